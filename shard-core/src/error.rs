//! Error types for the shard core

use thiserror::Error;

/// Result type for shard-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shard-core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Strategy could not decide a target shard for an entity
    #[error("entity of type '{entity_type}' is not routable: {reason}")]
    NotRoutable {
        /// Entity type name
        entity_type: String,
        /// Why routing failed
        reason: String,
    },

    /// Every candidate shard is read-only or archived
    #[error("no writable shard for entity of type '{0}'")]
    NoWritableShard(String),

    /// Sharding configuration resolves ambiguously or inconsistently
    #[error("misconfigured routing: {0}")]
    MisconfiguredRouting(String),

    /// Registry validation failure (fail-fast at construction)
    #[error("registry validation failed: {0}")]
    Validation(String),

    /// Configuration document problem
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard id not present in the registry
    #[error("unknown shard: {0}")]
    UnknownShard(String),

    /// Constraint violation raised by a shard backend at flush time
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Transient shard fault (connection drop, lock conflict, deadlock victim)
    #[error("transient shard error: {0}")]
    Transient(String),

    /// Malformed or unsupported logical query
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry loop may reasonably re-attempt the failed operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
