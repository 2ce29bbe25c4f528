//! Error types for cross-shard transactions

use shard_core::types::ShardId;
use thiserror::Error;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Cross-shard transaction errors
#[derive(Error, Debug)]
pub enum TransactionError {
    /// A participant voted Abort in phase 1; nothing was committed anywhere
    /// and the transaction was rolled back, so the caller may retry
    #[error("prepare aborted on shard '{failed_shard_id}' in transaction {transaction_id}: {reason}")]
    PrepareAborted {
        /// Transaction id
        transaction_id: String,
        /// First shard whose vote was Abort
        failed_shard_id: ShardId,
        /// The participant's abort reason
        reason: String,
    },

    /// Phase 2 succeeded on some shards and failed on others: the
    /// transaction is in doubt and needs operator action or compensation
    #[error("commit partially failed in transaction {transaction_id}: committed {committed_shards:?}, failed {failed_shards:?}")]
    CommitPartiallyFailed {
        /// Transaction id
        transaction_id: String,
        /// Shards whose local commit succeeded
        committed_shards: Vec<ShardId>,
        /// Shards whose local commit did not succeed
        failed_shards: Vec<ShardId>,
    },

    /// The transaction deadline elapsed before an outcome
    #[error("transaction {transaction_id} timed out after {timeout_ms} ms")]
    TimedOut {
        /// Transaction id
        transaction_id: String,
        /// Configured budget in milliseconds
        timeout_ms: u64,
    },

    /// A transaction was begun while another is ambient on this task
    #[error("nested cross-shard transactions are not supported")]
    NestedTransactionNotSupported,

    /// A mutation was attempted on a transaction in a terminal state
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// A shard-level failure outside the 2PC protocol itself
    #[error("shard error: {0}")]
    Shard(#[from] shard_core::Error),

    /// Recovery log failure
    #[error("recovery log error: {0}")]
    Recovery(String),

    /// Generic error
    #[error("{0}")]
    Internal(String),
}

impl TransactionError {
    /// Whether the retry wrapper may re-attempt the whole transaction
    ///
    /// Timeouts, deadlock victims, and connection faults are transient;
    /// prepare aborts and (partial) commit failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransactionError::TimedOut { .. } => true,
            TransactionError::Shard(e) => e.is_transient(),
            _ => false,
        }
    }
}
