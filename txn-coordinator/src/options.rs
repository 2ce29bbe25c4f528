//! Transaction options

use shard_core::types::IsolationLevel;
use std::time::Duration;

/// Options for one cross-shard transaction
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Single deadline for the whole transaction
    pub timeout: Duration,

    /// Isolation level propagated to every participant at phase 1
    pub isolation_level: IsolationLevel,

    /// Whether `execute_in_transaction` retries transient failures
    pub enable_retry: bool,

    /// Retry attempts after the first try
    pub max_retry_attempts: u32,

    /// Base delay between retries
    pub retry_delay: Duration,

    /// Double the delay on every retry
    pub use_exponential_backoff: bool,

    /// Ceiling for the backoff delay
    pub max_retry_delay: Duration,

    /// Human label folded into the transaction id
    pub transaction_name: Option<String>,

    /// Persist a prepared-transaction record before phase 2
    pub enable_recovery: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            isolation_level: IsolationLevel::ReadCommitted,
            enable_retry: false,
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(200),
            use_exponential_backoff: true,
            max_retry_delay: Duration::from_secs(5),
            transaction_name: None,
            enable_recovery: false,
        }
    }
}

impl TransactionOptions {
    /// Preset for interactive work: 10 second deadline
    pub fn short_lived() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Preset for batch work: 5 minute deadline
    pub fn long_running() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Set the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation_level = isolation;
        self
    }

    /// Set the human label folded into the transaction id
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.transaction_name = Some(name.into());
        self
    }

    /// Enable transient-failure retry in `execute_in_transaction`
    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.enable_retry = true;
        self.max_retry_attempts = max_attempts;
        self
    }

    /// Persist prepared-transaction records before phase 2
    pub fn with_recovery(mut self) -> Self {
        self.enable_recovery = true;
        self
    }
}
