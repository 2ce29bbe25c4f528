//! Tessera transaction coordinator
//!
//! Two-phase commit across shards: parallel prepare, sequential commit in
//! enlistment order, a single deadline for the whole transaction, ambient
//! task-local flow, retry for transient faults, and an optional recovery
//! log written before phase 2.
//!
//! # State machine
//!
//! ```text
//!     Active ────rollback()────▶ RollingBack ──▶ RolledBack
//!       │ commit()
//!       ▼
//!     Preparing ── any vote=Abort ──▶ RollingBack ──▶ RolledBack
//!       │ all votes ∈ {Prepared, ReadOnly}
//!       ▼
//!     Prepared ──▶ Committing ── partial commit failure ──▶ Failed
//!       │                  │ all commits succeed
//!       │                  ▼
//!       └──────────▶   Committed
//! ```
//!
//! Terminal states (`Committed`, `RolledBack`, `Failed`) are immutable.

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod error;
pub mod options;
pub mod participant;
pub mod recovery;

pub use coordinator::{
    CommitSummary, CrossShardTransaction, TransactionCoordinator, TransactionState,
};
pub use error::{Result, TransactionError};
pub use options::TransactionOptions;
pub use participant::{CustomShardOp, ParticipantVote, PendingOperation, TransactionParticipant};
pub use recovery::{
    InMemoryRecoveryLog, PreparedTransactionRecord, RecoveryLog, RocksRecoveryLog,
    TransactionOutcome,
};
