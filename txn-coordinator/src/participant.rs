//! Transaction participants
//!
//! A participant is the per-shard half of a cross-shard transaction: a
//! buffer of pending operations drained at prepare time, the phase-1 vote,
//! and the shard's local transaction handle.

use async_trait::async_trait;
use parking_lot::Mutex;
use shard_core::context::ShardExecutor;
use shard_core::types::{EntityOp, IsolationLevel, ShardId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A participant's phase-1 vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantVote {
    /// Prepare has not run yet
    Pending,
    /// Changes are flushed and locked; commit will succeed barring faults
    Prepared,
    /// Prepare failed; the transaction must roll back
    Abort,
    /// The participant produced no changes; commit is a no-op
    ReadOnly,
}

impl ParticipantVote {
    /// Stable name for events and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantVote::Pending => "pending",
            ParticipantVote::Prepared => "prepared",
            ParticipantVote::Abort => "abort",
            ParticipantVote::ReadOnly => "read_only",
        }
    }
}

/// An opaque operation executed against the participant's shard at prepare
#[async_trait]
pub trait CustomShardOp: Send + Sync {
    /// Run against the shard's execution context; returns staged row count
    async fn run(&self, executor: &dyn ShardExecutor) -> shard_core::Result<u64>;
}

/// One pending operation in a participant's queue
pub enum PendingOperation {
    /// A typed entity write against a resolved physical table
    Entity {
        /// Resolved physical table name
        table: String,
        /// The write
        op: EntityOp,
    },
    /// An opaque closure-style operation
    Custom(Box<dyn CustomShardOp>),
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingOperation::Entity { table, op } => {
                f.debug_struct("Entity").field("table", table).field("op", op).finish()
            }
            PendingOperation::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-shard state of one cross-shard transaction
///
/// Uniquely keyed by `(transaction_id, shard_id)`; the coordinator caches
/// participants so a shard is enlisted at most once per transaction.
pub struct TransactionParticipant {
    transaction_id: String,
    shard_id: ShardId,
    executor: Arc<dyn ShardExecutor>,
    queue: Mutex<Vec<PendingOperation>>,
    vote: Mutex<ParticipantVote>,
    abort_reason: Mutex<Option<String>>,
    local_txn_active: AtomicBool,
    rows_written: AtomicU64,
}

impl std::fmt::Debug for TransactionParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionParticipant")
            .field("transaction_id", &self.transaction_id)
            .field("shard_id", &self.shard_id)
            .field("vote", &*self.vote.lock())
            .field("pending", &self.queue.lock().len())
            .finish()
    }
}

impl TransactionParticipant {
    /// Create a participant bound to a shard's execution context
    pub fn new(
        transaction_id: impl Into<String>,
        shard_id: ShardId,
        executor: Arc<dyn ShardExecutor>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            shard_id,
            executor,
            queue: Mutex::new(Vec::new()),
            vote: Mutex::new(ParticipantVote::Pending),
            abort_reason: Mutex::new(None),
            local_txn_active: AtomicBool::new(false),
            rows_written: AtomicU64::new(0),
        }
    }

    /// The shard this participant owns
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The owning transaction id
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The shard execution context (for enqueueing reads inside the scope)
    pub fn executor(&self) -> &Arc<dyn ShardExecutor> {
        &self.executor
    }

    /// Append an operation to the pending queue
    pub fn enqueue(&self, op: PendingOperation) {
        self.queue.lock().push(op);
    }

    /// Append a typed entity write
    pub fn enqueue_entity(&self, table: impl Into<String>, op: EntityOp) {
        self.enqueue(PendingOperation::Entity { table: table.into(), op });
    }

    /// Whether any operations are queued
    pub fn has_pending_changes(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Number of queued operations
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// The current phase-1 vote
    pub fn vote(&self) -> ParticipantVote {
        *self.vote.lock()
    }

    /// Why the participant voted Abort, if it did
    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    /// Rows written at flush time
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Phase 1: drain the queue, begin the local transaction, flush without
    /// committing. Locks acquired by the flush stay held until `commit` or
    /// `rollback`.
    pub async fn prepare(&self, isolation: IsolationLevel) -> ParticipantVote {
        let ops: Vec<PendingOperation> = self.queue.lock().drain(..).collect();

        // 1. execute pending operations against the execution context
        let mut staged: u64 = 0;
        for op in ops {
            let result = match op {
                PendingOperation::Entity { table, op } => self.executor.apply(&table, &op).await,
                PendingOperation::Custom(custom) => custom.run(self.executor.as_ref()).await,
            };
            match result {
                Ok(count) => staged += count,
                Err(e) => return self.abort(format!("operation failed: {}", e)).await,
            }
        }

        // 2. nothing staged: the participant only read
        if staged == 0 {
            debug!(
                transaction_id = %self.transaction_id,
                shard_id = %self.shard_id,
                "participant is read-only"
            );
            *self.vote.lock() = ParticipantVote::ReadOnly;
            return ParticipantVote::ReadOnly;
        }

        // 3. begin the local transaction at the coordinator's isolation level
        if let Err(e) = self.executor.begin(isolation).await {
            return self.abort(format!("begin failed: {}", e)).await;
        }
        self.local_txn_active.store(true, Ordering::SeqCst);

        // 4. flush: validate, acquire locks, write - without committing
        match self.executor.flush().await {
            Ok(written) => {
                self.rows_written.store(written, Ordering::Relaxed);
                debug!(
                    transaction_id = %self.transaction_id,
                    shard_id = %self.shard_id,
                    rows = written,
                    "participant prepared"
                );
                *self.vote.lock() = ParticipantVote::Prepared;
                ParticipantVote::Prepared
            }
            Err(e) => self.abort(format!("flush failed: {}", e)).await,
        }
    }

    async fn abort(&self, reason: String) -> ParticipantVote {
        warn!(
            transaction_id = %self.transaction_id,
            shard_id = %self.shard_id,
            reason = %reason,
            "participant vote: abort"
        );
        if self.local_txn_active.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.executor.rollback().await {
                warn!(shard_id = %self.shard_id, error = %e, "rollback after abort failed");
            }
        }
        *self.abort_reason.lock() = Some(reason);
        *self.vote.lock() = ParticipantVote::Abort;
        ParticipantVote::Abort
    }

    /// Phase 2: commit the local transaction; a no-op for ReadOnly voters
    pub async fn commit(&self) -> shard_core::Result<()> {
        if self.vote() == ParticipantVote::ReadOnly {
            return Ok(());
        }
        self.executor.commit().await?;
        self.local_txn_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Roll the local transaction back; tolerated repeatedly and when no
    /// local transaction was ever begun
    pub async fn rollback(&self) -> shard_core::Result<()> {
        self.local_txn_active.store(false, Ordering::SeqCst);
        self.executor.rollback().await
    }
}
