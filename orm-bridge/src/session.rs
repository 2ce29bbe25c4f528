//! Transparent session
//!
//! When the application starts an explicit transaction on the ORM's
//! connection, a session joins that scope to one cross-shard transaction:
//! every save inside the scope routes into the same per-shard participants,
//! the application's commit drives the coordinator commit, and dropping the
//! scope without committing rolls back. Exactly one session may be active
//! per ORM context instance.

use crate::interceptor::{enqueue_groups, group_by_shard};
use crate::tracker::ChangeTracker;
use dashmap::DashMap;
use shard_core::registry::ShardRegistry;
use shard_core::router::WriteRouter;
use shard_core::types::IsolationLevel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use txn_coordinator::{
    CommitSummary, CrossShardTransaction, Result, TransactionCoordinator, TransactionError,
    TransactionOptions,
};
use uuid::Uuid;

/// Tracks which ORM context instances have an active session
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Arc<DashMap<Uuid, String>>,
}

impl SessionRegistry {
    /// Create an empty session registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session to an application transaction scope
    ///
    /// The requested isolation level is mapped onto the coordinator
    /// transaction (ReadUncommitted normalizes to ReadCommitted). Fails when
    /// the context instance already has a session.
    pub async fn begin_session(
        &self,
        coordinator: &TransactionCoordinator,
        registry: Arc<ShardRegistry>,
        router: Arc<WriteRouter>,
        context_id: Uuid,
        isolation: IsolationLevel,
    ) -> Result<TransparentSession> {
        if self.active.contains_key(&context_id) {
            return Err(TransactionError::InvalidState(format!(
                "ORM context {} already has an active session",
                context_id
            )));
        }

        let txn = coordinator
            .begin(TransactionOptions::default().with_isolation(isolation))
            .await?;
        self.active.insert(context_id, txn.id().to_string());
        info!(
            context_id = %context_id,
            transaction_id = %txn.id(),
            "transparent session attached"
        );

        Ok(TransparentSession {
            context_id,
            txn,
            registry,
            router,
            active: Arc::clone(&self.active),
            finished: AtomicBool::new(false),
        })
    }

    /// Whether a context instance has an active session
    pub fn has_session(&self, context_id: &Uuid) -> bool {
        self.active.contains_key(context_id)
    }
}

/// One application transaction scope joined to a cross-shard transaction
pub struct TransparentSession {
    context_id: Uuid,
    txn: Arc<CrossShardTransaction>,
    registry: Arc<ShardRegistry>,
    router: Arc<WriteRouter>,
    active: Arc<DashMap<Uuid, String>>,
    finished: AtomicBool,
}

impl std::fmt::Debug for TransparentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransparentSession")
            .field("context_id", &self.context_id)
            .field("transaction_id", &self.txn.id())
            .finish()
    }
}

impl TransparentSession {
    /// The cross-shard transaction carrying this scope
    pub fn transaction(&self) -> &Arc<CrossShardTransaction> {
        &self.txn
    }

    /// Route a save's entries into the session's participants
    ///
    /// Every save inside the scope lands on the same transaction; the
    /// source change tracker is cleared afterwards so the default path
    /// flushes nothing.
    pub async fn save(&self, tracker: &mut dyn ChangeTracker) -> Result<usize> {
        let entries = tracker.entries();
        if entries.is_empty() {
            return Ok(0);
        }

        let groups = group_by_shard(&self.registry, &self.router, entries)?;
        let enqueued = enqueue_groups(&self.registry, &self.txn, groups).await?;
        tracker.clear();

        debug!(
            transaction_id = %self.txn.id(),
            enqueued,
            "session save enqueued"
        );
        Ok(enqueued)
    }

    /// The application committed its transaction: drive the coordinator
    pub async fn commit(self) -> Result<CommitSummary> {
        self.finish();
        self.txn.commit().await
    }

    /// The application rolled back: roll the coordinator back
    pub async fn rollback(self) -> Result<()> {
        self.finish();
        self.txn.rollback().await
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.active.remove(&self.context_id);
    }
}

impl Drop for TransparentSession {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // scope dropped without an explicit outcome: roll back
        self.active.remove(&self.context_id);
        warn!(
            context_id = %self.context_id,
            transaction_id = %self.txn.id(),
            "session dropped without commit; rolling back"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let txn = Arc::clone(&self.txn);
            handle.spawn(async move {
                let _ = txn.rollback().await;
            });
        }
    }
}
