//! Transaction coordinator
//!
//! One [`CrossShardTransaction`] instance per transaction, owned by its
//! caller. Phase 1 prepares every enlisted participant in parallel; phase 2
//! commits sequentially in enlistment order to bound the in-doubt window.
//! A single deadline covers the whole transaction, armed as a watchdog at
//! begin. The ambient transaction flows through a tokio task-local, so it
//! crosses `.await`s without leaking to sibling tasks.

use crate::error::{Result, TransactionError};
use crate::options::TransactionOptions;
use crate::participant::{ParticipantVote, TransactionParticipant};
use crate::recovery::{PreparedTransactionRecord, RecoveryLog, TransactionOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use shard_core::context::ShardContextFactory;
use shard_core::events::{EngineEvent, EventBus};
use shard_core::metrics::Metrics;
use shard_core::registry::ShardRegistry;
use shard_core::types::{IsolationLevel, ShardId};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of one cross-shard transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting enlistments and operations
    Active,
    /// Phase 1 in flight
    Preparing,
    /// Every vote was Prepared or ReadOnly
    Prepared,
    /// Phase 2 in flight
    Committing,
    /// Every commit succeeded (terminal)
    Committed,
    /// Rollback in flight
    RollingBack,
    /// Rolled back everywhere (terminal)
    RolledBack,
    /// In doubt: timed out, or phase 2 diverged across shards (terminal)
    Failed,
}

impl TransactionState {
    /// Stable name for logging and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Preparing => "preparing",
            TransactionState::Prepared => "prepared",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RollingBack => "rolling_back",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed => "failed",
        }
    }

    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

/// Outcome of a successful commit
#[derive(Debug, Clone)]
pub struct CommitSummary {
    /// Transaction id
    pub transaction_id: String,
    /// Rows written across every shard
    pub total_rows: u64,
    /// Shards whose local commit ran
    pub committed_shards: Vec<ShardId>,
    /// Shards that only read
    pub read_only_shards: Vec<ShardId>,
}

/// One cross-shard transaction
pub struct CrossShardTransaction {
    id: String,
    options: TransactionOptions,
    isolation: IsolationLevel,
    state: Mutex<TransactionState>,
    participants: tokio::sync::Mutex<Vec<Arc<TransactionParticipant>>>,
    deadline: Instant,
    started_at: chrono::DateTime<Utc>,
    registry: Arc<ShardRegistry>,
    factory: Arc<dyn ShardContextFactory>,
    events: EventBus,
    metrics: Option<Arc<Metrics>>,
    recovery: Option<Arc<dyn RecoveryLog>>,
}

impl std::fmt::Debug for CrossShardTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossShardTransaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("isolation", &self.isolation)
            .finish()
    }
}

impl CrossShardTransaction {
    /// Transaction id (`XS-{name}-{stamp}-{random}`)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Normalized isolation level propagated to participants
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// When the transaction began
    pub fn started_at(&self) -> chrono::DateTime<Utc> {
        self.started_at
    }

    /// Shard ids in enlistment (and phase-2 commit) order
    pub async fn enlisted_shards(&self) -> Vec<ShardId> {
        self.participants
            .lock()
            .await
            .iter()
            .map(|p| p.shard_id().clone())
            .collect()
    }

    /// The participant for a shard, created and cached on first use
    pub async fn enlist(&self, shard_id: &ShardId) -> Result<Arc<TransactionParticipant>> {
        {
            let state = self.state.lock();
            if *state != TransactionState::Active {
                return Err(TransactionError::InvalidState(format!(
                    "cannot enlist shard '{}' in state {}",
                    shard_id,
                    state.as_str()
                )));
            }
        }

        let mut participants = self.participants.lock().await;
        if let Some(existing) = participants.iter().find(|p| p.shard_id() == shard_id) {
            return Ok(Arc::clone(existing));
        }

        let descriptor = self
            .registry
            .shard(shard_id)
            .ok_or_else(|| shard_core::Error::UnknownShard(shard_id.to_string()))?
            .clone();
        let executor = self.factory.create(&descriptor).await?;
        let participant = Arc::new(TransactionParticipant::new(
            self.id.clone(),
            shard_id.clone(),
            executor,
        ));

        let enlistment_index = participants.len();
        participants.push(Arc::clone(&participant));
        // enlistment order is phase-2 commit order; logged for deadlock postmortems
        info!(
            transaction_id = %self.id,
            shard_id = %shard_id,
            enlistment_index,
            "participant enlisted"
        );
        self.events.publish(EngineEvent::ParticipantEnlisted {
            transaction_id: self.id.clone(),
            shard_id: shard_id.clone(),
            enlistment_index,
        });

        Ok(participant)
    }

    /// Drive both phases of the commit
    pub async fn commit(&self) -> Result<CommitSummary> {
        self.try_advance(TransactionState::Active, TransactionState::Preparing)?;

        let participants = self.participants.lock().await.clone();
        if participants.is_empty() {
            self.set_state(TransactionState::Committed);
            self.events.publish(EngineEvent::TransactionCommitted {
                transaction_id: self.id.clone(),
                shard_count: 0,
            });
            return Ok(CommitSummary {
                transaction_id: self.id.clone(),
                total_rows: 0,
                committed_shards: Vec::new(),
                read_only_shards: Vec::new(),
            });
        }

        // Phase 1: parallel prepare under the transaction deadline
        let votes = match tokio::time::timeout_at(
            self.deadline,
            Self::prepare_all(&participants, self.isolation),
        )
        .await
        {
            Ok(votes) => votes?,
            Err(_) => {
                warn!(transaction_id = %self.id, "deadline elapsed during prepare");
                self.fail_with_rollback(&participants).await;
                return Err(self.timeout_error());
            }
        };

        for (participant, vote) in participants.iter().zip(votes.iter()) {
            self.events.publish(EngineEvent::ParticipantVoted {
                transaction_id: self.id.clone(),
                shard_id: participant.shard_id().clone(),
                vote: vote.as_str().to_string(),
            });
        }

        if let Some(index) = votes.iter().position(|v| *v == ParticipantVote::Abort) {
            let failed = Arc::clone(&participants[index]);
            warn!(
                transaction_id = %self.id,
                failed_shard = %failed.shard_id(),
                "prepare aborted; rolling back"
            );
            self.set_state(TransactionState::RollingBack);
            self.rollback_participants(&participants).await;
            self.set_state(TransactionState::RolledBack);
            self.events.publish(EngineEvent::TransactionRolledBack {
                transaction_id: self.id.clone(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.transactions_rolled_back.inc();
            }
            return Err(TransactionError::PrepareAborted {
                transaction_id: self.id.clone(),
                failed_shard_id: failed.shard_id().clone(),
                reason: failed
                    .abort_reason()
                    .unwrap_or_else(|| "prepare failed".to_string()),
            });
        }

        self.try_advance(TransactionState::Preparing, TransactionState::Prepared)?;
        self.events.publish(EngineEvent::TransactionPrepared {
            transaction_id: self.id.clone(),
        });

        // Recovery hook: persist the prepared record before any phase-2 write
        if self.options.enable_recovery {
            if let Some(log) = &self.recovery {
                let record = PreparedTransactionRecord {
                    transaction_id: self.id.clone(),
                    shard_ids: participants.iter().map(|p| p.shard_id().clone()).collect(),
                    isolation: self.isolation.as_str().to_string(),
                    prepared_at: Utc::now(),
                };
                if let Err(e) = log.record_prepared(&record).await {
                    error!(transaction_id = %self.id, error = %e, "recovery log write failed; rolling back");
                    self.set_state(TransactionState::RollingBack);
                    self.rollback_participants(&participants).await;
                    self.set_state(TransactionState::RolledBack);
                    return Err(e);
                }
            }
        }

        self.try_advance(TransactionState::Prepared, TransactionState::Committing)?;

        // Phase 2: sequential commit in enlistment order
        let mut committed: Vec<ShardId> = Vec::new();
        let mut failed: Vec<ShardId> = Vec::new();
        let mut read_only: Vec<ShardId> = Vec::new();
        let mut total_rows: u64 = 0;
        let mut first_failure: Option<TransactionError> = None;

        for participant in &participants {
            if participant.vote() == ParticipantVote::ReadOnly {
                read_only.push(participant.shard_id().clone());
                continue;
            }
            if Instant::now() >= self.deadline {
                warn!(
                    transaction_id = %self.id,
                    shard_id = %participant.shard_id(),
                    "deadline elapsed before shard commit"
                );
                failed.push(participant.shard_id().clone());
                first_failure.get_or_insert_with(|| self.timeout_error());
                continue;
            }

            match tokio::time::timeout_at(self.deadline, participant.commit()).await {
                Ok(Ok(())) => {
                    total_rows += participant.rows_written();
                    committed.push(participant.shard_id().clone());
                    self.events.publish(EngineEvent::ParticipantCommitted {
                        transaction_id: self.id.clone(),
                        shard_id: participant.shard_id().clone(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(
                        transaction_id = %self.id,
                        shard_id = %participant.shard_id(),
                        error = %e,
                        "shard commit failed"
                    );
                    failed.push(participant.shard_id().clone());
                    first_failure.get_or_insert(TransactionError::Shard(e));
                }
                Err(_) => {
                    warn!(
                        transaction_id = %self.id,
                        shard_id = %participant.shard_id(),
                        "shard commit timed out"
                    );
                    failed.push(participant.shard_id().clone());
                    first_failure.get_or_insert_with(|| self.timeout_error());
                }
            }
        }

        if failed.is_empty() {
            self.set_state(TransactionState::Committed);
            self.record_outcome(TransactionOutcome::Committed).await;
            info!(
                transaction_id = %self.id,
                shard_count = participants.len(),
                total_rows,
                "transaction committed"
            );
            self.events.publish(EngineEvent::TransactionCommitted {
                transaction_id: self.id.clone(),
                shard_count: participants.len(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.transactions_committed.inc();
            }
            return Ok(CommitSummary {
                transaction_id: self.id.clone(),
                total_rows,
                committed_shards: committed,
                read_only_shards: read_only,
            });
        }

        if committed.is_empty() {
            // no shard committed: the prepared locals can still roll back,
            // so the caller sees the underlying error, never a partial state
            self.set_state(TransactionState::RollingBack);
            let clean = self.rollback_participants(&participants).await;
            self.set_state(if clean {
                TransactionState::RolledBack
            } else {
                TransactionState::Failed
            });
            self.record_outcome(TransactionOutcome::RolledBack).await;
            self.events.publish(EngineEvent::TransactionRolledBack {
                transaction_id: self.id.clone(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.transactions_rolled_back.inc();
            }
            return Err(first_failure
                .unwrap_or_else(|| TransactionError::Internal("phase 2 failed".to_string())));
        }

        // in doubt: some shards committed, some did not
        self.set_state(TransactionState::Failed);
        self.record_outcome(TransactionOutcome::InDoubt {
            committed_shards: committed.clone(),
            failed_shards: failed.clone(),
        })
        .await;
        error!(
            transaction_id = %self.id,
            committed = ?committed,
            failed = ?failed,
            "commit partially failed; manual recovery required"
        );
        if let Some(metrics) = &self.metrics {
            metrics.transactions_failed.inc();
        }
        Err(TransactionError::CommitPartiallyFailed {
            transaction_id: self.id.clone(),
            committed_shards: committed,
            failed_shards: failed,
        })
    }

    /// Roll back every participant; idempotent, best-effort
    pub async fn rollback(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                TransactionState::RolledBack | TransactionState::RollingBack => return Ok(()),
                TransactionState::Committed | TransactionState::Failed => {
                    return Err(TransactionError::InvalidState(format!(
                        "cannot roll back a transaction in state {}",
                        state.as_str()
                    )));
                }
                _ => *state = TransactionState::RollingBack,
            }
        }

        let participants = self.participants.lock().await.clone();
        let clean = self.rollback_participants(&participants).await;
        self.set_state(if clean {
            TransactionState::RolledBack
        } else {
            TransactionState::Failed
        });
        self.record_outcome(TransactionOutcome::RolledBack).await;
        info!(transaction_id = %self.id, "transaction rolled back");
        self.events.publish(EngineEvent::TransactionRolledBack {
            transaction_id: self.id.clone(),
        });
        if let Some(metrics) = &self.metrics {
            metrics.transactions_rolled_back.inc();
        }
        Ok(())
    }

    async fn prepare_all(
        participants: &[Arc<TransactionParticipant>],
        isolation: IsolationLevel,
    ) -> Result<Vec<ParticipantVote>> {
        let mut tasks = JoinSet::new();
        for (index, participant) in participants.iter().enumerate() {
            let participant = Arc::clone(participant);
            tasks.spawn(async move { (index, participant.prepare(isolation).await) });
        }

        let mut votes = vec![ParticipantVote::Pending; participants.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, vote)) => votes[index] = vote,
                Err(e) => {
                    return Err(TransactionError::Internal(format!(
                        "prepare task failed: {}",
                        e
                    )))
                }
            }
        }
        Ok(votes)
    }

    async fn rollback_participants(&self, participants: &[Arc<TransactionParticipant>]) -> bool {
        let mut clean = true;
        for participant in participants {
            match participant.rollback().await {
                Ok(()) => {
                    self.events.publish(EngineEvent::ParticipantRolledBack {
                        transaction_id: self.id.clone(),
                        shard_id: participant.shard_id().clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        transaction_id = %self.id,
                        shard_id = %participant.shard_id(),
                        error = %e,
                        "participant rollback failed"
                    );
                    clean = false;
                }
            }
        }
        clean
    }

    async fn record_outcome(&self, outcome: TransactionOutcome) {
        if !self.options.enable_recovery {
            return;
        }
        if let Some(log) = &self.recovery {
            if let Err(e) = log.record_outcome(&self.id, &outcome).await {
                warn!(transaction_id = %self.id, error = %e, "recovery outcome write failed");
            }
        }
    }

    /// Deadline watchdog: fail a still-undecided transaction
    async fn expire(&self) {
        let should_fail = {
            let mut state = self.state.lock();
            match *state {
                TransactionState::Active
                | TransactionState::Preparing
                | TransactionState::Prepared => {
                    *state = TransactionState::Failed;
                    true
                }
                // phase 2 owns its own per-commit deadline handling
                _ => false,
            }
        };
        if !should_fail {
            return;
        }

        warn!(
            transaction_id = %self.id,
            timeout_ms = self.options.timeout.as_millis() as u64,
            "transaction timed out"
        );
        let participants = self.participants.lock().await.clone();
        self.rollback_participants(&participants).await;
        self.events.publish(EngineEvent::TransactionTimedOut {
            transaction_id: self.id.clone(),
            timeout_ms: self.options.timeout.as_millis() as u64,
        });
        if let Some(metrics) = &self.metrics {
            metrics.transactions_failed.inc();
        }
    }

    async fn fail_with_rollback(&self, participants: &[Arc<TransactionParticipant>]) {
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = TransactionState::Failed;
            }
        }
        self.rollback_participants(participants).await;
        self.events.publish(EngineEvent::TransactionTimedOut {
            transaction_id: self.id.clone(),
            timeout_ms: self.options.timeout.as_millis() as u64,
        });
        if let Some(metrics) = &self.metrics {
            metrics.transactions_failed.inc();
        }
    }

    fn try_advance(&self, from: TransactionState, to: TransactionState) -> Result<()> {
        let mut state = self.state.lock();
        if *state == from {
            debug!(transaction_id = %self.id, from = from.as_str(), to = to.as_str(), "state transition");
            *state = to;
            return Ok(());
        }
        if *state == TransactionState::Failed {
            // the watchdog got there first
            return Err(self.timeout_error());
        }
        Err(TransactionError::InvalidState(format!(
            "expected state {}, found {}",
            from.as_str(),
            state.as_str()
        )))
    }

    fn set_state(&self, to: TransactionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = to;
        }
    }

    fn timeout_error(&self) -> TransactionError {
        TransactionError::TimedOut {
            transaction_id: self.id.clone(),
            timeout_ms: self.options.timeout.as_millis() as u64,
        }
    }
}

tokio::task_local! {
    static CURRENT_TRANSACTION: Option<Arc<CrossShardTransaction>>;
}

/// Creates and drives cross-shard transactions
pub struct TransactionCoordinator {
    registry: Arc<ShardRegistry>,
    factory: Arc<dyn ShardContextFactory>,
    events: EventBus,
    metrics: Option<Arc<Metrics>>,
    recovery: Option<Arc<dyn RecoveryLog>>,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("has_recovery", &self.recovery.is_some())
            .finish()
    }
}

impl TransactionCoordinator {
    /// Create a coordinator
    pub fn new(
        registry: Arc<ShardRegistry>,
        factory: Arc<dyn ShardContextFactory>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            factory,
            events,
            metrics: None,
            recovery: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach a recovery log (used when options enable recovery)
    pub fn with_recovery_log(mut self, log: Arc<dyn RecoveryLog>) -> Self {
        self.recovery = Some(log);
        self
    }

    /// The event bus the coordinator publishes on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The registry backing the coordinator
    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Begin a transaction: allocate the id and arm the deadline watchdog
    ///
    /// Fails with `NestedTransactionNotSupported` when called while another
    /// transaction is ambient on this task.
    pub async fn begin(&self, options: TransactionOptions) -> Result<Arc<CrossShardTransaction>> {
        if Self::current().is_some() {
            return Err(TransactionError::NestedTransactionNotSupported);
        }

        let isolation = options.isolation_level.normalized();
        let id = Self::allocate_id(options.transaction_name.as_deref());
        let deadline = Instant::now() + options.timeout;

        let txn = Arc::new(CrossShardTransaction {
            id: id.clone(),
            isolation,
            deadline,
            started_at: Utc::now(),
            state: Mutex::new(TransactionState::Active),
            participants: tokio::sync::Mutex::new(Vec::new()),
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            recovery: self.recovery.clone(),
            options,
        });

        let weak = Arc::downgrade(&txn);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(txn) = weak.upgrade() {
                txn.expire().await;
            }
        });

        info!(
            transaction_id = %id,
            isolation = isolation.as_str(),
            timeout_ms = txn.options.timeout.as_millis() as u64,
            "transaction begun"
        );
        self.events.publish(EngineEvent::TransactionStarted {
            transaction_id: id,
            isolation: isolation.as_str().to_string(),
            timeout_ms: txn.options.timeout.as_millis() as u64,
        });

        Ok(txn)
    }

    /// The transaction ambient on the current task, if any
    pub fn current() -> Option<Arc<CrossShardTransaction>> {
        CURRENT_TRANSACTION
            .try_with(|txn| txn.clone())
            .unwrap_or(None)
    }

    /// Run a future with the transaction ambient
    pub async fn in_scope<F>(txn: Arc<CrossShardTransaction>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TRANSACTION.scope(Some(txn), future).await
    }

    /// Begin, run the work with the transaction ambient, and commit;
    /// transient failures (timeout, deadlock victim, connection faults) are
    /// retried with exponential backoff when the options allow it.
    ///
    /// Application errors raised by the work are never swallowed: the
    /// transaction rolls back and the error is re-thrown. Prepare aborts and
    /// commit failures are not retried.
    pub async fn execute_in_transaction<T, F, Fut>(
        &self,
        options: TransactionOptions,
        work: F,
    ) -> Result<T>
    where
        F: Fn(Arc<CrossShardTransaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = if options.enable_retry {
            options.max_retry_attempts
        } else {
            0
        };
        let mut last_error: Option<TransactionError> = None;

        for attempt in 0..=attempts {
            if attempt > 0 {
                let delay = backoff_delay(&options, attempt - 1);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying transaction after transient failure"
                );
                tokio::time::sleep(delay).await;
            }

            let txn = self.begin(options.clone()).await?;
            let scoped = {
                let txn = Arc::clone(&txn);
                async move {
                    match work(Arc::clone(&txn)).await {
                        Ok(value) => txn.commit().await.map(|_| value),
                        Err(e) => {
                            if let Err(rollback_error) = txn.rollback().await {
                                warn!(
                                    transaction_id = %txn.id(),
                                    error = %rollback_error,
                                    "rollback after work failure also failed"
                                );
                            }
                            Err(e)
                        }
                    }
                }
            };

            match Self::in_scope(Arc::clone(&txn), scoped).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt, "transaction succeeded on retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransactionError::Internal("retries exhausted".to_string())))
    }

    fn allocate_id(name: Option<&str>) -> String {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let random: u64 = rand::random();
        match name {
            Some(name) => format!("XS-{}-{}-{:016x}", name, stamp, random),
            None => format!("XS-{}-{:016x}", stamp, random),
        }
    }
}

fn backoff_delay(options: &TransactionOptions, attempt: u32) -> Duration {
    let base = options.retry_delay.as_millis() as f64;
    let raw = if options.use_exponential_backoff {
        base * 2f64.powi(attempt as i32)
    } else {
        base
    };
    let capped = raw.min(options.max_retry_delay.as_millis() as f64);
    // jitter to avoid lock-step retries across callers
    let jitter = (rand::random::<f64>() - 0.5) * capped * 0.2;
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::memory::MemoryBackend;
    use shard_core::registry::EntityShardingConfig;
    use shard_core::strategy::PropertyStrategy;
    use shard_core::types::{KeyValue, ShardDescriptor};

    fn registry() -> Arc<ShardRegistry> {
        Arc::new(
            ShardRegistry::builder()
                .add_shard(ShardDescriptor::new("EU", "mem://eu"))
                .add_shard(ShardDescriptor::new("US", "mem://us"))
                .configure_entity(EntityShardingConfig::new(
                    "customers",
                    Arc::new(PropertyStrategy::new(
                        "region",
                        [
                            (KeyValue::from("EU"), ShardId::from("EU")),
                            (KeyValue::from("US"), ShardId::from("US")),
                        ],
                    )),
                ))
                .build()
                .unwrap(),
        )
    }

    fn coordinator() -> TransactionCoordinator {
        TransactionCoordinator::new(
            registry(),
            Arc::new(MemoryBackend::new()),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_transaction_commits() {
        let coordinator = coordinator();
        let txn = coordinator.begin(TransactionOptions::default()).await.unwrap();
        let summary = txn.commit().await.unwrap();
        assert_eq!(summary.total_rows, 0);
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_enlist_caches_per_shard() {
        let coordinator = coordinator();
        let txn = coordinator.begin(TransactionOptions::default()).await.unwrap();

        let first = txn.enlist(&ShardId::from("EU")).await.unwrap();
        let second = txn.enlist(&ShardId::from("EU")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(txn.enlisted_shards().await.len(), 1);
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_enlist_after_terminal_state_fails() {
        let coordinator = coordinator();
        let txn = coordinator.begin(TransactionOptions::default()).await.unwrap();
        txn.commit().await.unwrap();

        assert!(matches!(
            txn.enlist(&ShardId::from("EU")).await,
            Err(TransactionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let coordinator = coordinator();
        let txn = coordinator.begin(TransactionOptions::default()).await.unwrap();
        txn.enlist(&ShardId::from("EU")).await.unwrap();

        txn.rollback().await.unwrap();
        txn.rollback().await.unwrap();
        assert_eq!(txn.state(), TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_after_commit_is_invalid() {
        let coordinator = coordinator();
        let txn = coordinator.begin(TransactionOptions::default()).await.unwrap();
        txn.commit().await.unwrap();

        assert!(matches!(
            txn.rollback().await,
            Err(TransactionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_nested_begin_rejected() {
        let coordinator = Arc::new(coordinator());
        let inner = Arc::clone(&coordinator);
        let result = coordinator
            .execute_in_transaction(TransactionOptions::default(), move |_txn| {
                let inner = Arc::clone(&inner);
                async move {
                    let nested = inner.begin(TransactionOptions::default()).await;
                    assert!(matches!(
                        nested,
                        Err(TransactionError::NestedTransactionNotSupported)
                    ));
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_ambient_flow() {
        let coordinator = coordinator();
        assert!(TransactionCoordinator::current().is_none());

        coordinator
            .execute_in_transaction(TransactionOptions::default(), |txn| async move {
                let ambient = TransactionCoordinator::current()
                    .expect("transaction should be ambient inside the scope");
                assert_eq!(ambient.id(), txn.id());
                Ok(())
            })
            .await
            .unwrap();

        assert!(TransactionCoordinator::current().is_none());
    }

    #[tokio::test]
    async fn test_transaction_id_shape() {
        let id = TransactionCoordinator::allocate_id(Some("nightly"));
        assert!(id.starts_with("XS-nightly-"));
        let parts: Vec<&str> = id.rsplitn(2, '-').collect();
        assert_eq!(parts[0].len(), 16);
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let options = TransactionOptions {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(400),
            use_exponential_backoff: true,
            ..TransactionOptions::default()
        };
        for attempt in 0..10 {
            let delay = backoff_delay(&options, attempt);
            // cap plus 10% jitter headroom
            assert!(delay <= Duration::from_millis(440));
        }
    }
}
