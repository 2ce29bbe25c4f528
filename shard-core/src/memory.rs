//! In-memory shard backend
//!
//! The default backend for tests and embedded use. Each shard is a set of
//! tables keyed by primary key, with staged sessions, unique-constraint
//! validation at flush time, row locks held until commit or rollback, and
//! injectable faults (failed fetch/flush/commit, stalled commit) for
//! exercising the failure paths of a two-phase commit.

use crate::context::{ShardContextFactory, ShardExecutor};
use crate::error::{Error, Result};
use crate::types::{
    EntityOp, EntityRecord, IsolationLevel, Predicate, ShardDescriptor, ShardId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Injectable fault plan for one shard
#[derive(Debug, Default)]
pub struct MemoryFaults {
    fail_next_fetch: Mutex<Option<String>>,
    fail_next_flush: Mutex<Option<String>>,
    fail_next_commit: Mutex<Option<String>>,
    commit_delay: Mutex<Option<Duration>>,
}

/// Committed state of one in-memory shard
#[derive(Debug, Default)]
pub struct MemoryShardState {
    tables: Mutex<HashMap<String, BTreeMap<String, EntityRecord>>>,
    locks: Mutex<HashSet<(String, String)>>,
    constraints: Mutex<HashMap<String, Vec<Vec<String>>>>,
    insert_sequence: AtomicU64,
    faults: MemoryFaults,
}

impl MemoryShardState {
    /// Declare a unique constraint over the given fields of a table
    pub fn add_unique_constraint(&self, table: impl Into<String>, fields: Vec<String>) {
        self.constraints
            .lock()
            .entry(table.into())
            .or_default()
            .push(fields);
    }

    /// Insert a committed row directly (test seeding)
    pub fn seed(&self, table: impl Into<String>, record: EntityRecord) {
        let key = self.insert_key(&record);
        self.tables
            .lock()
            .entry(table.into())
            .or_default()
            .insert(key, record);
    }

    /// Committed rows of a table
    pub fn rows(&self, table: &str) -> Vec<EntityRecord> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed row count of a table
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, |t| t.len())
    }

    /// Fail the next fetch with a transient error
    pub fn inject_fetch_failure(&self, message: impl Into<String>) {
        *self.faults.fail_next_fetch.lock() = Some(message.into());
    }

    /// Fail the next flush with a constraint error
    pub fn inject_flush_failure(&self, message: impl Into<String>) {
        *self.faults.fail_next_flush.lock() = Some(message.into());
    }

    /// Fail the next commit with a transient error
    pub fn inject_commit_failure(&self, message: impl Into<String>) {
        *self.faults.fail_next_commit.lock() = Some(message.into());
    }

    /// Stall every commit by the given duration
    pub fn set_commit_delay(&self, delay: Duration) {
        *self.faults.commit_delay.lock() = Some(delay);
    }

    fn insert_key(&self, record: &EntityRecord) -> String {
        match record.key_value("id") {
            Some(v) => v.canonical(),
            None => format!("auto:{}", self.insert_sequence.fetch_add(1, Ordering::Relaxed)),
        }
    }

    fn check_constraints(
        &self,
        table: &str,
        record: &EntityRecord,
        own_key: &str,
        staged_tuples: &[(String, Vec<Option<serde_json::Value>>)],
    ) -> Result<()> {
        let constraints = self.constraints.lock();
        let Some(rules) = constraints.get(table) else {
            return Ok(());
        };

        for fields in rules {
            let tuple: Vec<Option<serde_json::Value>> = fields
                .iter()
                .map(|f| record.field(f).filter(|v| !v.is_null()).cloned())
                .collect();
            if tuple.iter().any(|v| v.is_none()) {
                continue;
            }

            let tables = self.tables.lock();
            if let Some(rows) = tables.get(table) {
                for (key, row) in rows.iter() {
                    if key == own_key {
                        continue;
                    }
                    let row_tuple: Vec<Option<serde_json::Value>> = fields
                        .iter()
                        .map(|f| row.field(f).filter(|v| !v.is_null()).cloned())
                        .collect();
                    if row_tuple == tuple {
                        return Err(Error::Constraint(format!(
                            "unique constraint ({}) violated on table '{}'",
                            fields.join(", "),
                            table
                        )));
                    }
                }
            }
            drop(tables);

            for (staged_table, staged_tuple) in staged_tuples {
                if staged_table == table && staged_tuple == &tuple {
                    return Err(Error::Constraint(format!(
                        "unique constraint ({}) violated on table '{}' within the batch",
                        fields.join(", "),
                        table
                    )));
                }
            }
        }
        Ok(())
    }
}

/// In-memory shard context factory
///
/// Shards materialize on first use; handles created through the factory are
/// single-owner sessions over the shared committed state.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    shards: Mutex<HashMap<ShardId, Arc<MemoryShardState>>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// The state of a shard, created on demand
    pub fn shard(&self, shard_id: &ShardId) -> Arc<MemoryShardState> {
        self.shards
            .lock()
            .entry(shard_id.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ShardContextFactory for MemoryBackend {
    async fn create(&self, shard: &ShardDescriptor) -> Result<Arc<dyn ShardExecutor>> {
        Ok(Arc::new(MemorySession {
            shard_id: shard.shard_id.clone(),
            state: self.shard(&shard.shard_id),
            staged: Mutex::new(Vec::new()),
            phase: Mutex::new(SessionPhase::Idle),
            held_locks: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionPhase {
    Idle,
    Begun,
    Flushed,
}

/// One session over an in-memory shard
#[derive(Debug)]
pub struct MemorySession {
    shard_id: ShardId,
    state: Arc<MemoryShardState>,
    staged: Mutex<Vec<(String, EntityOp)>>,
    phase: Mutex<SessionPhase>,
    held_locks: Mutex<Vec<(String, String)>>,
}

impl MemorySession {
    fn op_key(op: &EntityOp, state: &MemoryShardState) -> String {
        match op {
            EntityOp::Insert { record } => state.insert_key(record),
            EntityOp::Update { key, .. } | EntityOp::Delete { key } => key.canonical(),
        }
    }

    fn acquire_lock(&self, table: &str, key: &str) -> Result<()> {
        let lock_key = (table.to_string(), key.to_string());
        let mut held = self.held_locks.lock();
        if held.contains(&lock_key) {
            return Ok(());
        }
        let mut locks = self.state.locks.lock();
        if locks.contains(&lock_key) {
            return Err(Error::Transient(format!(
                "row '{}' in table '{}' is locked by another transaction",
                key, table
            )));
        }
        locks.insert(lock_key.clone());
        held.push(lock_key);
        Ok(())
    }

    fn release_locks(&self) {
        let mut held = self.held_locks.lock();
        let mut locks = self.state.locks.lock();
        for key in held.drain(..) {
            locks.remove(&key);
        }
    }

    fn flush_inner(&self) -> Result<u64> {
        if let Some(message) = self.state.faults.fail_next_flush.lock().take() {
            return Err(Error::Constraint(message));
        }

        let staged = self.staged.lock();
        let mut staged_tuples: Vec<(String, Vec<Option<serde_json::Value>>)> = Vec::new();

        for (table, op) in staged.iter() {
            let key = Self::op_key(op, &self.state);
            self.acquire_lock(table, &key)?;

            if let EntityOp::Insert { record } | EntityOp::Update { record, .. } = op {
                self.state
                    .check_constraints(table, record, &key, &staged_tuples)?;

                let constraints = self.state.constraints.lock();
                if let Some(rules) = constraints.get(table) {
                    for fields in rules {
                        let tuple: Vec<Option<serde_json::Value>> = fields
                            .iter()
                            .map(|f| record.field(f).filter(|v| !v.is_null()).cloned())
                            .collect();
                        if tuple.iter().all(|v| v.is_some()) {
                            staged_tuples.push((table.clone(), tuple));
                        }
                    }
                }
            }
        }

        Ok(staged.len() as u64)
    }

    fn publish_staged(&self) {
        let staged: Vec<(String, EntityOp)> = self.staged.lock().drain(..).collect();
        let mut tables = self.state.tables.lock();
        for (table, op) in staged {
            let rows = tables.entry(table).or_default();
            match op {
                EntityOp::Insert { record } => {
                    let key = self.state.insert_key(&record);
                    rows.insert(key, record);
                }
                EntityOp::Update { key, record } => {
                    rows.insert(key.canonical(), record);
                }
                EntityOp::Delete { key } => {
                    rows.remove(&key.canonical());
                }
            }
        }
    }
}

#[async_trait]
impl ShardExecutor for MemorySession {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    async fn fetch(&self, table: &str, predicates: &[Predicate]) -> Result<Vec<EntityRecord>> {
        if let Some(message) = self.state.faults.fail_next_fetch.lock().take() {
            return Err(Error::Transient(message));
        }
        Ok(self
            .state
            .rows(table)
            .into_iter()
            .filter(|r| predicates.iter().all(|p| p.matches(r)))
            .collect())
    }

    async fn apply(&self, table: &str, op: &EntityOp) -> Result<u64> {
        self.staged.lock().push((table.to_string(), op.clone()));
        Ok(1)
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::Idle {
            return Err(Error::Internal(format!(
                "shard '{}' already has a local transaction",
                self.shard_id
            )));
        }
        debug!(shard_id = %self.shard_id, isolation = isolation.as_str(), "local transaction begun");
        *phase = SessionPhase::Begun;
        Ok(())
    }

    async fn flush(&self) -> Result<u64> {
        {
            let phase = self.phase.lock();
            if *phase != SessionPhase::Begun {
                return Err(Error::Internal(format!(
                    "flush on shard '{}' without a local transaction",
                    self.shard_id
                )));
            }
        }
        match self.flush_inner() {
            Ok(count) => {
                *self.phase.lock() = SessionPhase::Flushed;
                Ok(count)
            }
            Err(e) => {
                self.release_locks();
                Err(e)
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        let delay = *self.state.faults.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.state.faults.fail_next_commit.lock().take() {
            return Err(Error::Transient(message));
        }

        let mut phase = self.phase.lock();
        match *phase {
            SessionPhase::Idle => return Ok(()),
            SessionPhase::Begun | SessionPhase::Flushed => {}
        }
        drop(phase);

        self.publish_staged();
        self.release_locks();
        *self.phase.lock() = SessionPhase::Idle;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.staged.lock().clear();
        self.release_locks();
        *self.phase.lock() = SessionPhase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyValue;
    use serde_json::json;

    fn descriptor(id: &str) -> ShardDescriptor {
        ShardDescriptor::new(id, format!("mem://{}", id))
    }

    async fn session(backend: &MemoryBackend, id: &str) -> Arc<dyn ShardExecutor> {
        backend.create(&descriptor(id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let backend = MemoryBackend::new();
        let s = session(&backend, "EU").await;

        s.apply(
            "customers",
            &EntityOp::Insert {
                record: EntityRecord::new("customers", json!({"id": 1, "name": "A"})),
            },
        )
        .await
        .unwrap();
        s.begin(IsolationLevel::ReadCommitted).await.unwrap();
        s.flush().await.unwrap();

        assert_eq!(backend.shard(&ShardId::from("EU")).row_count("customers"), 0);

        s.commit().await.unwrap();
        assert_eq!(backend.shard(&ShardId::from("EU")).row_count("customers"), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let backend = MemoryBackend::new();
        let s = session(&backend, "EU").await;

        s.apply(
            "customers",
            &EntityOp::Insert {
                record: EntityRecord::new("customers", json!({"id": 1})),
            },
        )
        .await
        .unwrap();
        s.begin(IsolationLevel::ReadCommitted).await.unwrap();
        s.flush().await.unwrap();
        s.rollback().await.unwrap();
        // rollback is idempotent
        s.rollback().await.unwrap();

        assert_eq!(backend.shard(&ShardId::from("EU")).row_count("customers"), 0);
    }

    #[tokio::test]
    async fn test_unique_constraint_fails_flush() {
        let backend = MemoryBackend::new();
        let state = backend.shard(&ShardId::from("EU"));
        state.add_unique_constraint("customers", vec!["region".into(), "email".into()]);
        state.seed(
            "customers",
            EntityRecord::new("customers", json!({"id": 1, "region": "EU", "email": "x@y"})),
        );

        let s = session(&backend, "EU").await;
        s.apply(
            "customers",
            &EntityOp::Insert {
                record: EntityRecord::new(
                    "customers",
                    json!({"id": 2, "region": "EU", "email": "x@y"}),
                ),
            },
        )
        .await
        .unwrap();
        s.begin(IsolationLevel::ReadCommitted).await.unwrap();

        let result = s.flush().await;
        assert!(matches!(result, Err(Error::Constraint(_))));
    }

    #[tokio::test]
    async fn test_locks_block_second_session_until_rollback() {
        let backend = MemoryBackend::new();
        let state = backend.shard(&ShardId::from("EU"));
        state.seed(
            "customers",
            EntityRecord::new("customers", json!({"id": 1, "name": "A"})),
        );

        let first = session(&backend, "EU").await;
        first
            .apply(
                "customers",
                &EntityOp::Update {
                    key: KeyValue::Int(1),
                    record: EntityRecord::new("customers", json!({"id": 1, "name": "B"})),
                },
            )
            .await
            .unwrap();
        first.begin(IsolationLevel::ReadCommitted).await.unwrap();
        first.flush().await.unwrap();

        let second = session(&backend, "EU").await;
        second
            .apply(
                "customers",
                &EntityOp::Update {
                    key: KeyValue::Int(1),
                    record: EntityRecord::new("customers", json!({"id": 1, "name": "C"})),
                },
            )
            .await
            .unwrap();
        second.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert!(matches!(second.flush().await, Err(Error::Transient(_))));

        first.rollback().await.unwrap();

        second.rollback().await.unwrap();
        let retry = session(&backend, "EU").await;
        retry
            .apply(
                "customers",
                &EntityOp::Update {
                    key: KeyValue::Int(1),
                    record: EntityRecord::new("customers", json!({"id": 1, "name": "C"})),
                },
            )
            .await
            .unwrap();
        retry.begin(IsolationLevel::ReadCommitted).await.unwrap();
        retry.flush().await.unwrap();
        retry.commit().await.unwrap();

        let rows = state.rows("customers");
        assert_eq!(rows[0].field("name").unwrap(), &json!("C"));
    }

    #[tokio::test]
    async fn test_fetch_filters_predicates() {
        let backend = MemoryBackend::new();
        let state = backend.shard(&ShardId::from("EU"));
        state.seed("customers", EntityRecord::new("customers", json!({"id": 1, "age": 30})));
        state.seed("customers", EntityRecord::new("customers", json!({"id": 2, "age": 50})));

        let s = session(&backend, "EU").await;
        let rows = s
            .fetch("customers", &[Predicate::gt("age", 40)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field("id").unwrap(), &json!(2));
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let backend = MemoryBackend::new();
        backend
            .shard(&ShardId::from("EU"))
            .inject_commit_failure("connection reset");

        let s = session(&backend, "EU").await;
        s.apply(
            "customers",
            &EntityOp::Insert {
                record: EntityRecord::new("customers", json!({"id": 1})),
            },
        )
        .await
        .unwrap();
        s.begin(IsolationLevel::ReadCommitted).await.unwrap();
        s.flush().await.unwrap();

        assert!(matches!(s.commit().await, Err(Error::Transient(_))));
        // the fault is one-shot; a retry commits
        s.commit().await.unwrap();
        assert_eq!(backend.shard(&ShardId::from("EU")).row_count("customers"), 1);
    }
}
