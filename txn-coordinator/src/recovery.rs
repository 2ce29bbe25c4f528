//! Recovery log
//!
//! When a transaction opts in, the coordinator persists a prepared-
//! transaction record before phase 2 and the outcome after it. The log is
//! an operator hook: `pending()` surfaces transactions that prepared but
//! never reached a uniform outcome. Nothing replays automatically.
//!
//! The default backend is in-memory; the RocksDB backend survives process
//! restarts.

use crate::error::{Result, TransactionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use shard_core::types::ShardId;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A transaction that finished phase 1 with unanimous Prepared/ReadOnly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedTransactionRecord {
    /// Transaction id
    pub transaction_id: String,
    /// Enlisted shards in commit order
    pub shard_ids: Vec<ShardId>,
    /// Isolation level name
    pub isolation: String,
    /// When phase 1 completed
    pub prepared_at: DateTime<Utc>,
}

/// Terminal outcome of a logged transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransactionOutcome {
    /// Every shard committed
    Committed,
    /// Every shard rolled back
    RolledBack,
    /// Divergent phase 2; operator action required
    InDoubt {
        /// Shards whose local commit succeeded
        committed_shards: Vec<ShardId>,
        /// Shards whose local commit did not succeed
        failed_shards: Vec<ShardId>,
    },
}

/// Pluggable persistence for prepared-transaction records
#[async_trait]
pub trait RecoveryLog: Send + Sync {
    /// Persist a prepared record before phase 2 begins
    async fn record_prepared(&self, record: &PreparedTransactionRecord) -> Result<()>;

    /// Persist the terminal outcome
    async fn record_outcome(&self, transaction_id: &str, outcome: &TransactionOutcome) -> Result<()>;

    /// Records with no outcome, or an in-doubt one - the operator worklist
    async fn pending(&self) -> Result<Vec<PreparedTransactionRecord>>;
}

/// Default log: process-local, lost on restart
#[derive(Debug, Default)]
pub struct InMemoryRecoveryLog {
    entries: Mutex<HashMap<String, (PreparedTransactionRecord, Option<TransactionOutcome>)>>,
}

impl InMemoryRecoveryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded outcome of a transaction, if any
    pub fn outcome(&self, transaction_id: &str) -> Option<TransactionOutcome> {
        self.entries
            .lock()
            .get(transaction_id)
            .and_then(|(_, outcome)| outcome.clone())
    }
}

#[async_trait]
impl RecoveryLog for InMemoryRecoveryLog {
    async fn record_prepared(&self, record: &PreparedTransactionRecord) -> Result<()> {
        self.entries
            .lock()
            .insert(record.transaction_id.clone(), (record.clone(), None));
        Ok(())
    }

    async fn record_outcome(&self, transaction_id: &str, outcome: &TransactionOutcome) -> Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(transaction_id) {
            entry.1 = Some(outcome.clone());
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PreparedTransactionRecord>> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|(_, outcome)| {
                matches!(outcome, None | Some(TransactionOutcome::InDoubt { .. }))
            })
            .map(|(record, _)| record.clone())
            .collect())
    }
}

const CF_PREPARED: &str = "prepared";
const CF_OUTCOMES: &str = "outcomes";

/// RocksDB-backed log surviving process restarts
pub struct RocksRecoveryLog {
    db: Arc<DB>,
}

impl std::fmt::Debug for RocksRecoveryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RocksRecoveryLog")
    }
}

impl RocksRecoveryLog {
    /// Open or create the log database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .map_err(|e| TransactionError::Recovery(e.to_string()))?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PREPARED, Options::default()),
            ColumnFamilyDescriptor::new(CF_OUTCOMES, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .map_err(|e| TransactionError::Recovery(e.to_string()))?;

        info!(path = %path.display(), "recovery log opened");
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TransactionError::Recovery(format!("missing column family '{}'", name)))
    }
}

#[async_trait]
impl RecoveryLog for RocksRecoveryLog {
    async fn record_prepared(&self, record: &PreparedTransactionRecord) -> Result<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| TransactionError::Recovery(e.to_string()))?;
        self.db
            .put_cf(self.cf(CF_PREPARED)?, record.transaction_id.as_bytes(), bytes)
            .map_err(|e| TransactionError::Recovery(e.to_string()))
    }

    async fn record_outcome(&self, transaction_id: &str, outcome: &TransactionOutcome) -> Result<()> {
        let bytes =
            bincode::serialize(outcome).map_err(|e| TransactionError::Recovery(e.to_string()))?;
        self.db
            .put_cf(self.cf(CF_OUTCOMES)?, transaction_id.as_bytes(), bytes)
            .map_err(|e| TransactionError::Recovery(e.to_string()))
    }

    async fn pending(&self) -> Result<Vec<PreparedTransactionRecord>> {
        let prepared_cf = self.cf(CF_PREPARED)?;
        let outcomes_cf = self.cf(CF_OUTCOMES)?;

        let mut pending = Vec::new();
        for item in self.db.iterator_cf(prepared_cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item.map_err(|e| TransactionError::Recovery(e.to_string()))?;
            let record: PreparedTransactionRecord = bincode::deserialize(&value)
                .map_err(|e| TransactionError::Recovery(e.to_string()))?;

            let outcome = self
                .db
                .get_cf(outcomes_cf, &key)
                .map_err(|e| TransactionError::Recovery(e.to_string()))?
                .map(|bytes| bincode::deserialize::<TransactionOutcome>(&bytes))
                .transpose()
                .map_err(|e| TransactionError::Recovery(e.to_string()))?;

            if matches!(outcome, None | Some(TransactionOutcome::InDoubt { .. })) {
                pending.push(record);
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PreparedTransactionRecord {
        PreparedTransactionRecord {
            transaction_id: id.to_string(),
            shard_ids: vec![ShardId::from("EU"), ShardId::from("US")],
            isolation: "read_committed".to_string(),
            prepared_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_pending_tracks_outcomes() {
        let log = InMemoryRecoveryLog::new();
        log.record_prepared(&record("XS-1")).await.unwrap();
        log.record_prepared(&record("XS-2")).await.unwrap();
        assert_eq!(log.pending().await.unwrap().len(), 2);

        log.record_outcome("XS-1", &TransactionOutcome::Committed)
            .await
            .unwrap();
        let pending = log.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_id, "XS-2");
    }

    #[tokio::test]
    async fn test_in_memory_in_doubt_stays_pending() {
        let log = InMemoryRecoveryLog::new();
        log.record_prepared(&record("XS-1")).await.unwrap();
        log.record_outcome(
            "XS-1",
            &TransactionOutcome::InDoubt {
                committed_shards: vec![ShardId::from("EU")],
                failed_shards: vec![ShardId::from("US")],
            },
        )
        .await
        .unwrap();

        assert_eq!(log.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rocks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = RocksRecoveryLog::open(dir.path()).unwrap();

        log.record_prepared(&record("XS-1")).await.unwrap();
        let pending = log.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].shard_ids.len(), 2);

        log.record_outcome("XS-1", &TransactionOutcome::RolledBack)
            .await
            .unwrap();
        assert!(log.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rocks_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RocksRecoveryLog::open(dir.path()).unwrap();
            log.record_prepared(&record("XS-persisted")).await.unwrap();
        }
        let log = RocksRecoveryLog::open(dir.path()).unwrap();
        let pending = log.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_id, "XS-persisted");
    }
}
