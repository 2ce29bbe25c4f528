//! Save interceptor
//!
//! Runs at each save boundary over the ORM's change set. Single-shard saves
//! pass through untouched; a change set spanning several shards is
//! transparently promoted to a coordinator-driven two-phase commit. Inside
//! an explicit application transaction the interceptor defers to the
//! ambient cross-shard transaction - and refuses to promote silently when
//! there is none.

use crate::tracker::{ChangeTracker, EntityState, TrackedEntry};
use shard_core::context::resolve_table;
use shard_core::error::Error;
use shard_core::events::{EngineEvent, EventBus};
use shard_core::registry::ShardRegistry;
use shard_core::router::WriteRouter;
use shard_core::types::{EntityOp, ShardId};
use std::sync::Arc;
use tracing::{debug, info, warn};
use txn_coordinator::{
    CrossShardTransaction, Result, TransactionCoordinator, TransactionOptions,
};

/// Sentinel group for entity types the registry does not know
pub const DEFAULT_GROUP: &str = "_default_";

/// What the interceptor did with a save boundary
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    /// The default ORM save path is correct; the engine did not intervene
    Passthrough {
        /// Entries left for the default path
        entry_count: usize,
    },

    /// The save was promoted, committed, and the tracker cleared
    Completed {
        /// Transaction that carried the save
        transaction_id: String,
        /// Rows written across shards
        rows_affected: u64,
    },

    /// Entries were enqueued on the ambient transaction; commit happens at
    /// the application's transaction boundary
    Deferred {
        /// The ambient transaction id
        transaction_id: String,
        /// Entries enqueued
        enqueued: usize,
    },
}

/// Intercepts save boundaries and promotes cross-shard change sets
pub struct SaveInterceptor {
    registry: Arc<ShardRegistry>,
    router: Arc<WriteRouter>,
    coordinator: Arc<TransactionCoordinator>,
    events: EventBus,
    options: TransactionOptions,
    metrics: Option<Arc<shard_core::metrics::Metrics>>,
}

impl std::fmt::Debug for SaveInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SaveInterceptor")
    }
}

impl SaveInterceptor {
    /// Create an interceptor
    pub fn new(
        registry: Arc<ShardRegistry>,
        router: Arc<WriteRouter>,
        coordinator: Arc<TransactionCoordinator>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            router,
            coordinator,
            events,
            options: TransactionOptions::default(),
            metrics: None,
        }
    }

    /// Options used for implicitly begun transactions
    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<shard_core::metrics::Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle one save boundary
    ///
    /// Returns `Passthrough` when the default save path is correct; the
    /// caller must then let the ORM flush normally. In every other outcome
    /// the tracker has been cleared and the default path must flush nothing.
    pub async fn on_saving(&self, tracker: &mut dyn ChangeTracker) -> Result<SaveOutcome> {
        let entries = tracker.entries();
        if entries.is_empty() {
            return Ok(SaveOutcome::Passthrough { entry_count: 0 });
        }

        let groups = group_by_shard(&self.registry, &self.router, entries)?;
        let default_group = groups.iter().any(|(key, _)| key.is_default());
        let shard_groups = groups.iter().filter(|(key, _)| !key.is_default()).count();

        // single-shard (or default-only) change sets take the default path
        if (shard_groups <= 1 && !default_group) || (shard_groups == 0 && default_group) {
            debug!(groups = groups.len(), "save stays on the default path");
            return Ok(SaveOutcome::Passthrough {
                entry_count: groups.iter().map(|(_, entries)| entries.len()).sum(),
            });
        }

        let entry_count: usize = groups.iter().map(|(_, entries)| entries.len()).sum();
        let shard_count = groups.len();

        let ambient = TransactionCoordinator::current();
        if ambient.is_none() && tracker.in_explicit_transaction() {
            // the user owns this scope; do not promote behind their back
            warn!(
                entry_count,
                shard_count,
                "cross-shard change set inside an explicit transaction with no coordinator"
            );
            self.events.publish(EngineEvent::SaveWithoutCoordinator {
                entry_count,
                shard_count,
            });
            return Ok(SaveOutcome::Passthrough { entry_count });
        }

        let (txn, implicit) = match ambient {
            Some(txn) => (txn, false),
            None => (self.coordinator.begin(self.options.clone()).await?, true),
        };

        let enqueued =
            match enqueue_groups(&self.registry, &txn, groups).await {
                Ok(n) => n,
                Err(e) => {
                    if implicit {
                        if let Err(rollback_error) = txn.rollback().await {
                            warn!(error = %rollback_error, "rollback after enqueue failure failed");
                        }
                    }
                    return Err(e);
                }
            };

        if implicit {
            info!(
                transaction_id = %txn.id(),
                entry_count,
                shard_count,
                "save auto-promoted to a cross-shard transaction"
            );
            self.events.publish(EngineEvent::SaveAutoPromoted {
                entry_count,
                shard_count,
                transaction_id: txn.id().to_string(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.saves_promoted.inc();
            }

            let summary = txn.commit().await?;
            tracker.clear();
            Ok(SaveOutcome::Completed {
                transaction_id: summary.transaction_id,
                rows_affected: summary.total_rows,
            })
        } else {
            tracker.clear();
            Ok(SaveOutcome::Deferred {
                transaction_id: txn.id().to_string(),
                enqueued,
            })
        }
    }
}

/// Target of one group of entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupKey {
    Shard(ShardId),
    Default,
}

impl GroupKey {
    fn is_default(&self) -> bool {
        matches!(self, GroupKey::Default)
    }
}

/// Group entries by target shard in first-appearance order
///
/// First-appearance order matters: it becomes enlistment order, which is
/// phase-2 commit order.
pub(crate) fn group_by_shard(
    registry: &ShardRegistry,
    router: &WriteRouter,
    entries: Vec<TrackedEntry>,
) -> Result<Vec<(GroupKey, Vec<TrackedEntry>)>> {
    let mut groups: Vec<(GroupKey, Vec<TrackedEntry>)> = Vec::new();

    for entry in entries {
        let key = match registry.entity_metadata(&entry.record.entity_type) {
            None => GroupKey::Default,
            Some(_) => {
                let shard = router.target_shard(entry.routing_record())?;
                GroupKey::Shard(shard.shard_id)
            }
        };

        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, bucket)) => bucket.push(entry),
            None => groups.push((key, vec![entry])),
        }
    }

    Ok(groups)
}

/// Enlist each group's shard and enqueue its entries as typed operations
pub(crate) async fn enqueue_groups(
    registry: &ShardRegistry,
    txn: &Arc<CrossShardTransaction>,
    groups: Vec<(GroupKey, Vec<TrackedEntry>)>,
) -> Result<usize> {
    let mut enqueued = 0usize;

    for (key, entries) in groups {
        let shard_id = match key {
            GroupKey::Shard(id) => id,
            GroupKey::Default => registry
                .default_shard()
                .map(|s| s.shard_id.clone())
                .ok_or_else(|| {
                    Error::NoWritableShard(
                        "no default shard for unconfigured entity types".to_string(),
                    )
                })?,
        };

        let participant = txn.enlist(&shard_id).await?;
        let descriptor = registry
            .shard(&shard_id)
            .ok_or_else(|| Error::UnknownShard(shard_id.to_string()))?;

        for entry in entries {
            let (base_table, pk_field) = match registry.entity_metadata(&entry.record.entity_type)
            {
                Some(config) => (config.base_table.clone(), config.primary_key_field.clone()),
                None => (entry.record.entity_type.clone(), "id".to_string()),
            };
            let table = resolve_table(descriptor, &base_table);

            let pk = || {
                entry.record.primary_key(&pk_field).ok_or_else(|| {
                    Error::NotRoutable {
                        entity_type: entry.record.entity_type.clone(),
                        reason: format!("primary key '{}' is missing", pk_field),
                    }
                })
            };

            let op = match entry.state {
                EntityState::Added => EntityOp::Insert { record: entry.record.clone() },
                EntityState::Modified => EntityOp::Update {
                    key: pk()?,
                    record: entry.record.clone(),
                },
                EntityState::Deleted => EntityOp::Delete { key: pk()? },
            };
            participant.enqueue_entity(table, op);
            enqueued += 1;
        }
    }

    Ok(enqueued)
}
