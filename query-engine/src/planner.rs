//! Query planner: logical query to candidate shard set

use crate::query::LogicalQuery;
use shard_core::error::{Error, Result};
use shard_core::events::{EngineEvent, EventBus};
use shard_core::registry::ShardRegistry;
use shard_core::types::ShardDescriptor;
use std::sync::Arc;
use tracing::debug;

/// A planned query: the shards to contact and how to address them
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Entity type queried
    pub entity_type: String,

    /// Base physical table (rewritten per shard at execution time)
    pub base_table: String,

    /// Candidate shards in deterministic (id) order
    pub shards: Vec<ShardDescriptor>,

    /// Whether the merge step re-establishes an ordering
    pub ordered: bool,
}

/// Resolves logical queries to candidate shard sets
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    registry: Arc<ShardRegistry>,
    events: EventBus,
}

impl QueryPlanner {
    /// Create a planner over a registry
    pub fn new(registry: Arc<ShardRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

    /// Plan a query
    ///
    /// An empty candidate set is a valid plan (the query returns an empty
    /// result, not an error). Unconfigured entity types are not managed by
    /// the engine and are rejected here.
    pub fn plan(&self, query: &LogicalQuery) -> Result<QueryPlan> {
        let config = self
            .registry
            .entity_metadata(&query.entity_type)
            .ok_or_else(|| {
                Error::InvalidQuery(format!(
                    "entity type '{}' is not managed by the engine",
                    query.entity_type
                ))
            })?;
        let effective = self.registry.effective_config(&query.entity_type)?;

        let candidate_ids = effective
            .strategy
            .candidates(&query.predicates, query.as_of)?;

        let mut shards = Vec::with_capacity(candidate_ids.len());
        for id in &candidate_ids {
            let descriptor = self.registry.shard(id).ok_or_else(|| {
                Error::MisconfiguredRouting(format!(
                    "strategy '{}' produced unknown candidate shard '{}'",
                    effective.strategy.name(),
                    id
                ))
            })?;
            shards.push(descriptor.clone());
        }

        let plan = QueryPlan {
            entity_type: query.entity_type.clone(),
            base_table: config.base_table.clone(),
            shards,
            ordered: query.order_by.is_some(),
        };

        debug!(
            entity_type = %plan.entity_type,
            shard_count = plan.shards.len(),
            ordered = plan.ordered,
            "query planned"
        );
        self.events.publish(EngineEvent::QueryPlanned {
            entity_type: plan.entity_type.clone(),
            shard_ids: plan.shards.iter().map(|s| s.shard_id.clone()).collect(),
            ordered: plan.ordered,
        });

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::LogicalQuery;
    use chrono::{DateTime, Utc};
    use shard_core::registry::EntityShardingConfig;
    use shard_core::strategy::{DateInterval, DateStrategy};
    use shard_core::types::{DateRange, Predicate, ShardId};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn month_registry() -> Arc<ShardRegistry> {
        let months = [
            ("2024-01", "2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z"),
            ("2024-02", "2024-02-01T00:00:00Z", "2024-03-01T00:00:00Z"),
            ("2024-03", "2024-03-01T00:00:00Z", "2024-04-01T00:00:00Z"),
        ];

        let mut builder = ShardRegistry::builder();
        for (id, start, end) in months {
            builder = builder.add_shard(
                shard_core::types::ShardDescriptor::new(id, format!("mem://{}", id))
                    .with_date_range(ts(start), ts(end)),
            );
        }
        let strategy = DateStrategy::new(
            "transaction_date",
            DateInterval::Month,
            "%Y-%m",
            months
                .iter()
                .map(|(id, start, end)| {
                    (ShardId::from(*id), DateRange::new(ts(start), ts(end)))
                })
                .collect(),
        );
        Arc::new(
            builder
                .configure_entity(EntityShardingConfig::new(
                    "transactions",
                    Arc::new(strategy),
                ))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_date_query_plans_only_intersecting_months() {
        let planner = QueryPlanner::new(month_registry(), EventBus::default());

        let query = LogicalQuery::new("transactions")
            .filter(Predicate::gte("transaction_date", ts("2024-02-15T00:00:00Z")))
            .filter(Predicate::lt("transaction_date", ts("2024-03-10T00:00:00Z")));

        let plan = planner.plan(&query).unwrap();
        let ids: Vec<&str> = plan.shards.iter().map(|s| s.shard_id.as_str()).collect();
        assert_eq!(ids, vec!["2024-02", "2024-03"]);
    }

    #[test]
    fn test_unmanaged_entity_rejected() {
        let planner = QueryPlanner::new(month_registry(), EventBus::default());
        assert!(planner.plan(&LogicalQuery::new("widgets")).is_err());
    }

    #[tokio::test]
    async fn test_plan_emits_event() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let planner = QueryPlanner::new(month_registry(), events);

        planner.plan(&LogicalQuery::new("transactions")).unwrap();

        let drained = shard_core::events::drain(&mut rx);
        assert!(drained
            .iter()
            .any(|e| matches!(e, EngineEvent::QueryPlanned { shard_ids, .. } if shard_ids.len() == 3)));
    }
}
