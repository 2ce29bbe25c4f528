//! Row-count strategy: fill shards in order, newest first for writes

use super::{not_routable, ShardStrategy};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::types::{EntityRecord, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Routes writes to the most recent shard that still has capacity
///
/// Shards are listed oldest to newest. When the newest shard reaches its
/// target row count the strategy publishes a [`EngineEvent::ShardNeeded`]
/// request and refuses the write: the registry is immutable, so growing the
/// shard set is an operator (or re-construction) concern.
pub struct RowCountStrategy {
    entity_type: String,
    capacity: u64,
    shards: Vec<ShardId>,
    counts: Vec<AtomicU64>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for RowCountStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCountStrategy")
            .field("entity_type", &self.entity_type)
            .field("capacity", &self.capacity)
            .field("shards", &self.shards)
            .finish()
    }
}

impl RowCountStrategy {
    /// Create a strategy with shards ordered oldest to newest
    pub fn new(entity_type: impl Into<String>, capacity: u64, shards: Vec<ShardId>) -> Self {
        let counts = shards.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            entity_type: entity_type.into(),
            capacity,
            shards,
            counts,
            events: None,
        }
    }

    /// Attach the event bus used for shard-needed requests
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Seed the known row count of a shard (startup bookkeeping)
    pub fn seed_count(&self, shard_id: &ShardId, count: u64) {
        if let Some(index) = self.shards.iter().position(|s| s == shard_id) {
            self.counts[index].store(count, Ordering::Relaxed);
        }
    }

    /// Current fill estimate of a shard
    pub fn count(&self, shard_id: &ShardId) -> Option<u64> {
        self.shards
            .iter()
            .position(|s| s == shard_id)
            .map(|index| self.counts[index].load(Ordering::Relaxed))
    }
}

impl ShardStrategy for RowCountStrategy {
    fn name(&self) -> &'static str {
        "row_count"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        if self.shards.is_empty() {
            return Err(not_routable(record, "row-count strategy has zero shards"));
        }

        // most recent shard with remaining capacity
        for index in (0..self.shards.len()).rev() {
            if self.counts[index].load(Ordering::Relaxed) < self.capacity {
                return Ok(self.shards[index].clone());
            }
        }

        let newest = self.shards[self.shards.len() - 1].clone();
        if let Some(events) = &self.events {
            events.publish(EngineEvent::ShardNeeded {
                entity_type: self.entity_type.clone(),
                full_shard_id: newest,
            });
        }
        Err(Error::NoWritableShard(self.entity_type.clone()))
    }

    fn candidates(
        &self,
        _predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        // row counts carry no predicate information; every shard may match
        Ok(self.shards.iter().cloned().collect())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        let mut errors = Vec::new();
        if self.capacity == 0 {
            errors.push("row-count strategy configured with zero capacity".to_string());
        }
        errors.extend(super::check_known_shards(
            self.name(),
            self.shards.iter(),
            shards,
        ));
        errors
    }

    fn record_write(&self, shard_id: &ShardId) {
        if let Some(index) = self.shards.iter().position(|s| s == shard_id) {
            self.counts[index].fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fills_newest_shard_first() {
        let s = RowCountStrategy::new(
            "logs",
            2,
            vec![ShardId::from("logs-1"), ShardId::from("logs-2")],
        );
        let record = EntityRecord::new("logs", json!({"message": "x"}));

        assert_eq!(s.route(&record).unwrap(), ShardId::from("logs-2"));
    }

    #[test]
    fn test_full_newest_falls_back_then_refuses() {
        let s = RowCountStrategy::new(
            "logs",
            1,
            vec![ShardId::from("logs-1"), ShardId::from("logs-2")],
        );
        let record = EntityRecord::new("logs", json!({"message": "x"}));

        s.record_write(&ShardId::from("logs-2"));
        assert_eq!(s.route(&record).unwrap(), ShardId::from("logs-1"));

        s.record_write(&ShardId::from("logs-1"));
        assert!(matches!(s.route(&record), Err(Error::NoWritableShard(_))));
    }

    #[tokio::test]
    async fn test_shard_needed_event_when_exhausted() {
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let s = RowCountStrategy::new("logs", 1, vec![ShardId::from("logs-1")])
            .with_event_bus(events);
        s.seed_count(&ShardId::from("logs-1"), 1);

        let record = EntityRecord::new("logs", json!({"message": "x"}));
        assert!(s.route(&record).is_err());

        let drained = crate::events::drain(&mut rx);
        assert!(drained
            .iter()
            .any(|e| matches!(e, EngineEvent::ShardNeeded { .. })));
    }
}
