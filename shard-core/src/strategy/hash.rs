//! Hash strategy: stable xxh3 of the shard key, modulo a fixed shard count

use super::{eq_value, not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{EntityRecord, KeyValue, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64;

/// Routes by `xxh3(key) mod N` over a fixed, ordered shard list
///
/// xxh3 is stable across processes and architectures, so the same key always
/// lands on the same shard regardless of where routing runs.
#[derive(Debug, Clone)]
pub struct HashStrategy {
    key_field: String,
    shards: Vec<ShardId>,
}

impl HashStrategy {
    /// Create a strategy over `key_field`; shard count is the list length
    pub fn new(key_field: impl Into<String>, shards: Vec<ShardId>) -> Self {
        Self {
            key_field: key_field.into(),
            shards,
        }
    }

    fn bucket(&self, value: &KeyValue) -> Option<&ShardId> {
        if self.shards.is_empty() {
            return None;
        }
        let bytes = match value {
            KeyValue::Str(s) => s.as_bytes().to_vec(),
            KeyValue::Int(i) => i.to_le_bytes().to_vec(),
            KeyValue::Date(d) => d.timestamp_millis().to_le_bytes().to_vec(),
        };
        let index = (xxh3_64(&bytes) % self.shards.len() as u64) as usize;
        self.shards.get(index)
    }
}

impl ShardStrategy for HashStrategy {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        let value = record.key_value(&self.key_field).ok_or_else(|| {
            not_routable(record, format!("shard key '{}' is null", self.key_field))
        })?;
        self.bucket(&value)
            .cloned()
            .ok_or_else(|| not_routable(record, "hash strategy has zero shards"))
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        if let Some(value) = eq_value(predicates, &self.key_field) {
            if let Some(shard) = self.bucket(value) {
                return Ok(BTreeSet::from([shard.clone()]));
            }
        }
        // range and inequality predicates give the hash no pruning power
        Ok(self.shards.iter().cloned().collect())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        let mut errors = Vec::new();
        if self.shards.is_empty() {
            errors.push("hash strategy configured with zero shards".to_string());
        }
        errors.extend(super::check_known_shards(
            self.name(),
            self.shards.iter(),
            shards,
        ));
        errors
    }

    fn key_field(&self) -> Option<&str> {
        Some(&self.key_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy() -> HashStrategy {
        HashStrategy::new(
            "customer_id",
            (0..4).map(|i| ShardId::new(format!("shard-{}", i))).collect(),
        )
    }

    #[test]
    fn test_route_is_deterministic() {
        let s = strategy();
        let record = EntityRecord::new("orders", json!({"customer_id": 12345}));
        let first = s.route(&record).unwrap();
        let second = s.route(&record).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_equality_candidate_matches_route() {
        let s = strategy();
        let record = EntityRecord::new("orders", json!({"customer_id": 777}));
        let routed = s.route(&record).unwrap();

        let set = s
            .candidates(&[Predicate::eq("customer_id", 777)], None)
            .unwrap();
        assert_eq!(set, BTreeSet::from([routed]));
    }

    #[test]
    fn test_range_predicate_returns_all() {
        let s = strategy();
        let set = s
            .candidates(&[Predicate::gte("customer_id", 100)], None)
            .unwrap();
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_null_key_not_routable() {
        let s = strategy();
        let record = EntityRecord::new("orders", json!({"amount": 10}));
        assert!(s.route(&record).is_err());
    }
}
