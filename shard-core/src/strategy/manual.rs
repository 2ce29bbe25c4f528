//! Manual strategy: explicit per-shard predicates

use super::{not_routable, ShardStrategy};
use crate::error::{Error, Result};
use crate::types::{Comparison, EntityRecord, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// One manual routing rule
#[derive(Debug, Clone)]
pub struct ManualRule {
    /// Target shard
    pub shard_id: ShardId,
    /// Predicate an entity must match to live on the shard
    pub predicate: Predicate,
    /// Whether the shard accepts writes through this rule
    pub writable: bool,
}

/// Routes by evaluating each shard's predicate against the entity
///
/// When several writable rules match, the ambiguity is resolved by tier
/// (Hot first) and then by ascending priority; a residual tie is a
/// configuration error.
#[derive(Debug, Clone)]
pub struct ManualStrategy {
    rules: Vec<ManualRule>,
    // (tier rank, priority) per shard, captured from the catalog
    preference: HashMap<ShardId, (u8, i32)>,
}

impl ManualStrategy {
    /// Create a strategy from explicit rules
    pub fn new(rules: Vec<ManualRule>) -> Self {
        Self {
            rules,
            preference: HashMap::new(),
        }
    }

    /// Capture tier/priority tie-break information from the shard catalog
    pub fn with_catalog<'a>(mut self, shards: impl IntoIterator<Item = &'a ShardDescriptor>) -> Self {
        self.preference = shards
            .into_iter()
            .map(|s| (s.shard_id.clone(), (s.tier.rank(), s.priority)))
            .collect();
        self
    }

    fn preference_key(&self, shard_id: &ShardId) -> Option<(u8, i32)> {
        self.preference.get(shard_id).copied()
    }
}

impl ShardStrategy for ManualStrategy {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        let matching: Vec<&ManualRule> = self
            .rules
            .iter()
            .filter(|r| r.predicate.matches(record))
            .collect();

        if matching.is_empty() {
            return Err(not_routable(record, "no manual rule matches"));
        }

        let writable: Vec<&ManualRule> = matching.iter().filter(|r| r.writable).copied().collect();
        if writable.is_empty() {
            return Err(Error::NoWritableShard(record.entity_type.clone()));
        }
        if writable.len() == 1 {
            return Ok(writable[0].shard_id.clone());
        }

        // several writable matches: Hot tier first, then lowest priority
        let mut ranked: Vec<(&ManualRule, (u8, i32))> = writable
            .iter()
            .filter_map(|r| self.preference_key(&r.shard_id).map(|key| (*r, key)))
            .collect();
        if ranked.len() != writable.len() {
            return Err(Error::MisconfiguredRouting(format!(
                "manual strategy matched {} writable shards for entity '{}' and has no tie-break data",
                writable.len(),
                record.entity_type
            )));
        }
        ranked.sort_by_key(|(_, key)| *key);
        if ranked.len() > 1 && ranked[0].1 == ranked[1].1 {
            return Err(Error::MisconfiguredRouting(format!(
                "manual strategy matched shards '{}' and '{}' with equal preference for entity '{}'",
                ranked[0].0.shard_id, ranked[1].0.shard_id, record.entity_type
            )));
        }
        Ok(ranked[0].0.shard_id.clone())
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        // A rule can be excluded only when the query pins the rule's field
        // with an equality that contradicts it; everything else stays in.
        let pinned: EntityRecord = {
            let mut fields = serde_json::Map::new();
            for p in predicates.iter().filter(|p| p.op == Comparison::Eq) {
                fields.insert(
                    p.field.clone(),
                    serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null),
                );
            }
            EntityRecord::new("", serde_json::Value::Object(fields))
        };

        Ok(self
            .rules
            .iter()
            .filter(|r| {
                pinned.field(&r.predicate.field).is_none() || r.predicate.matches(&pinned)
            })
            .map(|r| r.shard_id.clone())
            .collect())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.rules.iter().any(|r| r.writable) {
            errors.push("manual strategy has zero writable shards".to_string());
        }
        errors.extend(super::check_known_shards(
            self.name(),
            self.rules.iter().map(|r| &r.shard_id),
            shards,
        ));
        errors
    }
}
