//! Alphabet strategy: first-letter folding into character ranges

use super::{eq_value, not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{EntityRecord, KeyValue, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// One inclusive character range bound to a shard
#[derive(Debug, Clone)]
pub struct AlphabetRange {
    /// First character of the range
    pub from: char,
    /// Last character of the range
    pub to: char,
    /// Owning shard
    pub shard_id: ShardId,
}

/// Routes by the uppercase-folded first character of a string key
///
/// Characters outside every configured range go to the default shard.
#[derive(Debug, Clone)]
pub struct AlphabetStrategy {
    key_field: String,
    ranges: Vec<AlphabetRange>,
    default_shard: Option<ShardId>,
}

impl AlphabetStrategy {
    /// Create a strategy over `key_field` with the given character ranges
    pub fn new(key_field: impl Into<String>, ranges: Vec<AlphabetRange>) -> Self {
        Self {
            key_field: key_field.into(),
            ranges,
            default_shard: None,
        }
    }

    /// Shard for unknown first characters (and null keys)
    pub fn with_default_shard(mut self, shard: ShardId) -> Self {
        self.default_shard = Some(shard);
        self
    }

    fn fold(value: &KeyValue) -> Option<char> {
        match value {
            KeyValue::Str(s) => s.chars().next().map(|c| c.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn lookup(&self, c: char) -> Option<&ShardId> {
        self.ranges
            .iter()
            .find(|r| r.from.to_ascii_uppercase() <= c && c <= r.to.to_ascii_uppercase())
            .map(|r| &r.shard_id)
            .or(self.default_shard.as_ref())
    }

    fn all_shards(&self) -> BTreeSet<ShardId> {
        let mut set: BTreeSet<ShardId> = self.ranges.iter().map(|r| r.shard_id.clone()).collect();
        if let Some(default) = &self.default_shard {
            set.insert(default.clone());
        }
        set
    }
}

impl ShardStrategy for AlphabetStrategy {
    fn name(&self) -> &'static str {
        "alphabet"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        let first = record
            .key_value(&self.key_field)
            .as_ref()
            .and_then(Self::fold);
        match first {
            Some(c) => self.lookup(c).cloned().ok_or_else(|| {
                not_routable(
                    record,
                    format!("no shard covers first letter '{}' and no default shard exists", c),
                )
            }),
            None => self.default_shard.clone().ok_or_else(|| {
                not_routable(
                    record,
                    format!("shard key '{}' is null and no default shard exists", self.key_field),
                )
            }),
        }
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        if let Some(first) = eq_value(predicates, &self.key_field).and_then(Self::fold) {
            if let Some(shard) = self.lookup(first) {
                return Ok(BTreeSet::from([shard.clone()]));
            }
        }
        Ok(self.all_shards())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        super::check_known_shards(
            self.name(),
            self.ranges
                .iter()
                .map(|r| &r.shard_id)
                .chain(self.default_shard.iter()),
            shards,
        )
    }

    fn key_field(&self) -> Option<&str> {
        Some(&self.key_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy() -> AlphabetStrategy {
        AlphabetStrategy::new(
            "last_name",
            vec![
                AlphabetRange { from: 'A', to: 'M', shard_id: ShardId::from("a-m") },
                AlphabetRange { from: 'N', to: 'Z', shard_id: ShardId::from("n-z") },
            ],
        )
        .with_default_shard(ShardId::from("misc"))
    }

    #[test]
    fn test_route_folds_case() {
        let s = strategy();
        let record = EntityRecord::new("customers", json!({"last_name": "smith"}));
        assert_eq!(s.route(&record).unwrap(), ShardId::from("n-z"));
    }

    #[test]
    fn test_unknown_character_routes_to_default() {
        let s = strategy();
        let record = EntityRecord::new("customers", json!({"last_name": "Åberg"}));
        assert_eq!(s.route(&record).unwrap(), ShardId::from("misc"));
    }

    #[test]
    fn test_candidates_equality_singleton() {
        let s = strategy();
        let set = s
            .candidates(&[Predicate::eq("last_name", "Baker")], None)
            .unwrap();
        assert_eq!(set, BTreeSet::from([ShardId::from("a-m")]));
    }

    #[test]
    fn test_candidates_unconstrained_includes_default() {
        let s = strategy();
        let set = s.candidates(&[], None).unwrap();
        assert_eq!(set.len(), 3);
    }
}
