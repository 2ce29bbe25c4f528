//! Property strategy: table lookup from a shard-key value to a shard id

use super::{eq_value, not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{EntityRecord, KeyValue, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// Routes by an exact-match lookup on one property
///
/// String keys fold case; integer keys match exactly. Values with no binding
/// fall back to the default shard when one is configured.
#[derive(Debug, Clone)]
pub struct PropertyStrategy {
    key_field: String,
    bindings: HashMap<String, ShardId>,
    default_shard: Option<ShardId>,
}

impl PropertyStrategy {
    /// Create a strategy over `key_field` with the given value bindings
    pub fn new(
        key_field: impl Into<String>,
        bindings: impl IntoIterator<Item = (KeyValue, ShardId)>,
    ) -> Self {
        Self {
            key_field: key_field.into(),
            bindings: bindings
                .into_iter()
                .map(|(value, shard)| (Self::fold(&value), shard))
                .collect(),
            default_shard: None,
        }
    }

    /// Shard for values with no explicit binding (and for null keys)
    pub fn with_default_shard(mut self, shard: ShardId) -> Self {
        self.default_shard = Some(shard);
        self
    }

    fn fold(value: &KeyValue) -> String {
        match value {
            KeyValue::Str(s) => format!("s:{}", s.to_lowercase()),
            other => other.canonical(),
        }
    }

    fn lookup(&self, value: &KeyValue) -> Option<&ShardId> {
        self.bindings
            .get(&Self::fold(value))
            .or(self.default_shard.as_ref())
    }

    fn all_shards(&self) -> BTreeSet<ShardId> {
        let mut set: BTreeSet<ShardId> = self.bindings.values().cloned().collect();
        if let Some(default) = &self.default_shard {
            set.insert(default.clone());
        }
        set
    }
}

impl ShardStrategy for PropertyStrategy {
    fn name(&self) -> &'static str {
        "property"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        match record.key_value(&self.key_field) {
            Some(value) => self.lookup(&value).cloned().ok_or_else(|| {
                not_routable(
                    record,
                    format!("no shard bound for {} = '{}'", self.key_field, value),
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
        if let Some(value) = eq_value(predicates, &self.key_field) {
            if let Some(shard) = self.lookup(value) {
                return Ok(BTreeSet::from([shard.clone()]));
            }
            // an unbound value with no default matches nothing
            if self.default_shard.is_none() {
                return Ok(BTreeSet::new());
            }
        }
        Ok(self.all_shards())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        super::check_known_shards(
            self.name(),
            self.bindings.values().chain(self.default_shard.iter()),
            shards,
        )
    }

    fn key_field(&self) -> Option<&str> {
        Some(&self.key_field)
    }
}
