//! Range strategy: ordered, non-overlapping key ranges bound to shards

use super::{bounds, not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{EntityRecord, KeyValue, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// One `[low, high]` range (inclusive on both ends) bound to a shard
#[derive(Debug, Clone)]
pub struct RangeBinding {
    /// Inclusive lower bound
    pub low: KeyValue,
    /// Inclusive upper bound
    pub high: KeyValue,
    /// Owning shard
    pub shard_id: ShardId,
}

/// Routes by locating the key inside an ordered range list
///
/// Ranges are kept sorted by lower bound; a key sitting exactly on a shared
/// boundary resolves to the lower shard because scanning is in order.
#[derive(Debug, Clone)]
pub struct RangeStrategy {
    key_field: String,
    ranges: Vec<RangeBinding>,
}

impl RangeStrategy {
    /// Create a strategy over `key_field` with the given range bindings
    pub fn new(key_field: impl Into<String>, mut ranges: Vec<RangeBinding>) -> Self {
        ranges.sort_by(|a, b| a.low.compare(&b.low).unwrap_or(Ordering::Equal));
        Self {
            key_field: key_field.into(),
            ranges,
        }
    }

    fn contains(range: &RangeBinding, value: &KeyValue) -> bool {
        let above_low = matches!(
            value.compare(&range.low),
            Some(Ordering::Greater | Ordering::Equal)
        );
        let below_high = matches!(
            value.compare(&range.high),
            Some(Ordering::Less | Ordering::Equal)
        );
        above_low && below_high
    }

    /// Whether a range can intersect the predicate interval
    fn intersects(
        range: &RangeBinding,
        lower: &Option<(KeyValue, bool)>,
        upper: &Option<(KeyValue, bool)>,
    ) -> bool {
        if let Some((value, inclusive)) = upper {
            match value.compare(&range.low) {
                Some(Ordering::Less) => return false,
                Some(Ordering::Equal) if !inclusive => return false,
                // incomparable bounds cannot prune: stay sound
                _ => {}
            }
        }
        if let Some((value, inclusive)) = lower {
            match value.compare(&range.high) {
                Some(Ordering::Greater) => return false,
                Some(Ordering::Equal) if !inclusive => return false,
                _ => {}
            }
        }
        true
    }
}

impl ShardStrategy for RangeStrategy {
    fn name(&self) -> &'static str {
        "range"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        let value = record.key_value(&self.key_field).ok_or_else(|| {
            not_routable(record, format!("shard key '{}' is null", self.key_field))
        })?;
        self.ranges
            .iter()
            .find(|r| Self::contains(r, &value))
            .map(|r| r.shard_id.clone())
            .ok_or_else(|| {
                not_routable(
                    record,
                    format!("no range covers {} = '{}'", self.key_field, value),
                )
            })
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        let (lower, upper) = bounds(predicates, &self.key_field);
        Ok(self
            .ranges
            .iter()
            .filter(|r| Self::intersects(r, &lower, &upper))
            .map(|r| r.shard_id.clone())
            .collect())
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        let mut errors = Vec::new();
        for pair in self.ranges.windows(2) {
            if matches!(
                pair[0].high.compare(&pair[1].low),
                Some(Ordering::Greater)
            ) {
                errors.push(format!(
                    "range strategy has overlapping ranges for shards '{}' and '{}'",
                    pair[0].shard_id, pair[1].shard_id
                ));
            }
        }
        errors.extend(super::check_known_shards(
            self.name(),
            self.ranges.iter().map(|r| &r.shard_id),
            shards,
        ));
        errors
    }

    fn key_field(&self) -> Option<&str> {
        Some(&self.key_field)
    }
}
