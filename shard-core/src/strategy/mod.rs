//! Sharding strategies
//!
//! A strategy answers two pure questions: where does this entity live
//! (`route`, mandatory for writes), and which shards could hold rows
//! matching this predicate set (`candidates`, for reads). Candidate sets
//! must be sound: any shard that could contain a matching row is included.

mod alphabet;
mod date;
mod expression;
mod hash;
mod manual;
mod property;
mod range;
mod row_count;

pub use alphabet::{AlphabetRange, AlphabetStrategy};
pub use date::{DateInterval, DateStrategy};
pub use expression::ExpressionStrategy;
pub use hash::HashStrategy;
pub use manual::{ManualRule, ManualStrategy};
pub use property::PropertyStrategy;
pub use range::{RangeBinding, RangeStrategy};
pub use row_count::RowCountStrategy;

use crate::error::{Error, Result};
use crate::types::{Comparison, EntityRecord, KeyValue, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// A shard-resolution strategy for one entity type
pub trait ShardStrategy: Send + Sync {
    /// Strategy name for logging and validation messages
    fn name(&self) -> &'static str;

    /// Resolve the target shard for a write
    fn route(&self, record: &EntityRecord) -> Result<ShardId>;

    /// Resolve the shards that could hold rows matching the predicates
    ///
    /// `as_of` is the temporal point of an as-of query; only the date
    /// strategy uses it for narrowing.
    fn candidates(
        &self,
        predicates: &[Predicate],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>>;

    /// Configuration errors detected against the shard catalog
    fn validate(&self, _shards: &[ShardDescriptor]) -> Vec<String> {
        Vec::new()
    }

    /// The shard-key field, when the strategy has a single one
    fn key_field(&self) -> Option<&str> {
        None
    }

    /// Observe a routed write landing on a shard (row-count bookkeeping)
    fn record_write(&self, _shard_id: &ShardId) {}
}

pub(crate) fn not_routable(record: &EntityRecord, reason: impl Into<String>) -> Error {
    Error::NotRoutable {
        entity_type: record.entity_type.clone(),
        reason: reason.into(),
    }
}

/// The value of an equality predicate on `field`, if one exists
pub(crate) fn eq_value<'a>(predicates: &'a [Predicate], field: &str) -> Option<&'a KeyValue> {
    predicates
        .iter()
        .find(|p| p.field == field && p.op == Comparison::Eq)
        .map(|p| &p.value)
}

/// Interval bounds `[lower, upper]` implied by the predicates on `field`
///
/// Each bound carries an inclusivity flag. Equality contributes to both
/// sides. Conflicting predicates tighten; soundness is preserved because a
/// tighter interval only ever excludes shards that cannot match.
pub(crate) fn bounds(
    predicates: &[Predicate],
    field: &str,
) -> (Option<(KeyValue, bool)>, Option<(KeyValue, bool)>) {
    let mut lower: Option<(KeyValue, bool)> = None;
    let mut upper: Option<(KeyValue, bool)> = None;

    for p in predicates.iter().filter(|p| p.field == field) {
        match p.op {
            Comparison::Eq => {
                tighten_lower(&mut lower, p.value.clone(), true);
                tighten_upper(&mut upper, p.value.clone(), true);
            }
            Comparison::Gt => tighten_lower(&mut lower, p.value.clone(), false),
            Comparison::Gte => tighten_lower(&mut lower, p.value.clone(), true),
            Comparison::Lt => tighten_upper(&mut upper, p.value.clone(), false),
            Comparison::Lte => tighten_upper(&mut upper, p.value.clone(), true),
            Comparison::Ne => {}
        }
    }

    (lower, upper)
}

fn tighten_lower(bound: &mut Option<(KeyValue, bool)>, value: KeyValue, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, _)) => matches!(
            value.compare(current),
            Some(std::cmp::Ordering::Greater)
        ),
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}

fn tighten_upper(bound: &mut Option<(KeyValue, bool)>, value: KeyValue, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, _)) => matches!(value.compare(current), Some(std::cmp::Ordering::Less)),
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}

/// Validation helper: every referenced shard id must exist in the catalog
pub(crate) fn check_known_shards<'a>(
    strategy: &str,
    ids: impl Iterator<Item = &'a ShardId>,
    shards: &[ShardDescriptor],
) -> Vec<String> {
    ids.filter(|id| !shards.iter().any(|s| &s.shard_id == *id))
        .map(|id| format!("{} strategy references unknown shard '{}'", strategy, id))
        .collect()
}
