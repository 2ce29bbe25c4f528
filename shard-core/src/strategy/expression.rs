//! Expression strategy: a user closure decides the shard

use super::{not_routable, ShardStrategy};
use crate::error::Result;
use crate::types::{EntityRecord, Predicate, ShardDescriptor, ShardId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

type RouteFn = dyn Fn(&EntityRecord) -> Option<ShardId> + Send + Sync;
type CandidateFn = dyn Fn(&[Predicate]) -> BTreeSet<ShardId> + Send + Sync;

/// Routes through an arbitrary closure
///
/// Reads conservatively return every shard unless a candidate hint closure
/// is supplied alongside the router.
pub struct ExpressionStrategy {
    all_shards: BTreeSet<ShardId>,
    route_fn: Arc<RouteFn>,
    candidate_hint: Option<Arc<CandidateFn>>,
}

impl std::fmt::Debug for ExpressionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionStrategy")
            .field("all_shards", &self.all_shards)
            .field("has_candidate_hint", &self.candidate_hint.is_some())
            .finish()
    }
}

impl ExpressionStrategy {
    /// Create a strategy from the router closure and the full shard set
    pub fn new<F>(all_shards: impl IntoIterator<Item = ShardId>, route_fn: F) -> Self
    where
        F: Fn(&EntityRecord) -> Option<ShardId> + Send + Sync + 'static,
    {
        Self {
            all_shards: all_shards.into_iter().collect(),
            route_fn: Arc::new(route_fn),
            candidate_hint: None,
        }
    }

    /// Supply a candidate hint so reads can prune shards
    pub fn with_candidate_hint<F>(mut self, hint: F) -> Self
    where
        F: Fn(&[Predicate]) -> BTreeSet<ShardId> + Send + Sync + 'static,
    {
        self.candidate_hint = Some(Arc::new(hint));
        self
    }
}

impl ShardStrategy for ExpressionStrategy {
    fn name(&self) -> &'static str {
        "expression"
    }

    fn route(&self, record: &EntityRecord) -> Result<ShardId> {
        (self.route_fn)(record)
            .ok_or_else(|| not_routable(record, "expression returned no shard"))
    }

    fn candidates(
        &self,
        predicates: &[Predicate],
        _as_of: Option<DateTime<Utc>>,
    ) -> Result<BTreeSet<ShardId>> {
        match &self.candidate_hint {
            Some(hint) => Ok(hint(predicates)),
            None => Ok(self.all_shards.clone()),
        }
    }

    fn validate(&self, shards: &[ShardDescriptor]) -> Vec<String> {
        super::check_known_shards(self.name(), self.all_shards.iter(), shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy() -> ExpressionStrategy {
        ExpressionStrategy::new(
            [ShardId::from("even"), ShardId::from("odd")],
            |record: &EntityRecord| {
                let id = record.field("id")?.as_i64()?;
                Some(if id % 2 == 0 {
                    ShardId::from("even")
                } else {
                    ShardId::from("odd")
                })
            },
        )
    }

    #[test]
    fn test_route_through_closure() {
        let s = strategy();
        let record = EntityRecord::new("widgets", json!({"id": 7}));
        assert_eq!(s.route(&record).unwrap(), ShardId::from("odd"));
    }

    #[test]
    fn test_route_none_is_not_routable() {
        let s = strategy();
        let record = EntityRecord::new("widgets", json!({"name": "x"}));
        assert!(s.route(&record).is_err());
    }

    #[test]
    fn test_candidates_conservative_without_hint() {
        let s = strategy();
        let set = s.candidates(&[Predicate::eq("id", 4)], None).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_candidates_with_hint() {
        let s = strategy().with_candidate_hint(|predicates| {
            predicates
                .iter()
                .filter_map(|p| match &p.value {
                    crate::types::KeyValue::Int(i) => Some(*i),
                    _ => None,
                })
                .map(|id| {
                    if id % 2 == 0 {
                        ShardId::from("even")
                    } else {
                        ShardId::from("odd")
                    }
                })
                .collect()
        });
        let set = s.candidates(&[Predicate::eq("id", 4)], None).unwrap();
        assert_eq!(set, BTreeSet::from([ShardId::from("even")]));
    }
}
