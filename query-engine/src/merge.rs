//! Result merging
//!
//! Per-shard result sets arrive unordered. The merge step concatenates,
//! re-establishes the requested global ordering with a k-way merge, applies
//! skip/take on the merged stream, and computes aggregations over the union
//! of per-shard projections with exact decimal arithmetic.

use crate::query::{Aggregate, LogicalQuery, OrderSpec, QueryResult, SortDirection};
use rust_decimal::Decimal;
use shard_core::error::Result;
use shard_core::types::{EntityRecord, KeyValue, ShardId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::str::FromStr;

/// Merge per-shard results into the final logical result
pub fn merge(query: &LogicalQuery, per_shard: Vec<(ShardId, Vec<EntityRecord>)>) -> Result<QueryResult> {
    if let Some(aggregate) = &query.aggregate {
        return aggregate_rows(aggregate, per_shard);
    }

    let rows = match &query.order_by {
        Some(order) => k_way_merge(per_shard.into_iter().map(|(_, rows)| rows).collect(), order),
        None => per_shard.into_iter().flat_map(|(_, rows)| rows).collect(),
    };

    Ok(QueryResult::Rows(paginate(rows, query.skip, query.take)))
}

fn paginate(rows: Vec<EntityRecord>, skip: Option<usize>, take: Option<usize>) -> Vec<EntityRecord> {
    rows.into_iter()
        .skip(skip.unwrap_or(0))
        .take(take.unwrap_or(usize::MAX))
        .collect()
}

/// Totally ordered sort key; missing and incomparable values sort last
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Int(i64),
    DateMillis(i64),
    Str(String),
    Missing,
}

fn sort_key(record: &EntityRecord, field: &str) -> SortKey {
    match record.key_value(field) {
        Some(value) => {
            if let Some(d) = value.as_date() {
                SortKey::DateMillis(d.timestamp_millis())
            } else {
                match value {
                    KeyValue::Int(i) => SortKey::Int(i),
                    KeyValue::Str(s) => SortKey::Str(s),
                    KeyValue::Date(d) => SortKey::DateMillis(d.timestamp_millis()),
                }
            }
        }
        None => SortKey::Missing,
    }
}

/// Merge pre-sorted per-shard lists into one ordered stream
fn k_way_merge(mut lists: Vec<Vec<EntityRecord>>, order: &OrderSpec) -> Vec<EntityRecord> {
    for list in &mut lists {
        list.sort_by(|a, b| sort_key(a, &order.field).cmp(&sort_key(b, &order.field)));
    }

    let total: usize = lists.iter().map(|l| l.len()).sum();
    let mut merged = Vec::with_capacity(total);

    // min-heap over (head key, list index, position)
    let mut heap = BinaryHeap::with_capacity(lists.len());
    for (index, list) in lists.iter().enumerate() {
        if let Some(first) = list.first() {
            heap.push(Reverse((sort_key(first, &order.field), index, 0usize)));
        }
    }

    while let Some(Reverse((_, index, position))) = heap.pop() {
        merged.push(lists[index][position].clone());
        let next = position + 1;
        if next < lists[index].len() {
            heap.push(Reverse((
                sort_key(&lists[index][next], &order.field),
                index,
                next,
            )));
        }
    }

    if order.direction == SortDirection::Desc {
        merged.reverse();
    }
    merged
}

fn decimal_of(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

fn aggregate_rows(
    aggregate: &Aggregate,
    per_shard: Vec<(ShardId, Vec<EntityRecord>)>,
) -> Result<QueryResult> {
    let rows = per_shard.into_iter().flat_map(|(_, rows)| rows);

    match aggregate {
        Aggregate::Count => Ok(QueryResult::Count(rows.count() as u64)),

        Aggregate::Sum { field } => {
            let mut total = Decimal::ZERO;
            for row in rows {
                if let Some(value) = row.field(field).and_then(decimal_of) {
                    total += value;
                }
            }
            Ok(QueryResult::Sum(total))
        }

        Aggregate::GroupBySum { group_field, value_field } => {
            let mut groups: BTreeMap<String, (KeyValue, Decimal)> = BTreeMap::new();
            for row in rows {
                let Some(group) = row.key_value(group_field) else {
                    continue;
                };
                let value = row.field(value_field).and_then(decimal_of).unwrap_or(Decimal::ZERO);
                groups
                    .entry(group.canonical())
                    .and_modify(|(_, sum)| *sum += value)
                    .or_insert((group, value));
            }
            Ok(QueryResult::Groups(groups.into_values().collect()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::LogicalQuery;
    use serde_json::json;

    fn shard_rows(shard: &str, amounts: &[i64]) -> (ShardId, Vec<EntityRecord>) {
        (
            ShardId::from(shard),
            amounts
                .iter()
                .map(|a| EntityRecord::new("orders", json!({"id": a, "amount": a, "region": shard})))
                .collect(),
        )
    }

    #[test]
    fn test_unordered_merge_concatenates() {
        let query = LogicalQuery::new("orders");
        let result = merge(
            &query,
            vec![shard_rows("EU", &[3, 1]), shard_rows("US", &[2])],
        )
        .unwrap();
        assert_eq!(result.rows().len(), 3);
    }

    #[test]
    fn test_ordered_merge_is_globally_sorted() {
        let query = LogicalQuery::new("orders").order_by("amount", SortDirection::Asc);
        let result = merge(
            &query,
            vec![shard_rows("EU", &[5, 1, 9]), shard_rows("US", &[4, 2])],
        )
        .unwrap();

        let amounts: Vec<i64> = result
            .rows()
            .iter()
            .map(|r| r.field("amount").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(amounts, vec![1, 2, 4, 5, 9]);
    }

    #[test]
    fn test_descending_order() {
        let query = LogicalQuery::new("orders").order_by("amount", SortDirection::Desc);
        let result = merge(
            &query,
            vec![shard_rows("EU", &[5, 1]), shard_rows("US", &[4])],
        )
        .unwrap();

        let amounts: Vec<i64> = result
            .rows()
            .iter()
            .map(|r| r.field("amount").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(amounts, vec![5, 4, 1]);
    }

    #[test]
    fn test_skip_take_on_merged_stream() {
        let query = LogicalQuery::new("orders")
            .order_by("amount", SortDirection::Asc)
            .skip(1)
            .take(2);
        let result = merge(
            &query,
            vec![shard_rows("EU", &[5, 1, 9]), shard_rows("US", &[4, 2])],
        )
        .unwrap();

        let amounts: Vec<i64> = result
            .rows()
            .iter()
            .map(|r| r.field("amount").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(amounts, vec![2, 4]);
    }

    #[test]
    fn test_count_aggregate() {
        let query = LogicalQuery::new("orders").aggregate(Aggregate::Count);
        let result = merge(
            &query,
            vec![shard_rows("EU", &[1, 2]), shard_rows("US", &[3])],
        )
        .unwrap();
        assert_eq!(result, QueryResult::Count(3));
    }

    #[test]
    fn test_sum_aggregate_is_exact() {
        let query = LogicalQuery::new("orders").aggregate(Aggregate::Sum {
            field: "amount".to_string(),
        });
        let result = merge(
            &query,
            vec![shard_rows("EU", &[10, 20]), shard_rows("US", &[12])],
        )
        .unwrap();
        assert_eq!(result, QueryResult::Sum(Decimal::from(42)));
    }

    #[test]
    fn test_group_by_sum() {
        let query = LogicalQuery::new("orders").aggregate(Aggregate::GroupBySum {
            group_field: "region".to_string(),
            value_field: "amount".to_string(),
        });
        let result = merge(
            &query,
            vec![shard_rows("EU", &[10, 20]), shard_rows("US", &[5])],
        )
        .unwrap();

        match result {
            QueryResult::Groups(groups) => {
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0], (KeyValue::from("EU"), Decimal::from(30)));
                assert_eq!(groups[1], (KeyValue::from("US"), Decimal::from(5)));
            }
            other => panic!("expected groups, got {:?}", other),
        }
    }
}
