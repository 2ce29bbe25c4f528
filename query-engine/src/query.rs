//! Logical query model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shard_core::types::{EntityRecord, KeyValue, Predicate};

/// Sort direction of an ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Global ordering applied at the merge step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Field to order by
    pub field: String,
    /// Direction
    pub direction: SortDirection,
}

/// Aggregation computed over the union of per-shard projections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregate {
    /// Row count
    Count,
    /// Exact decimal sum of a numeric field
    Sum {
        /// Field to sum
        field: String,
    },
    /// Per-group decimal sums
    GroupBySum {
        /// Grouping field
        group_field: String,
        /// Field to sum per group
        value_field: String,
    },
}

/// A query against the logical (unsharded) collection
#[derive(Debug, Clone)]
pub struct LogicalQuery {
    /// Entity type queried
    pub entity_type: String,

    /// Filter predicates
    pub predicates: Vec<Predicate>,

    /// Temporal point for as-of reads
    pub as_of: Option<DateTime<Utc>>,

    /// Global ordering re-established at the merge step
    pub order_by: Option<OrderSpec>,

    /// Rows to skip on the merged stream
    pub skip: Option<usize>,

    /// Rows to take on the merged stream
    pub take: Option<usize>,

    /// Aggregation instead of row results
    pub aggregate: Option<Aggregate>,
}

impl LogicalQuery {
    /// An unfiltered query over an entity type
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            predicates: Vec::new(),
            as_of: None,
            order_by: None,
            skip: None,
            take: None,
            aggregate: None,
        }
    }

    /// Add a predicate
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Read as of a point in time
    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    /// Order the merged result
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderSpec { field: field.into(), direction });
        self
    }

    /// Skip rows on the merged stream
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    /// Take at most `n` rows from the merged stream
    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    /// Replace row results with an aggregation
    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = Some(aggregate);
        self
    }
}

/// Result of a logical query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Merged rows
    Rows(Vec<EntityRecord>),
    /// Row count
    Count(u64),
    /// Exact decimal sum
    Sum(Decimal),
    /// Per-group decimal sums, ordered by group key
    Groups(Vec<(KeyValue, Decimal)>),
}

impl QueryResult {
    /// The rows of a row result; empty for aggregations
    pub fn rows(&self) -> &[EntityRecord] {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => &[],
        }
    }

    /// Row count across result shapes
    pub fn len(&self) -> usize {
        match self {
            QueryResult::Rows(rows) => rows.len(),
            QueryResult::Count(n) => *n as usize,
            QueryResult::Sum(_) => 1,
            QueryResult::Groups(groups) => groups.len(),
        }
    }

    /// Whether the result is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
