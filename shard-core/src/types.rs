//! Core types shared across the engine
//!
//! Entities flow through the engine as erased JSON documents tagged with
//! their entity type name; shard-key values are lifted out of them as
//! [`KeyValue`]s so strategies can compare and hash them uniformly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Shard identifier (unique within a registry)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a new shard id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Storage tier of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardTier {
    /// Frequently written and read
    Hot,
    /// Occasionally written
    Warm,
    /// Read-mostly
    Cold,
    /// Historical; never written through the router
    Archive,
}

impl ShardTier {
    /// Rank used for write-preference tie-breaks (lower = preferred)
    pub fn rank(&self) -> u8 {
        match self {
            ShardTier::Hot => 0,
            ShardTier::Warm => 1,
            ShardTier::Cold => 2,
            ShardTier::Archive => 3,
        }
    }
}

/// How a shard stores its rows physically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Prefixed tables inside one database
    Tables,
    /// The same table name in separate databases
    Databases,
    /// Explicitly named table
    Manual,
}

/// Inclusive range `[low, high]` of a comparable shard key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Lowest key held by the shard
    pub low: KeyValue,
    /// Highest key held by the shard
    pub high: KeyValue,
}

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Create a range, normalizing inverted bounds
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Whether the instant falls inside the range
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// Whether another half-open interval intersects this one
    pub fn intersects(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        let after_start = match end {
            Some(e) => self.start < e,
            None => true,
        };
        let before_end = match start {
            Some(s) => s < self.end,
            None => true,
        };
        after_start && before_end
    }

    /// Whether two ranges overlap
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Identity and placement of one physical shard
///
/// Immutable after registry construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Unique shard id
    pub shard_id: ShardId,

    /// Human-readable name
    pub display_name: String,

    /// Opaque connection descriptor consumed by the context factory
    pub connection_descriptor: String,

    /// Explicit physical table name (required for manual storage mode)
    pub table_name_override: Option<String>,

    /// Key range held by this shard (range strategy)
    pub key_range: Option<KeyRange>,

    /// Date range held by this shard (date strategy), half-open
    pub date_range: Option<DateRange>,

    /// Storage tier
    pub tier: ShardTier,

    /// Whether writes are refused
    pub is_read_only: bool,

    /// Write preference (lower = preferred when several candidates exist)
    pub priority: i32,

    /// Physical layout
    pub storage_mode: StorageMode,
}

impl ShardDescriptor {
    /// Create a descriptor with the common defaults (Hot tier, writable,
    /// priority 100, separate-database layout)
    pub fn new(shard_id: impl Into<ShardId>, connection_descriptor: impl Into<String>) -> Self {
        let shard_id = shard_id.into();
        Self {
            display_name: shard_id.as_str().to_string(),
            shard_id,
            connection_descriptor: connection_descriptor.into(),
            table_name_override: None,
            key_range: None,
            date_range: None,
            tier: ShardTier::Hot,
            is_read_only: false,
            priority: 100,
            storage_mode: StorageMode::Databases,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the storage tier
    pub fn with_tier(mut self, tier: ShardTier) -> Self {
        self.tier = tier;
        self
    }

    /// Mark the shard read-only
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Set the write priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the date range (date strategy)
    pub fn with_date_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.date_range = Some(DateRange::new(start, end));
        self
    }

    /// Set the key range (range strategy)
    pub fn with_key_range(mut self, low: KeyValue, high: KeyValue) -> Self {
        self.key_range = Some(KeyRange { low, high });
        self
    }

    /// Set the storage mode
    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Set the explicit table name
    pub fn with_table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name_override = Some(table.into());
        self
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A shard-key value lifted out of an entity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    /// Integer key
    Int(i64),
    /// String key
    Str(String),
    /// Timestamp key
    Date(DateTime<Utc>),
}

impl KeyValue {
    /// Lift a JSON value into a key value (strings and integer numbers only)
    pub fn from_json(value: &serde_json::Value) -> Option<KeyValue> {
        match value {
            serde_json::Value::String(s) => Some(KeyValue::Str(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(KeyValue::Int),
            _ => None,
        }
    }

    /// Interpret the value as a timestamp (RFC 3339 for strings)
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            KeyValue::Date(d) => Some(*d),
            KeyValue::Str(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
            KeyValue::Int(_) => None,
        }
    }

    /// Compare two key values of compatible variants
    ///
    /// Strings compare lexically; a string parseable as RFC 3339 compares
    /// against a date. Incompatible variants return `None`.
    pub fn compare(&self, other: &KeyValue) -> Option<Ordering> {
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => Some(a.cmp(b)),
            (KeyValue::Str(a), KeyValue::Str(b)) => Some(a.cmp(b)),
            (KeyValue::Date(a), KeyValue::Date(b)) => Some(a.cmp(b)),
            (KeyValue::Date(a), KeyValue::Str(_)) => other.as_date().map(|b| a.cmp(&b)),
            (KeyValue::Str(_), KeyValue::Date(b)) => self.as_date().map(|a| a.cmp(b)),
            _ => None,
        }
    }

    /// Canonical string form, stable across processes
    pub fn canonical(&self) -> String {
        match self {
            KeyValue::Int(i) => format!("i:{}", i),
            KeyValue::Str(s) => format!("s:{}", s),
            KeyValue::Date(d) => format!("d:{}", d.timestamp_millis()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Str(s) => write!(f, "{}", s),
            KeyValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Str(s.to_string())
    }
}

impl From<i64> for KeyValue {
    fn from(i: i64) -> Self {
        KeyValue::Int(i)
    }
}

impl From<DateTime<Utc>> for KeyValue {
    fn from(d: DateTime<Utc>) -> Self {
        KeyValue::Date(d)
    }
}

/// An entity erased to a JSON document, dispatched by type name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type name (the dispatch key into the registry)
    pub entity_type: String,

    /// Field values as a JSON object
    pub fields: serde_json::Value,
}

impl EntityRecord {
    /// Create a record from an entity type name and a JSON object
    pub fn new(entity_type: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            fields,
        }
    }

    /// Raw field access
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Field access lifted to a key value
    pub fn key_value(&self, name: &str) -> Option<KeyValue> {
        self.field(name).and_then(KeyValue::from_json)
    }

    /// Overwrite (or add) a field
    pub fn set_field(&mut self, name: &str, value: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut self.fields {
            map.insert(name.to_string(), value);
        }
    }

    /// The primary-key value under the given field name
    pub fn primary_key(&self, pk_field: &str) -> Option<KeyValue> {
        self.key_value(pk_field)
    }
}

/// Comparison operator of a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
}

/// A single field predicate of a logical query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Field the predicate constrains
    pub field: String,
    /// Comparison operator
    pub op: Comparison,
    /// Comparison operand
    pub value: KeyValue,
}

impl Predicate {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self { field: field.into(), op: Comparison::Eq, value: value.into() }
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self { field: field.into(), op: Comparison::Lt, value: value.into() }
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self { field: field.into(), op: Comparison::Lte, value: value.into() }
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self { field: field.into(), op: Comparison::Gt, value: value.into() }
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        Self { field: field.into(), op: Comparison::Gte, value: value.into() }
    }

    /// Evaluate the predicate against a record
    ///
    /// A record without the field (or with an incomparable value) never
    /// matches, except under `Ne` where an absent field trivially differs.
    pub fn matches(&self, record: &EntityRecord) -> bool {
        let value = record.key_value(&self.field);
        let ordering = value.as_ref().and_then(|v| v.compare(&self.value));
        match (self.op, ordering) {
            (Comparison::Eq, Some(Ordering::Equal)) => true,
            (Comparison::Ne, Some(ord)) => ord != Ordering::Equal,
            (Comparison::Ne, None) => value.is_none(),
            (Comparison::Lt, Some(Ordering::Less)) => true,
            (Comparison::Lte, Some(Ordering::Less | Ordering::Equal)) => true,
            (Comparison::Gt, Some(Ordering::Greater)) => true,
            (Comparison::Gte, Some(Ordering::Greater | Ordering::Equal)) => true,
            _ => false,
        }
    }
}

/// A typed write against one shard's physical table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityOp {
    /// Insert a new row
    Insert {
        /// Row to insert
        record: EntityRecord,
    },
    /// Replace the row with the given primary key
    Update {
        /// Primary-key value of the target row
        key: KeyValue,
        /// Replacement row
        record: EntityRecord,
    },
    /// Delete the row with the given primary key
    Delete {
        /// Primary-key value of the target row
        key: KeyValue,
    },
}

/// Transaction isolation level propagated to every participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Accepted for compatibility; normalized to `ReadCommitted`
    ReadUncommitted,
    /// Default
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
    /// Snapshot
    Snapshot,
}

impl IsolationLevel {
    /// Lower-than-read-committed isolation is not safe across a two-phase
    /// commit; normalize it away.
    pub fn normalized(self) -> Self {
        match self {
            IsolationLevel::ReadUncommitted => IsolationLevel::ReadCommitted,
            level => level,
        }
    }

    /// Stable name for logging and events
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
            IsolationLevel::Snapshot => "snapshot",
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_value_compare() {
        assert_eq!(
            KeyValue::Int(3).compare(&KeyValue::Int(5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            KeyValue::Str("b".into()).compare(&KeyValue::Str("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(KeyValue::Int(1).compare(&KeyValue::Str("1".into())), None);
    }

    #[test]
    fn test_key_value_date_coercion() {
        let d = KeyValue::Str("2024-02-15T00:00:00Z".to_string());
        let parsed = d.as_date().unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-02-15T00:00:00+00:00");

        let date = KeyValue::Date(parsed);
        assert_eq!(date.compare(&d), Some(Ordering::Equal));
    }

    #[test]
    fn test_predicate_matches() {
        let record = EntityRecord::new("customers", json!({"region": "EU", "age": 41}));

        assert!(Predicate::eq("region", "EU").matches(&record));
        assert!(!Predicate::eq("region", "US").matches(&record));
        assert!(Predicate::gte("age", 41).matches(&record));
        assert!(Predicate::lt("age", 42).matches(&record));
        assert!(!Predicate::gt("age", 41).matches(&record));
        // absent field never matches an equality
        assert!(!Predicate::eq("missing", "x").matches(&record));
    }

    #[test]
    fn test_date_range_half_open() {
        let start = "2024-02-01T00:00:00Z".parse().unwrap();
        let end = "2024-03-01T00:00:00Z".parse().unwrap();
        let range = DateRange::new(start, end);

        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert!(range.intersects(
            Some("2024-02-15T00:00:00Z".parse().unwrap()),
            Some("2024-03-10T00:00:00Z".parse().unwrap())
        ));
        assert!(!range.intersects(Some(end), None));
    }

    #[test]
    fn test_isolation_normalization() {
        assert_eq!(
            IsolationLevel::ReadUncommitted.normalized(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            IsolationLevel::Snapshot.normalized(),
            IsolationLevel::Snapshot
        );
    }
}
