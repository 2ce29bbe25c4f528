//! Temporal version operations
//!
//! A temporally versioned row carries a half-open validity period. Closing
//! a version and opening its successor are separate physical writes, and on
//! a date-sharded entity the two sides may land on different shards; the
//! write router turns a [`VersionOperation`] into its per-shard commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EntityRecord, KeyValue};

/// Field names carrying a row's validity period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Field holding the inclusive validity start
    pub valid_from_field: String,
    /// Field holding the exclusive validity end (null = current version)
    pub valid_to_field: String,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            valid_from_field: "valid_from".to_string(),
            valid_to_field: "valid_to".to_string(),
        }
    }
}

/// A version-aware unit of work against one logical row
#[derive(Debug, Clone)]
pub enum VersionOperation {
    /// Insert the first version of a row
    Create {
        /// The new row, with its validity-from already set
        record: EntityRecord,
    },

    /// Close the current version and open a successor at `at`
    ///
    /// The close lands on the current row's shard; the successor routes by
    /// its own shard key and validity-from, which may resolve elsewhere.
    VersionBump {
        /// Primary-key value of the logical row
        key: KeyValue,
        /// The currently valid version as stored
        current: EntityRecord,
        /// The successor's field values (validity fields are overwritten)
        successor: EntityRecord,
        /// Bump instant: the close's valid-to and the successor's valid-from
        at: DateTime<Utc>,
    },

    /// Close the current version without a successor
    Close {
        /// Primary-key value of the logical row
        key: KeyValue,
        /// The currently valid version as stored
        current: EntityRecord,
        /// Close instant
        at: DateTime<Utc>,
    },
}

impl VersionOperation {
    /// The entity type the operation applies to
    pub fn entity_type(&self) -> &str {
        match self {
            VersionOperation::Create { record } => &record.entity_type,
            VersionOperation::VersionBump { current, .. } => &current.entity_type,
            VersionOperation::Close { current, .. } => &current.entity_type,
        }
    }
}

/// Stamp a record's validity-from field
pub fn open_validity(record: &mut EntityRecord, config: &TemporalConfig, at: DateTime<Utc>) {
    record.set_field(&config.valid_from_field, serde_json::json!(at.to_rfc3339()));
    record.set_field(&config.valid_to_field, serde_json::Value::Null);
}

/// Stamp a record's validity-to field
pub fn close_validity(record: &mut EntityRecord, config: &TemporalConfig, at: DateTime<Utc>) {
    record.set_field(&config.valid_to_field, serde_json::json!(at.to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validity_stamping() {
        let config = TemporalConfig::default();
        let at: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();

        let mut record = EntityRecord::new("rates", json!({"id": 1, "value": 10}));
        open_validity(&mut record, &config, at);
        assert_eq!(
            record.field("valid_from").unwrap(),
            &json!("2024-03-01T00:00:00+00:00")
        );
        assert!(record.field("valid_to").unwrap().is_null());

        close_validity(&mut record, &config, at);
        assert_eq!(
            record.field("valid_to").unwrap(),
            &json!("2024-03-01T00:00:00+00:00")
        );
    }
}
