//! Configuration manifest
//!
//! A registry can be declared as a structured document (TOML file or JSON
//! string) instead of builder calls. Loading is idempotent: two loads of the
//! same content produce identical registries.

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::registry::{EngineDefaults, EntityShardingConfig, ShardRegistry};
use crate::strategy::{
    AlphabetRange, AlphabetStrategy, DateInterval, DateStrategy, HashStrategy, ManualRule,
    ManualStrategy, PropertyStrategy, RangeBinding, RangeStrategy, RowCountStrategy,
};
use crate::temporal::TemporalConfig;
use crate::types::{
    Comparison, DateRange, KeyValue, Predicate, ShardDescriptor, ShardId, ShardTier, StorageMode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingManifest {
    /// Physical layout applied to every shard
    #[serde(default = "default_storage_mode")]
    pub storage_mode: StorageMode,

    /// Shard declarations
    #[serde(default)]
    pub shards: Vec<ShardManifest>,

    /// Entity declarations, keyed by entity type name
    #[serde(default)]
    pub entities: HashMap<String, EntityManifest>,

    /// Engine defaults
    #[serde(default)]
    pub defaults: DefaultsManifest,
}

fn default_storage_mode() -> StorageMode {
    StorageMode::Databases
}

/// One shard declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardManifest {
    /// Unique shard id
    pub id: String,

    /// Display name (defaults to the id)
    pub name: Option<String>,

    /// Opaque connection descriptor
    pub connection_descriptor: String,

    /// Explicit physical table name
    pub table_name: Option<String>,

    /// Date range start (inclusive)
    pub date_range_start: Option<DateTime<Utc>>,

    /// Date range end (exclusive)
    pub date_range_end: Option<DateTime<Utc>>,

    /// Key range lower bound (inclusive)
    pub key_range_low: Option<serde_json::Value>,

    /// Key range upper bound (inclusive)
    pub key_range_high: Option<serde_json::Value>,

    /// Storage tier (defaults to hot)
    pub tier: Option<ShardTier>,

    /// Whether the shard refuses writes
    #[serde(default)]
    pub is_read_only: bool,

    /// Write preference (lower = preferred)
    pub priority: Option<i32>,
}

/// One entity declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityManifest {
    /// Strategy token: property | hash | range | date | alphabet |
    /// row_count | manual
    pub strategy: String,

    /// Shard-key field
    pub key: Option<String>,

    /// Primary-key field (defaults to "id")
    pub primary_key: Option<String>,

    /// Base table name (defaults to the entity type name)
    pub table: Option<String>,

    /// property: shard-key value to shard id
    pub bindings: Option<HashMap<String, String>>,

    /// property/alphabet: fallback shard
    pub default_shard: Option<String>,

    /// hash / row_count: ordered shard list
    pub shards: Option<Vec<String>>,

    /// range: ordered range bindings
    pub ranges: Option<Vec<RangeManifest>>,

    /// date: bucket width token (year | quarter | month | week | day | hour)
    pub interval: Option<String>,

    /// date: bucket naming pattern (strftime, `%q` = quarter)
    pub pattern: Option<String>,

    /// alphabet: character ranges
    pub alphabet: Option<Vec<AlphabetManifest>>,

    /// row_count: target rows per shard
    pub capacity: Option<u64>,

    /// manual: explicit rules
    pub rules: Option<Vec<RuleManifest>>,

    /// Inherit the shard of another entity type
    pub co_located_with: Option<String>,

    /// Temporal versioning fields
    pub temporal: Option<TemporalManifest>,
}

/// One range binding of a range entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeManifest {
    /// Inclusive lower bound
    pub low: serde_json::Value,
    /// Inclusive upper bound
    pub high: serde_json::Value,
    /// Owning shard
    pub shard: String,
}

/// One character range of an alphabet entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlphabetManifest {
    /// First character
    pub from: char,
    /// Last character
    pub to: char,
    /// Owning shard
    pub shard: String,
}

/// One manual routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleManifest {
    /// Target shard
    pub shard: String,
    /// Predicate field
    pub field: String,
    /// Predicate operator (eq | ne | lt | lte | gt | gte)
    pub op: String,
    /// Predicate operand
    pub value: serde_json::Value,
    /// Whether writes may land here
    #[serde(default = "default_true")]
    pub writable: bool,
}

fn default_true() -> bool {
    true
}

/// Temporal field declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalManifest {
    /// Validity-start field
    pub valid_from: String,
    /// Validity-end field
    pub valid_to: String,
}

/// Engine defaults section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsManifest {
    /// Upper bound on concurrently queried shards
    pub max_parallel_shards: Option<usize>,

    /// Connection budget in milliseconds
    pub connection_timeout_ms: Option<u64>,

    /// Per-shard read budget in milliseconds
    pub query_timeout_ms: Option<u64>,

    /// Shard absorbing writes of unconfigured entity types
    pub default_shard: Option<String>,
}

impl Default for DefaultsManifest {
    fn default() -> Self {
        Self {
            max_parallel_shards: None,
            connection_timeout_ms: None,
            query_timeout_ms: None,
            default_shard: None,
        }
    }
}

impl ShardingManifest {
    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse manifest: {}", e)))
    }

    /// Parse from a JSON string
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse manifest: {}", e)))
    }

    /// Build the registry described by this manifest
    ///
    /// The event bus is threaded into strategies that publish growth
    /// requests. Expression strategies cannot be declared in a document;
    /// register them through the builder instead.
    pub fn build(&self, events: &EventBus) -> Result<ShardRegistry> {
        let mut builder = ShardRegistry::builder();

        for shard in &self.shards {
            builder = builder.add_shard(self.descriptor(shard)?);
        }

        let descriptors: Vec<ShardDescriptor> = self
            .shards
            .iter()
            .map(|s| self.descriptor(s))
            .collect::<Result<_>>()?;

        for (entity_type, entity) in &self.entities {
            builder =
                builder.configure_entity(self.entity_config(entity_type, entity, &descriptors, events)?);
        }

        let mut defaults = EngineDefaults::default();
        if let Some(n) = self.defaults.max_parallel_shards {
            defaults.max_parallel_shards = n;
        }
        if let Some(ms) = self.defaults.connection_timeout_ms {
            defaults.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.defaults.query_timeout_ms {
            defaults.query_timeout = Duration::from_millis(ms);
        }
        builder = builder.defaults(defaults);

        if let Some(id) = &self.defaults.default_shard {
            builder = builder.default_shard(id.as_str());
        }

        builder.build()
    }

    fn descriptor(&self, shard: &ShardManifest) -> Result<ShardDescriptor> {
        let mut descriptor = ShardDescriptor::new(shard.id.as_str(), shard.connection_descriptor.clone())
            .with_storage_mode(self.storage_mode);

        if let Some(name) = &shard.name {
            descriptor = descriptor.with_name(name.clone());
        }
        if let Some(table) = &shard.table_name {
            descriptor = descriptor.with_table_name(table.clone());
        } else if self.storage_mode == StorageMode::Manual {
            return Err(Error::Config(format!(
                "shard '{}' requires table_name under manual storage mode",
                shard.id
            )));
        }
        if let (Some(start), Some(end)) = (shard.date_range_start, shard.date_range_end) {
            descriptor = descriptor.with_date_range(start, end);
        }
        if let (Some(low), Some(high)) = (&shard.key_range_low, &shard.key_range_high) {
            let low = key_value(low, &shard.id)?;
            let high = key_value(high, &shard.id)?;
            descriptor = descriptor.with_key_range(low, high);
        }
        if let Some(tier) = shard.tier {
            descriptor = descriptor.with_tier(tier);
        }
        if shard.is_read_only {
            descriptor = descriptor.read_only();
        }
        if let Some(priority) = shard.priority {
            descriptor = descriptor.with_priority(priority);
        }
        Ok(descriptor)
    }

    fn entity_config(
        &self,
        entity_type: &str,
        entity: &EntityManifest,
        descriptors: &[ShardDescriptor],
        events: &EventBus,
    ) -> Result<EntityShardingConfig> {
        let key = || -> Result<String> {
            entity.key.clone().ok_or_else(|| {
                Error::Config(format!("entity '{}' is missing its shard key", entity_type))
            })
        };

        let strategy: Arc<dyn crate::strategy::ShardStrategy> = match entity.strategy.as_str() {
            "property" => {
                let bindings = entity.bindings.clone().ok_or_else(|| {
                    Error::Config(format!("entity '{}' is missing bindings", entity_type))
                })?;
                let mut strategy = PropertyStrategy::new(
                    key()?,
                    bindings
                        .into_iter()
                        .map(|(value, shard)| (KeyValue::Str(value), ShardId::new(shard))),
                );
                if let Some(default) = &entity.default_shard {
                    strategy = strategy.with_default_shard(ShardId::new(default.clone()));
                }
                Arc::new(strategy)
            }

            "hash" => {
                let shards = self.entity_shards(entity);
                Arc::new(HashStrategy::new(key()?, shards))
            }

            "range" => {
                // explicit ranges win; otherwise fall back to the shards'
                // own key ranges
                let bindings = match entity.ranges.clone() {
                    Some(ranges) => ranges
                        .into_iter()
                        .map(|r| {
                            Ok(RangeBinding {
                                low: key_value(&r.low, entity_type)?,
                                high: key_value(&r.high, entity_type)?,
                                shard_id: ShardId::new(r.shard),
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    None => descriptors
                        .iter()
                        .filter_map(|d| {
                            d.key_range.clone().map(|range| RangeBinding {
                                low: range.low,
                                high: range.high,
                                shard_id: d.shard_id.clone(),
                            })
                        })
                        .collect(),
                };
                if bindings.is_empty() {
                    return Err(Error::Config(format!(
                        "entity '{}' declares range sharding but no ranges are configured",
                        entity_type
                    )));
                }
                Arc::new(RangeStrategy::new(key()?, bindings))
            }

            "date" => {
                let interval = entity
                    .interval
                    .as_deref()
                    .and_then(DateInterval::parse)
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "entity '{}' has a missing or unknown date interval",
                            entity_type
                        ))
                    })?;
                let pattern = entity.pattern.clone().unwrap_or_else(|| "%Y-%m".to_string());
                let shards = self.date_shards(entity, descriptors);
                Arc::new(DateStrategy::new(key()?, interval, pattern, shards))
            }

            "alphabet" => {
                let ranges = entity.alphabet.clone().ok_or_else(|| {
                    Error::Config(format!("entity '{}' is missing alphabet ranges", entity_type))
                })?;
                let mut strategy = AlphabetStrategy::new(
                    key()?,
                    ranges
                        .into_iter()
                        .map(|r| AlphabetRange {
                            from: r.from,
                            to: r.to,
                            shard_id: ShardId::new(r.shard),
                        })
                        .collect(),
                );
                if let Some(default) = &entity.default_shard {
                    strategy = strategy.with_default_shard(ShardId::new(default.clone()));
                }
                Arc::new(strategy)
            }

            "row_count" => {
                let capacity = entity.capacity.ok_or_else(|| {
                    Error::Config(format!("entity '{}' is missing capacity", entity_type))
                })?;
                let shards = self.entity_shards(entity);
                Arc::new(
                    RowCountStrategy::new(entity_type, capacity, shards)
                        .with_event_bus(events.clone()),
                )
            }

            "manual" => {
                let rules = entity.rules.clone().ok_or_else(|| {
                    Error::Config(format!("entity '{}' is missing rules", entity_type))
                })?;
                let rules = rules
                    .into_iter()
                    .map(|r| {
                        Ok(ManualRule {
                            shard_id: ShardId::new(r.shard),
                            predicate: Predicate {
                                field: r.field,
                                op: comparison(&r.op, entity_type)?,
                                value: key_value(&r.value, entity_type)?,
                            },
                            writable: r.writable,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(ManualStrategy::new(rules).with_catalog(descriptors.iter()))
            }

            "expression" => {
                return Err(Error::Config(format!(
                    "entity '{}': expression strategies carry closures and must be registered through the builder",
                    entity_type
                )))
            }

            other => {
                return Err(Error::Config(format!(
                    "entity '{}' declares unknown strategy '{}'",
                    entity_type, other
                )))
            }
        };

        let mut config = EntityShardingConfig::new(entity_type, strategy);
        if let Some(table) = &entity.table {
            config = config.with_table(table.clone());
        }
        if let Some(pk) = &entity.primary_key {
            config = config.with_primary_key(pk.clone());
        }
        if let Some(parent) = &entity.co_located_with {
            config = config.co_located_with(parent.clone());
        }
        if let Some(temporal) = &entity.temporal {
            config = config.with_temporal(TemporalConfig {
                valid_from_field: temporal.valid_from.clone(),
                valid_to_field: temporal.valid_to.clone(),
            });
        }
        Ok(config)
    }

    fn entity_shards(&self, entity: &EntityManifest) -> Vec<ShardId> {
        match &entity.shards {
            Some(ids) => ids.iter().map(|id| ShardId::new(id.clone())).collect(),
            None => self.shards.iter().map(|s| ShardId::new(s.id.clone())).collect(),
        }
    }

    fn date_shards(
        &self,
        entity: &EntityManifest,
        descriptors: &[ShardDescriptor],
    ) -> Vec<(ShardId, DateRange)> {
        let restriction: Option<Vec<ShardId>> = entity
            .shards
            .as_ref()
            .map(|ids| ids.iter().map(|id| ShardId::new(id.clone())).collect());

        descriptors
            .iter()
            .filter(|d| match &restriction {
                Some(ids) => ids.contains(&d.shard_id),
                None => true,
            })
            .filter_map(|d| d.date_range.map(|range| (d.shard_id.clone(), range)))
            .collect()
    }
}

fn key_value(value: &serde_json::Value, context: &str) -> Result<KeyValue> {
    KeyValue::from_json(value).ok_or_else(|| {
        Error::Config(format!(
            "'{}': value {} is not a usable shard key",
            context, value
        ))
    })
}

fn comparison(op: &str, context: &str) -> Result<Comparison> {
    match op {
        "eq" => Ok(Comparison::Eq),
        "ne" => Ok(Comparison::Ne),
        "lt" => Ok(Comparison::Lt),
        "lte" => Ok(Comparison::Lte),
        "gt" => Ok(Comparison::Gt),
        "gte" => Ok(Comparison::Gte),
        other => Err(Error::Config(format!(
            "'{}': unknown predicate operator '{}'",
            context, other
        ))),
    }
}
