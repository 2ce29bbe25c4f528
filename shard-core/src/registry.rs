//! Shard metadata registry
//!
//! The registry is the immutable catalog of shards and per-entity sharding
//! configuration. It is validated once at construction and afterwards read
//! lock-free through shared references.

use crate::error::{Error, Result};
use crate::strategy::ShardStrategy;
use crate::temporal::TemporalConfig;
use crate::types::{ShardDescriptor, ShardId, ShardTier};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Engine-wide defaults carried by the registry
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Upper bound on concurrently queried shards
    pub max_parallel_shards: usize,

    /// Budget for opening a shard connection
    pub connection_timeout: Duration,

    /// Budget for a single per-shard read
    pub query_timeout: Duration,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            max_parallel_shards: 10,
            connection_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// How one entity type is sharded
#[derive(Clone)]
pub struct EntityShardingConfig {
    /// Entity type name (dispatch key)
    pub entity_type: String,

    /// Resolution strategy
    pub strategy: Arc<dyn ShardStrategy>,

    /// Base physical table name (rewritten per shard at execution time)
    pub base_table: String,

    /// Primary-key field name
    pub primary_key_field: String,

    /// Inherit the shard of another entity type (e.g. order items living
    /// with their order); the record must carry the parent's key fields
    pub co_located_with: Option<String>,

    /// Temporal versioning contract, when the entity tracks row versions
    pub temporal: Option<TemporalConfig>,
}

impl std::fmt::Debug for EntityShardingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityShardingConfig")
            .field("entity_type", &self.entity_type)
            .field("strategy", &self.strategy.name())
            .field("base_table", &self.base_table)
            .field("co_located_with", &self.co_located_with)
            .finish()
    }
}

impl EntityShardingConfig {
    /// Create a configuration with defaults (table = entity type, pk = "id")
    pub fn new(entity_type: impl Into<String>, strategy: Arc<dyn ShardStrategy>) -> Self {
        let entity_type = entity_type.into();
        Self {
            base_table: entity_type.clone(),
            entity_type,
            strategy,
            primary_key_field: "id".to_string(),
            co_located_with: None,
            temporal: None,
        }
    }

    /// Override the base table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.base_table = table.into();
        self
    }

    /// Override the primary-key field
    pub fn with_primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key_field = field.into();
        self
    }

    /// Co-locate with another entity type's shard
    pub fn co_located_with(mut self, entity_type: impl Into<String>) -> Self {
        self.co_located_with = Some(entity_type.into());
        self
    }

    /// Attach a temporal versioning contract
    pub fn with_temporal(mut self, temporal: TemporalConfig) -> Self {
        self.temporal = Some(temporal);
        self
    }
}

/// Immutable catalog of shards and entity configurations
#[derive(Debug)]
pub struct ShardRegistry {
    shards: Vec<ShardDescriptor>,
    index: HashMap<ShardId, usize>,
    entities: HashMap<String, EntityShardingConfig>,
    defaults: EngineDefaults,
    default_shard: Option<ShardId>,
}

impl ShardRegistry {
    /// Start building a registry
    pub fn builder() -> ShardRegistryBuilder {
        ShardRegistryBuilder::default()
    }

    /// Sharding configuration for an entity type; `None` means the entity
    /// bypasses the engine entirely
    pub fn entity_metadata(&self, entity_type: &str) -> Option<&EntityShardingConfig> {
        self.entities.get(entity_type)
    }

    /// Descriptor lookup by shard id
    pub fn shard(&self, shard_id: &ShardId) -> Option<&ShardDescriptor> {
        self.index.get(shard_id).map(|&i| &self.shards[i])
    }

    /// Every shard, in registration order
    pub fn all_shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    /// Engine defaults
    pub fn defaults(&self) -> &EngineDefaults {
        &self.defaults
    }

    /// The shard that absorbs writes for unconfigured entity types: the
    /// configured default, or the most preferred writable Hot-tier shard
    pub fn default_shard(&self) -> Option<&ShardDescriptor> {
        if let Some(id) = &self.default_shard {
            return self.shard(id);
        }
        self.shards
            .iter()
            .filter(|s| !s.is_read_only && s.tier != ShardTier::Archive)
            .min_by_key(|s| (s.tier.rank(), s.priority))
    }

    /// Resolve the strategy-bearing configuration for an entity, following
    /// a single co-location hop
    pub fn effective_config(&self, entity_type: &str) -> Result<&EntityShardingConfig> {
        let config = self.entities.get(entity_type).ok_or_else(|| {
            Error::MisconfiguredRouting(format!("entity type '{}' is not configured", entity_type))
        })?;
        match &config.co_located_with {
            None => Ok(config),
            Some(parent) => {
                let parent_config = self.entities.get(parent).ok_or_else(|| {
                    Error::MisconfiguredRouting(format!(
                        "entity '{}' is co-located with unknown entity '{}'",
                        entity_type, parent
                    ))
                })?;
                if parent_config.co_located_with.is_some() {
                    return Err(Error::MisconfiguredRouting(format!(
                        "co-location chains are not supported ('{}' -> '{}' -> ...)",
                        entity_type, parent
                    )));
                }
                Ok(parent_config)
            }
        }
    }
}

/// Builder for [`ShardRegistry`]
#[derive(Default)]
pub struct ShardRegistryBuilder {
    shards: Vec<ShardDescriptor>,
    entities: HashMap<String, EntityShardingConfig>,
    defaults: EngineDefaults,
    default_shard: Option<ShardId>,
}

impl ShardRegistryBuilder {
    /// Register a shard
    pub fn add_shard(mut self, shard: ShardDescriptor) -> Self {
        self.shards.push(shard);
        self
    }

    /// Register an entity configuration
    pub fn configure_entity(mut self, config: EntityShardingConfig) -> Self {
        self.entities.insert(config.entity_type.clone(), config);
        self
    }

    /// Override engine defaults
    pub fn defaults(mut self, defaults: EngineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Pin the shard used for unconfigured entity types
    pub fn default_shard(mut self, shard_id: impl Into<ShardId>) -> Self {
        self.default_shard = Some(shard_id.into());
        self
    }

    /// Validate and freeze the registry; fails fast on the first batch of
    /// configuration errors
    pub fn build(self) -> Result<ShardRegistry> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(Error::Validation(errors.join("; ")));
        }

        let index = self
            .shards
            .iter()
            .enumerate()
            .map(|(i, s)| (s.shard_id.clone(), i))
            .collect();

        tracing::info!(
            shard_count = self.shards.len(),
            entity_count = self.entities.len(),
            "shard registry constructed"
        );

        Ok(ShardRegistry {
            shards: self.shards,
            index,
            entities: self.entities,
            defaults: self.defaults,
            default_shard: self.default_shard,
        })
    }

    /// Collect every configuration error without failing
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut seen = HashMap::new();
        for shard in &self.shards {
            if seen.insert(shard.shard_id.clone(), ()).is_some() {
                errors.push(format!("duplicate shard id '{}'", shard.shard_id));
            }
        }

        if let Some(id) = &self.default_shard {
            if !self.shards.iter().any(|s| &s.shard_id == id) {
                errors.push(format!("default shard '{}' is not registered", id));
            }
        }

        for (entity_type, config) in &self.entities {
            for error in config.strategy.validate(&self.shards) {
                errors.push(format!("entity '{}': {}", entity_type, error));
            }
            if let Some(parent) = &config.co_located_with {
                if !self.entities.contains_key(parent) {
                    errors.push(format!(
                        "entity '{}' is co-located with unknown entity '{}'",
                        entity_type, parent
                    ));
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{HashStrategy, PropertyStrategy};
    use crate::types::KeyValue;

    fn property_config() -> EntityShardingConfig {
        EntityShardingConfig::new(
            "customers",
            Arc::new(PropertyStrategy::new(
                "region",
                [
                    (KeyValue::from("EU"), ShardId::from("EU")),
                    (KeyValue::from("US"), ShardId::from("US")),
                ],
            )),
        )
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = ShardRegistry::builder()
            .add_shard(ShardDescriptor::new("EU", "mem://eu"))
            .add_shard(ShardDescriptor::new("US", "mem://us"))
            .configure_entity(property_config())
            .build()
            .unwrap();

        assert!(registry.entity_metadata("customers").is_some());
        assert!(registry.entity_metadata("unknown").is_none());
        assert!(registry.shard(&ShardId::from("EU")).is_some());
        assert_eq!(registry.all_shards().len(), 2);
    }

    #[test]
    fn test_duplicate_shard_id_rejected() {
        let result = ShardRegistry::builder()
            .add_shard(ShardDescriptor::new("EU", "mem://a"))
            .add_shard(ShardDescriptor::new("EU", "mem://b"))
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_strategy_with_unknown_shard_rejected() {
        let result = ShardRegistry::builder()
            .add_shard(ShardDescriptor::new("EU", "mem://eu"))
            .configure_entity(property_config())
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_zero_count_hash_rejected() {
        let result = ShardRegistry::builder()
            .add_shard(ShardDescriptor::new("EU", "mem://eu"))
            .configure_entity(EntityShardingConfig::new(
                "orders",
                Arc::new(HashStrategy::new("id", vec![])),
            ))
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_default_shard_prefers_hot_lowest_priority() {
        let registry = ShardRegistry::builder()
            .add_shard(
                ShardDescriptor::new("cold", "mem://cold")
                    .with_tier(ShardTier::Cold)
                    .with_priority(1),
            )
            .add_shard(ShardDescriptor::new("hot-2", "mem://h2").with_priority(2))
            .add_shard(ShardDescriptor::new("hot-1", "mem://h1").with_priority(1))
            .build()
            .unwrap();

        assert_eq!(
            registry.default_shard().unwrap().shard_id,
            ShardId::from("hot-1")
        );
    }

    #[test]
    fn test_co_location_resolves_to_parent() {
        let registry = ShardRegistry::builder()
            .add_shard(ShardDescriptor::new("EU", "mem://eu"))
            .add_shard(ShardDescriptor::new("US", "mem://us"))
            .configure_entity(property_config())
            .configure_entity(
                EntityShardingConfig::new(
                    "order_items",
                    Arc::new(PropertyStrategy::new(
                        "region",
                        [(KeyValue::from("EU"), ShardId::from("EU"))],
                    )),
                )
                .co_located_with("customers"),
            )
            .build()
            .unwrap();

        let effective = registry.effective_config("order_items").unwrap();
        assert_eq!(effective.entity_type, "customers");
    }
}
