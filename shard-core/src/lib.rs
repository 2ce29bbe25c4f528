//! Tessera shard core
//!
//! Catalog, routing, and execution primitives that make a horizontally
//! sharded logical table addressable as a single collection.
//!
//! # Architecture
//!
//! - **Immutable catalog**: shard descriptors and per-entity sharding
//!   configuration are validated once at construction and never mutated
//! - **Pure routing**: strategies map an entity to its shard and a predicate
//!   set to the shards that could hold matching rows
//! - **Erased entities**: records flow through the engine as JSON documents
//!   dispatched by entity type name; no runtime code generation
//! - **Pluggable execution**: per-shard work goes through the
//!   [`context::ShardExecutor`] trait; an in-memory backend ships for tests
//!   and embedding

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod strategy;
pub mod temporal;
pub mod types;

// Re-exports
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
pub use registry::{EngineDefaults, EntityShardingConfig, ShardRegistry};
pub use router::WriteRouter;
pub use types::{
    DateRange, EntityOp, EntityRecord, IsolationLevel, KeyRange, KeyValue, Predicate,
    ShardDescriptor, ShardId, ShardTier, StorageMode,
};
