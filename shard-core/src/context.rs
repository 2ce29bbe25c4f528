//! Per-shard execution contexts
//!
//! A context is a short-lived, single-owner handle bound to one shard.
//! Creating a handle never opens a database transaction; transactions are
//! started explicitly by the participant at prepare time.

use crate::error::Result;
use crate::types::{EntityOp, EntityRecord, IsolationLevel, Predicate, ShardDescriptor, ShardId, StorageMode};
use async_trait::async_trait;
use std::sync::Arc;

/// Execution handle bound to one shard
///
/// Writes are staged with [`apply`](ShardExecutor::apply) and only touch the
/// store through the `begin` / `flush` / `commit` sequence: `flush` performs
/// the validated write (acquiring locks) without committing, which is what a
/// two-phase-commit participant needs for its prepare step.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// The shard this handle is bound to
    fn shard_id(&self) -> &ShardId;

    /// Read committed rows matching the predicates
    async fn fetch(&self, table: &str, predicates: &[Predicate]) -> Result<Vec<EntityRecord>>;

    /// Stage a typed write; returns the rows it will affect
    async fn apply(&self, table: &str, op: &EntityOp) -> Result<u64>;

    /// Begin the local transaction at the given isolation level
    async fn begin(&self, isolation: IsolationLevel) -> Result<()>;

    /// Write staged changes without committing; locks stay held until
    /// `commit` or `rollback`
    async fn flush(&self) -> Result<u64>;

    /// Commit the local transaction
    async fn commit(&self) -> Result<()>;

    /// Roll the local transaction back; a no-op when none was begun
    async fn rollback(&self) -> Result<()>;
}

/// Produces execution handles on demand
#[async_trait]
pub trait ShardContextFactory: Send + Sync {
    /// Create a fresh handle for the shard; must not begin a transaction
    async fn create(&self, shard: &ShardDescriptor) -> Result<Arc<dyn ShardExecutor>>;
}

/// Resolve the physical table name for a shard
///
/// - `Tables`: prefixed table inside one database (`{shard}_{base}`)
/// - `Databases`: the base name, in the shard's own database
/// - `Manual`: the explicitly configured table name
pub fn resolve_table(shard: &ShardDescriptor, base: &str) -> String {
    match shard.storage_mode {
        StorageMode::Tables => shard
            .table_name_override
            .clone()
            .unwrap_or_else(|| format!("{}_{}", sanitize(shard.shard_id.as_str()), base)),
        StorageMode::Databases => shard
            .table_name_override
            .clone()
            .unwrap_or_else(|| base.to_string()),
        StorageMode::Manual => shard
            .table_name_override
            .clone()
            .unwrap_or_else(|| base.to_string()),
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_table_per_storage_mode() {
        let databases = ShardDescriptor::new("EU", "mem://eu");
        assert_eq!(resolve_table(&databases, "customers"), "customers");

        let tables = ShardDescriptor::new("2024-01", "mem://one")
            .with_storage_mode(StorageMode::Tables);
        assert_eq!(resolve_table(&tables, "transactions"), "2024_01_transactions");

        let manual = ShardDescriptor::new("legacy", "mem://legacy")
            .with_storage_mode(StorageMode::Manual)
            .with_table_name("tbl_customers_legacy");
        assert_eq!(resolve_table(&manual, "customers"), "tbl_customers_legacy");
    }
}
