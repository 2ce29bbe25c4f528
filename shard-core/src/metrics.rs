//! Prometheus metrics for the engine
//!
//! # Metrics
//!
//! - `tessera_transactions_committed_total` - Committed cross-shard transactions
//! - `tessera_transactions_rolled_back_total` - Rolled-back transactions
//! - `tessera_transactions_failed_total` - In-doubt / timed-out transactions
//! - `tessera_shard_queries_total` - Per-shard reads issued
//! - `tessera_query_duration_seconds` - Per-shard read latency
//! - `tessera_prepare_duration_seconds` - Phase-1 latency per participant
//! - `tessera_saves_promoted_total` - Save boundaries promoted to 2PC

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Committed cross-shard transactions
    pub transactions_committed: IntCounter,

    /// Rolled-back cross-shard transactions
    pub transactions_rolled_back: IntCounter,

    /// In-doubt or timed-out transactions
    pub transactions_failed: IntCounter,

    /// Per-shard reads issued
    pub shard_queries: IntCounter,

    /// Per-shard read latency
    pub query_duration: Histogram,

    /// Phase-1 prepare latency
    pub prepare_duration: Histogram,

    /// Save boundaries promoted to 2PC
    pub saves_promoted: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_committed = IntCounter::with_opts(Opts::new(
            "tessera_transactions_committed_total",
            "Committed cross-shard transactions",
        ))?;
        registry.register(Box::new(transactions_committed.clone()))?;

        let transactions_rolled_back = IntCounter::with_opts(Opts::new(
            "tessera_transactions_rolled_back_total",
            "Rolled-back cross-shard transactions",
        ))?;
        registry.register(Box::new(transactions_rolled_back.clone()))?;

        let transactions_failed = IntCounter::with_opts(Opts::new(
            "tessera_transactions_failed_total",
            "In-doubt or timed-out cross-shard transactions",
        ))?;
        registry.register(Box::new(transactions_failed.clone()))?;

        let shard_queries = IntCounter::with_opts(Opts::new(
            "tessera_shard_queries_total",
            "Per-shard reads issued",
        ))?;
        registry.register(Box::new(shard_queries.clone()))?;

        let query_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tessera_query_duration_seconds",
                "Per-shard read latency",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5]),
        )?;
        registry.register(Box::new(query_duration.clone()))?;

        let prepare_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tessera_prepare_duration_seconds",
                "Phase-1 prepare latency per participant",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(prepare_duration.clone()))?;

        let saves_promoted = IntCounter::with_opts(Opts::new(
            "tessera_saves_promoted_total",
            "Save boundaries promoted to cross-shard transactions",
        ))?;
        registry.register(Box::new(saves_promoted.clone()))?;

        Ok(Self {
            transactions_committed,
            transactions_rolled_back,
            transactions_failed,
            shard_queries,
            query_duration,
            prepare_duration,
            saves_promoted,
            registry,
        })
    }

    /// Record a per-shard read
    pub fn record_shard_query(&self, duration_seconds: f64) {
        self.shard_queries.inc();
        self.query_duration.observe(duration_seconds);
    }

    /// Record a participant prepare
    pub fn record_prepare(&self, duration_seconds: f64) {
        self.prepare_duration.observe(duration_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.transactions_committed.inc();
        assert_eq!(a.transactions_committed.get(), 1);
        assert_eq!(b.transactions_committed.get(), 0);
    }

    #[test]
    fn test_record_shard_query() {
        let metrics = Metrics::new().unwrap();
        metrics.record_shard_query(0.012);
        metrics.record_shard_query(0.200);
        assert_eq!(metrics.shard_queries.get(), 2);
    }
}
