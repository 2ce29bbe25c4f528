//! Parallel fan-out executor
//!
//! One read per candidate shard, dispatched concurrently under a semaphore
//! bound. Failures are fail-fast: the first per-shard error cancels the
//! siblings through a linked cancellation token and fails the logical query.

use crate::merge;
use crate::planner::QueryPlanner;
use crate::query::{LogicalQuery, QueryResult};
use shard_core::context::{resolve_table, ShardContextFactory};
use shard_core::error::{Error, Result};
use shard_core::events::{EngineEvent, EventBus};
use shard_core::metrics::Metrics;
use shard_core::registry::ShardRegistry;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Executes logical queries across shards
pub struct ParallelQueryExecutor {
    planner: QueryPlanner,
    factory: Arc<dyn ShardContextFactory>,
    events: EventBus,
    metrics: Option<Arc<Metrics>>,
    max_parallel: usize,
    query_timeout: std::time::Duration,
}

impl ParallelQueryExecutor {
    /// Create an executor; parallelism and the per-shard read budget come
    /// from the registry defaults
    pub fn new(
        registry: Arc<ShardRegistry>,
        factory: Arc<dyn ShardContextFactory>,
        events: EventBus,
    ) -> Self {
        let max_parallel = registry.defaults().max_parallel_shards;
        let query_timeout = registry.defaults().query_timeout;
        Self {
            planner: QueryPlanner::new(registry, events.clone()),
            factory,
            events,
            metrics: None,
            max_parallel,
            query_timeout,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the parallelism bound
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Execute a logical query
    pub async fn execute(&self, query: &LogicalQuery) -> Result<QueryResult> {
        self.execute_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Execute with a caller-supplied cancellation signal
    ///
    /// The caller's token is linked with the executor's internal one;
    /// cancelling stops in-flight per-shard reads at their next suspension
    /// point.
    pub async fn execute_with_cancel(
        &self,
        query: &LogicalQuery,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let plan = self.planner.plan(query)?;
        if plan.shards.is_empty() {
            return merge::merge(query, Vec::new());
        }

        let linked = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for shard in plan.shards.clone() {
            let factory = Arc::clone(&self.factory);
            let semaphore = Arc::clone(&semaphore);
            let token = linked.clone();
            let events = self.events.clone();
            let metrics = self.metrics.clone();
            let predicates = query.predicates.clone();
            let table = resolve_table(&shard, &plan.base_table);
            let query_timeout = self.query_timeout;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("query semaphore closed".to_string()))?;
                if token.is_cancelled() {
                    return Err(Error::Transient("query cancelled".to_string()));
                }

                let started = Instant::now();
                let read = async {
                    let executor = factory.create(&shard).await?;
                    executor.fetch(&table, &predicates).await
                };
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(Error::Transient("query cancelled".to_string())),
                    _ = tokio::time::sleep(query_timeout) => {
                        Err(Error::Transient(format!(
                            "shard read exceeded the {} ms budget",
                            query_timeout.as_millis()
                        )))
                    }
                    rows = read => rows,
                };

                let duration = started.elapsed();
                events.publish(EngineEvent::ShardQueryCompleted {
                    shard_id: shard.shard_id.clone(),
                    row_count: outcome.as_ref().map_or(0, |rows| rows.len()),
                    duration_ms: duration.as_millis() as u64,
                    success: outcome.is_ok(),
                });
                if let Some(metrics) = &metrics {
                    metrics.record_shard_query(duration.as_secs_f64());
                }

                outcome.map(|rows| (shard.shard_id, rows))
            });
        }

        let mut per_shard = Vec::with_capacity(plan.shards.len());
        let mut first_error: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(pair)) => per_shard.push(pair),
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        warn!(error = %e, "per-shard read failed; cancelling siblings");
                        first_error = Some(e);
                        linked.cancel();
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error =
                            Some(Error::Internal(format!("shard read task failed: {}", join_error)));
                        linked.cancel();
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        merge::merge(query, per_shard)
    }
}
