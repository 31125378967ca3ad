use super::{LoadSummary, MetricsSnapshot, ShardMetrics, compute_load};
use crate::config::{MigrationSchema, RebalanceSettings};
use crate::connection::pool::ConnectionPool;
use crate::core::{DbError, Result, ShardId};
use crate::registry::ShardRegistry;
use crate::sharding::ShardResolver;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
struct ResponseSamples {
    total: Duration,
    count: u32,
}

/// Turns registry counters and router outcomes into periodic [`MetricsSnapshot`]s.
///
/// Each snapshot also refreshes the resolver's load hints, which is what the
/// dynamic strategy places new keys by.
pub struct MetricsCollector {
    registry: Arc<ShardRegistry>,
    resolver: Arc<ShardResolver>,
    settings: RebalanceSettings,
    schema: MigrationSchema,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    query_baselines: Mutex<HashMap<ShardId, u64>>,
    samples: Mutex<HashMap<ShardId, ResponseSamples>>,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<ShardRegistry>,
        resolver: Arc<ShardResolver>,
        settings: RebalanceSettings,
        schema: MigrationSchema,
    ) -> Self {
        Self {
            registry,
            resolver,
            settings,
            schema,
            history: Mutex::new(VecDeque::new()),
            query_baselines: Mutex::new(HashMap::new()),
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &RebalanceSettings {
        &self.settings
    }

    /// Records the outcome of one routed statement
    pub fn record_query(&self, shard_id: ShardId, elapsed: Duration, succeeded: bool) -> Result<()> {
        {
            let mut samples = self.samples.lock()?;
            let entry = samples.entry(shard_id).or_default();
            entry.total += elapsed;
            entry.count += 1;
        }

        if succeeded {
            self.registry.record_response(shard_id, elapsed)
        } else {
            self.registry.record_error(shard_id)
        }
    }

    /// Entity rows and total rows including child tables
    async fn count_rows(&self, pool: &ConnectionPool) -> Result<(u64, u64)> {
        let mut conn = pool.get_connection().await?;
        let mut entities = 0u64;
        let mut total = 0u64;
        for table in self.schema.tables() {
            let result = conn
                .query(&format!("SELECT COUNT(*) FROM {}", table), &[])
                .await?;
            let count = result
                .scalar()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| DbError::Query(format!("COUNT(*) on {} returned no value", table)))?
                .max(0) as u64;
            if table == self.schema.table {
                entities = count;
            }
            total += count;
        }
        conn.close().await?;
        Ok((entities, total))
    }

    /// Measures every live shard and stores the resulting snapshot
    pub async fn collect(&self) -> Result<MetricsSnapshot> {
        let ids = self.registry.shard_ids()?;
        let previous = self.latest()?;
        let previous = &previous;
        let measurements = join_all(ids.into_iter().map(|shard_id| async move {
            let entry = self.registry.entry(shard_id)?;
            let (entities, rows) = match self.count_rows(&entry.pool).await {
                Ok((entities, rows)) => {
                    self.registry.set_row_count(shard_id, rows)?;
                    (entities, rows)
                }
                Err(err) => {
                    warn!(shard_id, error = %err, "row count failed; keeping previous value");
                    let entities = previous
                        .as_ref()
                        .and_then(|s| s.get(shard_id))
                        .map_or(0, |m| m.entity_count);
                    (entities, entry.counters.row_count())
                }
            };
            let stats = entry.pool.stats().await;
            Ok::<_, DbError>((entry, entities, rows, stats.active_connections))
        }))
        .await;

        let mut shards = Vec::new();
        {
            let mut baselines = self.query_baselines.lock()?;
            let mut samples = self.samples.lock()?;
            let now = Utc::now();

            for measurement in measurements {
                // Shards removed mid-collection are simply skipped
                let Ok((entry, entity_count, row_count, active_connections)) = measurement else {
                    continue;
                };
                let shard_id = entry.descriptor.id;

                let total_queries = entry.counters.query_count();
                let baseline = baselines.insert(shard_id, total_queries).unwrap_or(0);
                let query_count = total_queries.saturating_sub(baseline);

                let avg_response_ms = match samples.remove(&shard_id) {
                    Some(s) if s.count > 0 => {
                        Some(s.total.as_secs_f64() * 1000.0 / f64::from(s.count))
                    }
                    _ => entry
                        .counters
                        .response_time()
                        .map(|d| d.as_secs_f64() * 1000.0),
                };

                shards.push(ShardMetrics {
                    shard_id,
                    collected_at: now,
                    query_count,
                    avg_response_ms,
                    active_connections,
                    row_count,
                    entity_count,
                    load: compute_load(
                        row_count,
                        query_count,
                        self.settings.max_rows,
                        self.settings.max_queries,
                    ),
                });
            }
            baselines.retain(|id, _| shards.iter().any(|m| m.shard_id == *id));
            // Samples for shards retired since the last pass are never read
            samples.retain(|id, _| shards.iter().any(|m| m.shard_id == *id));
        }

        let snapshot = MetricsSnapshot {
            collected_at: Utc::now(),
            shards,
        };
        self.record_snapshot(snapshot.clone())?;
        debug!(
            shards = snapshot.shards.len(),
            mean_load = snapshot.mean_load(),
            "metrics collected"
        );
        Ok(snapshot)
    }

    /// Stores a snapshot, prunes history past retention and publishes load hints
    pub fn record_snapshot(&self, snapshot: MetricsSnapshot) -> Result<()> {
        let hints: BTreeMap<ShardId, f64> = snapshot
            .shards
            .iter()
            .map(|m| (m.shard_id, m.load))
            .collect();

        {
            let mut history = self.history.lock()?;
            history.push_back(snapshot);

            let now = Utc::now();
            let cutoff = chrono::Duration::from_std(self.settings.metrics_retention())
                .ok()
                .and_then(|retention| now.checked_sub_signed(retention));
            if let Some(cutoff) = cutoff {
                // Never prune the newest snapshot
                while history.len() > 1
                    && history.front().is_some_and(|s| s.collected_at < cutoff)
                {
                    history.pop_front();
                }
            }
        }

        self.resolver.update_load_hints(hints)
    }

    pub fn latest(&self) -> Result<Option<MetricsSnapshot>> {
        Ok(self.history.lock()?.back().cloned())
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Result<Vec<MetricsSnapshot>> {
        Ok(self.history.lock()?.iter().cloned().collect())
    }

    pub fn load_summary(&self) -> Result<LoadSummary> {
        Ok(self
            .latest()?
            .map(|s| s.summarize(self.settings.rebalance_threshold))
            .unwrap_or_default())
    }
}
