//! Read-only view of the control plane for monitoring dashboards.

use crate::core::{DbError, Result, ShardId};
use crate::metrics::{LoadSummary, MetricsCollector, ShardMetrics};
use crate::rebalance::{MigrationRecord, RebalanceEvent, Rebalancer};
use crate::registry::{ShardRegistry, ShardStatus};
use crate::replica::{ReplicaRouter, ReplicaStatus, SelectionStrategy};
use crate::sharding::{ShardResolver, ShardingStrategy};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ShardView {
    #[serde(flatten)]
    pub status: ShardStatus,
    pub metrics: Option<ShardMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminSnapshot {
    pub generated_at: DateTime<Utc>,
    pub sharding_strategy: ShardingStrategy,
    pub selection_strategy: SelectionStrategy,
    pub shards: Vec<ShardView>,
    pub standby_shards: Vec<ShardId>,
    pub primary_healthy: bool,
    pub replicas: Vec<ReplicaStatus>,
    pub load: LoadSummary,
    /// Rebalance and scale events, newest last
    pub history: Vec<RebalanceEvent>,
    pub migrations: Vec<MigrationRecord>,
}

impl AdminSnapshot {
    pub fn gather(
        registry: &ShardRegistry,
        resolver: &ShardResolver,
        replicas: &ReplicaRouter,
        collector: &MetricsCollector,
        rebalancer: &Rebalancer,
    ) -> Result<Self> {
        let latest = collector.latest()?;
        let shards = registry
            .statuses()?
            .into_iter()
            .map(|status| {
                let metrics = latest
                    .as_ref()
                    .and_then(|snapshot| snapshot.get(status.id).cloned());
                ShardView { status, metrics }
            })
            .collect();

        let mut standby_shards: Vec<ShardId> =
            registry.standby()?.into_iter().map(|d| d.id).collect();
        standby_shards.sort_unstable();

        Ok(Self {
            generated_at: Utc::now(),
            sharding_strategy: resolver.strategy()?,
            selection_strategy: replicas.strategy()?,
            shards,
            standby_shards,
            primary_healthy: replicas.primary_healthy(),
            replicas: replicas.replicas()?,
            load: collector.load_summary()?,
            history: rebalancer.history()?,
            migrations: rebalancer.migrations()?,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| DbError::ParseError(e.to_string()))
    }
}
