// ============================================================================
// ShardPlane Library
// ============================================================================

pub mod admin;
pub mod config;
pub mod connection;
pub mod control_store;
pub mod core;
pub mod metrics;
pub mod rebalance;
pub mod registry;
pub mod replica;
pub mod result;
pub mod router;
pub mod sharding;
pub mod workers;

// Re-export main types for convenience
pub use admin::AdminSnapshot;
pub use config::PlaneConfig;
pub use core::{DbError, ReplicaId, Result, Row, ShardId, Statement, StatementIntent, Value};
pub use result::QueryResult;

pub use connection::{
    Connector, DbConnection,
    config::ConnectionConfig,
    memory::{MemoryConnector, MemoryDatabase},
    pool::{ConnectionPool, PoolGuard, PoolStats, run_in_transaction},
    postgres::PostgresConnector,
};
pub use control_store::{ControlStore, DescriptorKind, StoredDescriptor};
pub use metrics::{LoadSummary, MetricsCollector, MetricsSnapshot, ShardMetrics};
pub use rebalance::{MigrationRecord, MigrationState, PassOutcome, PlannedMove, RebalanceEvent, Rebalancer};
pub use registry::{ShardAttributes, ShardDescriptor, ShardRegistry, ShardStatus};
pub use replica::{HealthReport, ReplicaDescriptor, ReplicaRouter, ReplicaStatus, SelectionStrategy};
pub use router::ShardRouter;
pub use sharding::{
    CompositeKey, GeoPoint, KeyComponent, ResolverTable, ShardKey, ShardResolver, ShardingStrategy,
    TimeRange, WeightedKeyBuilder,
};
pub use workers::BackgroundWorker;

use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Control plane facade
// ============================================================================

/// Every component of the control plane, wired together.
///
/// Components are shared through `Arc`s and reach each other only through
/// the handles passed in here; there is no global state.
///
/// # Examples
///
/// ```
/// use shardplane::{MemoryConnector, PlaneConfig, ShardPlane, Value};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> shardplane::Result<()> {
/// let config = PlaneConfig::from_toml_str(r#"
///     [primary]
///     host = "primary"
///     database = "app"
///     username = "plane"
///
///     [[shards]]
///     id = 0
///     host = "shard-0"
///     database = "app"
///     username = "plane"
/// "#, None)?;
///
/// let connector = Arc::new(MemoryConnector::new());
/// connector.add_database(&config.primary.connection_config(&config.health));
/// let shard = connector.add_database(&config.shards[0].instance.connection_config(&config.health));
/// shard.create_table("users", &["id", "name"])?;
///
/// let plane = ShardPlane::connect(config, connector).await?;
/// plane
///     .shards()
///     .execute(
///         42,
///         "INSERT INTO users (id, name) VALUES ($1, $2)",
///         &[Value::Integer(42), Value::Text("ada".into())],
///     )
///     .await?;
/// assert_eq!(shard.row_count("users"), 1);
/// plane.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ShardPlane {
    config: PlaneConfig,
    registry: Arc<ShardRegistry>,
    resolver: Arc<ShardResolver>,
    collector: Arc<MetricsCollector>,
    shard_router: ShardRouter,
    replicas: Arc<ReplicaRouter>,
    rebalancer: Arc<Rebalancer>,
    control: ControlStore,
    weighted_key: Option<WeightedKeyBuilder>,
}

impl ShardPlane {
    /// Validates the configuration, registers every non-standby shard and
    /// every replica, and opens the primary.
    ///
    /// Fails fast: any instance that cannot be reached aborts the connect and
    /// closes whatever was already opened.
    pub async fn connect(config: PlaneConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ShardRegistry::new(connector.clone()));
        for shard in config.active_shards() {
            if let Err(err) = registry.register_shard(shard.descriptor(&config.health)).await {
                registry.close_all().await?;
                return Err(err);
            }
        }
        for shard in config.standby_shards() {
            registry.add_standby(shard.descriptor(&config.health))?;
        }

        let resolver = Arc::new(ShardResolver::new(
            config.sharding.strategy,
            config.resolver_table()?,
        ));
        let collector = Arc::new(MetricsCollector::new(
            registry.clone(),
            resolver.clone(),
            config.rebalance.clone(),
            config.migration.clone(),
        ));
        let shard_router = ShardRouter::new(resolver.clone(), registry.clone(), collector.clone());

        let replicas = match ReplicaRouter::new(
            config.primary.connection_config(&config.health),
            connector.clone(),
            config.health.selection_strategy,
            config.health.thresholds(),
        )
        .await
        {
            Ok(router) => Arc::new(router),
            Err(err) => {
                registry.close_all().await?;
                return Err(err);
            }
        };
        for replica in &config.replicas {
            if let Err(err) = replicas.add_replica(replica.descriptor(&config.health)).await {
                replicas.close().await?;
                registry.close_all().await?;
                return Err(err);
            }
        }

        let rebalancer = Arc::new(Rebalancer::new(
            registry.clone(),
            resolver.clone(),
            collector.clone(),
            config.rebalance.clone(),
            config.migration.clone(),
        ));

        let control_pool = match &config.control {
            Some(instance) => Arc::new(
                ConnectionPool::new("control", instance.connection_config(&config.health), connector)
                    .await?,
            ),
            None => replicas.primary_pool(),
        };

        let weighted_key = if config.sharding.weighted_key.is_empty() {
            None
        } else {
            Some(WeightedKeyBuilder::new(
                config.sharding.weighted_key.clone(),
                config.sharding.default_shard,
            )?)
        };

        info!(
            shards = registry.shard_count()?,
            standby = config.standby_shards().count(),
            replicas = config.replicas.len(),
            strategy = %config.sharding.strategy,
            "shard plane connected"
        );

        Ok(Self {
            config,
            registry,
            resolver,
            collector,
            shard_router,
            replicas,
            rebalancer,
            control: ControlStore::new(control_pool),
            weighted_key,
        })
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn shards(&self) -> &ShardRouter {
        &self.shard_router
    }

    pub fn replicas(&self) -> &Arc<ReplicaRouter> {
        &self.replicas
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<ShardResolver> {
        &self.resolver
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    pub fn control_store(&self) -> &ControlStore {
        &self.control
    }

    /// Builder for the configured weighted composite key, if any
    pub fn weighted_key(&self) -> Option<&WeightedKeyBuilder> {
        self.weighted_key.as_ref()
    }

    /// Shard for an application entity under the configured weighted key,
    /// placed among the shards active right now
    pub fn shard_for_entity(&self, entity: &serde_json::Value) -> Result<ShardId> {
        let builder = self.weighted_key.as_ref().ok_or_else(|| {
            DbError::Configuration("no weighted key is configured".to_string())
        })?;
        let table = self.resolver.snapshot()?;
        builder.shard_for_json(entity, table.active_shards())
    }

    /// Writes every live shard, standby shard and replica to the control database
    pub async fn persist_descriptors(&self) -> Result<()> {
        self.control.ensure_schema().await?;
        for descriptor in self.registry.descriptors()? {
            self.control.save_shard(&descriptor).await?;
        }
        for descriptor in self.registry.standby()? {
            self.control.save_shard(&descriptor).await?;
        }
        for replica in &self.config.replicas {
            let active = self
                .replicas
                .replica(&replica.id)
                .map(|status| status.active)
                .unwrap_or(false);
            self.control
                .save_replica(&replica.descriptor(&self.config.health), active)
                .await?;
        }
        Ok(())
    }

    /// Starts the health, metrics and rebalance loops
    pub fn spawn_workers(&self) -> Vec<BackgroundWorker> {
        vec![
            workers::spawn_health_worker(
                self.registry.clone(),
                self.replicas.clone(),
                self.config.health.check_interval(),
            ),
            workers::spawn_metrics_worker(
                self.collector.clone(),
                self.config.rebalance.metrics_interval(),
            ),
            workers::spawn_rebalance_worker(
                self.rebalancer.clone(),
                self.config.rebalance.check_interval(),
            ),
        ]
    }

    pub fn admin_snapshot(&self) -> Result<AdminSnapshot> {
        AdminSnapshot::gather(
            &self.registry,
            &self.resolver,
            &self.replicas,
            &self.collector,
            &self.rebalancer,
        )
    }

    /// Closes every pool. Workers should be stopped first.
    pub async fn shutdown(&self) -> Result<()> {
        if self.rebalancer.is_running() {
            warn!("shutting down while a rebalance pass is in flight");
        }
        self.registry.close_all().await?;
        self.replicas.close().await?;
        if self.config.control.is_some() {
            self.control.pool().close().await;
        }
        info!("shard plane shut down");
        Ok(())
    }
}
