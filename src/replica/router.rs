use super::health::{HealthReport, HealthThresholds, ReplicaDescriptor, ReplicaState, ReplicaStatus, probe_replica};
use super::strategy::{SelectionStrategy, Selector};
use crate::connection::pool::{ConnectionPool, PoolGuard, run_in_transaction};
use crate::connection::{Connector, config::ConnectionConfig};
use crate::core::{DbError, Result, Statement, Value};
use crate::result::QueryResult;
use futures::future::{BoxFuture, join_all};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Routes reads across the read replicas of one logical database.
///
/// Writes and transactions always go to the primary. A read makes at most one
/// replica attempt; if it fails, the same statement runs once on the primary.
pub struct ReplicaRouter {
    primary: Arc<ConnectionPool>,
    primary_healthy: AtomicBool,
    replicas: RwLock<Vec<Arc<ReplicaState>>>,
    strategy: RwLock<SelectionStrategy>,
    selector: Selector,
    thresholds: HealthThresholds,
    connector: Arc<dyn Connector>,
}

impl ReplicaRouter {
    /// Opens and probes the primary pool
    pub async fn new(
        primary: ConnectionConfig,
        connector: Arc<dyn Connector>,
        strategy: SelectionStrategy,
        thresholds: HealthThresholds,
    ) -> Result<Self> {
        let pool = ConnectionPool::new("primary", primary, connector.clone()).await?;
        pool.ping().await?;

        Ok(Self {
            primary: Arc::new(pool),
            primary_healthy: AtomicBool::new(true),
            replicas: RwLock::new(Vec::new()),
            strategy: RwLock::new(strategy),
            selector: Selector::default(),
            thresholds,
            connector,
        })
    }

    /// Opens the replica's pool, verifies it and adds it as active
    pub async fn add_replica(&self, descriptor: ReplicaDescriptor) -> Result<()> {
        if self.find(&descriptor.id).is_ok() {
            return Err(DbError::Configuration(format!(
                "replica '{}' is already registered",
                descriptor.id
            )));
        }

        let pool = ConnectionPool::new(
            format!("replica-{}", descriptor.id),
            descriptor.connection.clone(),
            self.connector.clone(),
        )
        .await?;
        if let Err(err) = pool.ping().await {
            pool.close().await;
            return Err(err);
        }

        let id = descriptor.id.clone();
        let address = descriptor.connection.address();
        self.replicas
            .write()?
            .push(Arc::new(ReplicaState::new(descriptor, pool)));
        info!(replica = %id, address = %address, "replica registered");
        Ok(())
    }

    pub async fn remove_replica(&self, id: &str) -> Result<()> {
        let removed = {
            let mut replicas = self.replicas.write()?;
            let idx = replicas
                .iter()
                .position(|r| r.id() == id)
                .ok_or_else(|| DbError::ReplicaNotFound(id.to_string()))?;
            replicas.remove(idx)
        };
        removed.pool.close().await;
        info!(replica = %id, "replica removed");
        Ok(())
    }

    fn find(&self, id: &str) -> Result<Arc<ReplicaState>> {
        self.replicas
            .read()?
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or_else(|| DbError::ReplicaNotFound(id.to_string()))
    }

    fn active_replicas(&self) -> Result<Vec<Arc<ReplicaState>>> {
        Ok(self
            .replicas
            .read()?
            .iter()
            .filter(|r| r.is_active())
            .cloned()
            .collect())
    }

    /// Runs a statement, reading from a replica when allowed.
    ///
    /// Goes straight to the primary when `use_replica` is false, when the
    /// statement is a write, or when no replica is active.
    pub async fn query(
        &self,
        statement: impl Into<Statement>,
        params: &[Value],
        use_replica: bool,
    ) -> Result<QueryResult> {
        let statement = statement.into();

        if !use_replica || statement.is_write() {
            return self.query_primary(&statement, params).await;
        }

        let strategy = *self.strategy.read()?;
        let candidates = self.active_replicas()?;
        let Some(replica) = self.selector.select(strategy, &candidates)? else {
            warn!("no active replica available; reading from primary");
            return self.query_primary(&statement, params).await;
        };

        let start = Instant::now();
        let attempt = tokio::time::timeout(
            self.thresholds.failover_timeout,
            query_pool(&replica.pool, statement.sql(), params),
        )
        .await;
        let outcome = match attempt {
            Ok(outcome) => outcome,
            Err(_) => Err(DbError::Timeout(format!(
                "replica '{}' exceeded {:?}",
                replica.id(),
                self.thresholds.failover_timeout
            ))),
        };

        match outcome {
            Ok(result) => {
                replica.record_success(start.elapsed());
                debug!(replica = replica.id(), %strategy, "read served by replica");
                Ok(result)
            }
            Err(err) => {
                if replica.record_error(&self.thresholds) {
                    warn!(
                        replica = replica.id(),
                        errors = replica.error_count(),
                        "replica deactivated: error count reached threshold"
                    );
                }
                warn!(replica = replica.id(), error = %err, "replica read failed; failing over to primary");
                self.query_primary(&statement, params).await
            }
        }
    }

    async fn query_primary(&self, statement: &Statement, params: &[Value]) -> Result<QueryResult> {
        query_pool(&self.primary, statement.sql(), params).await
    }

    /// Runs `f` in a transaction on the primary
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PoolGuard) -> BoxFuture<'c, Result<T>>,
    {
        run_in_transaction(&self.primary, f).await
    }

    pub fn strategy(&self) -> Result<SelectionStrategy> {
        Ok(*self.strategy.read()?)
    }

    /// Switches the selection strategy by name (`round-robin`, `least-lag`, ...)
    pub fn set_strategy(&self, name: &str) -> Result<()> {
        let strategy: SelectionStrategy = name.parse()?;
        self.set_selection_strategy(strategy)
    }

    pub fn set_selection_strategy(&self, strategy: SelectionStrategy) -> Result<()> {
        *self.strategy.write()? = strategy;
        info!(%strategy, "replica selection strategy changed");
        Ok(())
    }

    /// Reactivates a replica and clears its error count and lag
    pub fn mark_active(&self, id: &str) -> Result<()> {
        self.find(id)?.reactivate();
        info!(replica = %id, "replica marked active");
        Ok(())
    }

    pub fn mark_inactive(&self, id: &str) -> Result<()> {
        self.find(id)?.deactivate();
        info!(replica = %id, "replica marked inactive");
        Ok(())
    }

    /// Probes the primary and every replica concurrently.
    ///
    /// Replicas over the error or lag threshold are deactivated; nothing is
    /// ever reactivated here.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let replicas = self.replicas.read()?.clone();
        let thresholds = &self.thresholds;

        let primary_probe = async {
            tokio::time::timeout(thresholds.failover_timeout, self.primary.ping()).await
        };
        let replica_probes = join_all(
            replicas
                .iter()
                .map(|replica| probe_replica(replica, thresholds)),
        );
        let (primary, probes) = tokio::join!(primary_probe, replica_probes);

        let primary_healthy = matches!(primary, Ok(Ok(_)));
        let was_healthy = self.primary_healthy.swap(primary_healthy, Ordering::SeqCst);
        if was_healthy && !primary_healthy {
            warn!("primary failed its health probe");
        } else if !was_healthy && primary_healthy {
            info!("primary recovered");
        }

        Ok(HealthReport {
            primary_healthy,
            replicas: probes,
        })
    }

    pub fn primary_healthy(&self) -> bool {
        self.primary_healthy.load(Ordering::SeqCst)
    }

    pub fn primary_pool(&self) -> Arc<ConnectionPool> {
        self.primary.clone()
    }

    pub fn replicas(&self) -> Result<Vec<ReplicaStatus>> {
        Ok(self.replicas.read()?.iter().map(|r| r.status()).collect())
    }

    pub fn replica(&self, id: &str) -> Result<ReplicaStatus> {
        Ok(self.find(id)?.status())
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub async fn close(&self) -> Result<()> {
        let replicas = self.replicas.read()?.clone();
        join_all(replicas.iter().map(|r| r.pool.close())).await;
        self.primary.close().await;
        Ok(())
    }
}

impl std::fmt::Debug for ReplicaRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRouter")
            .field("primary", &self.primary.config().address())
            .field("primary_healthy", &self.primary_healthy())
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

async fn query_pool(pool: &ConnectionPool, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let mut conn = pool.get_connection().await?;
    let result = conn.query(sql, params).await?;
    conn.close().await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{MemoryConnector, MemoryDatabase};
    use crate::core::Statement;

    fn instance(host: &str) -> ConnectionConfig {
        ConnectionConfig::new("app", "pw").host(host).min_connections(0)
    }

    async fn setup(replica_hosts: &[&str]) -> (ReplicaRouter, MemoryDatabase, Vec<MemoryDatabase>) {
        let connector = Arc::new(MemoryConnector::new());
        let primary = connector.add_database(&instance("primary"));
        let router = ReplicaRouter::new(
            instance("primary"),
            connector.clone(),
            SelectionStrategy::RoundRobin,
            HealthThresholds::default(),
        )
        .await
        .unwrap();

        let mut dbs = Vec::new();
        for host in replica_hosts {
            dbs.push(connector.add_database(&instance(host)));
            router
                .add_replica(ReplicaDescriptor::new(*host, instance(host)))
                .await
                .unwrap();
        }
        primary.clear_log();
        (router, primary, dbs)
    }

    #[tokio::test]
    async fn test_reads_avoid_primary() {
        let (router, primary, replicas) = setup(&["r1", "r2"]).await;
        for db in &replicas {
            db.create_table("users", &["id"]).unwrap();
        }

        router.query("SELECT id FROM users", &[], true).await.unwrap();
        router.query("SELECT id FROM users", &[], true).await.unwrap();

        assert!(!primary.received("users"));
        assert!(replicas[0].received("SELECT id FROM users"));
        assert!(replicas[1].received("SELECT id FROM users"));
    }

    #[tokio::test]
    async fn test_use_replica_false_goes_to_primary() {
        let (router, primary, replicas) = setup(&["r1"]).await;
        replicas[0].clear_log();

        router.query("SELECT 1", &[], false).await.unwrap();
        assert!(primary.received("SELECT 1"));
        assert!(replicas[0].statement_log().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_write_intent_goes_to_primary() {
        let (router, primary, replicas) = setup(&["r1"]).await;
        primary.create_table("audit", &["id"]).unwrap();

        let stmt = Statement::write("INSERT INTO audit (id) VALUES ($1)");
        router.query(stmt, &[Value::Integer(1)], true).await.unwrap();

        assert_eq!(primary.row_count("audit"), 1);
        assert!(!replicas[0].received("audit"));
    }

    #[tokio::test]
    async fn test_failed_replica_read_falls_back_once() {
        let (router, primary, replicas) = setup(&["r1"]).await;
        primary.create_table("users", &["id"]).unwrap();
        replicas[0].fail_next_statements(1);

        let result = router.query("SELECT id FROM users", &[], true).await;
        assert!(result.is_ok());
        assert!(primary.received("SELECT id FROM users"));
        assert_eq!(router.replica("r1").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_no_active_replica_uses_primary() {
        let (router, primary, _replicas) = setup(&["r1"]).await;
        router.mark_inactive("r1").unwrap();

        router.query("SELECT 1", &[], true).await.unwrap();
        assert!(primary.received("SELECT 1"));
    }

    #[tokio::test]
    async fn test_set_strategy_by_name() {
        let (router, _primary, _replicas) = setup(&[]).await;
        router.set_strategy("least-lag").unwrap();
        assert_eq!(router.strategy().unwrap(), SelectionStrategy::LeastLag);
        assert!(router.set_strategy("fastest").is_err());
        assert!(matches!(
            router.mark_active("ghost"),
            Err(DbError::ReplicaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_runs_on_primary() {
        let (router, primary, replicas) = setup(&["r1"]).await;
        primary.create_table("orders", &["id"]).unwrap();

        router
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("INSERT INTO orders (id) VALUES ($1)", &[Value::Integer(9)])
                        .await
                })
            })
            .await
            .unwrap();

        assert_eq!(primary.row_count("orders"), 1);
        assert!(!replicas[0].received("orders"));
    }

    #[tokio::test]
    async fn test_primary_health_tracking() {
        let (router, primary, _replicas) = setup(&[]).await;
        assert!(router.health_check().await.unwrap().primary_healthy);

        primary.set_unreachable(true);
        let report = router.health_check().await.unwrap();
        assert!(!report.primary_healthy);
        assert!(!router.primary_healthy());
    }
}
