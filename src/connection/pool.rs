use super::{Connector, DbConnection, config::ConnectionConfig};
use crate::core::{DbError, Result, Value};
use crate::result::QueryResult;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Connection pool for one physical database instance
///
/// Connections are opened lazily up to `max_connections`, handed out as
/// [`PoolGuard`]s and returned on drop. Broken connections and connections
/// dropped mid-transaction are discarded instead of being reused.
pub struct ConnectionPool {
    name: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Open connections, idle and checked out
    total_connections: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

struct PooledConnection {
    connection: Box<dyn DbConnection>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Box<dyn DbConnection>, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            last_used: Instant::now(),
        }
    }

    fn is_stale(&self, config: &ConnectionConfig) -> bool {
        config
            .max_lifetime
            .is_some_and(|lifetime| self.created_at.elapsed() > lifetime)
            || config
                .idle_timeout
                .is_some_and(|timeout| self.last_used.elapsed() > timeout)
            || self.connection.is_closed()
    }
}

impl ConnectionPool {
    /// Create a pool and pre-open `min_connections` sessions
    pub async fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate().map_err(DbError::Configuration)?;

        let pool = Self {
            name: name.into(),
            config,
            connector,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };

        pool.ensure_min_connections().await?;

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get a connection from the pool, waiting up to `connect_timeout`
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if self.is_closed() {
                return Err(DbError::PoolClosed(self.name.clone()));
            }

            if let Some(pooled) = self.try_get_available().await {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            if let Some(connection) = self.try_create_connection().await? {
                return Ok(self.guard(connection, Instant::now()));
            }

            if start.elapsed() > self.config.connect_timeout {
                return Err(DbError::Timeout(format!(
                    "pool '{}' exhausted: no connection available within {:?}",
                    self.name, self.config.connect_timeout
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, connection: Box<dyn DbConnection>, created_at: Instant) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            created_at,
            pool_name: self.name.clone(),
            pool: self.available.clone(),
            total_connections: self.total_connections.clone(),
            closed: self.closed.clone(),
            query_timeout: self.config.query_timeout,
            broken: false,
        }
    }

    /// Try to get an available connection, evicting stale ones on the way
    async fn try_get_available(&self) -> Option<PooledConnection> {
        let mut available = self.available.lock().await;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut removed = 0usize;
        while let Some(pooled) = available.pop_front() {
            if pooled.is_stale(&self.config) {
                removed += 1;
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;

        if removed > 0 {
            self.total_connections.fetch_sub(removed, Ordering::SeqCst);
            debug!(pool = %self.name, removed, "evicted stale connections");
        }

        available.pop_front()
    }

    /// Reserves a slot under `max_connections` before opening
    async fn try_create_connection(&self) -> Result<Option<Box<dyn DbConnection>>> {
        let max = self.config.max_connections;
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match self.open().await {
            Ok(connection) => Ok(Some(connection)),
            Err(err) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn open(&self) -> Result<Box<dyn DbConnection>> {
        tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.config))
            .await
            .map_err(|_| {
                DbError::Timeout(format!(
                    "connecting to {} exceeded {:?}",
                    self.config.address(),
                    self.config.connect_timeout
                ))
            })?
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.open().await?;
            self.total_connections.fetch_add(1, Ordering::SeqCst);
            let mut available = self.available.lock().await;
            available.push_back(PooledConnection::new(connection, Instant::now()));
        }

        Ok(())
    }

    /// Round trip `SELECT 1` on a pooled connection and report how long it took
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let mut guard = self.get_connection().await?;
        guard.ping().await?;
        let elapsed = start.elapsed();
        guard.close().await?;
        Ok(elapsed)
    }

    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }

    /// Refuse further checkouts and drop idle connections
    ///
    /// Connections currently checked out are discarded when their guards drop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut available = self.available.lock().await;
        let drained = available.len();
        available.clear();
        self.total_connections.fetch_sub(drained, Ordering::SeqCst);
        debug!(pool = %self.name, drained, "connection pool closed");
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("address", &self.config.address())
            .field("total_connections", &self.total_connections.load(Ordering::SeqCst))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| DbError::Timeout(format!("statement exceeded {:?}", limit)))?,
        None => operation.await,
    }
}

/// RAII guard for pooled connections
///
/// Every statement runs under the pool's query timeout. Returns the
/// connection to the pool when dropped unless it broke or is still inside a
/// transaction.
pub struct PoolGuard {
    connection: Option<Box<dyn DbConnection>>,
    created_at: Instant,
    pool_name: String,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    query_timeout: Option<Duration>,
    broken: bool,
}

impl PoolGuard {
    fn connection(&mut self) -> Result<&mut Box<dyn DbConnection>> {
        let name = &self.pool_name;
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::PoolClosed(name.clone()))
    }

    fn observe<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(err) = &outcome {
            if err.is_connectivity() {
                self.broken = true;
            }
        }
        outcome
    }

    /// Override the per-statement timeout for this checkout
    pub fn set_query_timeout(&mut self, timeout: Option<Duration>) {
        self.query_timeout = timeout;
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.query(sql, params)).await;
        self.observe(outcome)
    }

    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.execute(sql, params)).await;
        self.observe(outcome)
    }

    pub async fn begin(&mut self) -> Result<()> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.begin()).await;
        self.observe(outcome)
    }

    pub async fn commit(&mut self) -> Result<()> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.commit()).await;
        self.observe(outcome)
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.rollback()).await;
        self.observe(outcome)
    }

    pub async fn ping(&mut self) -> Result<()> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.ping()).await;
        self.observe(outcome)
    }

    pub async fn replication_lag(&mut self) -> Result<f64> {
        let limit = self.query_timeout;
        let outcome = with_timeout(limit, self.connection()?.replication_lag()).await;
        self.observe(outcome)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.is_in_transaction())
    }

    /// Explicitly return the connection to the pool.
    ///
    /// Rolls back an open transaction first, which `Drop` cannot do.
    pub async fn close(mut self) -> Result<()> {
        if self.is_in_transaction() {
            self.rollback().await?;
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let discard = self.broken
            || connection.is_closed()
            || connection.is_in_transaction()
            || self.closed.load(Ordering::SeqCst);
        if discard {
            if connection.is_in_transaction() {
                debug!(pool = %self.pool_name, "discarding connection dropped inside a transaction");
            }
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        if let Ok(mut pool) = self.pool.try_lock() {
            pool.push_back(PooledConnection::new(connection, self.created_at));
        } else {
            warn!(pool = %self.pool_name, "pool lock busy on release; connection dropped");
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` inside a transaction on one connection from `pool`
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
///
/// ```ignore
/// let id = run_in_transaction(&pool, |tx| Box::pin(async move {
///     tx.execute("INSERT INTO users (id) VALUES ($1)", &[Value::Integer(1)]).await?;
///     Ok(1)
/// })).await?;
/// ```
pub async fn run_in_transaction<T, F>(pool: &ConnectionPool, f: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut PoolGuard) -> BoxFuture<'c, Result<T>>,
{
    let mut guard = pool.get_connection().await?;
    guard.begin().await?;

    match f(&mut guard).await {
        Ok(value) => {
            guard.commit().await?;
            guard.close().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = guard.rollback().await {
                warn!(pool = %pool.name(), error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{MemoryConnector, MemoryDatabase};

    async fn pool_with(
        config: ConnectionConfig,
    ) -> (ConnectionPool, MemoryDatabase) {
        let connector = Arc::new(MemoryConnector::new());
        let db = connector.add_database(&config);
        let pool = ConnectionPool::new("test", config, connector).await.unwrap();
        (pool, db)
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = ConnectionConfig::new("app", "pw")
            .min_connections(2)
            .max_connections(5);

        let (pool, _db) = pool_with(config).await;
        let stats = pool.stats().await;

        assert_eq!(stats.total_connections, 2); // min_connections
        assert_eq!(stats.available_connections, 2);
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let config = ConnectionConfig::new("app", "pw")
            .min_connections(1)
            .max_connections(5);

        let (pool, _db) = pool_with(config).await;

        {
            let _conn = pool.get_connection().await.unwrap();
            let stats = pool.stats().await;
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.available_connections, 0);
        }

        let stats = pool.stats().await;
        assert_eq!(stats.available_connections, 1);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let config = ConnectionConfig::new("app", "pw")
            .max_connections(2)
            .connect_timeout(Duration::from_millis(100));

        let (pool, _db) = pool_with(config).await;

        let _conn1 = pool.get_connection().await.unwrap();
        let _conn2 = pool.get_connection().await.unwrap();

        let result = pool.get_connection().await;
        assert!(matches!(result, Err(DbError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_statement_timeout() {
        let config = ConnectionConfig::new("app", "pw")
            .min_connections(1)
            .query_timeout(Duration::from_millis(20));
        let (pool, db) = pool_with(config).await;

        db.set_latency(Some(Duration::from_millis(200)));
        let mut conn = pool.get_connection().await.unwrap();
        let err = conn.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Timeout(_)));
        drop(conn);

        // Timed-out connection is not reused
        assert_eq!(pool.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_unreachable_instance_fails_creation() {
        let connector = Arc::new(MemoryConnector::new());
        let config = ConnectionConfig::new("app", "pw").database("missing");
        let result = ConnectionPool::new("missing", config, connector).await;
        assert!(matches!(result, Err(DbError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let (pool, _db) = pool_with(ConnectionConfig::new("app", "pw")).await;
        pool.close().await;
        assert!(matches!(
            pool.get_connection().await,
            Err(DbError::PoolClosed(_))
        ));
        assert_eq!(pool.stats().await.total_connections, 0);
    }

    #[tokio::test]
    async fn test_run_in_transaction_commits_and_rolls_back() {
        let (pool, db) = pool_with(ConnectionConfig::new("app", "pw")).await;
        db.create_table("ledger", &["id"]).unwrap();

        let inserted = run_in_transaction(&pool, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO ledger (id) VALUES ($1)", &[Value::Integer(1)])
                    .await
            })
        })
        .await
        .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.row_count("ledger"), 1);

        let failed: Result<()> = run_in_transaction(&pool, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO ledger (id) VALUES ($1)", &[Value::Integer(2)])
                    .await?;
                Err(DbError::Query("abort".into()))
            })
        })
        .await;
        assert!(failed.is_err());
        assert_eq!(db.row_count("ledger"), 1);
        assert!(db.received("ROLLBACK"));
    }
}
