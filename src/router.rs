//! Key-based routing of statements to shards.

use crate::connection::pool::{ConnectionPool, PoolGuard, run_in_transaction};
use crate::core::{Result, ShardId, Statement, Value};
use crate::metrics::MetricsCollector;
use crate::registry::ShardRegistry;
use crate::result::QueryResult;
use crate::sharding::{ShardKey, ShardResolver};
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

lazy_static! {
    static ref RETURNING: Regex = Regex::new(r"(?i)\bRETURNING\b").unwrap();
}

/// Routes each statement to the one shard its key resolves to.
///
/// There is no shard failover: connectivity and query errors reach the
/// caller unchanged. Every outcome is reported to the metrics collector.
pub struct ShardRouter {
    resolver: Arc<ShardResolver>,
    registry: Arc<ShardRegistry>,
    collector: Arc<MetricsCollector>,
}

impl ShardRouter {
    pub fn new(
        resolver: Arc<ShardResolver>,
        registry: Arc<ShardRegistry>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            resolver,
            registry,
            collector,
        }
    }

    pub fn resolver(&self) -> &Arc<ShardResolver> {
        &self.resolver
    }

    /// Shard the key currently resolves to
    pub fn shard_for(&self, key: &ShardKey) -> Result<ShardId> {
        self.resolver.resolve(key)
    }

    fn target(&self, key: &ShardKey) -> Result<(ShardId, Arc<ConnectionPool>)> {
        let shard_id = self.resolver.resolve(key)?;
        Ok((shard_id, self.registry.get_pool(shard_id)?))
    }

    pub async fn execute(
        &self,
        key: impl Into<ShardKey>,
        statement: impl Into<Statement>,
        params: &[Value],
    ) -> Result<QueryResult> {
        let key = key.into();
        let shard_id = self.resolver.resolve(&key)?;
        debug!(shard_id, key = %key, "key resolved");
        self.execute_on(shard_id, statement, params).await
    }

    /// Runs a statement on an already chosen shard, e.g. one picked by a
    /// [`WeightedKeyBuilder`](crate::sharding::WeightedKeyBuilder)
    pub async fn execute_on(
        &self,
        shard_id: ShardId,
        statement: impl Into<Statement>,
        params: &[Value],
    ) -> Result<QueryResult> {
        let statement = statement.into();
        let pool = self.registry.get_pool(shard_id)?;

        let start = Instant::now();
        let outcome = async {
            let mut conn = pool.get_connection().await?;
            let result = run_statement(&mut conn, &statement, params).await?;
            conn.close().await?;
            Ok(result)
        }
        .await;
        self.report(shard_id, start.elapsed(), outcome.is_ok());

        debug!(
            shard_id,
            write = statement.is_write(),
            ok = outcome.is_ok(),
            "statement routed"
        );
        outcome
    }

    /// Runs `f` in one transaction on the shard `key` resolves to.
    ///
    /// Atomicity never spans shards.
    pub async fn transaction<T, F>(&self, key: impl Into<ShardKey>, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut PoolGuard) -> BoxFuture<'c, Result<T>>,
    {
        let key = key.into();
        let (shard_id, pool) = self.target(&key)?;

        let start = Instant::now();
        let outcome = run_in_transaction(&pool, f).await;
        self.report(shard_id, start.elapsed(), outcome.is_ok());
        outcome
    }

    fn report(&self, shard_id: ShardId, elapsed: Duration, succeeded: bool) {
        // The shard may have been retired while the statement ran
        if let Err(err) = self.collector.record_query(shard_id, elapsed, succeeded) {
            warn!(shard_id, error = %err, "could not record routed statement");
        }
    }
}

/// Runs a statement and returns rows, or the affected count for a write
/// without a `RETURNING` clause
pub(crate) async fn run_statement(
    conn: &mut PoolGuard,
    statement: &Statement,
    params: &[Value],
) -> Result<QueryResult> {
    if statement.is_write() && !RETURNING.is_match(statement.sql()) {
        let affected = conn.execute(statement.sql(), params).await?;
        Ok(QueryResult::affected(affected))
    } else {
        conn.query(statement.sql(), params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationSchema, RebalanceSettings};
    use crate::connection::config::ConnectionConfig;
    use crate::connection::memory::{MemoryConnector, MemoryDatabase};
    use crate::core::DbError;
    use crate::registry::ShardDescriptor;
    use crate::sharding::{ResolverTable, ShardingStrategy};
    use futures::FutureExt;

    fn shard_config(id: ShardId) -> ConnectionConfig {
        ConnectionConfig::new("app", "pw")
            .host(&format!("shard-{}", id))
            .min_connections(0)
    }

    async fn setup(count: u32) -> (ShardRouter, Arc<ShardRegistry>, Vec<MemoryDatabase>) {
        let connector = Arc::new(MemoryConnector::new());
        let registry = Arc::new(ShardRegistry::new(connector.clone()));
        let mut dbs = Vec::new();
        for id in 0..count {
            let db = connector.add_database(&shard_config(id));
            db.create_table("users", &["id", "name"]).unwrap();
            registry
                .register_shard(ShardDescriptor::new(id, shard_config(id)))
                .await
                .unwrap();
            dbs.push(db);
        }

        let mut table = ResolverTable::new(0);
        table.set_active_shards(registry.shard_ids().unwrap());
        let resolver = Arc::new(ShardResolver::new(ShardingStrategy::Modulo, table));
        let collector = Arc::new(MetricsCollector::new(
            registry.clone(),
            resolver.clone(),
            RebalanceSettings::default(),
            MigrationSchema::new("users", "id"),
        ));
        let router = ShardRouter::new(resolver, registry.clone(), collector);
        (router, registry, dbs)
    }

    #[tokio::test]
    async fn test_execute_routes_by_key() {
        let (router, registry, dbs) = setup(4).await;

        let inserted = router
            .execute(
                10,
                "INSERT INTO users (id, name) VALUES ($1, $2)",
                &[Value::Integer(10), Value::Text("ada".into())],
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(dbs[2].row_count("users"), 1);
        assert!(dbs.iter().enumerate().all(|(i, db)| i == 2 || db.row_count("users") == 0));

        let rows = router
            .execute(10, "SELECT * FROM users WHERE id = $1", &[Value::Integer(10)])
            .await
            .unwrap();
        assert_eq!(rows.get(0, "name"), Some(&Value::Text("ada".into())));
        assert_eq!(registry.entry(2).unwrap().counters.query_count(), 2);
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let (router, registry, dbs) = setup(2).await;
        dbs[1].set_unreachable(true);

        let err = router.execute(1, "SELECT * FROM users", &[]).await.unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(registry.entry(1).unwrap().counters.error_count(), 1);

        let err = router
            .execute("eu", "SELECT * FROM users", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_transaction_targets_one_shard() {
        let (router, _registry, dbs) = setup(2).await;

        router
            .transaction(3, |conn| {
                async move {
                    conn.execute(
                        "INSERT INTO users (id, name) VALUES ($1, $2)",
                        &[Value::Integer(3), Value::Text("a".into())],
                    )
                    .await?;
                    conn.execute(
                        "INSERT INTO users (id, name) VALUES ($1, $2)",
                        &[Value::Integer(5), Value::Text("b".into())],
                    )
                    .await?;
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(dbs[1].row_count("users"), 2);

        let failed: Result<()> = router
            .transaction(3, |conn| {
                async move {
                    conn.execute(
                        "INSERT INTO users (id, name) VALUES ($1, $2)",
                        &[Value::Integer(7), Value::Text("c".into())],
                    )
                    .await?;
                    Err(DbError::Query("abort".into()))
                }
                .boxed()
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(dbs[1].row_count("users"), 2);
        assert!(dbs[1].received("ROLLBACK"));
    }
}
