pub mod config;
pub mod memory;
pub mod pool;
pub mod postgres;

use crate::core::{Result, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use config::ConnectionConfig;

/// One open session against a physical database instance
///
/// Implemented by the Postgres driver adapter and by the in-memory test
/// database. Parameters are positional (`$1`, `$2`, ...).
#[async_trait]
pub trait DbConnection: Send {
    /// Run a statement that returns rows
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Run a statement and return the number of rows it changed
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Trivial round trip used for connectivity probes
    async fn ping(&mut self) -> Result<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    /// Server-reported replication delay in seconds (zero on a primary)
    async fn replication_lag(&mut self) -> Result<f64>;

    fn is_in_transaction(&self) -> bool;

    /// True once the underlying session can no longer serve statements
    fn is_closed(&self) -> bool {
        false
    }
}

/// Opens connections for a pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DbConnection>>;
}
