//! Shard connection-pool registry.
//!
//! Owns one [`ConnectionPool`] per live shard plus the idle standby
//! descriptors the autoscaler activates. The descriptor table is an
//! [`im::OrdMap`] behind a std `RwLock`: readers clone it (cheap, structurally
//! shared) and release the lock before any I/O. Per-shard counters are atomics
//! so the hot path never takes the table lock for writing.

use crate::connection::pool::ConnectionPool;
use crate::connection::{Connector, config::ConnectionConfig};
use crate::core::{DbError, Result, ShardId, Value};
use crate::sharding::{CompositeKey, GeoPoint, TimeRange};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// `[start, end)` numeric key bounds a shard owns under the range strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: i64,
    pub end: i64,
}

/// Strategy-specific placement attributes of a shard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<KeyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Value>,
}

impl ShardAttributes {
    /// Composite key this shard answers to, if it carries any composite discriminant
    pub fn composite_key(&self) -> Option<CompositeKey> {
        let key = CompositeKey {
            time_range: self.time_range,
            location: self.location,
            attributes: self.tags.clone(),
        };
        (!key.is_empty()).then_some(key)
    }
}

/// Identity, connection parameters and placement attributes of one shard
#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub id: ShardId,
    pub connection: ConnectionConfig,
    pub attributes: ShardAttributes,
    pub active: bool,
}

impl ShardDescriptor {
    pub fn new(id: ShardId, connection: ConnectionConfig) -> Self {
        Self {
            id,
            connection,
            attributes: ShardAttributes::default(),
            active: false,
        }
    }

    pub fn with_attributes(mut self, attributes: ShardAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn pool_name(&self) -> String {
        format!("shard-{}", self.id)
    }
}

const UNKNOWN: u64 = u64::MAX;

/// Rolling per-shard counters
#[derive(Debug)]
pub struct ShardCounters {
    row_count: AtomicU64,
    query_count: AtomicU64,
    error_count: AtomicU64,
    response_time_us: AtomicU64,
    last_checked_ms: AtomicI64,
    healthy: AtomicBool,
}

impl Default for ShardCounters {
    fn default() -> Self {
        Self {
            row_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            response_time_us: AtomicU64::new(UNKNOWN),
            last_checked_ms: AtomicI64::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

impl ShardCounters {
    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn response_time(&self) -> Option<Duration> {
        match self.response_time_us.load(Ordering::Relaxed) {
            UNKNOWN => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        match self.last_checked_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn record_probe(&self, outcome: &Result<Duration>) {
        self.last_checked_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        match outcome {
            Ok(elapsed) => {
                self.set_response_time(*elapsed);
                self.healthy.store(true, Ordering::Relaxed);
            }
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.healthy.store(false, Ordering::Relaxed);
            }
        }
    }

    fn set_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(UNKNOWN - 1);
        self.response_time_us.store(micros, Ordering::Relaxed);
    }
}

/// A live shard: its descriptor, pool and counters
#[derive(Debug)]
pub struct ShardEntry {
    pub descriptor: ShardDescriptor,
    pub pool: Arc<ConnectionPool>,
    pub counters: ShardCounters,
}

/// Point-in-time view of a live shard for admin reads
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub id: ShardId,
    pub address: String,
    pub active: bool,
    pub healthy: bool,
    pub attributes: ShardAttributes,
    pub row_count: u64,
    pub query_count: u64,
    pub error_count: u64,
    pub response_time_ms: Option<f64>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl From<&ShardEntry> for ShardStatus {
    fn from(entry: &ShardEntry) -> Self {
        Self {
            id: entry.descriptor.id,
            address: entry.descriptor.connection.address(),
            active: entry.descriptor.active,
            healthy: entry.counters.is_healthy(),
            attributes: entry.descriptor.attributes.clone(),
            row_count: entry.counters.row_count(),
            query_count: entry.counters.query_count(),
            error_count: entry.counters.error_count(),
            response_time_ms: entry
                .counters
                .response_time()
                .map(|d| d.as_secs_f64() * 1000.0),
            last_checked: entry.counters.last_checked(),
        }
    }
}

pub struct ShardRegistry {
    connector: Arc<dyn Connector>,
    shards: RwLock<OrdMap<ShardId, Arc<ShardEntry>>>,
    standby: Mutex<Vec<ShardDescriptor>>,
}

impl ShardRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shards: RwLock::new(OrdMap::new()),
            standby: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the live table; the lock is released on return
    fn table(&self) -> Result<OrdMap<ShardId, Arc<ShardEntry>>> {
        Ok(self.shards.read()?.clone())
    }

    pub fn entry(&self, shard_id: ShardId) -> Result<Arc<ShardEntry>> {
        self.shards
            .read()?
            .get(&shard_id)
            .cloned()
            .ok_or(DbError::ShardNotFound(shard_id))
    }

    /// Opens the shard's pool, verifies it with a round trip and makes it live.
    ///
    /// Fails fast, leaving nothing registered, if the probe fails.
    pub async fn register_shard(&self, mut descriptor: ShardDescriptor) -> Result<()> {
        let shard_id = descriptor.id;
        if self.shards.read()?.contains_key(&shard_id) {
            return Err(DbError::Configuration(format!(
                "shard {} is already registered",
                shard_id
            )));
        }

        let pool = ConnectionPool::new(
            descriptor.pool_name(),
            descriptor.connection.clone(),
            self.connector.clone(),
        )
        .await?;
        let elapsed = match pool.ping().await {
            Ok(elapsed) => elapsed,
            Err(err) => {
                pool.close().await;
                warn!(shard_id, error = %err, "shard failed registration probe");
                return Err(err);
            }
        };

        descriptor.active = true;
        let address = descriptor.connection.address();
        let entry = Arc::new(ShardEntry {
            descriptor,
            pool: Arc::new(pool),
            counters: ShardCounters::default(),
        });
        entry.counters.record_probe(&Ok(elapsed));

        let duplicate = {
            let mut shards = self.shards.write()?;
            if shards.contains_key(&shard_id) {
                true
            } else {
                shards.insert(shard_id, entry.clone());
                false
            }
        };
        if duplicate {
            entry.pool.close().await;
            return Err(DbError::Configuration(format!(
                "shard {} is already registered",
                shard_id
            )));
        }

        info!(shard_id, address = %address, "shard registered");
        Ok(())
    }

    /// Pool for application traffic; counts one query against the shard
    pub fn get_pool(&self, shard_id: ShardId) -> Result<Arc<ConnectionPool>> {
        let entry = self.entry(shard_id)?;
        entry.counters.query_count.fetch_add(1, Ordering::Relaxed);
        Ok(entry.pool.clone())
    }

    /// Pool for administrative traffic; not counted as load
    pub fn admin_pool(&self, shard_id: ShardId) -> Result<Arc<ConnectionPool>> {
        Ok(self.entry(shard_id)?.pool.clone())
    }

    /// Closes the shard's pool and returns its descriptor to the standby list.
    ///
    /// Data must already have been migrated away; this is not checked.
    pub async fn remove_shard(&self, shard_id: ShardId) -> Result<ShardDescriptor> {
        let entry = self
            .shards
            .write()?
            .remove(&shard_id)
            .ok_or(DbError::ShardNotFound(shard_id))?;

        entry.pool.close().await;

        let mut descriptor = entry.descriptor.clone();
        descriptor.active = false;
        self.add_standby(descriptor.clone())?;

        info!(shard_id, "shard removed");
        Ok(descriptor)
    }

    /// Probes every live shard concurrently
    pub async fn health_check_all(&self) -> Result<BTreeMap<ShardId, bool>> {
        let table = self.table()?;
        let probes = table.values().map(|entry| {
            let entry = entry.clone();
            async move {
                let outcome = entry.pool.ping().await;
                entry.counters.record_probe(&outcome);
                if let Err(err) = &outcome {
                    warn!(shard_id = entry.descriptor.id, error = %err, "shard health probe failed");
                }
                (entry.descriptor.id, outcome.is_ok())
            }
        });

        Ok(join_all(probes).await.into_iter().collect())
    }

    pub fn shard_ids(&self) -> Result<Vec<ShardId>> {
        Ok(self.table()?.keys().copied().collect())
    }

    pub fn shard_count(&self) -> Result<usize> {
        Ok(self.shards.read()?.len())
    }

    pub fn contains(&self, shard_id: ShardId) -> Result<bool> {
        Ok(self.shards.read()?.contains_key(&shard_id))
    }

    pub fn descriptors(&self) -> Result<Vec<ShardDescriptor>> {
        Ok(self
            .table()?
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect())
    }

    pub fn statuses(&self) -> Result<Vec<ShardStatus>> {
        Ok(self
            .table()?
            .values()
            .map(|entry| ShardStatus::from(entry.as_ref()))
            .collect())
    }

    pub fn record_error(&self, shard_id: ShardId) -> Result<()> {
        self.entry(shard_id)?
            .counters
            .error_count
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_response(&self, shard_id: ShardId, elapsed: Duration) -> Result<()> {
        self.entry(shard_id)?.counters.set_response_time(elapsed);
        Ok(())
    }

    pub fn set_row_count(&self, shard_id: ShardId, rows: u64) -> Result<()> {
        self.entry(shard_id)?
            .counters
            .row_count
            .store(rows, Ordering::Relaxed);
        Ok(())
    }

    pub fn add_standby(&self, descriptor: ShardDescriptor) -> Result<()> {
        let mut standby = self.standby.lock()?;
        standby.retain(|d| d.id != descriptor.id);
        standby.push(descriptor);
        Ok(())
    }

    /// Takes the next idle descriptor (lowest id first)
    pub fn take_standby(&self) -> Result<Option<ShardDescriptor>> {
        let mut standby = self.standby.lock()?;
        let next = standby
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| d.id)
            .map(|(idx, _)| idx);
        Ok(next.map(|idx| standby.remove(idx)))
    }

    pub fn standby(&self) -> Result<Vec<ShardDescriptor>> {
        Ok(self.standby.lock()?.clone())
    }

    pub async fn close_all(&self) -> Result<()> {
        let table = self.table()?;
        join_all(table.values().map(|entry| entry.pool.close())).await;
        Ok(())
    }
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shards = self
            .shards
            .read()
            .map(|shards| shards.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("ShardRegistry")
            .field("shards", &shards)
            .finish()
    }
}
