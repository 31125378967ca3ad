use crate::connection::config::ConnectionConfig;
use crate::connection::pool::ConnectionPool;
use crate::core::{ReplicaId, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const UNKNOWN: u64 = u64::MAX;

/// Limits applied by the health loop and by failed reads
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// A replica is deactivated once its error count reaches this
    pub error_count: u64,
    /// A replica is deactivated once its lag reaches this many seconds
    pub lag_secs: f64,
    /// Probes slower than this are logged
    pub response_time: Duration,
    /// Upper bound for one replica attempt before falling back to the primary
    pub failover_timeout: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_count: 5,
            lag_secs: 30.0,
            response_time: Duration::from_secs(1),
            failover_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaDescriptor {
    pub id: ReplicaId,
    pub connection: ConnectionConfig,
    /// Share of traffic under weighted round robin
    pub weight: u32,
}

impl ReplicaDescriptor {
    pub fn new(id: impl Into<ReplicaId>, connection: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            connection,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }
}

/// Live state of one replica: its pool plus lock-free health counters
#[derive(Debug)]
pub struct ReplicaState {
    pub descriptor: ReplicaDescriptor,
    pub(crate) pool: Arc<ConnectionPool>,
    active: AtomicBool,
    error_count: AtomicU64,
    query_count: AtomicU64,
    response_time_us: AtomicU64,
    lag_bits: AtomicU64,
    last_checked_ms: AtomicI64,
}

impl ReplicaState {
    pub(crate) fn new(descriptor: ReplicaDescriptor, pool: ConnectionPool) -> Self {
        Self {
            descriptor,
            pool: Arc::new(pool),
            active: AtomicBool::new(true),
            error_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            response_time_us: AtomicU64::new(UNKNOWN),
            lag_bits: AtomicU64::new(0f64.to_bits()),
            last_checked_ms: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn response_time(&self) -> Option<Duration> {
        match self.response_time_us.load(Ordering::Relaxed) {
            UNKNOWN => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn lag_secs(&self) -> f64 {
        f64::from_bits(self.lag_bits.load(Ordering::Relaxed))
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        match self.last_checked_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub(crate) fn record_success(&self, elapsed: Duration) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.set_response_time(elapsed);
    }

    fn set_response_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(UNKNOWN - 1);
        self.response_time_us.store(micros, Ordering::Relaxed);
    }

    fn set_lag(&self, lag_secs: f64) {
        self.lag_bits.store(lag_secs.to_bits(), Ordering::Relaxed);
    }

    /// Counts a failure and deactivates at the threshold.
    ///
    /// Returns true only for the call that flipped the replica inactive.
    pub(crate) fn record_error(&self, thresholds: &HealthThresholds) -> bool {
        let errors = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        errors >= thresholds.error_count && self.deactivate()
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Administrative reactivation; the replica is judged afresh from here on
    pub(crate) fn reactivate(&self) {
        self.error_count.store(0, Ordering::SeqCst);
        self.set_lag(0.0);
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            id: self.descriptor.id.clone(),
            address: self.descriptor.connection.address(),
            weight: self.descriptor.weight,
            active: self.is_active(),
            error_count: self.error_count(),
            query_count: self.query_count(),
            response_time_ms: self.response_time().map(|d| d.as_secs_f64() * 1000.0),
            lag_secs: self.lag_secs(),
            last_checked: self.last_checked(),
        }
    }
}

/// Point-in-time view of a replica for admin reads
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub address: String,
    pub weight: u32,
    pub active: bool,
    pub error_count: u64,
    pub query_count: u64,
    pub response_time_ms: Option<f64>,
    pub lag_secs: f64,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Outcome of one health probe against a replica
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaProbe {
    pub id: ReplicaId,
    pub reachable: bool,
    pub response_time_ms: Option<f64>,
    pub lag_secs: Option<f64>,
    /// Set when this probe pushed the replica over a threshold
    pub deactivated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub primary_healthy: bool,
    pub replicas: Vec<ReplicaProbe>,
}

impl HealthReport {
    pub fn deactivated(&self) -> Vec<ReplicaId> {
        self.replicas
            .iter()
            .filter(|probe| probe.deactivated)
            .map(|probe| probe.id.clone())
            .collect()
    }
}

async fn measure(pool: &ConnectionPool, limit: Duration) -> Result<(Duration, f64)> {
    let start = Instant::now();
    let mut conn = tokio::time::timeout(limit, pool.get_connection()).await??;
    tokio::time::timeout(limit, conn.ping()).await??;
    let elapsed = start.elapsed();
    let lag = tokio::time::timeout(limit, conn.replication_lag()).await??;
    conn.close().await?;
    Ok((elapsed, lag))
}

/// Probes connectivity and replication lag, then applies the deactivation rule.
///
/// Never reactivates a replica.
pub(crate) async fn probe_replica(
    state: &ReplicaState,
    thresholds: &HealthThresholds,
) -> ReplicaProbe {
    let outcome = measure(&state.pool, thresholds.failover_timeout).await;
    state
        .last_checked_ms
        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

    match outcome {
        Ok((elapsed, lag)) => {
            state.set_response_time(elapsed);
            state.set_lag(lag);

            if elapsed > thresholds.response_time {
                info!(
                    replica = state.id(),
                    response_ms = elapsed.as_millis() as u64,
                    "replica responding slowly"
                );
            }

            let deactivated = lag >= thresholds.lag_secs && state.deactivate();
            if deactivated {
                warn!(
                    replica = state.id(),
                    lag_secs = lag,
                    threshold = thresholds.lag_secs,
                    "replica deactivated: replication lag over threshold"
                );
            }

            ReplicaProbe {
                id: state.descriptor.id.clone(),
                reachable: true,
                response_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
                lag_secs: Some(lag),
                deactivated,
            }
        }
        Err(err) => {
            let deactivated = state.record_error(thresholds);
            if deactivated {
                warn!(
                    replica = state.id(),
                    errors = state.error_count(),
                    "replica deactivated: error count reached threshold"
                );
            } else {
                warn!(replica = state.id(), error = %err, "replica health probe failed");
            }

            ReplicaProbe {
                id: state.descriptor.id.clone(),
                reachable: false,
                response_time_ms: None,
                lag_secs: None,
                deactivated,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryConnector;

    async fn state_with(connector: &Arc<MemoryConnector>, host: &str) -> ReplicaState {
        let config = ConnectionConfig::new("app", "pw").host(host).min_connections(0);
        connector.add_database(&config);
        let pool = ConnectionPool::new(host, config.clone(), connector.clone())
            .await
            .unwrap();
        ReplicaState::new(ReplicaDescriptor::new(host, config), pool)
    }

    #[tokio::test]
    async fn test_error_threshold_flips_once() {
        let connector = Arc::new(MemoryConnector::new());
        let state = state_with(&connector, "r1").await;
        let thresholds = HealthThresholds {
            error_count: 2,
            ..HealthThresholds::default()
        };

        assert!(!state.record_error(&thresholds));
        assert!(state.record_error(&thresholds));
        assert!(!state.record_error(&thresholds));
        assert!(!state.is_active());

        state.reactivate();
        assert!(state.is_active());
        assert_eq!(state.error_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_records_lag_and_deactivates() {
        let connector = Arc::new(MemoryConnector::new());
        let state = state_with(&connector, "r1").await;
        let db = connector.database(&state.descriptor.connection.address()).unwrap();

        db.set_replication_lag(2.5);
        let probe = probe_replica(&state, &HealthThresholds::default()).await;
        assert!(probe.reachable);
        assert_eq!(state.lag_secs(), 2.5);
        assert!(state.is_active());
        assert!(state.last_checked().is_some());

        db.set_replication_lag(45.0);
        let probe = probe_replica(&state, &HealthThresholds::default()).await;
        assert!(probe.deactivated);
        assert!(!state.is_active());
    }
}
