//! Periodic background loops: health checks, metrics collection, rebalancing.

use crate::core::{DbError, Result};
use crate::metrics::MetricsCollector;
use crate::rebalance::{PassOutcome, Rebalancer};
use crate::registry::ShardRegistry;
use crate::replica::ReplicaRouter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Handle to one periodic loop. Dropping it aborts the loop.
pub struct BackgroundWorker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signals the worker to stop and waits for the current tick to finish
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DbError::Worker(format!("{} worker join: {}", self.name, err)))?;
        }
        info!(worker = self.name, "worker stopped");
        Ok(())
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Runs `tick` every `period`, starting one period from now.
///
/// Ticks that fall behind are skipped rather than bunched up. A failed tick
/// is logged and the loop carries on with the next one.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> BackgroundWorker
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let period = period.max(MIN_PERIOD);

    let join_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = tick().await {
                        error!(worker = name, error = %err, "background tick failed");
                    }
                }
            }
        }
    });

    info!(worker = name, period = ?period, "worker started");
    BackgroundWorker {
        name,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

pub fn spawn_health_worker(
    registry: Arc<ShardRegistry>,
    replicas: Arc<ReplicaRouter>,
    period: Duration,
) -> BackgroundWorker {
    spawn_periodic("health", period, move || {
        let registry = registry.clone();
        let replicas = replicas.clone();
        async move {
            let shards = registry.health_check_all().await?;
            let report = replicas.health_check().await?;
            debug!(
                shards_healthy = shards.values().filter(|ok| **ok).count(),
                shards = shards.len(),
                primary_healthy = report.primary_healthy,
                replicas_deactivated = report.deactivated().len(),
                "health check finished"
            );
            Ok(())
        }
    })
}

pub fn spawn_metrics_worker(collector: Arc<MetricsCollector>, period: Duration) -> BackgroundWorker {
    spawn_periodic("metrics", period, move || {
        let collector = collector.clone();
        async move {
            collector.collect().await?;
            Ok(())
        }
    })
}

pub fn spawn_rebalance_worker(rebalancer: Arc<Rebalancer>, period: Duration) -> BackgroundWorker {
    spawn_periodic("rebalance", period, move || {
        let rebalancer = rebalancer.clone();
        async move {
            rebalancer.reconcile().await?;
            match rebalancer.run_pass().await? {
                PassOutcome::NoChange | PassOutcome::AlreadyRunning => {}
                outcome => info!(?outcome, "rebalance pass finished"),
            }
            Ok(())
        }
    })
}
