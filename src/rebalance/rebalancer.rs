use super::migration::{MigrationRecord, Migrator};
use super::{PlannedMove, plan_moves};
use crate::config::{MigrationSchema, RebalanceSettings};
use crate::core::{DbError, Result, ShardId};
use crate::metrics::{MetricsCollector, MetricsSnapshot, ShardMetrics};
use crate::registry::{ShardDescriptor, ShardRegistry};
use crate::sharding::{ResolverTable, ShardResolver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceEventKind {
    Migration,
    ScaleUp,
    ScaleDown,
    Reconciled,
    PassFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebalanceEvent {
    pub at: DateTime<Utc>,
    pub kind: RebalanceEventKind,
    pub shards: Vec<ShardId>,
    pub rows_moved: u64,
    pub detail: String,
}

impl RebalanceEvent {
    fn new(kind: RebalanceEventKind, shards: Vec<ShardId>, rows_moved: u64, detail: String) -> Self {
        Self {
            at: Utc::now(),
            kind,
            shards,
            rows_moved,
            detail,
        }
    }
}

/// What a single pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass held the guard
    AlreadyRunning,
    NoChange,
    Rebalanced { moves: usize, rows_moved: u64 },
    ScaledUp { shard_id: ShardId, rows_moved: u64 },
    ScaledDown { removed: Vec<ShardId> },
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Load balancer and autoscaler over the live shard set.
///
/// A pass reads the latest metrics snapshot, collecting a fresh one when the
/// latest was taken before the previous pass moved data, and does exactly one of: scale
/// up (activate a standby shard, then rebalance onto it), scale down (drain
/// the least-loaded shards and retire them) or rebalance. Passes never
/// overlap; a pass that finds another in flight returns immediately.
pub struct Rebalancer {
    registry: Arc<ShardRegistry>,
    resolver: Arc<ShardResolver>,
    collector: Arc<MetricsCollector>,
    migrator: Migrator,
    settings: RebalanceSettings,
    running: AtomicBool,
    /// When the last pass that may have moved data ended
    last_change: Mutex<Option<DateTime<Utc>>>,
    events: Mutex<VecDeque<RebalanceEvent>>,
}

impl Rebalancer {
    pub fn new(
        registry: Arc<ShardRegistry>,
        resolver: Arc<ShardResolver>,
        collector: Arc<MetricsCollector>,
        settings: RebalanceSettings,
        schema: MigrationSchema,
    ) -> Self {
        let migrator = Migrator::new(
            registry.clone(),
            schema,
            settings.migration_batch_size,
            settings.migration_timeout(),
            settings.history_limit,
        );
        Self {
            registry,
            resolver,
            collector,
            migrator,
            settings,
            running: AtomicBool::new(false),
            last_change: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn settings(&self) -> &RebalanceSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn plan(&self, snapshot: &MetricsSnapshot) -> Vec<PlannedMove> {
        plan_moves(snapshot, self.settings.rebalance_threshold)
    }

    pub async fn run_pass(&self) -> Result<PassOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("rebalance pass already in progress; skipping");
            return Ok(PassOutcome::AlreadyRunning);
        }
        let _guard = PassGuard(&self.running);

        let outcome = self.pass().instrument(info_span!("rebalance_pass")).await;
        // A failed pass may still have moved some batches
        if !matches!(outcome, Ok(PassOutcome::NoChange)) {
            *self.last_change.lock()? = Some(Utc::now());
        }
        if let Err(err) = &outcome {
            error!(error = %err, "rebalance pass aborted");
            self.push_event(RebalanceEvent::new(
                RebalanceEventKind::PassFailed,
                Vec::new(),
                0,
                err.to_string(),
            ))?;
        }
        outcome
    }

    async fn pass(&self) -> Result<PassOutcome> {
        let last_change = *self.last_change.lock()?;
        let snapshot = match self.collector.latest()? {
            Some(snapshot) if last_change.is_none_or(|at| snapshot.collected_at > at) => snapshot,
            Some(_) => {
                debug!("metrics predate the last data movement; collecting");
                self.collector.collect().await?
            }
            None => self.collector.collect().await?,
        };
        let snapshot = self.live_view(&snapshot)?;
        let mean = snapshot.mean_load();
        let count = self.registry.shard_count()?;

        if mean > self.settings.load_threshold && count < self.settings.max_shard_count {
            if let Some((shard_id, rows_moved)) = self.scale_up(&snapshot).await? {
                return Ok(PassOutcome::ScaledUp {
                    shard_id,
                    rows_moved,
                });
            }
        } else if mean < self.settings.load_threshold / 2.0 && count > self.settings.min_shard_count {
            let removed = self.scale_down(&snapshot).await?;
            if !removed.is_empty() {
                return Ok(PassOutcome::ScaledDown { removed });
            }
        }

        let (moves, rows_moved) = self.rebalance(&snapshot).await?;
        if moves == 0 {
            Ok(PassOutcome::NoChange)
        } else {
            Ok(PassOutcome::Rebalanced { moves, rows_moved })
        }
    }

    /// Snapshot restricted to shards that are still live
    fn live_view(&self, snapshot: &MetricsSnapshot) -> Result<MetricsSnapshot> {
        let live = self.registry.shard_ids()?;
        let mut view = snapshot.clone();
        view.shards.retain(|m| live.contains(&m.shard_id));
        Ok(view)
    }

    /// Executes the planned moves in order; the first failure aborts the rest.
    ///
    /// Returns the number of moves and the entities they transferred.
    pub async fn rebalance(&self, snapshot: &MetricsSnapshot) -> Result<(usize, u64)> {
        let moves = self.plan(snapshot);
        let mut rows_moved = 0;

        for planned in &moves {
            info!(
                source = planned.source,
                destination = planned.destination,
                rows = planned.rows,
                "rebalancing shards"
            );
            let record = self
                .migrator
                .migrate(planned.source, planned.destination, Some(planned.rows))
                .await?;
            rows_moved += record.moved;
            self.push_event(RebalanceEvent::new(
                RebalanceEventKind::Migration,
                vec![planned.source, planned.destination],
                record.moved,
                format!("moved {} of {} planned entities", record.moved, planned.rows),
            ))?;
        }
        Ok((moves.len(), rows_moved))
    }

    /// Activates the next standby shard and rebalances onto it.
    ///
    /// Returns `None` when no standby shard is left.
    pub async fn scale_up(&self, snapshot: &MetricsSnapshot) -> Result<Option<(ShardId, u64)>> {
        let Some(descriptor) = self.registry.take_standby()? else {
            warn!(
                mean_load = snapshot.mean_load(),
                "load above threshold but no standby shard is available"
            );
            return Ok(None);
        };
        let shard_id = descriptor.id;

        if let Err(err) = self.registry.register_shard(descriptor.clone()).await {
            self.registry.add_standby(descriptor)?;
            return Err(err);
        }

        let live = self.registry.shard_ids()?;
        let shard_count = live.len();
        self.resolver.update(|table| {
            table.set_active_shards(live);
            announce(table, &descriptor)
        })??;

        // The new shard starts with zero metrics so the planner targets it
        let mut shards = snapshot.shards.clone();
        shards.push(ShardMetrics {
            shard_id,
            collected_at: Utc::now(),
            query_count: 0,
            avg_response_ms: None,
            active_connections: 0,
            row_count: 0,
            entity_count: 0,
            load: 0.0,
        });
        let expanded = MetricsSnapshot::new(shards);
        self.collector.record_snapshot(expanded.clone())?;
        info!(shard_id, shard_count, "scaled up");

        let (_, rows_moved) = self.rebalance(&expanded).await?;
        self.push_event(RebalanceEvent::new(
            RebalanceEventKind::ScaleUp,
            vec![shard_id],
            rows_moved,
            format!(
                "activated shard {} at mean load {:.3}",
                shard_id,
                snapshot.mean_load()
            ),
        ))?;
        Ok(Some((shard_id, rows_moved)))
    }

    /// Drains the least-loaded shards down to the configured minimum and retires them
    pub async fn scale_down(&self, snapshot: &MetricsSnapshot) -> Result<Vec<ShardId>> {
        let live = self.registry.shard_ids()?;
        let excess = live.len().saturating_sub(self.settings.min_shard_count);

        let mut candidates: Vec<&ShardMetrics> = snapshot
            .shards
            .iter()
            .filter(|m| live.contains(&m.shard_id))
            .collect();
        // Least loaded first; on ties the highest id goes first
        candidates.sort_by(|a, b| a.load.total_cmp(&b.load).then(b.shard_id.cmp(&a.shard_id)));
        let victims: Vec<ShardId> = candidates.iter().take(excess).map(|m| m.shard_id).collect();
        if victims.is_empty() {
            return Ok(victims);
        }

        let survivors: Vec<ShardId> = live
            .iter()
            .copied()
            .filter(|id| !victims.contains(id))
            .collect();
        if survivors.is_empty() {
            return Err(DbError::Configuration(
                "scale-down would leave no live shard".into(),
            ));
        }

        // Stop placing new keys on the shards being drained
        self.resolver.set_active_shards(survivors.iter().copied())?;

        let mut projected: BTreeMap<ShardId, f64> = survivors
            .iter()
            .map(|id| (*id, snapshot.get(*id).map_or(0.0, |m| m.load)))
            .collect();
        let mut removed = Vec::with_capacity(victims.len());

        for victim in victims {
            let Some(destination) = projected
                .iter()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| *id)
            else {
                break;
            };

            let record = match self.migrator.migrate(victim, destination, None).await {
                Ok(record) => record,
                Err(err) => {
                    self.resolver.set_active_shards(self.registry.shard_ids()?)?;
                    return Err(err);
                }
            };
            if let Some(load) = projected.get_mut(&destination) {
                *load += snapshot.get(victim).map_or(0.0, |m| m.load);
            }

            self.registry.remove_shard(victim).await?;
            self.resolver.update(|table| table.forget_shard(victim))?;
            info!(shard_id = victim, destination, moved = record.moved, "scaled down");

            self.push_event(RebalanceEvent::new(
                RebalanceEventKind::ScaleDown,
                vec![victim, destination],
                record.moved,
                format!("retired shard {} into shard {}", victim, destination),
            ))?;
            removed.push(victim);
        }
        Ok(removed)
    }

    /// Finishes migrations whose source commit failed
    pub async fn reconcile(&self) -> Result<usize> {
        let cleaned = self.migrator.reconcile().await?;
        if cleaned > 0 {
            self.push_event(RebalanceEvent::new(
                RebalanceEventKind::Reconciled,
                Vec::new(),
                cleaned as u64,
                format!("removed {} duplicated entities from source shards", cleaned),
            ))?;
        }
        Ok(cleaned)
    }

    fn push_event(&self, event: RebalanceEvent) -> Result<()> {
        let mut events = self.events.lock()?;
        events.push_back(event);
        while events.len() > self.settings.history_limit.max(1) {
            events.pop_front();
        }
        Ok(())
    }

    /// Recent events, oldest first
    pub fn history(&self) -> Result<Vec<RebalanceEvent>> {
        Ok(self.events.lock()?.iter().cloned().collect())
    }

    pub fn migrations(&self) -> Result<Vec<MigrationRecord>> {
        self.migrator.records()
    }
}

/// Publishes a newly active shard's placement attributes to the resolver
fn announce(table: &mut ResolverTable, descriptor: &ShardDescriptor) -> Result<()> {
    let attributes = &descriptor.attributes;
    if let Some(range) = attributes.range {
        table.add_range(range.start, range.end, descriptor.id)?;
    }
    if let Some(key) = attributes.composite_key() {
        table.register_composite(descriptor.id, key);
    }
    if let Some(region) = &attributes.region {
        let mut shards = table
            .regions()
            .get(&region.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        if !shards.contains(&descriptor.id) {
            shards.push(descriptor.id);
        }
        table.map_region(region.as_str(), shards);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::connection::memory::MemoryConnector;
    use crate::registry::{KeyRange, ShardAttributes};
    use crate::sharding::{ShardKey, ShardingStrategy};

    fn rebalancer() -> Rebalancer {
        let connector = Arc::new(MemoryConnector::new());
        let registry = Arc::new(ShardRegistry::new(connector));
        let resolver = Arc::new(ShardResolver::new(
            ShardingStrategy::Modulo,
            ResolverTable::new(0),
        ));
        let settings = RebalanceSettings::default();
        let schema = MigrationSchema::new("tenants", "id");
        let collector = Arc::new(MetricsCollector::new(
            registry.clone(),
            resolver.clone(),
            settings.clone(),
            schema.clone(),
        ));
        Rebalancer::new(registry, resolver, collector, settings, schema)
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let rebalancer = rebalancer();
        rebalancer.running.store(true, Ordering::Release);

        let outcome = rebalancer.run_pass().await.unwrap();
        assert_eq!(outcome, PassOutcome::AlreadyRunning);
        assert!(rebalancer.is_running());
    }

    #[tokio::test]
    async fn test_guard_released_after_pass() {
        let rebalancer = rebalancer();
        let outcome = rebalancer.run_pass().await.unwrap();
        assert_eq!(outcome, PassOutcome::NoChange);
        assert!(!rebalancer.is_running());
    }

    #[test]
    fn test_history_is_bounded() {
        let rebalancer = rebalancer();
        for n in 0..(rebalancer.settings.history_limit + 5) {
            rebalancer
                .push_event(RebalanceEvent::new(
                    RebalanceEventKind::Migration,
                    vec![0, 1],
                    n as u64,
                    String::new(),
                ))
                .unwrap();
        }
        let history = rebalancer.history().unwrap();
        assert_eq!(history.len(), rebalancer.settings.history_limit);
        assert_eq!(history[0].rows_moved, 5);
    }

    #[test]
    fn test_announce_appends_region_and_range() {
        let mut table = ResolverTable::new(0);
        table.map_region("eu", vec![1]);

        let descriptor = ShardDescriptor::new(4, ConnectionConfig::new("app", "pw")).with_attributes(
            ShardAttributes {
                region: Some("EU".into()),
                range: Some(KeyRange { start: 0, end: 100 }),
                ..ShardAttributes::default()
            },
        );
        announce(&mut table, &descriptor).unwrap();

        assert_eq!(table.regions()["eu"], vec![1, 4]);
        assert_eq!(
            table.resolve(ShardingStrategy::Range, &ShardKey::Numeric(50)).unwrap(),
            4
        );
    }
}
