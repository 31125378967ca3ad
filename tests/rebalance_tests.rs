use shardplane::config::{MigrationSchema, RebalanceSettings};
use shardplane::rebalance::RebalanceEventKind;
use shardplane::{
    ConnectionConfig, MemoryConnector, MemoryDatabase, MetricsCollector, MigrationState,
    PassOutcome, PlannedMove, Rebalancer, ResolverTable, ShardDescriptor, ShardId, ShardKey,
    ShardRegistry, ShardResolver, ShardingStrategy, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn shard_config(id: ShardId) -> ConnectionConfig {
    ConnectionConfig::new("app", "pw")
        .host(&format!("shard-{}", id))
        .min_connections(0)
}

struct Cluster {
    registry: Arc<ShardRegistry>,
    resolver: Arc<ShardResolver>,
    collector: Arc<MetricsCollector>,
    rebalancer: Rebalancer,
    dbs: BTreeMap<ShardId, MemoryDatabase>,
}

impl Cluster {
    fn db(&self, shard_id: ShardId) -> &MemoryDatabase {
        &self.dbs[&shard_id]
    }

    fn rows(&self, shard_id: ShardId) -> usize {
        self.db(shard_id).row_count("entities")
    }
}

async fn cluster(rows: &[i64], active: usize, settings: RebalanceSettings) -> Cluster {
    cluster_with_invoices(rows, 0, active, settings).await
}

/// One database per entry in `rows`, the first `active` of them registered live
/// and the rest parked as standby. Every entity owns `invoices` child rows.
async fn cluster_with_invoices(
    rows: &[i64],
    invoices: i64,
    active: usize,
    settings: RebalanceSettings,
) -> Cluster {
    let connector = Arc::new(MemoryConnector::new());
    let registry = Arc::new(ShardRegistry::new(connector.clone()));
    let mut dbs = BTreeMap::new();

    for (idx, count) in rows.iter().enumerate() {
        let id = idx as ShardId;
        let db = connector.add_database(&shard_config(id));
        db.create_table("entities", &["id", "payload"]).unwrap();
        db.create_table("invoices", &["id", "entity_id"]).unwrap();
        for n in 0..*count {
            let entity_id = i64::from(id) * 1_000_000 + n;
            db.insert_row(
                "entities",
                vec![Value::Integer(entity_id), Value::Text(format!("e{}", n))],
            )
            .unwrap();
            for k in 0..invoices {
                db.insert_row(
                    "invoices",
                    vec![Value::Integer(entity_id * 10 + k), Value::Integer(entity_id)],
                )
                .unwrap();
            }
        }

        let descriptor = ShardDescriptor::new(id, shard_config(id));
        if idx < active {
            registry.register_shard(descriptor).await.unwrap();
        } else {
            registry.add_standby(descriptor).unwrap();
        }
        dbs.insert(id, db);
    }

    let mut table = ResolverTable::new(0);
    table.set_active_shards(registry.shard_ids().unwrap());
    let resolver = Arc::new(ShardResolver::new(ShardingStrategy::Modulo, table));
    let schema = MigrationSchema::new("entities", "id").with_child("invoices", "entity_id");
    let collector = Arc::new(MetricsCollector::new(
        registry.clone(),
        resolver.clone(),
        settings.clone(),
        schema.clone(),
    ));
    let rebalancer = Rebalancer::new(
        registry.clone(),
        resolver.clone(),
        collector.clone(),
        settings,
        schema,
    );

    Cluster {
        registry,
        resolver,
        collector,
        rebalancer,
        dbs,
    }
}

fn settings(max_rows: u64, batch_size: usize) -> RebalanceSettings {
    RebalanceSettings {
        max_rows,
        migration_batch_size: batch_size,
        ..RebalanceSettings::default()
    }
}

#[tokio::test]
async fn test_rebalance_moves_half_the_difference() {
    // Loads 0.9 and 0.1 around a mean of 0.5
    let cluster = cluster(&[900, 100], 2, settings(1_000, 100)).await;

    let snapshot = cluster.collector.collect().await.unwrap();
    assert_eq!(
        cluster.rebalancer.plan(&snapshot),
        vec![PlannedMove {
            source: 0,
            destination: 1,
            rows: 400
        }]
    );

    let outcome = cluster.rebalancer.run_pass().await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::Rebalanced {
            moves: 1,
            rows_moved: 400
        }
    );
    assert_eq!(cluster.rows(0), 500);
    assert_eq!(cluster.rows(1), 500);

    let history = cluster.rebalancer.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, RebalanceEventKind::Migration);
    assert_eq!(history[0].shards, vec![0, 1]);

    // Balanced now
    let snapshot = cluster.collector.collect().await.unwrap();
    assert!(cluster.rebalancer.plan(&snapshot).is_empty());
}

#[tokio::test]
async fn test_second_pass_sees_moved_rows() {
    let cluster = cluster(&[900, 100], 2, settings(1_000, 100)).await;
    cluster.collector.collect().await.unwrap();

    // No metrics tick between the two passes
    let first = cluster.rebalancer.run_pass().await.unwrap();
    let second = cluster.rebalancer.run_pass().await.unwrap();

    assert_eq!(
        first,
        PassOutcome::Rebalanced {
            moves: 1,
            rows_moved: 400
        }
    );
    assert_eq!(second, PassOutcome::NoChange);
    assert_eq!(cluster.rows(0), 500);
    assert_eq!(cluster.rows(1), 500);
    assert_eq!(cluster.collector.history().unwrap().len(), 2);
}

#[tokio::test]
async fn test_moves_are_sized_in_entities_not_child_rows() {
    // 300 entities with 600 invoices against 100 entities with 200 invoices
    let cluster = cluster_with_invoices(&[300, 100], 2, 2, settings(1_000, 50)).await;

    let snapshot = cluster.collector.collect().await.unwrap();
    assert_eq!(snapshot.get(0).unwrap().row_count, 900);
    assert_eq!(snapshot.get(0).unwrap().entity_count, 300);
    assert_eq!(
        cluster.rebalancer.plan(&snapshot),
        vec![PlannedMove {
            source: 0,
            destination: 1,
            rows: 100
        }]
    );

    let outcome = cluster.rebalancer.run_pass().await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::Rebalanced {
            moves: 1,
            rows_moved: 100
        }
    );
    for shard_id in [0, 1] {
        assert_eq!(cluster.rows(shard_id), 200);
        assert_eq!(cluster.db(shard_id).row_count("invoices"), 400);
    }

    assert_eq!(cluster.rebalancer.run_pass().await.unwrap(), PassOutcome::NoChange);
}

#[tokio::test]
async fn test_scale_up_activates_standby_and_fills_it() {
    let cluster = cluster(&[85, 85, 85, 85, 0], 4, settings(100, 500)).await;
    cluster.collector.collect().await.unwrap();

    let outcome = cluster.rebalancer.run_pass().await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::ScaledUp {
            shard_id: 4,
            rows_moved: 42
        }
    );

    assert_eq!(cluster.registry.shard_ids().unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(cluster.registry.standby().unwrap().is_empty());
    assert_eq!(cluster.rows(0), 43);
    assert_eq!(cluster.rows(4), 42);
    assert_eq!(
        (1..4).map(|id| cluster.rows(id)).collect::<Vec<_>>(),
        vec![85, 85, 85]
    );

    // New keys can land on the new shard
    assert_eq!(cluster.resolver.resolve(&ShardKey::Numeric(9)).unwrap(), 4);

    let kinds: Vec<_> = cluster
        .rebalancer
        .history()
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![RebalanceEventKind::Migration, RebalanceEventKind::ScaleUp]
    );
}

#[tokio::test]
async fn test_overload_without_standby_falls_back_to_rebalance() {
    let cluster = cluster(&[95, 75], 2, settings(100, 500)).await;
    cluster.collector.collect().await.unwrap();

    // Mean 0.85 is over the load threshold, but nothing is left to activate
    let outcome = cluster.rebalancer.run_pass().await.unwrap();
    assert_eq!(outcome, PassOutcome::NoChange);
    assert_eq!(cluster.registry.shard_count().unwrap(), 2);
}

#[tokio::test]
async fn test_scale_down_drains_least_loaded_shards() {
    let mut settings = settings(1_000, 4);
    settings.min_shard_count = 1;
    let cluster = cluster(&[10, 5, 20], 3, settings).await;
    cluster.collector.collect().await.unwrap();

    let outcome = cluster.rebalancer.run_pass().await.unwrap();
    assert_eq!(outcome, PassOutcome::ScaledDown { removed: vec![1, 0] });

    assert_eq!(cluster.registry.shard_ids().unwrap(), vec![2]);
    assert_eq!(cluster.rows(2), 35);
    assert_eq!(cluster.rows(0), 0);
    assert_eq!(cluster.rows(1), 0);

    let mut standby: Vec<ShardId> = cluster
        .registry
        .standby()
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    standby.sort_unstable();
    assert_eq!(standby, vec![0, 1]);

    for key in 0..10 {
        assert_eq!(cluster.resolver.resolve(&ShardKey::Numeric(key)).unwrap(), 2);
    }
}

#[tokio::test]
async fn test_failed_source_commit_is_reconciled() {
    let cluster = cluster(&[900, 100, 500], 3, settings(1_000, 100)).await;
    cluster.collector.collect().await.unwrap();
    cluster.db(0).fail_next_commits(1);

    assert!(cluster.rebalancer.run_pass().await.is_err());
    assert!(!cluster.rebalancer.is_running());

    // The first batch reached the destination but was never removed from the source
    assert_eq!(cluster.rows(0), 900);
    assert_eq!(cluster.rows(1), 200);
    let migrations = cluster.rebalancer.migrations().unwrap();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].state, MigrationState::NeedsReconciliation);
    assert_eq!(migrations[0].pending_source_deletes(), 100);

    assert_eq!(cluster.rebalancer.reconcile().await.unwrap(), 100);
    assert_eq!(cluster.rows(0), 800);
    assert_eq!(cluster.rows(1), 200);
    assert_eq!(
        cluster.rebalancer.migrations().unwrap()[0].state,
        MigrationState::Completed
    );
    // Nothing left to do
    assert_eq!(cluster.rebalancer.reconcile().await.unwrap(), 0);

    let kinds: Vec<_> = cluster
        .rebalancer
        .history()
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![RebalanceEventKind::PassFailed, RebalanceEventKind::Reconciled]
    );
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_passes_run_once() {
    let cluster = cluster(&[900, 100, 500], 3, settings(1_000, 100)).await;
    cluster.collector.collect().await.unwrap();
    cluster.db(0).set_latency(Some(Duration::from_millis(5)));

    let (first, second) = tokio::join!(
        cluster.rebalancer.run_pass(),
        cluster.rebalancer.run_pass()
    );
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|outcome| matches!(outcome, PassOutcome::AlreadyRunning));

    assert_eq!(
        outcomes,
        vec![
            PassOutcome::Rebalanced {
                moves: 1,
                rows_moved: 400
            },
            PassOutcome::AlreadyRunning,
        ]
    );
    assert!(!cluster.rebalancer.is_running());
    assert_eq!(cluster.rows(0), 500);
}
