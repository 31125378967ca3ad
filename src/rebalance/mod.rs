pub mod migration;
pub mod rebalancer;

pub use migration::{MigrationRecord, MigrationState, Migrator};
pub use rebalancer::{PassOutcome, RebalanceEvent, RebalanceEventKind, Rebalancer};

use crate::core::ShardId;
use crate::metrics::{MetricsSnapshot, ShardMetrics};
use serde::Serialize;

/// One planned transfer: `rows` entities from `source` to `destination`, each
/// travelling with its child rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub source: ShardId,
    pub destination: ShardId,
    pub rows: u64,
}

/// Pairs overloaded shards with underloaded ones and sizes each move.
///
/// A shard is overloaded above `mean * (1 + threshold)` and underloaded below
/// `mean * (1 - threshold)`. The most loaded source is paired with the least
/// loaded destination, and so on one-to-one; surplus shards on either side
/// are left alone. Each move carries half the entity difference, rounded
/// down; child rows count towards load but not towards the move size.
pub fn plan_moves(snapshot: &MetricsSnapshot, rebalance_threshold: f64) -> Vec<PlannedMove> {
    let mean = snapshot.mean_load();
    let upper = mean * (1.0 + rebalance_threshold);
    let lower = mean * (1.0 - rebalance_threshold);

    let mut overloaded: Vec<&ShardMetrics> =
        snapshot.shards.iter().filter(|m| m.load > upper).collect();
    let mut underloaded: Vec<&ShardMetrics> =
        snapshot.shards.iter().filter(|m| m.load < lower).collect();

    overloaded.sort_by(|a, b| b.load.total_cmp(&a.load).then(a.shard_id.cmp(&b.shard_id)));
    underloaded.sort_by(|a, b| a.load.total_cmp(&b.load).then(a.shard_id.cmp(&b.shard_id)));

    overloaded
        .into_iter()
        .zip(underloaded)
        .filter_map(|(source, destination)| {
            let rows = source.entity_count.checked_sub(destination.entity_count)? / 2;
            (rows > 0).then_some(PlannedMove {
                source: source.shard_id,
                destination: destination.shard_id,
                rows,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::compute_load;
    use chrono::Utc;

    fn shard(shard_id: ShardId, row_count: u64) -> ShardMetrics {
        ShardMetrics {
            shard_id,
            collected_at: Utc::now(),
            query_count: 0,
            avg_response_ms: None,
            active_connections: 0,
            row_count,
            entity_count: row_count,
            load: compute_load(row_count, 0, 1_000_000, 10_000),
        }
    }

    #[test]
    fn test_plan_moves_half_the_difference() {
        let snapshot = MetricsSnapshot::new(vec![
            shard(0, 900_000),
            shard(1, 100_000),
            shard(2, 500_000),
        ]);
        let moves = plan_moves(&snapshot, 0.2);
        assert_eq!(
            moves,
            vec![PlannedMove {
                source: 0,
                destination: 1,
                rows: 400_000
            }]
        );
    }

    #[test]
    fn test_plan_pairs_one_to_one() {
        let snapshot = MetricsSnapshot::new(vec![
            shard(0, 800_000),
            shard(1, 900_000),
            shard(2, 100_000),
            shard(3, 500_000),
            shard(4, 500_000),
        ]);
        // Mean 0.56: shards 0 and 1 are overloaded, only shard 2 is underloaded
        let moves = plan_moves(&snapshot, 0.2);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].source, 1);
        assert_eq!(moves[0].destination, 2);
        assert_eq!(moves[0].rows, 400_000);
    }

    #[test]
    fn test_balanced_cluster_needs_no_moves() {
        let snapshot = MetricsSnapshot::new(vec![shard(0, 500_000), shard(1, 520_000)]);
        assert!(plan_moves(&snapshot, 0.2).is_empty());
        assert!(plan_moves(&MetricsSnapshot::default(), 0.2).is_empty());
    }

    #[test]
    fn test_query_load_without_row_difference_is_skipped() {
        let mut busy = shard(0, 100);
        busy.query_count = 9_000;
        busy.load = compute_load(100, 9_000, 1_000_000, 10_000);
        let idle = shard(1, 100);

        let snapshot = MetricsSnapshot::new(vec![busy, idle]);
        assert!(plan_moves(&snapshot, 0.2).is_empty());
    }
}
