pub mod collector;

pub use collector::MetricsCollector;

use crate::core::ShardId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Load as a fraction of capacity: the larger of the row and query ratios
pub fn compute_load(row_count: u64, query_count: u64, max_rows: u64, max_queries: u64) -> f64 {
    let ratio = |value: u64, max: u64| {
        if max == 0 {
            0.0
        } else {
            value as f64 / max as f64
        }
    };
    ratio(row_count, max_rows).max(ratio(query_count, max_queries))
}

/// Measurements for one shard over one collection interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardMetrics {
    pub shard_id: ShardId,
    pub collected_at: DateTime<Utc>,
    /// Queries routed to the shard during the interval
    pub query_count: u64,
    pub avg_response_ms: Option<f64>,
    pub active_connections: usize,
    /// Rows across the entity table and its child tables
    pub row_count: u64,
    /// Rows in the entity table alone; moves are sized in these
    pub entity_count: u64,
    pub load: f64,
}

/// Immutable result of one collection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub collected_at: DateTime<Utc>,
    pub shards: Vec<ShardMetrics>,
}

impl MetricsSnapshot {
    pub fn new(shards: Vec<ShardMetrics>) -> Self {
        Self {
            collected_at: Utc::now(),
            shards,
        }
    }

    pub fn get(&self, shard_id: ShardId) -> Option<&ShardMetrics> {
        self.shards.iter().find(|m| m.shard_id == shard_id)
    }

    pub fn mean_load(&self) -> f64 {
        if self.shards.is_empty() {
            return 0.0;
        }
        self.shards.iter().map(|m| m.load).sum::<f64>() / self.shards.len() as f64
    }

    /// Summary with overloaded/underloaded classification around the mean
    pub fn summarize(&self, rebalance_threshold: f64) -> LoadSummary {
        let mean = self.mean_load();
        let upper = mean * (1.0 + rebalance_threshold);
        let lower = mean * (1.0 - rebalance_threshold);

        let loads = self.shards.iter().map(|m| m.load);
        LoadSummary {
            shard_count: self.shards.len(),
            mean_load: mean,
            min_load: loads.clone().reduce(f64::min).unwrap_or(0.0),
            max_load: loads.reduce(f64::max).unwrap_or(0.0),
            overloaded: self
                .shards
                .iter()
                .filter(|m| m.load > upper)
                .map(|m| m.shard_id)
                .collect(),
            underloaded: self
                .shards
                .iter()
                .filter(|m| m.load < lower)
                .map(|m| m.shard_id)
                .collect(),
            collected_at: Some(self.collected_at),
        }
    }
}

/// Aggregated load across the live shards
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub shard_count: usize,
    pub mean_load: f64,
    pub min_load: f64,
    pub max_load: f64,
    pub overloaded: Vec<ShardId>,
    pub underloaded: Vec<ShardId>,
    pub collected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(shard_id: ShardId, row_count: u64, load: f64) -> ShardMetrics {
        ShardMetrics {
            shard_id,
            collected_at: Utc::now(),
            query_count: 0,
            avg_response_ms: None,
            active_connections: 0,
            row_count,
            entity_count: row_count,
            load,
        }
    }

    #[test]
    fn test_compute_load_takes_larger_ratio() {
        assert_eq!(compute_load(900_000, 0, 1_000_000, 10_000), 0.9);
        assert_eq!(compute_load(100_000, 5_000, 1_000_000, 10_000), 0.5);
        assert_eq!(compute_load(10, 10, 0, 0), 0.0);
    }

    #[test]
    fn test_summary_classifies_around_mean() {
        let snapshot = MetricsSnapshot::new(vec![
            metrics(0, 900_000, 0.9),
            metrics(1, 100_000, 0.1),
            metrics(2, 500_000, 0.5),
        ]);
        let summary = snapshot.summarize(0.2);

        assert_eq!(summary.shard_count, 3);
        assert!((summary.mean_load - 0.5).abs() < 1e-9);
        assert_eq!(summary.overloaded, vec![0]);
        assert_eq!(summary.underloaded, vec![1]);
        assert_eq!(summary.min_load, 0.1);
        assert_eq!(summary.max_load, 0.9);
    }

    #[test]
    fn test_empty_snapshot() {
        let summary = MetricsSnapshot::default().summarize(0.2);
        assert_eq!(summary.shard_count, 0);
        assert_eq!(summary.mean_load, 0.0);
        assert!(summary.overloaded.is_empty());
    }
}
