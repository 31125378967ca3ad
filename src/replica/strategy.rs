use super::health::ReplicaState;
use crate::core::{DbError, ReplicaId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a read picks one of the active replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    /// Smooth weighted round robin over configured weights
    WeightedRoundRobin,
    /// Lowest cumulative query count
    LeastConnections,
    /// Lowest last measured response time
    ResponseTime,
    /// Lowest last measured replication lag
    LeastLag,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::WeightedRoundRobin => "weighted-round-robin",
            Self::LeastConnections => "least-connections",
            Self::ResponseTime => "response-time",
            Self::LeastLag => "least-lag",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            "least-connections" => Ok(Self::LeastConnections),
            "response-time" => Ok(Self::ResponseTime),
            "least-lag" => Ok(Self::LeastLag),
            other => Err(DbError::Configuration(format!(
                "unknown replica selection strategy '{}'",
                other
            ))),
        }
    }
}

/// Picks a replica from the active list.
///
/// Round robin uses one shared atomic counter, so concurrent callers each get
/// a distinct slot. Weighted round robin keeps per-replica current weights
/// under a mutex.
#[derive(Debug, Default)]
pub(crate) struct Selector {
    counter: AtomicUsize,
    current_weights: Mutex<HashMap<ReplicaId, i64>>,
}

impl Selector {
    pub(crate) fn select(
        &self,
        strategy: SelectionStrategy,
        candidates: &[Arc<ReplicaState>],
    ) -> Result<Option<Arc<ReplicaState>>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let slot = self.counter.fetch_add(1, Ordering::SeqCst);
                candidates.get(slot % candidates.len())
            }
            SelectionStrategy::WeightedRoundRobin => {
                return self.select_weighted(candidates).map(Some);
            }
            SelectionStrategy::LeastConnections => {
                min_by(candidates, |replica| replica.query_count() as f64)
            }
            SelectionStrategy::ResponseTime => min_by(candidates, |replica| {
                replica
                    .response_time()
                    .unwrap_or(Duration::ZERO)
                    .as_secs_f64()
            }),
            SelectionStrategy::LeastLag => min_by(candidates, |replica| replica.lag_secs()),
        };

        Ok(chosen.cloned())
    }

    fn select_weighted(&self, candidates: &[Arc<ReplicaState>]) -> Result<Arc<ReplicaState>> {
        let mut current = self.current_weights.lock()?;
        current.retain(|id, _| candidates.iter().any(|c| c.id() == id));

        let total: i64 = candidates
            .iter()
            .map(|c| i64::from(c.descriptor.weight.max(1)))
            .sum();

        let mut best: Option<(usize, i64)> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let weight = current.entry(candidate.descriptor.id.clone()).or_insert(0);
            *weight += i64::from(candidate.descriptor.weight.max(1));
            if best.is_none_or(|(_, best_weight)| *weight > best_weight) {
                best = Some((idx, *weight));
            }
        }

        // candidates is non-empty, so best is set
        let (idx, _) = best.unwrap_or((0, 0));
        let chosen = &candidates[idx];
        if let Some(weight) = current.get_mut(chosen.id()) {
            *weight -= total;
        }
        Ok(chosen.clone())
    }
}

/// First candidate with the smallest key
fn min_by(
    candidates: &[Arc<ReplicaState>],
    key: impl Fn(&ReplicaState) -> f64,
) -> Option<&Arc<ReplicaState>> {
    let mut best: Option<(&Arc<ReplicaState>, f64)> = None;
    for candidate in candidates {
        let value = key(candidate.as_ref());
        if best.is_none_or(|(_, best_value)| value < best_value) {
            best = Some((candidate, value));
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::connection::memory::MemoryConnector;
    use crate::connection::pool::ConnectionPool;
    use crate::replica::health::ReplicaDescriptor;

    async fn replicas(weights: &[u32]) -> Vec<Arc<ReplicaState>> {
        let connector = Arc::new(MemoryConnector::new());
        let mut out = Vec::new();
        for (idx, weight) in weights.iter().enumerate() {
            let host = format!("replica-{}", idx);
            let config = ConnectionConfig::new("app", "pw").host(&host).min_connections(0);
            let pool = ConnectionPool::new(host.clone(), config.clone(), connector.clone())
                .await
                .unwrap();
            let descriptor = ReplicaDescriptor::new(host, config).with_weight(*weight);
            out.push(Arc::new(ReplicaState::new(descriptor, pool)));
        }
        out
    }

    fn pick(selector: &Selector, strategy: SelectionStrategy, list: &[Arc<ReplicaState>]) -> String {
        selector
            .select(strategy, list)
            .unwrap()
            .unwrap()
            .id()
            .to_string()
    }

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!(
            "least_lag".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LeastLag
        );
        assert_eq!(
            "Weighted-Round-Robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::WeightedRoundRobin
        );
        assert!("random".parse::<SelectionStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_smooth_weighted_distribution() {
        let list = replicas(&[5, 1, 1]).await;
        let selector = Selector::default();

        let picks: Vec<String> = (0..7)
            .map(|_| pick(&selector, SelectionStrategy::WeightedRoundRobin, &list))
            .collect();
        assert_eq!(
            picks,
            vec![
                "replica-0", "replica-0", "replica-1", "replica-0", "replica-2", "replica-0",
                "replica-0"
            ]
        );
    }

    #[tokio::test]
    async fn test_equal_weights_cycle_like_round_robin() {
        let list = replicas(&[1, 1, 1]).await;
        let selector = Selector::default();

        let picks: Vec<String> = (0..6)
            .map(|_| pick(&selector, SelectionStrategy::WeightedRoundRobin, &list))
            .collect();
        assert_eq!(
            picks,
            vec!["replica-0", "replica-1", "replica-2", "replica-0", "replica-1", "replica-2"]
        );
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle_replica() {
        let list = replicas(&[1, 1]).await;
        list[0].record_success(Duration::from_millis(1));
        let selector = Selector::default();
        assert_eq!(
            pick(&selector, SelectionStrategy::LeastConnections, &list),
            "replica-1"
        );
    }

    #[tokio::test]
    async fn test_unknown_response_time_counts_as_zero() {
        let list = replicas(&[1, 1]).await;
        list[0].record_success(Duration::from_millis(40));
        let selector = Selector::default();
        assert_eq!(
            pick(&selector, SelectionStrategy::ResponseTime, &list),
            "replica-1"
        );
    }

    #[test]
    fn test_empty_candidates() {
        let selector = Selector::default();
        assert!(selector.select(SelectionStrategy::RoundRobin, &[]).unwrap().is_none());
    }
}
