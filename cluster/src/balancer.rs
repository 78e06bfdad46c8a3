//! Replica selection.
//!
//! The balancer is a pure function of the replica snapshots plus an
//! internal round-robin cursor; it holds no reference to pools and can be
//! driven entirely from metrics.

use crate::error::ClusterError;
use multiverse_core::types::BalanceStrategy;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

const DEFAULT_HEALTH_THRESHOLD: f64 = 50.0;

/// Point-in-time view of one replica pool.
#[derive(Debug, Clone)]
pub struct ReplicaSnapshot {
    pub id: String,
    pub active: u64,
    pub max_connections: u32,
    pub avg_response_time: f64,
}

#[derive(Debug, Clone)]
pub struct BalancerOptions<'a> {
    pub weights: Option<&'a HashMap<String, f64>>,
    pub health_threshold: f64,
}

impl Default for BalancerOptions<'_> {
    fn default() -> Self {
        Self {
            weights: None,
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalancerStats {
    pub strategy: BalanceStrategy,
    pub selections: u64,
}

pub struct LoadBalancer {
    strategy: RwLock<BalanceStrategy>,
    cursor: AtomicUsize,
    selections: AtomicU64,
}

/// Weight for a replica: by id, by `replica_<index>` fallback, else 1.
fn weight_for(weights: &HashMap<String, f64>, replica: &ReplicaSnapshot, index: usize) -> f64 {
    weights
        .get(&replica.id)
        .or_else(|| weights.get(&format!("replica_{index}")))
        .copied()
        .unwrap_or(1.0)
}

fn health_score(replica: &ReplicaSnapshot) -> f64 {
    let capacity = replica.max_connections.max(1) as f64;
    let load_penalty = (replica.active as f64 / capacity) * 30.0;
    let latency_penalty = (replica.avg_response_time / 10.0).min(50.0);
    100.0 - load_penalty - latency_penalty
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            cursor: AtomicUsize::new(0),
            selections: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        *self.strategy.read().unwrap()
    }

    pub fn set_strategy(&self, strategy: BalanceStrategy) {
        *self.strategy.write().unwrap() = strategy;
    }

    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            strategy: self.strategy(),
            selections: self.selections.load(Ordering::Relaxed),
        }
    }

    /// Pick a replica index. An empty list is an error; a single replica
    /// short-circuits without consulting the strategy.
    pub fn select(
        &self,
        replicas: &[ReplicaSnapshot],
        options: &BalancerOptions<'_>,
    ) -> Result<usize, ClusterError> {
        if replicas.is_empty() {
            return Err(ClusterError::NoReplicas);
        }
        if replicas.len() == 1 {
            return Ok(0);
        }
        self.selections.fetch_add(1, Ordering::Relaxed);

        let index = match self.strategy() {
            BalanceStrategy::RoundRobin => self.round_robin(replicas.len()),
            BalanceStrategy::Weighted => match options.weights {
                Some(weights) => self.weighted(replicas, weights),
                None => self.round_robin(replicas.len()),
            },
            BalanceStrategy::LeastConnections => Self::min_by(replicas, |r| r.active as f64),
            BalanceStrategy::ResponseTime => Self::min_by(replicas, |r| r.avg_response_time),
            BalanceStrategy::HealthAware => Self::health_aware(replicas, options),
        };
        Ok(index)
    }

    fn round_robin(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    fn weighted(&self, replicas: &[ReplicaSnapshot], weights: &HashMap<String, f64>) -> usize {
        let total: f64 = replicas
            .iter()
            .enumerate()
            .map(|(i, r)| weight_for(weights, r, i))
            .sum();
        if total <= 0.0 {
            return self.round_robin(replicas.len());
        }
        let mut bucket = rand::thread_rng().gen_range(0.0..total);
        for (i, replica) in replicas.iter().enumerate() {
            bucket -= weight_for(weights, replica, i);
            if bucket < 0.0 {
                return i;
            }
        }
        replicas.len() - 1
    }

    fn min_by(replicas: &[ReplicaSnapshot], key: impl Fn(&ReplicaSnapshot) -> f64) -> usize {
        let mut best = 0;
        for (i, replica) in replicas.iter().enumerate().skip(1) {
            if key(replica) < key(&replicas[best]) {
                best = i;
            }
        }
        best
    }

    fn health_aware(replicas: &[ReplicaSnapshot], options: &BalancerOptions<'_>) -> usize {
        let mut best = 0;
        let mut best_score = f64::MIN;
        for (i, replica) in replicas.iter().enumerate() {
            let mut score = health_score(replica);
            if let Some(weights) = options.weights {
                score *= weight_for(weights, replica, i);
            }
            if score < options.health_threshold {
                score *= 0.1;
            }
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: &str, active: u64, avg_ms: f64) -> ReplicaSnapshot {
        ReplicaSnapshot {
            id: id.to_string(),
            active,
            max_connections: 10,
            avg_response_time: avg_ms,
        }
    }

    #[test]
    fn test_empty_replica_list_is_error() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        assert!(matches!(
            lb.select(&[], &BalancerOptions::default()),
            Err(ClusterError::NoReplicas)
        ));
    }

    #[test]
    fn test_single_replica_short_circuits() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let replicas = vec![replica("r0", 0, 0.0)];
        for _ in 0..5 {
            assert_eq!(lb.select(&replicas, &BalancerOptions::default()).unwrap(), 0);
        }
        // The cursor never moved.
        assert_eq!(lb.cursor.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_round_robin_is_balanced() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let replicas = vec![
            replica("r0", 0, 0.0),
            replica("r1", 0, 0.0),
            replica("r2", 0, 0.0),
        ];
        let mut counts = [0u32; 3];
        for _ in 0..30 {
            counts[lb.select(&replicas, &BalancerOptions::default()).unwrap()] += 1;
        }
        assert_eq!(counts, [10, 10, 10]);
    }

    #[test]
    fn test_round_robin_order() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        let replicas = vec![replica("r0", 0, 0.0), replica("r1", 0, 0.0)];
        let picks: Vec<usize> = (0..6)
            .map(|_| lb.select(&replicas, &BalancerOptions::default()).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_weighted_without_weights_falls_back_to_round_robin() {
        let lb = LoadBalancer::new(BalanceStrategy::Weighted);
        let replicas = vec![replica("r0", 0, 0.0), replica("r1", 0, 0.0)];
        let picks: Vec<usize> = (0..4)
            .map(|_| lb.select(&replicas, &BalancerOptions::default()).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_weighted_respects_zero_weight() {
        let lb = LoadBalancer::new(BalanceStrategy::Weighted);
        let replicas = vec![replica("r0", 0, 0.0), replica("r1", 0, 0.0)];
        let mut weights = HashMap::new();
        weights.insert("r0".to_string(), 0.0);
        weights.insert("r1".to_string(), 5.0);
        let options = BalancerOptions {
            weights: Some(&weights),
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(lb.select(&replicas, &options).unwrap(), 1);
        }
    }

    #[test]
    fn test_weighted_uses_replica_index_fallback() {
        let lb = LoadBalancer::new(BalanceStrategy::Weighted);
        let replicas = vec![replica("r0", 0, 0.0), replica("r1", 0, 0.0)];
        let mut weights = HashMap::new();
        weights.insert("replica_0".to_string(), 0.0);
        weights.insert("replica_1".to_string(), 3.0);
        let options = BalancerOptions {
            weights: Some(&weights),
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(lb.select(&replicas, &options).unwrap(), 1);
        }
    }

    #[test]
    fn test_least_connections_with_tie_break() {
        let lb = LoadBalancer::new(BalanceStrategy::LeastConnections);
        let replicas = vec![
            replica("r0", 5, 0.0),
            replica("r1", 2, 0.0),
            replica("r2", 2, 0.0),
        ];
        // r1 and r2 tie; the earlier index wins.
        assert_eq!(lb.select(&replicas, &BalancerOptions::default()).unwrap(), 1);
    }

    #[test]
    fn test_response_time_picks_fastest() {
        let lb = LoadBalancer::new(BalanceStrategy::ResponseTime);
        let replicas = vec![
            replica("r0", 0, 30.0),
            replica("r1", 0, 5.0),
            replica("r2", 0, 12.0),
        ];
        assert_eq!(lb.select(&replicas, &BalancerOptions::default()).unwrap(), 1);
    }

    #[test]
    fn test_health_aware_prefers_unloaded_fast_replica() {
        let lb = LoadBalancer::new(BalanceStrategy::HealthAware);
        let replicas = vec![
            ReplicaSnapshot {
                id: "r0".to_string(),
                active: 9,
                max_connections: 10,
                avg_response_time: 400.0,
            },
            ReplicaSnapshot {
                id: "r1".to_string(),
                active: 1,
                max_connections: 10,
                avg_response_time: 5.0,
            },
        ];
        assert_eq!(lb.select(&replicas, &BalancerOptions::default()).unwrap(), 1);
    }

    #[test]
    fn test_health_aware_weight_multiplier() {
        let lb = LoadBalancer::new(BalanceStrategy::HealthAware);
        // Identical replicas; a larger weight must decide the pick.
        let replicas = vec![replica("r0", 1, 10.0), replica("r1", 1, 10.0)];
        let mut weights = HashMap::new();
        weights.insert("r0".to_string(), 1.0);
        weights.insert("r1".to_string(), 2.0);
        let options = BalancerOptions {
            weights: Some(&weights),
            ..Default::default()
        };
        assert_eq!(lb.select(&replicas, &options).unwrap(), 1);
    }

    #[test]
    fn test_health_score_formula() {
        let r = ReplicaSnapshot {
            id: "r".to_string(),
            active: 5,
            max_connections: 10,
            avg_response_time: 100.0,
        };
        // 100 - (5/10)*30 - min(100/10, 50) = 100 - 15 - 10 = 75
        assert!((health_score(&r) - 75.0).abs() < f64::EPSILON);

        let slow = ReplicaSnapshot {
            id: "r".to_string(),
            active: 0,
            max_connections: 10,
            avg_response_time: 10_000.0,
        };
        // Latency penalty caps at 50.
        assert!((health_score(&slow) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_strategy_and_stats() {
        let lb = LoadBalancer::new(BalanceStrategy::RoundRobin);
        lb.set_strategy(BalanceStrategy::ResponseTime);
        assert_eq!(lb.strategy(), BalanceStrategy::ResponseTime);

        let replicas = vec![replica("r0", 0, 1.0), replica("r1", 0, 2.0)];
        lb.select(&replicas, &BalancerOptions::default()).unwrap();
        assert_eq!(lb.stats().selections, 1);
    }
}
