//! Periodic liveness probes across every pool of every cluster.
//!
//! A probe checks out and releases a connection from the primary and each
//! replica, running `SELECT 1`. Transitions emit `clusterDown`,
//! `clusterRecovered` (with measured downtime), and `clusterUp` in that
//! temporal order, and flip the cluster's routing status.

use crate::manager::{ClusterRuntime, ManagerShared};
use crate::pool::ClusterPool;
use chrono::{DateTime, Utc};
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::ClusterStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Snapshot of one cluster's probed health.
#[derive(Debug, Clone)]
pub struct ClusterHealth {
    pub cluster_id: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub response_time: Duration,
    pub failure_count: u32,
    pub uptime: Duration,
    pub connections: ConnectionCounts,
    pub queries: QueryStats,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionCounts {
    pub active: u64,
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct QueryStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_response_time: f64,
}

struct HealthEntry {
    health: ClusterHealth,
    healthy_since: Option<Instant>,
}

struct HealthShared {
    manager: Arc<ManagerShared>,
    entries: RwLock<HashMap<String, HealthEntry>>,
    events: EventBus,
    interval: Duration,
}

pub struct HealthChecker {
    shared: Arc<HealthShared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

async fn probe_pools(pools: &[Arc<ClusterPool>]) -> Option<String> {
    for pool in pools {
        if let Err(e) = pool.query("SELECT 1", &[]).await {
            return Some(format!("{}: {e}", pool.pool_id()));
        }
    }
    None
}

impl HealthChecker {
    pub(crate) fn new(manager: Arc<ManagerShared>, interval: Duration) -> Self {
        let events = manager.events.clone();
        Self {
            shared: Arc::new(HealthShared {
                manager,
                entries: RwLock::new(HashMap::new()),
                events,
                interval,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic task. The first pass runs immediately.
    pub async fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        Self::check_all(&shared).await;
                    }
                }
            }
        });
        *task = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let taken = self.task.lock().unwrap().take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    async fn check_all(shared: &Arc<HealthShared>) {
        let clusters: Vec<(String, Arc<ClusterRuntime>)> = shared
            .manager
            .clusters
            .read()
            .await
            .iter()
            .map(|(id, runtime)| (id.clone(), runtime.clone()))
            .collect();
        for (cluster_id, runtime) in clusters {
            Self::check_cluster(shared, &cluster_id, &runtime).await;
        }
    }

    async fn check_cluster(
        shared: &Arc<HealthShared>,
        cluster_id: &str,
        runtime: &Arc<ClusterRuntime>,
    ) -> ClusterHealth {
        let started = Instant::now();
        let pools: Vec<Arc<ClusterPool>> = {
            let guard = runtime.pools.read().await;
            let mut pools = vec![guard.primary.clone()];
            pools.extend(guard.replicas.iter().cloned());
            pools
        };

        let error = probe_pools(&pools).await;
        let response_time = started.elapsed();
        let healthy = error.is_none();

        let mut connections = ConnectionCounts::default();
        for pool in &pools {
            let m = pool.metrics();
            connections.active += m.active;
            connections.idle += m.idle;
            connections.total += m.total;
        }

        let stats = runtime.stats.snapshot();
        let queries = QueryStats {
            total: stats.queries + stats.errors,
            successful: stats.queries,
            failed: stats.errors,
            avg_response_time: stats.avg_response_time,
        };

        let now = Utc::now();
        let mut entries = shared.entries.write().await;
        let previous = entries.get(cluster_id);
        let was_healthy = previous.map(|e| e.health.healthy).unwrap_or(true);
        let previous_last_check = previous.map(|e| e.health.last_check);
        let failure_count = if healthy {
            0
        } else {
            previous.map(|e| e.health.failure_count).unwrap_or(0) + 1
        };
        let healthy_since = if healthy {
            previous
                .and_then(|e| e.healthy_since)
                .or(Some(Instant::now()))
        } else {
            None
        };

        let health = ClusterHealth {
            cluster_id: cluster_id.to_string(),
            healthy,
            last_check: now,
            response_time,
            failure_count,
            uptime: healthy_since.map(|t| t.elapsed()).unwrap_or_default(),
            connections,
            queries,
            error: error.clone(),
        };
        entries.insert(
            cluster_id.to_string(),
            HealthEntry {
                health: health.clone(),
                healthy_since,
            },
        );
        drop(entries);

        if was_healthy && !healthy {
            let reason = error.unwrap_or_else(|| "health probe failed".to_string());
            tracing::warn!(cluster_id = %cluster_id, reason = %reason, "cluster down");
            if runtime.status() == ClusterStatus::Active {
                runtime.set_status(ClusterStatus::Down);
            }
            shared.events.emit(Event::ClusterDown {
                cluster_id: cluster_id.to_string(),
                reason,
            });
        } else if !was_healthy && healthy {
            let downtime = previous_last_check
                .and_then(|t| (now - t).to_std().ok())
                .unwrap_or_default();
            tracing::info!(
                cluster_id = %cluster_id,
                downtime_ms = downtime.as_millis() as u64,
                "cluster recovered"
            );
            if runtime.status() == ClusterStatus::Down {
                runtime.set_status(ClusterStatus::Active);
            }
            shared.events.emit(Event::ClusterRecovered {
                cluster_id: cluster_id.to_string(),
                downtime,
            });
            shared.events.emit(Event::ClusterUp {
                cluster_id: cluster_id.to_string(),
            });
        }

        health
    }

    /// Probe one cluster right now.
    pub async fn force_check(&self, cluster_id: &str) -> Option<ClusterHealth> {
        let runtime = self.shared.manager.clusters.read().await.get(cluster_id).cloned()?;
        Some(Self::check_cluster(&self.shared, cluster_id, &runtime).await)
    }

    pub async fn get_health(&self, cluster_id: &str) -> Option<ClusterHealth> {
        self.shared
            .entries
            .read()
            .await
            .get(cluster_id)
            .map(|e| e.health.clone())
    }

    pub async fn all_health(&self) -> HashMap<String, ClusterHealth> {
        self.shared
            .entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.health.clone()))
            .collect()
    }

    pub async fn remove_cluster(&self, cluster_id: &str) {
        self.shared.entries.write().await.remove(cluster_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ClusterManager, ManagerOptions};
    use crate::pool::PoolRole;
    use multiverse_core::config::{ClusterConfig, ConnectionConfig, PoolSettings};

    fn unreachable() -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: 54999,
            database: "app".to_string(),
            user: "app".to_string(),
            password: "secret".to_string(),
            max_connections: Some(2),
            min_connections: None,
            ssl: None,
            connection_timeout_millis: Some(300),
            idle_timeout_millis: None,
            search_path: None,
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            schemas: vec!["users".to_string()],
            priority: None,
            read_preference: None,
            consistency_level: None,
            primary: unreachable(),
            replicas: vec![],
            sharding: None,
            load_balancing: None,
            connection_pool: None,
            shard_key: None,
            cache_strategy: None,
        }
    }

    async fn manager_with_unreachable_cluster() -> ClusterManager {
        let manager = ClusterManager::new(EventBus::new(), ManagerOptions::default());
        let pool = Arc::new(ClusterPool::connect(
            "alpha",
            PoolRole::Primary,
            None,
            &unreachable(),
            &PoolSettings::default(),
            EventBus::new(),
        ));
        pool.mark_ready_for_tests();
        manager
            .insert_runtime_for_tests("alpha", config(), pool, vec![])
            .await;
        manager
    }

    #[tokio::test]
    async fn test_failing_probe_marks_cluster_down() {
        let manager = manager_with_unreachable_cluster().await;
        let mut rx = manager.events().subscribe();

        let health = manager.force_health_check("alpha").await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.failure_count, 1);
        assert!(health.error.is_some());
        assert_eq!(health.uptime, Duration::ZERO);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "clusterDown");

        // The cluster left the routing rotation.
        let descriptors = manager.get_clusters().await;
        assert_eq!(descriptors[0].status, ClusterStatus::Down);
    }

    #[tokio::test]
    async fn test_failure_count_accumulates() {
        let manager = manager_with_unreachable_cluster().await;
        manager.force_health_check("alpha").await.unwrap();
        let health = manager.force_health_check("alpha").await.unwrap();
        assert_eq!(health.failure_count, 2);
    }

    #[tokio::test]
    async fn test_down_event_fires_once_per_transition() {
        let manager = manager_with_unreachable_cluster().await;
        let mut rx = manager.events().subscribe();
        manager.force_health_check("alpha").await.unwrap();
        manager.force_health_check("alpha").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "clusterDown");
        // A second failing probe must not emit another clusterDown.
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_unknown_cluster_force_check() {
        let manager = manager_with_unreachable_cluster().await;
        assert!(manager.force_health_check("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_get_health_returns_last_snapshot() {
        let manager = manager_with_unreachable_cluster().await;
        assert!(manager.get_cluster_health("alpha").await.is_none());
        manager.force_health_check("alpha").await.unwrap();
        let health = manager.get_cluster_health("alpha").await.unwrap();
        assert_eq!(health.cluster_id, "alpha");
        assert!(!health.healthy);
    }
}
