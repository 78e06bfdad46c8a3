//! Cluster registry, schema→cluster routing, and read/write splitting.
//!
//! The manager exclusively owns every [`ClusterPool`] and the
//! [`HealthChecker`]. Routing resolves a [`QueryOptions`] to one concrete
//! pool: explicit cluster first, then the schema map, then the first
//! active cluster; reads go to replicas unless consistency or read
//! preference forces the primary.

use crate::balancer::{BalancerOptions, LoadBalancer, ReplicaSnapshot};
use crate::error::ClusterError;
use crate::health::{ClusterHealth, HealthChecker};
use crate::pool::{ClusterPool, PoolInfo, PoolMetrics, PoolRole, WrappedConnection};
use futures::future::{join_all, BoxFuture};
use multiverse_core::config::{ClusterConfig, ClusterConfigMap};
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::{
    ClusterStatus, ConsistencyLevel, Operation, QueryOptions, QueryOutput, ReadPreference,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const PRIMARY_READY_TIMEOUT: Duration = Duration::from_secs(30);
const REPLICA_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-cluster running statistics.
pub(crate) struct ClusterStats {
    pub(crate) queries: AtomicU64,
    pub(crate) errors: AtomicU64,
    avg_response_ms: Mutex<f64>,
    pub(crate) active_connections: Arc<AtomicU64>,
}

impl ClusterStats {
    fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            avg_response_ms: Mutex::new(0.0),
            active_connections: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record_success(&self, duration: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let sample = duration.as_secs_f64() * 1000.0;
        let mut avg = self.avg_response_ms.lock().unwrap();
        *avg = if *avg == 0.0 { sample } else { (*avg + sample) / 2.0 };
    }

    fn record_failure(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ClusterStatsSnapshot {
        ClusterStatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_response_time: *self.avg_response_ms.lock().unwrap(),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterStatsSnapshot {
    pub queries: u64,
    pub errors: u64,
    pub avg_response_time: f64,
    pub active_connections: u64,
}

pub(crate) struct ClusterPools {
    pub(crate) primary: Arc<ClusterPool>,
    pub(crate) replicas: Vec<Arc<ClusterPool>>,
}

pub(crate) struct ClusterRuntime {
    pub(crate) id: String,
    pub(crate) config: ClusterConfig,
    status: std::sync::RwLock<ClusterStatus>,
    pub(crate) pools: RwLock<ClusterPools>,
    pub(crate) balancer: LoadBalancer,
    pub(crate) stats: ClusterStats,
}

impl ClusterRuntime {
    pub(crate) fn status(&self) -> ClusterStatus {
        *self.status.read().unwrap()
    }

    pub(crate) fn set_status(&self, status: ClusterStatus) {
        *self.status.write().unwrap() = status;
    }
}

pub(crate) struct ManagerShared {
    pub(crate) clusters: RwLock<BTreeMap<String, Arc<ClusterRuntime>>>,
    pub(crate) schema_map: RwLock<HashMap<String, String>>,
    pub(crate) events: EventBus,
}

/// Where a statement will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub cluster_id: String,
    pub pool_id: String,
    pub role: PoolRole,
    pub replica_index: Option<usize>,
}

/// One executed statement plus its attribution.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub output: QueryOutput,
    pub cluster_id: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct ClusterDescriptor {
    pub id: String,
    pub status: ClusterStatus,
    pub schemas: Vec<String>,
    pub replicas: usize,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct PoolReport {
    pub info: PoolInfo,
    pub metrics: PoolMetrics,
}

#[derive(Debug, Clone)]
pub struct ClusterMetrics {
    pub status: ClusterStatus,
    pub stats: ClusterStatsSnapshot,
    pub pools: Vec<PoolReport>,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub health_check_interval: Duration,
    pub primary_ready_timeout: Duration,
    pub replica_ready_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            primary_ready_timeout: PRIMARY_READY_TIMEOUT,
            replica_ready_timeout: REPLICA_READY_TIMEOUT,
        }
    }
}

/// Boxed future returned by transaction closures.
pub type TxnFuture<'a, T> = BoxFuture<'a, Result<T, ClusterError>>;

pub struct ClusterManager {
    shared: Arc<ManagerShared>,
    health: HealthChecker,
    options: ManagerOptions,
    initialized: AtomicBool,
}

impl ClusterManager {
    pub fn new(events: EventBus, options: ManagerOptions) -> Self {
        let shared = Arc::new(ManagerShared {
            clusters: RwLock::new(BTreeMap::new()),
            schema_map: RwLock::new(HashMap::new()),
            events,
        });
        let health = HealthChecker::new(shared.clone(), options.health_check_interval);
        Self {
            shared,
            health,
            options,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    fn ensure_initialized(&self) -> Result<(), ClusterError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClusterError::NotInitialized)
        }
    }

    /// Register every configured cluster and start health checking.
    pub async fn initialize(&self, config: ClusterConfigMap) -> Result<(), ClusterError> {
        for (cluster_id, cluster_config) in config {
            self.register_cluster(&cluster_id, cluster_config).await?;
        }
        self.health.start().await;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Apply a new configuration document: removed clusters are shut down,
    /// new ones registered, changed ones re-registered.
    pub async fn update_config(&self, config: ClusterConfigMap) -> Result<(), ClusterError> {
        self.ensure_initialized()?;

        let current: Vec<String> = self.shared.clusters.read().await.keys().cloned().collect();
        for cluster_id in &current {
            match config.get(cluster_id) {
                None => self.remove_cluster(cluster_id).await,
                Some(new_config) => {
                    let changed = {
                        let clusters = self.shared.clusters.read().await;
                        clusters
                            .get(cluster_id)
                            .map(|runtime| runtime.config != *new_config)
                            .unwrap_or(true)
                    };
                    if changed {
                        tracing::info!(cluster_id = %cluster_id, "cluster config changed, re-registering");
                        self.remove_cluster(cluster_id).await;
                        self.register_cluster(cluster_id, new_config.clone()).await?;
                    }
                }
            }
        }
        for (cluster_id, cluster_config) in config {
            if !current.contains(&cluster_id) {
                self.register_cluster(&cluster_id, cluster_config).await?;
            }
        }
        Ok(())
    }

    async fn remove_cluster(&self, cluster_id: &str) {
        let removed = self.shared.clusters.write().await.remove(cluster_id);
        if let Some(runtime) = removed {
            let pools = runtime.pools.read().await;
            pools.primary.close().await;
            for replica in &pools.replicas {
                replica.close().await;
            }
        }
        self.shared
            .schema_map
            .write()
            .await
            .retain(|_, owner| owner != cluster_id);
        self.health.remove_cluster(cluster_id).await;
        tracing::info!(cluster_id = %cluster_id, "cluster removed");
    }

    /// Bring up a cluster: the primary must become ready; replicas get a
    /// bounded wait and are dropped from rotation when they miss it.
    async fn register_cluster(
        &self,
        cluster_id: &str,
        config: ClusterConfig,
    ) -> Result<(), ClusterError> {
        let settings = config.connection_pool.clone().unwrap_or_default();
        let events = self.shared.events.clone();

        let primary = Arc::new(ClusterPool::connect(
            cluster_id,
            PoolRole::Primary,
            None,
            &config.primary,
            &settings,
            events.clone(),
        ));
        primary.wait_ready(self.options.primary_ready_timeout).await?;

        let candidates: Vec<Arc<ClusterPool>> = config
            .replicas
            .iter()
            .enumerate()
            .map(|(i, replica_config)| {
                Arc::new(ClusterPool::connect(
                    cluster_id,
                    PoolRole::Replica,
                    Some(i),
                    replica_config,
                    &settings,
                    events.clone(),
                ))
            })
            .collect();

        let waits = candidates
            .iter()
            .map(|pool| pool.wait_ready(self.options.replica_ready_timeout));
        let mut replicas = Vec::with_capacity(candidates.len());
        for (pool, result) in candidates.iter().cloned().zip(join_all(waits).await) {
            match result {
                Ok(()) => replicas.push(pool),
                Err(e) => {
                    tracing::warn!(
                        cluster_id = %cluster_id,
                        pool_id = pool.pool_id(),
                        "replica excluded from rotation: {}",
                        e
                    );
                    pool.close().await;
                }
            }
        }

        {
            let mut schema_map = self.shared.schema_map.write().await;
            for schema in &config.schemas {
                if let Some(owner) = schema_map.get(schema) {
                    if owner != cluster_id {
                        return Err(ClusterError::Config(
                            multiverse_core::ConfigError::SchemaAlreadyMapped {
                                schema: schema.clone(),
                                cluster_id: owner.clone(),
                            },
                        ));
                    }
                }
                schema_map.insert(schema.clone(), cluster_id.to_string());
            }
        }

        let strategy = config
            .load_balancing
            .as_ref()
            .map(|lb| lb.strategy)
            .unwrap_or(multiverse_core::types::BalanceStrategy::RoundRobin);

        let runtime = Arc::new(ClusterRuntime {
            id: cluster_id.to_string(),
            config,
            status: std::sync::RwLock::new(ClusterStatus::Active),
            pools: RwLock::new(ClusterPools { primary, replicas }),
            balancer: LoadBalancer::new(strategy),
            stats: ClusterStats::new(),
        });

        self.shared
            .clusters
            .write()
            .await
            .insert(cluster_id.to_string(), runtime);
        self.shared.events.emit(Event::ClusterRegistered {
            cluster_id: cluster_id.to_string(),
        });
        tracing::info!(cluster_id = %cluster_id, "cluster registered");
        Ok(())
    }

    async fn resolve_cluster(&self, opts: &QueryOptions) -> Result<Arc<ClusterRuntime>, ClusterError> {
        let clusters = self.shared.clusters.read().await;
        let explicit = opts.cluster_id.is_some();

        let cluster_id = if let Some(id) = &opts.cluster_id {
            id.clone()
        } else if let Some(schema) = &opts.schema {
            self.shared
                .schema_map
                .read()
                .await
                .get(schema)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownSchema(schema.clone()))?
        } else {
            clusters
                .iter()
                .find(|(_, runtime)| runtime.status() == ClusterStatus::Active)
                .map(|(id, _)| id.clone())
                .ok_or(ClusterError::NoActiveCluster)?
        };

        let runtime = clusters
            .get(&cluster_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownCluster(cluster_id.clone()))?;

        let status = runtime.status();
        if !explicit && status != ClusterStatus::Active {
            return Err(ClusterError::ClusterNotActive {
                cluster_id,
                status: status.as_str().to_string(),
            });
        }
        Ok(runtime)
    }

    async fn route(
        &self,
        opts: &QueryOptions,
    ) -> Result<(Arc<ClusterRuntime>, Arc<ClusterPool>, RouteDecision), ClusterError> {
        self.ensure_initialized()?;
        let runtime = self.resolve_cluster(opts).await?;

        let operation = opts.operation.unwrap_or(Operation::Read);
        let consistency = opts
            .consistency
            .or(runtime.config.consistency_level)
            .unwrap_or(ConsistencyLevel::Eventual);
        let read_preference = runtime
            .config
            .read_preference
            .unwrap_or(ReadPreference::Any);

        let pools = runtime.pools.read().await;
        let use_replica = !operation.is_write()
            && consistency != ConsistencyLevel::Strong
            && read_preference != ReadPreference::Primary
            && !pools.replicas.is_empty();

        let (pool, role, replica_index) = if use_replica {
            let snapshots: Vec<ReplicaSnapshot> = pools
                .replicas
                .iter()
                .map(|p| ReplicaSnapshot {
                    id: p.pool_id().to_string(),
                    active: p.metrics().active,
                    max_connections: p.max_connections(),
                    avg_response_time: p.avg_response_time(),
                })
                .collect();
            let lb = runtime.config.load_balancing.as_ref();
            let defaults = BalancerOptions::default();
            let balancer_options = BalancerOptions {
                weights: lb.and_then(|c| c.weights.as_ref()),
                health_threshold: lb
                    .and_then(|c| c.health_threshold)
                    .unwrap_or(defaults.health_threshold),
            };
            let index = runtime.balancer.select(&snapshots, &balancer_options)?;
            (pools.replicas[index].clone(), PoolRole::Replica, Some(index))
        } else {
            (pools.primary.clone(), PoolRole::Primary, None)
        };
        drop(pools);

        let decision = RouteDecision {
            cluster_id: runtime.id.clone(),
            pool_id: pool.pool_id().to_string(),
            role,
            replica_index,
        };
        Ok((runtime, pool, decision))
    }

    /// Resolve a statement's target without acquiring a connection.
    pub async fn resolve_route(&self, opts: &QueryOptions) -> Result<RouteDecision, ClusterError> {
        let (_, _, decision) = self.route(opts).await?;
        Ok(decision)
    }

    /// Route and check out a connection, wrapped with cluster metadata.
    pub async fn get_connection(
        &self,
        opts: &QueryOptions,
    ) -> Result<WrappedConnection, ClusterError> {
        let (runtime, pool, _) = self.route(opts).await?;
        let mut conn = pool.acquire().await?;
        conn.meta.schema = opts.schema.clone();
        conn.attach_gauge(runtime.stats.active_connections.clone());
        Ok(conn)
    }

    /// Route, execute, and account one statement. The connection is
    /// returned to its pool on every path.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<QueryExecution, ClusterError> {
        let (runtime, pool, decision) = self.route(opts).await?;
        let mut conn = pool.acquire().await?;
        conn.meta.schema = opts.schema.clone();
        conn.attach_gauge(runtime.stats.active_connections.clone());

        let started = Instant::now();
        let result = match opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, conn.query(sql, params)).await {
                Ok(inner) => inner,
                Err(_) => Err(ClusterError::Timeout(limit)),
            },
            None => conn.query(sql, params).await,
        };
        let duration = started.elapsed();
        pool.record_response_time(duration);

        match result {
            Ok(output) => {
                runtime.stats.record_success(duration);
                Ok(QueryExecution {
                    output,
                    cluster_id: decision.cluster_id,
                    duration,
                })
            }
            Err(e) => {
                runtime.stats.record_failure();
                Err(e)
            }
        }
    }

    /// Run `f` inside a transaction on the single cluster `opts` resolves
    /// to. The statement always targets the primary.
    pub async fn transaction<T, F>(&self, opts: &QueryOptions, f: F) -> Result<T, ClusterError>
    where
        F: for<'c> FnOnce(&'c mut WrappedConnection) -> TxnFuture<'c, T>,
    {
        let mut write_opts = opts.clone();
        write_opts.operation = Some(Operation::Write);
        let mut conn = self.get_connection(&write_opts).await?;

        conn.execute_raw("BEGIN").await?;
        match f(&mut conn).await {
            Ok(value) => {
                conn.execute_raw("COMMIT").await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_raw("ROLLBACK").await {
                    tracing::warn!(
                        cluster_id = %conn.meta.cluster_id,
                        "rollback after failed transaction also failed: {}",
                        rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Run the same transactional closure once per cluster covering
    /// `schemas`, each on its own primary connection. Side effects are
    /// duplicated per cluster on purpose; results come back in cluster
    /// resolution order.
    pub async fn per_cluster_transaction<T, F>(
        &self,
        schemas: &[String],
        f: F,
    ) -> Result<Vec<T>, ClusterError>
    where
        F: for<'c> Fn(&'c mut WrappedConnection) -> TxnFuture<'c, T>,
    {
        self.ensure_initialized()?;
        let mut cluster_ids = Vec::new();
        {
            let schema_map = self.shared.schema_map.read().await;
            for schema in schemas {
                let cluster_id = schema_map
                    .get(schema)
                    .cloned()
                    .ok_or_else(|| ClusterError::UnknownSchema(schema.clone()))?;
                if !cluster_ids.contains(&cluster_id) {
                    cluster_ids.push(cluster_id);
                }
            }
        }

        let mut results = Vec::with_capacity(cluster_ids.len());
        for cluster_id in cluster_ids {
            let opts = QueryOptions {
                cluster_id: Some(cluster_id),
                operation: Some(Operation::Write),
                ..Default::default()
            };
            let result = self.transaction(&opts, &f).await?;
            results.push(result);
        }
        Ok(results)
    }

    /// Swap the primary pool with the given replica. The old primary joins
    /// the replica tail.
    pub async fn force_failover(
        &self,
        cluster_id: &str,
        replica_index: usize,
    ) -> Result<(), ClusterError> {
        self.ensure_initialized()?;
        let runtime = {
            let clusters = self.shared.clusters.read().await;
            clusters
                .get(cluster_id)
                .cloned()
                .ok_or_else(|| ClusterError::UnknownCluster(cluster_id.to_string()))?
        };

        let mut pools = runtime.pools.write().await;
        if replica_index >= pools.replicas.len() {
            return Err(ClusterError::ReplicaOutOfRange {
                cluster_id: cluster_id.to_string(),
                index: replica_index,
            });
        }
        let promoted = pools.replicas.remove(replica_index);
        let demoted = std::mem::replace(&mut pools.primary, promoted);
        let new_primary = pools.primary.pool_id().to_string();
        let old_primary = demoted.pool_id().to_string();
        pools.replicas.push(demoted);
        drop(pools);

        tracing::warn!(
            cluster_id = %cluster_id,
            new_primary = %new_primary,
            old_primary = %old_primary,
            "forced failover"
        );
        self.shared.events.emit(Event::Failover {
            cluster_id: cluster_id.to_string(),
            new_primary,
            old_primary,
        });
        Ok(())
    }

    /// Map a schema to a cluster at runtime.
    pub async fn register_schema(
        &self,
        schema: &str,
        cluster_id: &str,
    ) -> Result<(), ClusterError> {
        self.ensure_initialized()?;
        if !self.shared.clusters.read().await.contains_key(cluster_id) {
            return Err(ClusterError::UnknownCluster(cluster_id.to_string()));
        }
        let mut schema_map = self.shared.schema_map.write().await;
        if let Some(owner) = schema_map.get(schema) {
            if owner != cluster_id {
                return Err(ClusterError::Config(
                    multiverse_core::ConfigError::SchemaAlreadyMapped {
                        schema: schema.to_string(),
                        cluster_id: owner.clone(),
                    },
                ));
            }
        }
        schema_map.insert(schema.to_string(), cluster_id.to_string());
        drop(schema_map);
        self.shared.events.emit(Event::SchemaRegistered {
            schema: schema.to_string(),
            cluster_id: cluster_id.to_string(),
        });
        Ok(())
    }

    pub async fn schema_cluster(&self, schema: &str) -> Option<String> {
        self.shared.schema_map.read().await.get(schema).cloned()
    }

    pub async fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self.shared.schema_map.read().await.keys().cloned().collect();
        schemas.sort();
        schemas
    }

    pub async fn cluster_ids(&self) -> Vec<String> {
        self.shared.clusters.read().await.keys().cloned().collect()
    }

    pub async fn get_clusters(&self) -> Vec<ClusterDescriptor> {
        let clusters = self.shared.clusters.read().await;
        let mut out = Vec::with_capacity(clusters.len());
        for (id, runtime) in clusters.iter() {
            let pools = runtime.pools.read().await;
            out.push(ClusterDescriptor {
                id: id.clone(),
                status: runtime.status(),
                schemas: runtime.config.schemas.clone(),
                replicas: pools.replicas.len(),
                priority: runtime.config.priority.unwrap_or(0),
            });
        }
        out
    }

    pub async fn get_stats(&self) -> HashMap<String, ClusterStatsSnapshot> {
        let clusters = self.shared.clusters.read().await;
        clusters
            .iter()
            .map(|(id, runtime)| (id.clone(), runtime.stats.snapshot()))
            .collect()
    }

    pub async fn get_metrics(&self) -> HashMap<String, ClusterMetrics> {
        let clusters = self.shared.clusters.read().await;
        let mut out = HashMap::with_capacity(clusters.len());
        for (id, runtime) in clusters.iter() {
            let pools = runtime.pools.read().await;
            let mut reports = vec![PoolReport {
                info: pools.primary.info(),
                metrics: pools.primary.metrics(),
            }];
            reports.extend(pools.replicas.iter().map(|p| PoolReport {
                info: p.info(),
                metrics: p.metrics(),
            }));
            out.insert(
                id.clone(),
                ClusterMetrics {
                    status: runtime.status(),
                    stats: runtime.stats.snapshot(),
                    pools: reports,
                },
            );
        }
        out
    }

    pub async fn get_cluster_health(&self, cluster_id: &str) -> Option<ClusterHealth> {
        self.health.get_health(cluster_id).await
    }

    pub async fn all_cluster_health(&self) -> HashMap<String, ClusterHealth> {
        self.health.all_health().await
    }

    pub async fn force_health_check(
        &self,
        cluster_id: &str,
    ) -> Result<ClusterHealth, ClusterError> {
        self.ensure_initialized()?;
        self.health
            .force_check(cluster_id)
            .await
            .ok_or_else(|| ClusterError::UnknownCluster(cluster_id.to_string()))
    }

    /// Stop health checking, close every pool, and forget all clusters.
    pub async fn close(&self) {
        self.health.stop().await;
        let clusters: Vec<Arc<ClusterRuntime>> =
            self.shared.clusters.write().await.values().cloned().collect();
        for runtime in clusters {
            let pools = runtime.pools.read().await;
            pools.primary.close().await;
            for replica in &pools.replicas {
                replica.close().await;
            }
        }
        self.shared.clusters.write().await.clear();
        self.shared.schema_map.write().await.clear();
        self.initialized.store(false, Ordering::Release);
        tracing::info!("cluster manager closed");
    }

    #[cfg(test)]
    pub(crate) async fn insert_runtime_for_tests(
        &self,
        cluster_id: &str,
        config: ClusterConfig,
        primary: Arc<ClusterPool>,
        replicas: Vec<Arc<ClusterPool>>,
    ) {
        let strategy = config
            .load_balancing
            .as_ref()
            .map(|lb| lb.strategy)
            .unwrap_or(multiverse_core::types::BalanceStrategy::RoundRobin);
        let runtime = Arc::new(ClusterRuntime {
            id: cluster_id.to_string(),
            config: config.clone(),
            status: std::sync::RwLock::new(ClusterStatus::Active),
            pools: RwLock::new(ClusterPools { primary, replicas }),
            balancer: LoadBalancer::new(strategy),
            stats: ClusterStats::new(),
        });
        self.shared
            .clusters
            .write()
            .await
            .insert(cluster_id.to_string(), runtime);
        let mut schema_map = self.shared.schema_map.write().await;
        for schema in &config.schemas {
            schema_map.insert(schema.clone(), cluster_id.to_string());
        }
        self.initialized.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ManagerShared> {
        &self.shared
    }
}
