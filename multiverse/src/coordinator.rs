//! The public facade: query path with caching, transactions, cache
//! invalidation, health, and merged metrics.

use multiverse_cache::{
    CacheError, CacheOptions, CacheProvider, CacheStats, EvictionStrategy, FallbackCache,
    MemoryCache, RedisCache,
};
use multiverse_cache::{MemoryCacheOptions, RedisCacheOptions};
use multiverse_cluster::{
    ClusterError, ClusterHealth, ClusterManager, ClusterMetrics, ManagerOptions, WrappedConnection,
};
use multiverse_core::config::{ClusterConfigMap, ConfigError, ConfigStore, ValidationReport};
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::{Operation, QueryOptions, QueryOutput};
use multiverse_migrate::{MigrateError, MigrationManager};
use multiverse_txn::{TransactionManager, TxnError, TxnOptions, TxnStatement};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TxnError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrateError),
}

/// Which cache provider the coordinator builds.
#[derive(Debug, Clone, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis {
        url: String,
    },
    /// Redis primary with a memory fallback behind it.
    RedisWithFallback {
        url: String,
    },
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: CacheBackend,
    pub default_ttl: Duration,
    pub max_size: usize,
    pub strategy: EvictionStrategy,
    pub sync_on_reconnect: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            default_ttl: multiverse_cache::DEFAULT_TTL,
            max_size: multiverse_cache::DEFAULT_MAX_SIZE,
            strategy: EvictionStrategy::default(),
            sync_on_reconnect: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub config_path: Option<PathBuf>,
    pub migrations_path: PathBuf,
    pub cache: CacheSettings,
    pub manager: ManagerOptions,
    /// Poll the config file and apply changes while running.
    pub watch_config: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            migrations_path: PathBuf::from("./migrations"),
            cache: CacheSettings::default(),
            manager: ManagerOptions::default(),
            watch_config: false,
        }
    }
}

/// Merged view over cluster stats, cache, and transactions.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub uptime: Duration,
    pub clusters: HashMap<String, ClusterMetrics>,
    pub cache: Option<CacheStats>,
    pub transactions: multiverse_txn::TxnMetricsSnapshot,
    pub total_queries: u64,
    pub avg_response_time: f64,
    /// Failed queries as a percentage of all queries.
    pub error_rate: f64,
}

/// Exactly one criterion is honored, in field order.
#[derive(Debug, Clone, Default)]
pub struct InvalidateCriteria {
    pub schema: Option<String>,
    pub tags: Option<Vec<String>>,
    pub cluster: Option<String>,
    pub pattern: Option<String>,
}

/// Handle passed to [`Coordinator::with_transaction`] closures.
#[derive(Clone)]
pub struct TransactionScope {
    txns: Arc<TransactionManager>,
    id: Uuid,
}

impl TransactionScope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn execute(&self, stmt: TxnStatement) -> Result<QueryOutput, CoordinatorError> {
        Ok(self.txns.execute(self.id, stmt).await?)
    }
}

pub struct Coordinator {
    events: EventBus,
    config: Arc<ConfigStore>,
    manager: Arc<ClusterManager>,
    cache: RwLock<Option<Arc<dyn CacheProvider>>>,
    txns: Arc<TransactionManager>,
    migrations: MigrationManager,
    options: CoordinatorOptions,
    started_at: Instant,
    initialized: AtomicBool,
    reload_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// 32-bit string hash matching the classic `(h << 5) - h + c` scheme.
fn query_hash(input: &str) -> u32 {
    let mut hash: i32 = 0;
    for c in input.chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32);
    }
    hash as u32
}

fn to_base36(mut n: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

fn derive_cache_key(sql: &str, params: &[Value], schema: Option<&str>) -> String {
    let params_json = serde_json::to_string(params).unwrap_or_default();
    let input = format!("{sql}|{params_json}|{}", schema.unwrap_or(""));
    format!("query:{}", to_base36(query_hash(&input)))
}

async fn build_cache(
    settings: &CacheSettings,
    events: EventBus,
) -> Option<Arc<dyn CacheProvider>> {
    if !settings.enabled {
        return None;
    }
    let memory = || {
        Arc::new(MemoryCache::new(
            MemoryCacheOptions {
                max_size: settings.max_size,
                strategy: settings.strategy,
                default_ttl: settings.default_ttl,
            },
            events.clone(),
        )) as Arc<dyn CacheProvider>
    };

    match &settings.backend {
        CacheBackend::Memory => Some(memory()),
        CacheBackend::Redis { url } => {
            let options = RedisCacheOptions {
                default_ttl: settings.default_ttl,
                ..RedisCacheOptions::new(url.clone())
            };
            match RedisCache::connect(options).await {
                Ok(redis) => {
                    let provider: Arc<dyn CacheProvider> = Arc::new(redis);
                    Some(provider)
                }
                Err(e) => {
                    tracing::warn!("redis cache unavailable, degrading to memory: {}", e);
                    Some(memory())
                }
            }
        }
        CacheBackend::RedisWithFallback { url } => {
            let options = RedisCacheOptions {
                default_ttl: settings.default_ttl,
                ..RedisCacheOptions::new(url.clone())
            };
            match RedisCache::connect(options).await {
                Ok(redis) => {
                    let provider: Arc<dyn CacheProvider> = Arc::new(FallbackCache::new(
                        Arc::new(redis),
                        memory(),
                        settings.sync_on_reconnect,
                        events.clone(),
                    ));
                    Some(provider)
                }
                Err(e) => {
                    tracing::warn!("redis cache unavailable, running memory-only: {}", e);
                    Some(memory())
                }
            }
        }
    }
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        let events = EventBus::new();
        let config = Arc::new(ConfigStore::new(options.config_path.clone(), events.clone()));
        let manager = Arc::new(ClusterManager::new(events.clone(), options.manager.clone()));
        let txns = Arc::new(TransactionManager::new(manager.clone(), events.clone()));
        let migrations = MigrationManager::new(
            manager.clone(),
            options.migrations_path.clone(),
            events.clone(),
        );
        Self {
            events,
            config,
            manager,
            cache: RwLock::new(None),
            txns,
            migrations,
            options,
            started_at: Instant::now(),
            initialized: AtomicBool::new(false),
            reload_task: Mutex::new(None),
        }
    }

    fn ensure_initialized(&self) -> Result<(), CoordinatorError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoordinatorError::NotInitialized)
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn manager(&self) -> &Arc<ClusterManager> {
        &self.manager
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    fn cache_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        self.cache.read().unwrap().clone()
    }

    /// Validate configuration, bring up clusters, migrations, cache, and
    /// (optionally) the config watcher.
    pub async fn initialize(
        &self,
        config: Option<ClusterConfigMap>,
    ) -> Result<(), CoordinatorError> {
        let clusters = match config {
            Some(map) => {
                self.config.set_clusters(map.clone())?;
                map
            }
            None => self.config.load_config().await?,
        };

        self.manager.initialize(clusters).await?;
        self.migrations.initialize().await?;
        *self.cache.write().unwrap() =
            build_cache(&self.options.cache, self.events.clone()).await;

        if self.options.watch_config && self.config.path().is_some() {
            self.config.watch().await?;
            self.spawn_reload_task();
        }

        self.initialized.store(true, Ordering::Release);
        self.events.emit(Event::Initialized);
        tracing::info!("coordinator initialized");
        Ok(())
    }

    /// Apply config file changes to the cluster manager as the watcher
    /// reports them.
    fn spawn_reload_task(&self) {
        let mut task = self.reload_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut rx = self.events.subscribe();
        let config = self.config.clone();
        let manager = self.manager.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(Event::ConfigReloaded) => {
                            match config.load_config().await {
                                Ok(map) => {
                                    if let Err(e) = manager.update_config(map).await {
                                        tracing::error!("config update failed: {}", e);
                                    }
                                }
                                Err(e) => tracing::error!("config reload failed: {}", e),
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        *task = Some((cancel, handle));
    }

    /// Route and run one statement, with the read cache in front.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<QueryOutput, CoordinatorError> {
        self.ensure_initialized()?;

        let mut opts = opts.clone();
        let operation = opts.operation.unwrap_or_else(|| Operation::detect(sql));
        opts.operation = Some(operation);

        let cache = self.cache_provider();
        let use_cache = opts.cache && operation == Operation::Read && cache.is_some();
        let cache_key = if use_cache {
            opts.cache_key
                .clone()
                .unwrap_or_else(|| derive_cache_key(sql, params, opts.schema.as_deref()))
        } else {
            String::new()
        };

        if use_cache {
            let cache = cache.as_ref().expect("cache checked above");
            match cache.get(&cache_key).await {
                Ok(Some(value)) => {
                    self.events.emit(Event::CacheHit {
                        key: cache_key.clone(),
                    });
                    let output: QueryOutput =
                        serde_json::from_value(value).map_err(CacheError::from)?;
                    return Ok(output);
                }
                Ok(None) => {
                    self.events.emit(Event::CacheMiss {
                        key: cache_key.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!("cache lookup failed: {}", e);
                    self.events.emit(Event::CacheMiss {
                        key: cache_key.clone(),
                    });
                }
            }
        }

        match self.manager.execute_query(sql, params, &opts).await {
            Ok(execution) => {
                self.events.emit(Event::QueryExecuted {
                    sql: sql.to_string(),
                    params: params.to_vec(),
                    duration: execution.duration,
                    cluster_id: execution.cluster_id.clone(),
                });

                if use_cache {
                    let cache = cache.as_ref().expect("cache checked above");
                    let value = serde_json::to_value(&execution.output)
                        .map_err(CacheError::from)?;
                    let cache_opts = CacheOptions {
                        ttl: opts.cache_ttl,
                        tags: opts.schema.iter().cloned().collect(),
                        schema: opts.schema.clone(),
                        cluster: Some(execution.cluster_id.clone()),
                    };
                    if let Err(e) = cache.set(&cache_key, value, cache_opts).await {
                        tracing::warn!("cache store failed: {}", e);
                    }
                }
                Ok(execution.output)
            }
            Err(e) => {
                self.events.emit(Event::QueryError {
                    sql: sql.to_string(),
                    error: e.to_string(),
                    cluster_id: opts.cluster_id.clone(),
                });
                Err(e.into())
            }
        }
    }

    pub async fn get_connection(
        &self,
        opts: &QueryOptions,
    ) -> Result<WrappedConnection, CoordinatorError> {
        self.ensure_initialized()?;
        Ok(self.manager.get_connection(opts).await?)
    }

    pub async fn begin_transaction(
        &self,
        schemas: &[String],
        options: TxnOptions,
    ) -> Result<Uuid, CoordinatorError> {
        self.ensure_initialized()?;
        Ok(self.txns.begin(schemas, options).await?)
    }

    pub async fn execute_in_transaction(
        &self,
        id: Uuid,
        stmt: TxnStatement,
    ) -> Result<QueryOutput, CoordinatorError> {
        Ok(self.txns.execute(id, stmt).await?)
    }

    pub async fn commit_transaction(&self, id: Uuid) -> Result<(), CoordinatorError> {
        Ok(self.txns.commit(id).await?)
    }

    pub async fn rollback_transaction(&self, id: Uuid) -> Result<(), CoordinatorError> {
        Ok(self.txns.rollback(id).await?)
    }

    /// Open a transaction over `schemas`, run `f`, commit on success, and
    /// roll back (re-raising the error) on failure.
    pub async fn with_transaction<F, Fut, T>(
        &self,
        schemas: &[String],
        f: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, CoordinatorError>>,
    {
        self.ensure_initialized()?;
        let id = self.txns.begin(schemas, TxnOptions::default()).await?;
        let scope = TransactionScope {
            txns: self.txns.clone(),
            id,
        };
        match f(scope).await {
            Ok(value) => {
                self.txns.commit(id).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.txns.rollback(id).await {
                    tracing::warn!(txn_id = %id, "rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub async fn register_schema(
        &self,
        schema: &str,
        cluster_id: &str,
    ) -> Result<(), CoordinatorError> {
        self.ensure_initialized()?;
        self.manager.register_schema(schema, cluster_id).await?;
        self.config.map_schema_to_cluster(schema, cluster_id)?;
        Ok(())
    }

    /// Route to the single matching invalidation, in criterion order:
    /// schema, tags, cluster, pattern.
    pub async fn invalidate_cache(
        &self,
        criteria: &InvalidateCriteria,
    ) -> Result<u64, CoordinatorError> {
        self.ensure_initialized()?;
        let Some(cache) = self.cache_provider() else {
            return Ok(0);
        };
        let count = if let Some(schema) = &criteria.schema {
            cache.invalidate_by_schema(schema).await?
        } else if let Some(tags) = &criteria.tags {
            cache.invalidate_by_tags(tags).await?
        } else if let Some(cluster) = &criteria.cluster {
            cache.invalidate_by_cluster(cluster).await?
        } else if let Some(pattern) = &criteria.pattern {
            cache.invalidate_by_pattern(pattern).await?
        } else {
            0
        };
        Ok(count)
    }

    pub async fn get_metrics(&self) -> SystemMetrics {
        let clusters = self.manager.get_metrics().await;
        let cache = match self.cache_provider() {
            Some(cache) => Some(cache.stats().await),
            None => None,
        };

        let mut total_queries = 0u64;
        let mut total_errors = 0u64;
        let mut avg_sum = 0.0;
        let mut avg_count = 0u32;
        for metrics in clusters.values() {
            total_queries += metrics.stats.queries + metrics.stats.errors;
            total_errors += metrics.stats.errors;
            if metrics.stats.queries > 0 {
                avg_sum += metrics.stats.avg_response_time;
                avg_count += 1;
            }
        }

        SystemMetrics {
            uptime: self.started_at.elapsed(),
            clusters,
            cache,
            transactions: self.txns.metrics(),
            total_queries,
            avg_response_time: if avg_count == 0 {
                0.0
            } else {
                avg_sum / f64::from(avg_count)
            },
            error_rate: if total_queries == 0 {
                0.0
            } else {
                total_errors as f64 / total_queries as f64 * 100.0
            },
        }
    }

    /// Fresh probes for every cluster.
    pub async fn health_check(
        &self,
    ) -> Result<HashMap<String, ClusterHealth>, CoordinatorError> {
        self.ensure_initialized()?;
        let mut out = HashMap::new();
        for cluster_id in self.manager.cluster_ids().await {
            let health = self.manager.force_health_check(&cluster_id).await?;
            out.insert(cluster_id, health);
        }
        Ok(out)
    }

    pub fn validate_config(&self) -> ValidationReport {
        self.config.validate()
    }

    /// Roll back active transactions, stop background tasks, and drain
    /// every pool.
    pub async fn close(&self) {
        let task = self.reload_task.lock().unwrap().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }

        self.txns.close().await;
        self.migrations.close().await;
        if let Some(cache) = self.cache_provider() {
            cache.close().await;
        }
        self.manager.close().await;
        self.config.close().await;
        self.initialized.store(false, Ordering::Release);
        self.events.emit(Event::Closed);
        tracing::info!("coordinator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_hash_is_stable() {
        let a = query_hash("SELECT 1|[]|users");
        let b = query_hash("SELECT 1|[]|users");
        assert_eq!(a, b);
        assert_ne!(a, query_hash("SELECT 2|[]|users"));
    }

    #[test]
    fn test_base36_digits() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_derive_cache_key_varies_by_inputs() {
        let base = derive_cache_key("SELECT 1", &[], Some("users"));
        assert!(base.starts_with("query:"));
        assert_eq!(base, derive_cache_key("SELECT 1", &[], Some("users")));
        assert_ne!(base, derive_cache_key("SELECT 1", &[], Some("orders")));
        assert_ne!(
            base,
            derive_cache_key("SELECT 1", &[serde_json::json!(1)], Some("users"))
        );
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let err = coordinator
            .query("SELECT 1", &[], &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotInitialized));

        let err = coordinator
            .invalidate_cache(&InvalidateCriteria::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        // An empty document fails validation before any cluster work.
        let err = coordinator
            .initialize(Some(ClusterConfigMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }

    #[tokio::test]
    async fn test_metrics_on_fresh_coordinator() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let metrics = coordinator.get_metrics().await;
        assert_eq!(metrics.total_queries, 0);
        assert_eq!(metrics.error_rate, 0.0);
        assert!(metrics.clusters.is_empty());
        assert!(metrics.cache.is_none());
    }
}
