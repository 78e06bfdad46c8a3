//! Cluster configuration document: parsing, validation, persistence, and
//! file watching.
//!
//! The document is a JSON mapping of `clusterId` to [`ClusterConfig`].
//! Unknown keys are rejected at parse time; semantic rules (connection
//! fields, sharding shape, schema uniqueness) are checked by
//! [`ConfigStore::validate`] / [`validate_clusters`].

use crate::events::{Event, EventBus};
use crate::types::{BalanceStrategy, CacheStrategy, ConsistencyLevel, ReadPreference};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("FS error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No config path set")]
    NoPath,

    #[error("Schema '{schema}' is already mapped to cluster '{cluster_id}'")]
    SchemaAlreadyMapped { schema: String, cluster_id: String },

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),
}

/// A single PostgreSQL endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_path: Option<String>,
}

/// `true`/`false`, or certificate options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslConfig {
    Enabled(bool),
    Options(SslOptions),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SslOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_unauthorized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardingStrategy {
    Hash,
    Range,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShardingConfig {
    pub strategy: ShardingStrategy,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadBalancingConfig {
    pub strategy: BalanceStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_threshold: Option<f64>,
}

/// Pool sizing applied to every pool of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_connections: Option<bool>,
}

/// One logical cluster: a primary, its replicas, and the schemas it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_preference: Option<ReadPreference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_level: Option<ConsistencyLevel>,
    pub primary: ConnectionConfig,
    #[serde(default)]
    pub replicas: Vec<ConnectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pool: Option<PoolSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_strategy: Option<CacheStrategy>,
}

/// The whole configuration document.
pub type ClusterConfigMap = BTreeMap<String, ClusterConfig>;

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn validate_connection(
    cluster_id: &str,
    label: &str,
    conn: &ConnectionConfig,
    errors: &mut Vec<String>,
) {
    if conn.host.is_empty() {
        errors.push(format!(
            "cluster '{cluster_id}': {label} connection is missing host"
        ));
    }
    if conn.port == 0 {
        errors.push(format!(
            "cluster '{cluster_id}': {label} connection port must be in [1, 65535]"
        ));
    }
    if conn.database.is_empty() {
        errors.push(format!(
            "cluster '{cluster_id}': {label} connection is missing database"
        ));
    }
    if conn.user.is_empty() {
        errors.push(format!(
            "cluster '{cluster_id}': {label} connection is missing user"
        ));
    }
    if conn.password.is_empty() {
        errors.push(format!(
            "cluster '{cluster_id}': {label} connection is missing password"
        ));
    }
    if let Some(0) = conn.max_connections {
        errors.push(format!(
            "cluster '{cluster_id}': {label} maxConnections must be >= 1"
        ));
    }
}

/// Semantic validation of a configuration document.
pub fn validate_clusters(clusters: &ClusterConfigMap) -> ValidationReport {
    let mut report = ValidationReport::default();

    if clusters.is_empty() {
        report
            .errors
            .push("at least one cluster must be configured".to_string());
    }

    let mut schema_owner: HashMap<&str, &str> = HashMap::new();

    for (cluster_id, cluster) in clusters {
        validate_connection(cluster_id, "primary", &cluster.primary, &mut report.errors);
        for (i, replica) in cluster.replicas.iter().enumerate() {
            validate_connection(
                cluster_id,
                &format!("replica {i}"),
                replica,
                &mut report.errors,
            );
        }

        if cluster.schemas.is_empty() {
            report
                .warnings
                .push(format!("cluster '{cluster_id}' serves no schemas"));
        }

        for schema in &cluster.schemas {
            match schema_owner.get(schema.as_str()) {
                Some(owner) if *owner != cluster_id.as_str() => {
                    report.errors.push(format!(
                        "schema '{schema}' is mapped to both '{owner}' and '{cluster_id}'"
                    ));
                }
                _ => {
                    schema_owner.insert(schema, cluster_id);
                }
            }
        }

        if let Some(sharding) = &cluster.sharding {
            if sharding.key.is_empty() {
                report
                    .errors
                    .push(format!("cluster '{cluster_id}': sharding key must not be empty"));
            }
            let field_ok = match sharding.strategy {
                ShardingStrategy::Hash => sharding.partitions.is_some(),
                ShardingStrategy::Range => sharding.ranges.is_some(),
                ShardingStrategy::Directory => sharding.directory.is_some(),
            };
            if !field_ok {
                report.errors.push(format!(
                    "cluster '{cluster_id}': sharding strategy requires its matching field \
                     (hash: partitions, range: ranges, directory: directory)"
                ));
            }
        }

        if let Some(lb) = &cluster.load_balancing {
            if lb.strategy == BalanceStrategy::Weighted
                && lb.weights.as_ref().map_or(true, |w| w.is_empty())
            {
                report.errors.push(format!(
                    "cluster '{cluster_id}': weighted load balancing requires weights"
                ));
            }
        }
    }

    report.valid = report.errors.is_empty();
    report
}

/// Loads, saves, validates, and watches the cluster configuration file,
/// and keeps the schema↔cluster assignments it implies.
pub struct ConfigStore {
    path: Option<PathBuf>,
    clusters: RwLock<ClusterConfigMap>,
    events: EventBus,
    watcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConfigStore {
    pub fn new(path: Option<PathBuf>, events: EventBus) -> Self {
        Self {
            path,
            clusters: RwLock::new(BTreeMap::new()),
            events,
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read and parse the config file, validate it, and make it current.
    pub async fn load_config(&self) -> Result<ClusterConfigMap, ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoPath)?;
        let content = tokio::fs::read_to_string(path).await?;
        let clusters: ClusterConfigMap = serde_json::from_str(&content)?;

        let report = validate_clusters(&clusters);
        if !report.valid {
            return Err(ConfigError::Invalid(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "config warning");
        }

        *self.clusters.write().unwrap() = clusters.clone();
        tracing::info!(clusters = clusters.len(), path = %path.display(), "configuration loaded");
        Ok(clusters)
    }

    /// Replace the current document without touching disk.
    pub fn set_clusters(&self, clusters: ClusterConfigMap) -> Result<(), ConfigError> {
        let report = validate_clusters(&clusters);
        if !report.valid {
            return Err(ConfigError::Invalid(report.errors.join("; ")));
        }
        *self.clusters.write().unwrap() = clusters;
        Ok(())
    }

    /// Serialize the current document (or `clusters` if given) to disk.
    pub async fn save_config(
        &self,
        clusters: Option<&ClusterConfigMap>,
        path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let target = path
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or(ConfigError::NoPath)?;
        let json = match clusters {
            Some(map) => serde_json::to_string_pretty(map)?,
            None => serde_json::to_string_pretty(&*self.clusters.read().unwrap())?,
        };
        tokio::fs::write(&target, json).await?;
        tracing::info!(path = %target.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> ValidationReport {
        validate_clusters(&self.clusters.read().unwrap())
    }

    pub fn clusters(&self) -> ClusterConfigMap {
        self.clusters.read().unwrap().clone()
    }

    /// All schemas currently served, in document order.
    pub fn schemas(&self) -> Vec<String> {
        let clusters = self.clusters.read().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for cluster in clusters.values() {
            for schema in &cluster.schemas {
                if seen.insert(schema.clone()) {
                    out.push(schema.clone());
                }
            }
        }
        out
    }

    pub fn get_cluster_for_schema(&self, schema: &str) -> Option<String> {
        let clusters = self.clusters.read().unwrap();
        clusters
            .iter()
            .find(|(_, c)| c.schemas.iter().any(|s| s == schema))
            .map(|(id, _)| id.clone())
    }

    /// Add `schema` to `cluster_id`'s served set. A schema may belong to at
    /// most one cluster.
    pub fn map_schema_to_cluster(&self, schema: &str, cluster_id: &str) -> Result<(), ConfigError> {
        let mut clusters = self.clusters.write().unwrap();
        if let Some((owner, _)) = clusters
            .iter()
            .find(|(_, c)| c.schemas.iter().any(|s| s == schema))
        {
            if owner != cluster_id {
                return Err(ConfigError::SchemaAlreadyMapped {
                    schema: schema.to_string(),
                    cluster_id: owner.clone(),
                });
            }
            return Ok(());
        }
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| ConfigError::UnknownCluster(cluster_id.to_string()))?;
        cluster.schemas.push(schema.to_string());
        Ok(())
    }

    pub fn unmap_schema_from_cluster(
        &self,
        schema: &str,
        cluster_id: &str,
    ) -> Result<(), ConfigError> {
        let mut clusters = self.clusters.write().unwrap();
        let cluster = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| ConfigError::UnknownCluster(cluster_id.to_string()))?;
        cluster.schemas.retain(|s| s != schema);
        Ok(())
    }

    /// Poll the config file every second and emit [`Event::ConfigReloaded`]
    /// when its content changes. The caller decides what to reload.
    pub async fn watch(&self) -> Result<(), ConfigError> {
        let path = self.path.clone().ok_or(ConfigError::NoPath)?;
        let mut watcher = self.watcher.lock().unwrap();
        if watcher.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let events = self.events.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut last = tokio::fs::read(&path).await.ok();
            let mut interval = tokio::time::interval(WATCH_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match tokio::fs::read(&path).await {
                            Ok(content) => {
                                if last.as_deref() != Some(content.as_slice()) {
                                    if last.is_some() {
                                        tracing::info!(path = %path.display(), "config file changed");
                                        events.emit(Event::ConfigReloaded);
                                    }
                                    last = Some(content);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(path = %path.display(), "config watch read failed: {}", e);
                            }
                        }
                    }
                }
            }
        });

        *watcher = Some((cancel, handle));
        Ok(())
    }

    pub async fn stop_watching(&self) {
        let taken = self.watcher.lock().unwrap().take();
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    pub async fn close(&self) {
        self.stop_watching().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(host: &str) -> ConnectionConfig {
        ConnectionConfig {
            host: host.to_string(),
            port: 5432,
            database: "app".to_string(),
            user: "app".to_string(),
            password: "secret".to_string(),
            max_connections: None,
            min_connections: None,
            ssl: None,
            connection_timeout_millis: None,
            idle_timeout_millis: None,
            search_path: None,
        }
    }

    fn cluster(schemas: &[&str]) -> ClusterConfig {
        ClusterConfig {
            schemas: schemas.iter().map(|s| s.to_string()).collect(),
            priority: None,
            read_preference: None,
            consistency_level: None,
            primary: conn("db1"),
            replicas: vec![],
            sharding: None,
            load_balancing: None,
            connection_pool: None,
            shard_key: None,
            cache_strategy: None,
        }
    }

    #[test]
    fn test_validate_empty_document() {
        let report = validate_clusters(&BTreeMap::new());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_validate_accepts_minimal_cluster() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), cluster(&["users"]));
        let report = validate_clusters(&map);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validate_missing_connection_fields() {
        let mut bad = cluster(&["users"]);
        bad.primary.host = String::new();
        bad.primary.password = String::new();
        bad.primary.port = 0;
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), bad);
        let report = validate_clusters(&map);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn test_validate_empty_schemas_is_warning() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), cluster(&[]));
        let report = validate_clusters(&map);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_validate_duplicate_schema_is_error() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), cluster(&["users"]));
        map.insert("b".to_string(), cluster(&["users"]));
        let report = validate_clusters(&map);
        assert!(!report.valid);
        assert!(report.errors[0].contains("users"));
    }

    #[test]
    fn test_validate_sharding_field_must_match_strategy() {
        let mut c = cluster(&["users"]);
        c.sharding = Some(ShardingConfig {
            strategy: ShardingStrategy::Hash,
            key: "id".to_string(),
            partitions: None,
            ranges: None,
            directory: None,
        });
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), c);
        let report = validate_clusters(&map);
        assert!(!report.valid);

        let mut c = cluster(&["users"]);
        c.sharding = Some(ShardingConfig {
            strategy: ShardingStrategy::Hash,
            key: "id".to_string(),
            partitions: Some(4),
            ranges: None,
            directory: None,
        });
        map.insert("a".to_string(), c);
        assert!(validate_clusters(&map).valid);
    }

    #[test]
    fn test_validate_weighted_requires_weights() {
        let mut c = cluster(&["users"]);
        c.load_balancing = Some(LoadBalancingConfig {
            strategy: BalanceStrategy::Weighted,
            weights: None,
            health_threshold: None,
        });
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), c);
        assert!(!validate_clusters(&map).valid);
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        let json = r#"{
            "a": {
                "schemas": ["users"],
                "primary": {"host": "db", "port": 5432, "database": "d", "user": "u", "password": "p"},
                "mystery": true
            }
        }"#;
        let parsed: Result<ClusterConfigMap, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_ssl_bool_and_object() {
        let json = r#"{"host": "db", "port": 5432, "database": "d", "user": "u",
                       "password": "p", "ssl": true}"#;
        let conn: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(conn.ssl, Some(SslConfig::Enabled(true)));

        let json = r#"{"host": "db", "port": 5432, "database": "d", "user": "u",
                       "password": "p", "ssl": {"rejectUnauthorized": false}}"#;
        let conn: ConnectionConfig = serde_json::from_str(json).unwrap();
        match conn.ssl {
            Some(SslConfig::Options(opts)) => assert_eq!(opts.reject_unauthorized, Some(false)),
            other => panic!("expected ssl options, got {other:?}"),
        }
    }

    #[test]
    fn test_store_schema_mapping() {
        let store = ConfigStore::new(None, EventBus::new());
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), cluster(&["users"]));
        map.insert("b".to_string(), cluster(&["orders"]));
        store.set_clusters(map).unwrap();

        assert_eq!(store.get_cluster_for_schema("users").as_deref(), Some("a"));
        assert_eq!(store.get_cluster_for_schema("ghost"), None);

        store.map_schema_to_cluster("events", "b").unwrap();
        assert_eq!(store.get_cluster_for_schema("events").as_deref(), Some("b"));

        let err = store.map_schema_to_cluster("users", "b").unwrap_err();
        assert!(matches!(err, ConfigError::SchemaAlreadyMapped { .. }));

        store.unmap_schema_from_cluster("events", "b").unwrap();
        assert_eq!(store.get_cluster_for_schema("events"), None);
    }

    #[tokio::test]
    async fn test_watch_emits_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.json");
        tokio::fs::write(&path, b"{}").await.unwrap();

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let store = ConfigStore::new(Some(path.clone()), events);
        store.watch().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::fs::write(&path, b"{\"changed\": true}")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for configReloaded")
            .unwrap();
        assert_eq!(event.kind(), "configReloaded");

        store.close().await;
    }
}
