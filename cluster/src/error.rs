// ABOUTME: Typed errors for pools, routing, and cluster lifecycle
// ABOUTME: Routing failures surface to callers; probe failures feed health transitions

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster manager is not initialized")]
    NotInitialized,

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("No active cluster available")]
    NoActiveCluster,

    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("Cluster '{cluster_id}' is not active (status: {status})")]
    ClusterNotActive { cluster_id: String, status: String },

    #[error("Pool '{0}' is closed")]
    PoolClosed(String),

    #[error("Pool '{pool_id}' is not ready: {reason}")]
    PoolNotReady { pool_id: String, reason: String },

    #[error("No replicas available for selection")]
    NoReplicas,

    #[error("Replica index {index} out of range for cluster '{cluster_id}'")]
    ReplicaOutOfRange { cluster_id: String, index: usize },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Statement resolves to multiple clusters {0:?}; use per_cluster_transaction or a distributed transaction")]
    MultipleClusters(Vec<String>),

    #[error("Database error: {0}")]
    Driver(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] multiverse_core::ConfigError),
}
