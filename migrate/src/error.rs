use multiverse_cluster::ClusterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Migration manager is not initialized")]
    NotInitialized,

    #[error("Invalid migration: {0}")]
    Invalid(String),

    #[error("Migration '{0}' not found")]
    NotFound(String),

    #[error("Failed to acquire migration lock '{0}'")]
    LockFailed(String),

    #[error("Migration '{version}' depends on '{dependency}', which is neither planned nor applied")]
    DependencyMissing { version: String, dependency: String },

    #[error("Migration '{version}' failed on ({schema}, {cluster_id}): {reason}")]
    ExecutionFailed {
        version: String,
        schema: String,
        cluster_id: String,
        reason: String,
    },

    #[error("FS error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}
