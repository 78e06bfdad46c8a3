//! Cluster-side building blocks for pg-multiverse.
//!
//! This crate owns everything between a routed statement and PostgreSQL:
//! - [`ClusterPool`]: one connection pool per (cluster, role, replica),
//!   with async readiness, warmup, and merged metrics
//! - [`LoadBalancer`]: replica selection across five strategies
//! - [`HealthChecker`]: periodic liveness probes with up/down/recovered
//!   transitions
//! - [`ClusterManager`]: the cluster registry, the schema→cluster map,
//!   read/write splitting, and failover
//!
//! # Example
//!
//! ```rust,ignore
//! use multiverse_cluster::ClusterManager;
//! use multiverse_core::{EventBus, QueryOptions};
//!
//! let manager = ClusterManager::new(EventBus::new(), Default::default());
//! manager.initialize(clusters).await?;
//!
//! let result = manager
//!     .execute_query("SELECT * FROM accounts", &[], &QueryOptions::schema("users"))
//!     .await?;
//! ```

mod balancer;
mod error;
mod health;
mod manager;
mod pool;

pub use balancer::{BalancerOptions, BalancerStats, LoadBalancer, ReplicaSnapshot};
pub use error::ClusterError;
pub use health::{ClusterHealth, ConnectionCounts, HealthChecker, QueryStats};
pub use manager::{
    ClusterDescriptor, ClusterManager, ClusterMetrics, ClusterStatsSnapshot, ManagerOptions,
    PoolReport, QueryExecution, RouteDecision, TxnFuture,
};
pub use pool::{ClusterMetadata, ClusterPool, PoolInfo, PoolMetrics, PoolRole, WrappedConnection};
