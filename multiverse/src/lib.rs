//! Multi-cluster PostgreSQL routing and coordination.
//!
//! pg-multiverse presents one query interface over a fleet of PostgreSQL
//! clusters and transparently:
//! - routes each statement to the right cluster by the schema it touches
//! - splits reads onto replicas and writes onto primaries, honoring
//!   caller-declared consistency
//! - load-balances replica selection (round robin, weighted, least
//!   connections, response time, health aware)
//! - health-checks every pool and routes around clusters that go down
//! - caches read results with TTL, tag, schema, cluster, and pattern
//!   invalidation
//! - coordinates cross-cluster transactions with two-phase commit
//! - runs versioned schema migrations with locking and dependency order
//!
//! # Example
//!
//! ```rust,ignore
//! use pg_multiverse::{Coordinator, CoordinatorOptions};
//! use multiverse_core::QueryOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = Coordinator::new(CoordinatorOptions {
//!         config_path: Some("./multiverse.config.json".into()),
//!         ..Default::default()
//!     });
//!     coordinator.initialize(None).await?;
//!
//!     let users = coordinator
//!         .query(
//!             "SELECT id, email FROM accounts WHERE active = $1",
//!             &[serde_json::json!(true)],
//!             &QueryOptions::schema("users"),
//!         )
//!         .await?;
//!     println!("{} rows", users.rows.len());
//!
//!     coordinator.close().await;
//!     Ok(())
//! }
//! ```

mod coordinator;

pub use coordinator::{
    CacheBackend, CacheSettings, Coordinator, CoordinatorError, CoordinatorOptions,
    InvalidateCriteria, SystemMetrics, TransactionScope,
};

pub use multiverse_cache::{CacheOptions, CacheProvider, CacheStats, EvictionStrategy};
pub use multiverse_cluster::{
    ClusterError, ClusterHealth, ClusterManager, ManagerOptions, PoolMetrics, WrappedConnection,
};
pub use multiverse_core::config::{ClusterConfig, ClusterConfigMap, ConnectionConfig};
pub use multiverse_core::events::{Event, EventBus, EvictionReason};
pub use multiverse_core::types::{
    ConsistencyLevel, Operation, QueryOptions, QueryOutput, ReadPreference,
};
pub use multiverse_migrate::{
    MigrateOptions, Migration, MigrationManager, MigrationStatus, RollbackOptions,
};
pub use multiverse_txn::{TxnOptions, TxnState, TxnStatement};
