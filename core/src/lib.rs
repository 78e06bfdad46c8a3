//! Shared foundation for pg-multiverse.
//!
//! This crate carries the pieces every other pg-multiverse crate agrees on:
//! - The typed [`Event`] bus surfaced to callers ([`events`])
//! - Query routing options and the JSON row/parameter bridge ([`types`])
//! - The cluster configuration document: parsing, validation, file
//!   watching, and schema↔cluster mapping ([`config`])
//!
//! Nothing here talks to PostgreSQL on its own; higher crates
//! (`multiverse_cluster`, `multiverse_cache`, …) compose these types into
//! the routing and coordination layer.

pub mod config;
pub mod events;
pub mod types;

pub use config::{ClusterConfig, ConfigError, ConfigStore, ConnectionConfig, ValidationReport};
pub use events::{Event, EventBus, EvictionReason};
pub use types::{
    BalanceStrategy, CacheStrategy, ClusterStatus, ConsistencyLevel, Operation, QueryOptions,
    QueryOutput, ReadPreference,
};
