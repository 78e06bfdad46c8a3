//! Versioned schema migrations across clusters and schemas.
//!
//! Migrations are `(version, up, down)` records with target schemas,
//! optional target clusters, dependencies, and a sha256 checksum over
//! `up + down`. They are registered through [`MigrationManager::add_migration`]
//! or loaded from JSON files named `<version>.json` where the version
//! carries a sortable `YYYYMMDDHHMMSS_` prefix. Execution is serialized
//! per `(version, schema, cluster)` by a lock row whose stale entries may
//! be overwritten.

mod error;
mod manager;
mod migration;
mod store;

pub use error::MigrateError;
pub use manager::{
    AppliedMigration, CreateOptions, MigrateOptions, MigrationIssue, MigrationManager,
    MigrationStatus, PendingMigration, RollbackOptions,
};
pub use migration::Migration;
pub use store::{MigrationRecord, MigrationStore, LOCKS_TABLE, MIGRATIONS_TABLE};
