//! Per-cluster persistence: the migrations table and the lock table.
//!
//! Lock acquisition is an upsert that only overwrites rows whose
//! `expires_at` has passed, so a crashed runner's lock becomes claimable
//! after its TTL.

use crate::error::MigrateError;
use crate::migration::Migration;
use multiverse_cluster::ClusterManager;
use multiverse_core::types::{Operation, QueryOptions};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const MIGRATIONS_TABLE: &str = "multiverse_migrations";
pub const LOCKS_TABLE: &str = "multiverse_migration_locks";

const MIGRATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS multiverse_migrations (
    version TEXT NOT NULL,
    name TEXT NOT NULL,
    schema_name TEXT NOT NULL,
    cluster_id TEXT NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    execution_time BIGINT NOT NULL DEFAULT 0,
    checksum TEXT NOT NULL,
    batch BIGINT NOT NULL DEFAULT 1,
    UNIQUE (version, schema_name, cluster_id)
)";

const LOCKS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS multiverse_migration_locks (
    lock_key TEXT PRIMARY KEY,
    locked_by TEXT NOT NULL,
    locked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expires_at TIMESTAMPTZ NOT NULL
)";

/// One row of the migrations table.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub executed_at: Option<String>,
    pub execution_time: i64,
    pub checksum: String,
    pub batch: i64,
}

impl MigrationRecord {
    fn from_row(row: &Value) -> Self {
        let text = |field: &str| {
            row.get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let number = |field: &str| row.get(field).and_then(Value::as_i64).unwrap_or(0);
        Self {
            version: text("version"),
            name: text("name"),
            executed_at: row
                .get("executed_at")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            execution_time: number("execution_time"),
            checksum: text("checksum"),
            batch: number("batch"),
        }
    }
}

pub struct MigrationStore {
    manager: Arc<ClusterManager>,
}

impl MigrationStore {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }

    fn write_opts(cluster_id: &str) -> QueryOptions {
        QueryOptions {
            cluster_id: Some(cluster_id.to_string()),
            operation: Some(Operation::Write),
            ..Default::default()
        }
    }

    fn read_opts(cluster_id: &str) -> QueryOptions {
        QueryOptions {
            cluster_id: Some(cluster_id.to_string()),
            operation: Some(Operation::Read),
            // Migration bookkeeping must read its own writes.
            consistency: Some(multiverse_core::types::ConsistencyLevel::Strong),
            ..Default::default()
        }
    }

    pub async fn ensure_tables(&self, cluster_id: &str) -> Result<(), MigrateError> {
        self.manager
            .execute_query(MIGRATIONS_TABLE_SQL, &[], &Self::write_opts(cluster_id))
            .await?;
        self.manager
            .execute_query(LOCKS_TABLE_SQL, &[], &Self::write_opts(cluster_id))
            .await?;
        Ok(())
    }

    pub async fn applied_versions(
        &self,
        schema: &str,
        cluster_id: &str,
    ) -> Result<Vec<String>, MigrateError> {
        let result = self
            .manager
            .execute_query(
                "SELECT version FROM multiverse_migrations \
                 WHERE schema_name = $1 AND cluster_id = $2 ORDER BY version",
                &[Value::from(schema), Value::from(cluster_id)],
                &Self::read_opts(cluster_id),
            )
            .await?;
        Ok(result
            .output
            .rows
            .iter()
            .filter_map(|row| row.get("version").and_then(Value::as_str))
            .map(|v| v.to_string())
            .collect())
    }

    /// Applied rows for one (schema, cluster), newest version first.
    pub async fn applied_records(
        &self,
        schema: &str,
        cluster_id: &str,
    ) -> Result<Vec<MigrationRecord>, MigrateError> {
        let result = self
            .manager
            .execute_query(
                "SELECT version, name, executed_at, execution_time, checksum, batch \
                 FROM multiverse_migrations \
                 WHERE schema_name = $1 AND cluster_id = $2 ORDER BY version DESC",
                &[Value::from(schema), Value::from(cluster_id)],
                &Self::read_opts(cluster_id),
            )
            .await?;
        Ok(result
            .output
            .rows
            .iter()
            .map(MigrationRecord::from_row)
            .collect())
    }

    pub async fn record_applied(
        &self,
        migration: &Migration,
        schema: &str,
        cluster_id: &str,
        execution_time: Duration,
        batch: i64,
    ) -> Result<(), MigrateError> {
        self.manager
            .execute_query(
                "INSERT INTO multiverse_migrations \
                 (version, name, schema_name, cluster_id, execution_time, checksum, batch) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (version, schema_name, cluster_id) DO NOTHING",
                &[
                    Value::from(migration.version.as_str()),
                    Value::from(migration.name.as_str()),
                    Value::from(schema),
                    Value::from(cluster_id),
                    Value::from(execution_time.as_millis() as i64),
                    Value::from(migration.checksum()),
                    Value::from(batch),
                ],
                &Self::write_opts(cluster_id),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_record(
        &self,
        version: &str,
        schema: &str,
        cluster_id: &str,
    ) -> Result<u64, MigrateError> {
        let result = self
            .manager
            .execute_query(
                "DELETE FROM multiverse_migrations \
                 WHERE version = $1 AND schema_name = $2 AND cluster_id = $3",
                &[
                    Value::from(version),
                    Value::from(schema),
                    Value::from(cluster_id),
                ],
                &Self::write_opts(cluster_id),
            )
            .await?;
        Ok(result.output.rows_affected)
    }

    pub async fn next_batch(&self, schema: &str, cluster_id: &str) -> Result<i64, MigrateError> {
        let result = self
            .manager
            .execute_query(
                "SELECT COALESCE(MAX(batch), 0) + 1 AS next_batch FROM multiverse_migrations \
                 WHERE schema_name = $1 AND cluster_id = $2",
                &[Value::from(schema), Value::from(cluster_id)],
                &Self::read_opts(cluster_id),
            )
            .await?;
        Ok(result
            .output
            .rows
            .first()
            .and_then(|row| row.get("next_batch"))
            .and_then(Value::as_i64)
            .unwrap_or(1))
    }

    /// Upsert the lock row; only a missing or stale row is claimable.
    pub async fn acquire_lock(
        &self,
        cluster_id: &str,
        lock_key: &str,
        locked_by: &str,
        ttl: Duration,
    ) -> Result<bool, MigrateError> {
        let result = self
            .manager
            .execute_query(
                "INSERT INTO multiverse_migration_locks (lock_key, locked_by, locked_at, expires_at) \
                 VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3)) \
                 ON CONFLICT (lock_key) DO UPDATE SET \
                     locked_by = EXCLUDED.locked_by, \
                     locked_at = NOW(), \
                     expires_at = EXCLUDED.expires_at \
                 WHERE multiverse_migration_locks.expires_at < NOW()",
                &[
                    Value::from(lock_key),
                    Value::from(locked_by),
                    Value::from(ttl.as_secs_f64()),
                ],
                &Self::write_opts(cluster_id),
            )
            .await?;
        Ok(result.output.rows_affected == 1)
    }

    pub async fn release_lock(
        &self,
        cluster_id: &str,
        lock_key: &str,
        locked_by: &str,
    ) -> Result<(), MigrateError> {
        self.manager
            .execute_query(
                "DELETE FROM multiverse_migration_locks WHERE lock_key = $1 AND locked_by = $2",
                &[Value::from(lock_key), Value::from(locked_by)],
                &Self::write_opts(cluster_id),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_from_row() {
        let row = json!({
            "version": "20240101120000_base",
            "name": "base",
            "executed_at": "2024-01-01T12:00:05+00:00",
            "execution_time": 42,
            "checksum": "abc",
            "batch": 3
        });
        let record = MigrationRecord::from_row(&row);
        assert_eq!(record.version, "20240101120000_base");
        assert_eq!(record.execution_time, 42);
        assert_eq!(record.batch, 3);
        assert!(record.executed_at.is_some());
    }

    #[test]
    fn test_record_from_partial_row() {
        let record = MigrationRecord::from_row(&json!({"version": "v1"}));
        assert_eq!(record.version, "v1");
        assert_eq!(record.batch, 0);
        assert!(record.executed_at.is_none());
    }
}
