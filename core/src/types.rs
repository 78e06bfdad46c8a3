//! Routing options shared across the workspace, plus the JSON bridge
//! between dynamic query parameters/results and sqlx.

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Either, Postgres, Row, TypeInfo, ValueRef};
use std::time::Duration;

/// Statement class, derived from the leading keyword when the caller does
/// not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    /// Leading-keyword sniff. `select`/`with`/`explain` are reads,
    /// `insert`/`update`/`delete`/`merge` are writes, anything else is
    /// treated as a read.
    pub fn detect(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match keyword.as_str() {
            "insert" | "update" | "delete" | "merge" => Self::Write,
            _ => Self::Read,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

/// `strong` forces reads onto the primary; `eventual` allows replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    Eventual,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPreference {
    Replica,
    Primary,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Initializing,
    Active,
    Down,
    Maintenance,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Down => "down",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Aggressive,
    Conservative,
    None,
}

/// Replica selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    ResponseTime,
    HealthAware,
}

/// Per-statement routing and caching options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Route via the schema→cluster map.
    pub schema: Option<String>,
    /// Route to this cluster directly, bypassing the schema map and the
    /// active-status check.
    pub cluster_id: Option<String>,
    /// Statement class; sniffed from the SQL when absent.
    pub operation: Option<Operation>,
    /// Overrides the target cluster's configured consistency level.
    pub consistency: Option<ConsistencyLevel>,
    /// Serve/store this read through the result cache.
    pub cache: bool,
    /// Explicit cache key; derived from the statement when absent.
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    /// Caller deadline for the whole operation.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            ..Default::default()
        }
    }

    pub fn cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            ..Default::default()
        }
    }
}

/// Rows decoded to JSON plus the affected-row count reported by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<Value>,
    pub rows_affected: u64,
}

/// Bind JSON parameters by their JSON type. Arrays and objects are bound
/// as jsonb; integral numbers as BIGINT, other numbers as DOUBLE PRECISION.
pub fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}

/// Run one statement on a connection, collecting rows and the affected
/// count in a single pass.
pub async fn fetch_output<'c, E>(
    executor: E,
    sql: &str,
    params: &[Value],
) -> Result<QueryOutput, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = bind_values(sqlx::query(sql), params);
    let mut rows = Vec::new();
    let mut rows_affected = 0u64;
    let mut stream = query.fetch_many(executor);
    while let Some(step) = stream.try_next().await? {
        match step {
            Either::Left(done) => rows_affected += done.rows_affected(),
            Either::Right(row) => rows.push(row_to_json(&row)),
        }
    }
    Ok(QueryOutput {
        rows,
        rows_affected,
    })
}

/// Decode a row into a JSON object keyed by column name. Types without a
/// JSON mapping decode as null.
pub fn row_to_json(row: &PgRow) -> Value {
    let mut map = serde_json::Map::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let is_null = row
            .try_get_raw(i)
            .map(|raw| raw.is_null())
            .unwrap_or(true);
        if is_null {
            map.insert(name, Value::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<bool, _>(i).map(Value::Bool).ok(),
            "INT2" => row.try_get::<i16, _>(i).map(Value::from).ok(),
            "INT4" => row.try_get::<i32, _>(i).map(Value::from).ok(),
            "INT8" => row.try_get::<i64, _>(i).map(Value::from).ok(),
            "FLOAT4" => row
                .try_get::<f32, _>(i)
                .map(|v| Value::from(f64::from(v)))
                .ok(),
            "FLOAT8" => row.try_get::<f64, _>(i).map(Value::from).ok(),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                row.try_get::<String, _>(i).map(Value::String).ok()
            }
            "UUID" => row
                .try_get::<uuid::Uuid, _>(i)
                .map(|u| Value::String(u.to_string()))
                .ok(),
            "TIMESTAMPTZ" => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .map(|t| Value::String(t.to_rfc3339()))
                .ok(),
            "TIMESTAMP" => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .map(|t| Value::String(t.to_string()))
                .ok(),
            "DATE" => row
                .try_get::<chrono::NaiveDate, _>(i)
                .map(|d| Value::String(d.to_string()))
                .ok(),
            "JSON" | "JSONB" => row.try_get::<Value, _>(i).ok(),
            other => {
                tracing::debug!(column = %name, pg_type = other, "no JSON mapping for column type");
                None
            }
        };
        map.insert(name, value.unwrap_or(Value::Null));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reads() {
        assert_eq!(Operation::detect("SELECT 1"), Operation::Read);
        assert_eq!(Operation::detect("  select * from users"), Operation::Read);
        assert_eq!(
            Operation::detect("WITH x AS (SELECT 1) SELECT * FROM x"),
            Operation::Read
        );
        assert_eq!(Operation::detect("EXPLAIN SELECT 1"), Operation::Read);
    }

    #[test]
    fn test_detect_writes() {
        assert_eq!(
            Operation::detect("INSERT INTO t VALUES (1)"),
            Operation::Write
        );
        assert_eq!(Operation::detect("update t set a = 1"), Operation::Write);
        assert_eq!(Operation::detect("DELETE FROM t"), Operation::Write);
        assert_eq!(Operation::detect("MERGE INTO t USING s"), Operation::Write);
    }

    #[test]
    fn test_detect_unknown_defaults_to_read() {
        assert_eq!(Operation::detect("VACUUM"), Operation::Read);
        assert_eq!(Operation::detect(""), Operation::Read);
    }

    #[test]
    fn test_balance_strategy_serde_names() {
        let s: BalanceStrategy = serde_json::from_str("\"round_robin\"").unwrap();
        assert_eq!(s, BalanceStrategy::RoundRobin);
        let s: BalanceStrategy = serde_json::from_str("\"least_connections\"").unwrap();
        assert_eq!(s, BalanceStrategy::LeastConnections);
        assert_eq!(
            serde_json::to_string(&BalanceStrategy::HealthAware).unwrap(),
            "\"health_aware\""
        );
    }

    #[test]
    fn test_query_options_helpers() {
        let opts = QueryOptions::schema("users");
        assert_eq!(opts.schema.as_deref(), Some("users"));
        assert!(opts.cluster_id.is_none());
        let opts = QueryOptions::cluster("analytics");
        assert_eq!(opts.cluster_id.as_deref(), Some("analytics"));
    }
}
