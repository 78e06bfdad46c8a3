//! End-to-end scenarios against live PostgreSQL.
//!
//! These tests need two reachable databases (they default to
//! `multiverse_a` and `multiverse_b` on localhost; override with PGHOST /
//! PGPORT / PGUSER / PGPASSWORD / PGM_TEST_DB_A / PGM_TEST_DB_B) and are
//! ignored by default:
//!
//! ```sh
//! cargo test -p pg_multiverse -- --ignored
//! ```
//!
//! The two-phase-commit tests additionally need
//! `max_prepared_transactions > 0` on the server.

use pg_multiverse::{
    ClusterConfig, ClusterConfigMap, ConnectionConfig, ConsistencyLevel, Coordinator,
    CoordinatorOptions, Event, InvalidateCriteria, Operation, QueryOptions, TxnStatement,
};
use serde_json::json;
use serial_test::serial;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn connection(db: &str) -> ConnectionConfig {
    ConnectionConfig {
        host: env_or("PGHOST", "127.0.0.1"),
        port: env_or("PGPORT", "5432").parse().unwrap(),
        database: db.to_string(),
        user: env_or("PGUSER", "postgres"),
        password: env_or("PGPASSWORD", "password"),
        max_connections: Some(5),
        min_connections: None,
        ssl: None,
        connection_timeout_millis: Some(5_000),
        idle_timeout_millis: None,
        search_path: None,
    }
}

fn cluster(db: &str, schemas: &[&str], replicas: usize) -> ClusterConfig {
    ClusterConfig {
        schemas: schemas.iter().map(|s| s.to_string()).collect(),
        priority: None,
        read_preference: None,
        consistency_level: None,
        primary: connection(db),
        replicas: (0..replicas).map(|_| connection(db)).collect(),
        sharding: None,
        load_balancing: None,
        connection_pool: None,
        shard_key: None,
        cache_strategy: None,
    }
}

fn two_cluster_config(replicas_on_a: usize) -> ClusterConfigMap {
    let mut map = ClusterConfigMap::new();
    map.insert(
        "alpha".to_string(),
        cluster(&env_or("PGM_TEST_DB_A", "multiverse_a"), &["users"], replicas_on_a),
    );
    map.insert(
        "beta".to_string(),
        cluster(&env_or("PGM_TEST_DB_B", "multiverse_b"), &["orders"], 0),
    );
    map
}

async fn coordinator(replicas_on_a: usize) -> Coordinator {
    let dir = std::env::temp_dir().join(format!("pgm-test-{}", uuid::Uuid::new_v4()));
    let coordinator = Coordinator::new(CoordinatorOptions {
        migrations_path: dir,
        ..Default::default()
    });
    coordinator
        .initialize(Some(two_cluster_config(replicas_on_a)))
        .await
        .expect("coordinator initialize");
    coordinator
}

fn drain_kinds(rx: &mut Receiver<Event>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    kinds
}

#[tokio::test]
#[serial]
#[ignore]
async fn s1_schema_routing() {
    let coordinator = coordinator(0).await;

    let out = coordinator
        .query("SELECT 1 AS one", &[], &QueryOptions::schema("users"))
        .await
        .unwrap();
    assert_eq!(out.rows[0]["one"], json!(1));

    coordinator
        .query("SELECT 1", &[], &QueryOptions::schema("orders"))
        .await
        .unwrap();

    let err = coordinator
        .query("SELECT 1", &[], &QueryOptions::schema("ghost"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown schema"));

    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s2_read_write_split() {
    let coordinator = coordinator(2).await;
    let manager = coordinator.manager();

    let read = QueryOptions {
        schema: Some("users".to_string()),
        operation: Some(Operation::Read),
        consistency: Some(ConsistencyLevel::Eventual),
        ..Default::default()
    };
    let mut picks = Vec::new();
    for _ in 0..6 {
        picks.push(manager.resolve_route(&read).await.unwrap().replica_index);
    }
    assert_eq!(
        picks,
        vec![Some(0), Some(1), Some(0), Some(1), Some(0), Some(1)]
    );

    let strong = QueryOptions {
        consistency: Some(ConsistencyLevel::Strong),
        ..read.clone()
    };
    assert_eq!(
        manager.resolve_route(&strong).await.unwrap().replica_index,
        None
    );

    coordinator
        .query(
            "CREATE TABLE IF NOT EXISTS split_probe (id INT)",
            &[],
            &QueryOptions::schema("users"),
        )
        .await
        .unwrap();
    let write = QueryOptions {
        schema: Some("users".to_string()),
        operation: Some(Operation::Write),
        ..Default::default()
    };
    assert_eq!(
        manager.resolve_route(&write).await.unwrap().replica_index,
        None
    );

    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s3_cache_hit_then_invalidation() {
    let coordinator = coordinator(0).await;
    let mut rx = coordinator.subscribe();

    let opts = QueryOptions {
        schema: Some("users".to_string()),
        cache: true,
        cache_ttl: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    coordinator.query("SELECT 1 AS n", &[], &opts).await.unwrap();
    let kinds = drain_kinds(&mut rx);
    assert!(kinds.contains(&"cacheMiss"));
    assert!(kinds.contains(&"queryExecuted"));

    coordinator.query("SELECT 1 AS n", &[], &opts).await.unwrap();
    let kinds = drain_kinds(&mut rx);
    assert!(kinds.contains(&"cacheHit"));
    assert!(!kinds.contains(&"queryExecuted"));

    let removed = coordinator
        .invalidate_cache(&InvalidateCriteria {
            schema: Some("users".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(removed, 1);

    coordinator.query("SELECT 1 AS n", &[], &opts).await.unwrap();
    assert!(drain_kinds(&mut rx).contains(&"cacheMiss"));

    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s4_two_phase_commit_happy_path() {
    let coordinator = coordinator(0).await;
    for schema in ["users", "orders"] {
        coordinator
            .query(
                "CREATE TABLE IF NOT EXISTS tpc_rows (id BIGINT PRIMARY KEY, note TEXT)",
                &[],
                &QueryOptions::schema(schema),
            )
            .await
            .unwrap();
        coordinator
            .query("DELETE FROM tpc_rows", &[], &QueryOptions::schema(schema))
            .await
            .unwrap();
    }

    let mut rx = coordinator.subscribe();
    coordinator
        .with_transaction(
            &["users".to_string(), "orders".to_string()],
            |scope| async move {
                scope
                    .execute(
                        TxnStatement::new("INSERT INTO tpc_rows VALUES ($1, $2)")
                            .on_schema("users")
                            .bind(json!(1))
                            .bind(json!("from users")),
                    )
                    .await?;
                scope
                    .execute(
                        TxnStatement::new("INSERT INTO tpc_rows VALUES ($1, $2)")
                            .on_schema("orders")
                            .bind(json!(1))
                            .bind(json!("from orders")),
                    )
                    .await?;
                Ok(())
            },
        )
        .await
        .unwrap();

    let kinds: HashSet<&str> = drain_kinds(&mut rx).into_iter().collect();
    assert!(kinds.contains("transactionStarted"));
    assert!(kinds.contains("transactionCommitted"));

    for schema in ["users", "orders"] {
        let out = coordinator
            .query(
                "SELECT COUNT(*) AS n FROM tpc_rows",
                &[],
                &QueryOptions::schema(schema),
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0]["n"], json!(1));
    }

    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s5_two_phase_commit_prepare_failure_leaves_nothing() {
    // With max_prepared_transactions = 0 (the PostgreSQL default), the
    // prepare phase fails on the first participant and everything must
    // roll back. When the server enables prepared transactions, this
    // test is vacuous and exits early.
    let coordinator = coordinator(0).await;
    let probe = coordinator
        .query(
            "SHOW max_prepared_transactions",
            &[],
            &QueryOptions::schema("users"),
        )
        .await
        .unwrap();
    if probe.rows[0]["max_prepared_transactions"] != json!("0") {
        coordinator.close().await;
        return;
    }

    for schema in ["users", "orders"] {
        coordinator
            .query(
                "CREATE TABLE IF NOT EXISTS tpc_fail_rows (id BIGINT)",
                &[],
                &QueryOptions::schema(schema),
            )
            .await
            .unwrap();
        coordinator
            .query("DELETE FROM tpc_fail_rows", &[], &QueryOptions::schema(schema))
            .await
            .unwrap();
    }

    let mut rx = coordinator.subscribe();
    let result = coordinator
        .with_transaction(
            &["users".to_string(), "orders".to_string()],
            |scope| async move {
                scope
                    .execute(
                        TxnStatement::new("INSERT INTO tpc_fail_rows VALUES (1)")
                            .on_schema("users"),
                    )
                    .await?;
                scope
                    .execute(
                        TxnStatement::new("INSERT INTO tpc_fail_rows VALUES (1)")
                            .on_schema("orders"),
                    )
                    .await?;
                Ok(())
            },
        )
        .await;
    assert!(result.is_err());

    let kinds: HashSet<&str> = drain_kinds(&mut rx).into_iter().collect();
    assert!(kinds.contains("transactionAborted"));

    for schema in ["users", "orders"] {
        let out = coordinator
            .query(
                "SELECT COUNT(*) AS n FROM tpc_fail_rows",
                &[],
                &QueryOptions::schema(schema),
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0]["n"], json!(0), "no row may survive on {schema}");
    }

    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s6_migration_with_dependency_and_rollback() {
    use pg_multiverse::{MigrateOptions, Migration, RollbackOptions};

    let coordinator = coordinator(0).await;
    let migrations = coordinator.migrations();

    let base = Migration {
        version: "20240101120000_base".to_string(),
        name: "base".to_string(),
        description: None,
        target_schemas: vec!["users".to_string()],
        target_clusters: None,
        up: "CREATE TABLE IF NOT EXISTS mig_accounts (id BIGINT PRIMARY KEY)".to_string(),
        down: "DROP TABLE IF EXISTS mig_accounts".to_string(),
        dependencies: vec![],
        tags: vec![],
        created_at: None,
    };
    let next = Migration {
        version: "20240101130000_next".to_string(),
        name: "next".to_string(),
        description: None,
        target_schemas: vec!["users".to_string()],
        target_clusters: None,
        up: "ALTER TABLE mig_accounts ADD COLUMN IF NOT EXISTS email TEXT".to_string(),
        down: "ALTER TABLE mig_accounts DROP COLUMN IF EXISTS email".to_string(),
        dependencies: vec!["20240101120000_base".to_string()],
        tags: vec![],
        created_at: None,
    };
    migrations.add_migration(base.clone()).await.unwrap();
    migrations.add_migration(next.clone()).await.unwrap();

    let run = migrations.migrate(&MigrateOptions::default()).await.unwrap();
    assert_eq!(run.applied_migrations.len(), 2);
    assert_eq!(run.applied_migrations[0].version, base.version);
    assert_eq!(run.applied_migrations[1].version, next.version);
    assert_ne!(
        run.applied_migrations[0].checksum,
        run.applied_migrations[1].checksum
    );

    let status = migrations.get_status(None, None).await.unwrap();
    assert_eq!(status.applied_migrations.len(), 2);

    let rolled_back = migrations
        .rollback(&RollbackOptions::default())
        .await
        .unwrap();
    assert_eq!(rolled_back.applied_migrations.len(), 1);
    assert_eq!(rolled_back.applied_migrations[0].version, next.version);

    let status = migrations.get_status(None, None).await.unwrap();
    assert_eq!(status.applied_migrations.len(), 1);
    assert_eq!(status.applied_migrations[0].version, base.version);

    // Clean up for the next run.
    migrations
        .rollback(&RollbackOptions::default())
        .await
        .unwrap();
    coordinator.close().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn s7_health_check_reports_healthy_clusters() {
    let coordinator = coordinator(0).await;
    let health = coordinator.health_check().await.unwrap();
    assert_eq!(health.len(), 2);
    for (cluster_id, snapshot) in health {
        assert!(snapshot.healthy, "{cluster_id} should be healthy");
        assert_eq!(snapshot.failure_count, 0);
        assert!(snapshot.error.is_none());
    }
    coordinator.close().await;
}
