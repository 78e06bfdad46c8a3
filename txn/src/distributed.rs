//! Per-transaction state machine and the two-phase commit engine.

use multiverse_cluster::{ClusterError, ClusterManager, WrappedConnection};
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::{Operation, QueryOptions, QueryOutput};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TxnError {
    #[error("Transaction {0} not found")]
    NotFound(Uuid),

    #[error("Transaction {id} is in state '{actual}'; expected '{expected}'")]
    WrongState {
        id: Uuid,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Statement carries neither schema nor clusterId")]
    NoTarget,

    #[error("'{0}' does not resolve to a cluster in this transaction")]
    UnknownTarget(String),

    #[error("Prepare phase failed on cluster '{cluster_id}': {reason}")]
    PrepareFailed { cluster_id: String, reason: String },

    #[error(
        "Commit phase failed on {failures} of {participants} participants; \
         prepared transaction '{gid}' is in doubt"
    )]
    CommitPhaseFailed {
        gid: String,
        failures: usize,
        participants: usize,
    },

    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// `preparing → prepared → committing → committed`, or
/// `… → aborting → aborted`. The last two of each chain are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Deadline for `begin` connection setup and for each statement.
    pub timeout: Option<Duration>,
}

/// One statement inside a transaction, addressed by schema or cluster.
#[derive(Debug, Clone)]
pub struct TxnStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub schema: Option<String>,
    pub cluster_id: Option<String>,
}

impl TxnStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            schema: None,
            cluster_id: None,
        }
    }

    pub fn on_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn on_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn bind(mut self, param: Value) -> Self {
        self.params.push(param);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TxnMetricsSnapshot {
    pub total: u64,
    pub active: u64,
    pub committed: u64,
    pub aborted: u64,
    /// Multi-cluster transactions.
    pub distributed: u64,
    /// True running mean over committed + aborted transactions.
    pub avg_duration_ms: f64,
}

struct TxnInner {
    id: Uuid,
    clusters: Vec<String>,
    schema_clusters: HashMap<String, String>,
    state: TxnState,
    conns: HashMap<String, WrappedConnection>,
    started: Instant,
    options: TxnOptions,
}

/// Which cluster a statement belongs to, within this transaction.
fn resolve_target(
    clusters: &[String],
    schema_clusters: &HashMap<String, String>,
    stmt: &TxnStatement,
) -> Result<String, TxnError> {
    if let Some(cluster_id) = &stmt.cluster_id {
        if clusters.iter().any(|c| c == cluster_id) {
            return Ok(cluster_id.clone());
        }
        return Err(TxnError::UnknownTarget(cluster_id.clone()));
    }
    if let Some(schema) = &stmt.schema {
        return schema_clusters
            .get(schema)
            .cloned()
            .ok_or_else(|| TxnError::UnknownTarget(schema.clone()));
    }
    Err(TxnError::NoTarget)
}

fn global_id(id: &Uuid) -> String {
    format!("pgm_{}", id.simple())
}

pub struct TransactionManager {
    manager: Arc<ClusterManager>,
    txns: StdMutex<HashMap<Uuid, Arc<Mutex<TxnInner>>>>,
    events: EventBus,
    total: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    distributed: AtomicU64,
    completed: AtomicU64,
    duration_sum_ms: AtomicU64,
}

impl TransactionManager {
    pub fn new(manager: Arc<ClusterManager>, events: EventBus) -> Self {
        Self {
            manager,
            txns: StdMutex::new(HashMap::new()),
            events,
            total: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            distributed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
        }
    }

    /// Open a transaction across every cluster the schemas resolve to:
    /// one write connection per cluster, `BEGIN` issued on each.
    pub async fn begin(
        &self,
        schemas: &[String],
        options: TxnOptions,
    ) -> Result<Uuid, TxnError> {
        let id = Uuid::new_v4();

        let mut schema_clusters = HashMap::new();
        let mut clusters: Vec<String> = Vec::new();
        for schema in schemas {
            let cluster_id = self
                .manager
                .schema_cluster(schema)
                .await
                .ok_or_else(|| TxnError::Cluster(ClusterError::UnknownSchema(schema.clone())))?;
            schema_clusters.insert(schema.clone(), cluster_id.clone());
            if !clusters.contains(&cluster_id) {
                clusters.push(cluster_id);
            }
        }
        if clusters.is_empty() {
            return Err(TxnError::NoTarget);
        }

        let setup = async {
            let mut conns: HashMap<String, WrappedConnection> = HashMap::new();
            for cluster_id in &clusters {
                let opts = QueryOptions {
                    cluster_id: Some(cluster_id.clone()),
                    operation: Some(Operation::Write),
                    ..Default::default()
                };
                let conn = self.manager.get_connection(&opts).await?;
                conns.insert(cluster_id.clone(), conn);
            }

            let mut begun: Vec<String> = Vec::new();
            for cluster_id in &clusters {
                let conn = conns.get_mut(cluster_id).expect("connection just acquired");
                if let Err(e) = conn.execute_raw("BEGIN").await {
                    for begun_cluster in &begun {
                        if let Some(conn) = conns.get_mut(begun_cluster) {
                            if let Err(rb) = conn.execute_raw("ROLLBACK").await {
                                tracing::warn!(
                                    cluster_id = %begun_cluster,
                                    "rollback during failed begin also failed: {}",
                                    rb
                                );
                            }
                        }
                    }
                    return Err(TxnError::Cluster(e));
                }
                begun.push(cluster_id.clone());
            }
            Ok(conns)
        };

        let conns = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, setup)
                .await
                .map_err(|_| TxnError::Timeout(limit))??,
            None => setup.await?,
        };

        let inner = TxnInner {
            id,
            clusters: clusters.clone(),
            schema_clusters,
            state: TxnState::Prepared,
            conns,
            started: Instant::now(),
            options,
        };
        self.txns
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(inner)));

        self.total.fetch_add(1, Ordering::Relaxed);
        if clusters.len() > 1 {
            self.distributed.fetch_add(1, Ordering::Relaxed);
        }
        self.events.emit(Event::TransactionStarted { id, clusters });
        tracing::debug!(txn_id = %id, "transaction started");
        Ok(id)
    }

    fn lookup(&self, id: Uuid) -> Result<Arc<Mutex<TxnInner>>, TxnError> {
        self.txns
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(TxnError::NotFound(id))
    }

    fn forget(&self, id: Uuid) {
        self.txns.lock().unwrap().remove(&id);
    }

    fn record_completion(&self, inner: &TxnInner) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_ms.fetch_add(
            inner.started.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    /// Run one statement inside an open transaction.
    pub async fn execute(&self, id: Uuid, stmt: TxnStatement) -> Result<QueryOutput, TxnError> {
        let txn = self.lookup(id)?;
        let mut inner = txn.lock().await;
        if inner.state != TxnState::Prepared {
            return Err(TxnError::WrongState {
                id,
                expected: TxnState::Prepared.as_str(),
                actual: inner.state.as_str(),
            });
        }

        let cluster_id = resolve_target(&inner.clusters, &inner.schema_clusters, &stmt)?;
        let timeout = inner.options.timeout;
        let conn = inner
            .conns
            .get_mut(&cluster_id)
            .ok_or_else(|| TxnError::UnknownTarget(cluster_id.clone()))?;

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, conn.query(&stmt.sql, &stmt.params))
                .await
                .map_err(|_| TxnError::Timeout(limit))??,
            None => conn.query(&stmt.sql, &stmt.params).await?,
        };
        Ok(output)
    }

    /// Commit: plain `COMMIT` for one cluster, two-phase commit otherwise.
    pub async fn commit(&self, id: Uuid) -> Result<(), TxnError> {
        let txn = self.lookup(id)?;
        let mut inner = txn.lock().await;
        if inner.state != TxnState::Prepared {
            return Err(TxnError::WrongState {
                id,
                expected: TxnState::Prepared.as_str(),
                actual: inner.state.as_str(),
            });
        }
        inner.state = TxnState::Committing;

        let result = if inner.clusters.len() == 1 {
            self.commit_single(&mut inner).await
        } else {
            self.commit_two_phase(&mut inner).await
        };

        self.record_completion(&inner);
        inner.conns.clear();
        drop(inner);
        self.forget(id);
        result
    }

    async fn commit_single(&self, inner: &mut TxnInner) -> Result<(), TxnError> {
        let cluster_id = inner.clusters[0].clone();
        let conn = inner
            .conns
            .get_mut(&cluster_id)
            .expect("single-cluster transaction has its connection");
        match conn.execute_raw("COMMIT").await {
            Ok(_) => {
                inner.state = TxnState::Committed;
                self.committed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(Event::TransactionCommitted {
                    id: inner.id,
                    distributed: false,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = conn.execute_raw("ROLLBACK").await {
                    tracing::warn!(txn_id = %inner.id, "rollback after failed commit failed: {}", rb);
                }
                inner.state = TxnState::Aborted;
                self.aborted.fetch_add(1, Ordering::Relaxed);
                self.events.emit(Event::TransactionAborted {
                    id: inner.id,
                    reason: e.to_string(),
                });
                Err(TxnError::Cluster(e))
            }
        }
    }

    async fn commit_two_phase(&self, inner: &mut TxnInner) -> Result<(), TxnError> {
        let gid = global_id(&inner.id);
        let clusters = inner.clusters.clone();

        // Phase 1: PREPARE TRANSACTION everywhere.
        let mut prepared: Vec<String> = Vec::new();
        for cluster_id in &clusters {
            let conn = inner
                .conns
                .get_mut(cluster_id)
                .expect("participant connection");
            if let Err(e) = conn.execute_raw(&format!("PREPARE TRANSACTION '{gid}'")).await {
                let reason = e.to_string();
                tracing::warn!(
                    txn_id = %inner.id,
                    cluster_id = %cluster_id,
                    "prepare failed: {}",
                    reason
                );
                self.undo_prepare(inner, &gid, &prepared, cluster_id).await;
                inner.state = TxnState::Aborted;
                self.aborted.fetch_add(1, Ordering::Relaxed);
                self.events.emit(Event::TransactionAborted {
                    id: inner.id,
                    reason: reason.clone(),
                });
                return Err(TxnError::PrepareFailed {
                    cluster_id: cluster_id.clone(),
                    reason,
                });
            }
            prepared.push(cluster_id.clone());
        }

        // Phase 2: COMMIT PREPARED everywhere. Partial failure leaves the
        // survivors committed and the failures in doubt.
        let mut failures = 0usize;
        for cluster_id in &clusters {
            let conn = inner
                .conns
                .get_mut(cluster_id)
                .expect("participant connection");
            if let Err(e) = conn
                .execute_raw(&format!("COMMIT PREPARED '{gid}'"))
                .await
            {
                failures += 1;
                tracing::warn!(
                    txn_id = %inner.id,
                    cluster_id = %cluster_id,
                    gid = %gid,
                    "COMMIT PREPARED failed; participant left in doubt: {}",
                    e
                );
            }
        }

        inner.state = TxnState::Committed;
        self.committed.fetch_add(1, Ordering::Relaxed);
        if failures == 0 {
            self.events.emit(Event::TransactionCommitted {
                id: inner.id,
                distributed: true,
            });
            Ok(())
        } else {
            self.events.emit(Event::Error {
                message: format!(
                    "transaction {} in doubt: {} of {} COMMIT PREPARED calls failed (gid {})",
                    inner.id,
                    failures,
                    clusters.len(),
                    gid
                ),
            });
            Err(TxnError::CommitPhaseFailed {
                gid,
                failures,
                participants: clusters.len(),
            })
        }
    }

    /// After a failed PREPARE: roll back prepared participants with
    /// `ROLLBACK PREPARED`, everything else with plain `ROLLBACK`.
    async fn undo_prepare(
        &self,
        inner: &mut TxnInner,
        gid: &str,
        prepared: &[String],
        failed_cluster: &str,
    ) {
        let clusters = inner.clusters.clone();
        for cluster_id in &clusters {
            let conn = match inner.conns.get_mut(cluster_id) {
                Some(conn) => conn,
                None => continue,
            };
            let result = if prepared.iter().any(|c| c == cluster_id) {
                conn.execute_raw(&format!("ROLLBACK PREPARED '{gid}'")).await
            } else if cluster_id == failed_cluster {
                // The failed PREPARE already aborted this session's
                // transaction; a plain ROLLBACK clears the state.
                conn.execute_raw("ROLLBACK").await
            } else {
                conn.execute_raw("ROLLBACK").await
            };
            if let Err(e) = result {
                tracing::warn!(
                    txn_id = %inner.id,
                    cluster_id = %cluster_id,
                    "rollback during prepare recovery failed: {}",
                    e
                );
            }
        }
    }

    /// Roll back on every participant and forget the transaction.
    pub async fn rollback(&self, id: Uuid) -> Result<(), TxnError> {
        let txn = self.lookup(id)?;
        let mut inner = txn.lock().await;
        if inner.state != TxnState::Prepared {
            return Err(TxnError::WrongState {
                id,
                expected: TxnState::Prepared.as_str(),
                actual: inner.state.as_str(),
            });
        }
        inner.state = TxnState::Aborting;

        let clusters = inner.clusters.clone();
        for cluster_id in &clusters {
            if let Some(conn) = inner.conns.get_mut(cluster_id) {
                if let Err(e) = conn.execute_raw("ROLLBACK").await {
                    tracing::warn!(
                        txn_id = %inner.id,
                        cluster_id = %cluster_id,
                        "rollback failed: {}",
                        e
                    );
                }
            }
        }

        inner.state = TxnState::Aborted;
        self.aborted.fetch_add(1, Ordering::Relaxed);
        self.events.emit(Event::TransactionAborted {
            id: inner.id,
            reason: "rolled back by caller".to_string(),
        });
        self.record_completion(&inner);
        inner.conns.clear();
        drop(inner);
        self.forget(id);
        Ok(())
    }

    pub fn metrics(&self) -> TxnMetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let avg_duration_ms = if completed == 0 {
            0.0
        } else {
            self.duration_sum_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };
        TxnMetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            active: self.txns.lock().unwrap().len() as u64,
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            distributed: self.distributed.load(Ordering::Relaxed),
            avg_duration_ms,
        }
    }

    /// Best-effort rollback of every active transaction.
    pub async fn close(&self) {
        let ids: Vec<Uuid> = self.txns.lock().unwrap().keys().copied().collect();
        for id in ids {
            if let Err(e) = self.rollback(id).await {
                tracing::warn!(txn_id = %id, "rollback during close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiverse_cluster::ManagerOptions;

    fn manager() -> Arc<ClusterManager> {
        Arc::new(ClusterManager::new(EventBus::new(), ManagerOptions::default()))
    }

    #[test]
    fn test_global_id_is_sql_safe() {
        let id = Uuid::new_v4();
        let gid = global_id(&id);
        assert!(gid.starts_with("pgm_"));
        assert!(gid.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_resolve_target_by_cluster() {
        let clusters = vec!["a".to_string(), "b".to_string()];
        let schema_clusters = HashMap::new();
        let stmt = TxnStatement::new("SELECT 1").on_cluster("b");
        assert_eq!(
            resolve_target(&clusters, &schema_clusters, &stmt).unwrap(),
            "b"
        );

        let stmt = TxnStatement::new("SELECT 1").on_cluster("ghost");
        assert!(matches!(
            resolve_target(&clusters, &schema_clusters, &stmt),
            Err(TxnError::UnknownTarget(c)) if c == "ghost"
        ));
    }

    #[test]
    fn test_resolve_target_by_schema() {
        let clusters = vec!["a".to_string()];
        let mut schema_clusters = HashMap::new();
        schema_clusters.insert("users".to_string(), "a".to_string());

        let stmt = TxnStatement::new("SELECT 1").on_schema("users");
        assert_eq!(
            resolve_target(&clusters, &schema_clusters, &stmt).unwrap(),
            "a"
        );

        let stmt = TxnStatement::new("SELECT 1").on_schema("ghost");
        assert!(matches!(
            resolve_target(&clusters, &schema_clusters, &stmt),
            Err(TxnError::UnknownTarget(_))
        ));
    }

    #[test]
    fn test_resolve_target_requires_some_target() {
        let stmt = TxnStatement::new("SELECT 1");
        assert!(matches!(
            resolve_target(&[], &HashMap::new(), &stmt),
            Err(TxnError::NoTarget)
        ));
    }

    #[tokio::test]
    async fn test_execute_unknown_transaction() {
        let txns = TransactionManager::new(manager(), EventBus::new());
        let err = txns
            .execute(Uuid::new_v4(), TxnStatement::new("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TxnError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_begin_with_unknown_schema() {
        let txns = TransactionManager::new(manager(), EventBus::new());
        let err = txns
            .begin(&["ghost".to_string()], TxnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TxnError::Cluster(ClusterError::UnknownSchema(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_start_empty() {
        let txns = TransactionManager::new(manager(), EventBus::new());
        let metrics = txns.metrics();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.avg_duration_ms, 0.0);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(TxnState::Preparing.as_str(), "preparing");
        assert_eq!(TxnState::Aborted.as_str(), "aborted");
    }
}
