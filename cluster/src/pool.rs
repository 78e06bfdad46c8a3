//! Per-(cluster, role, replica) connection pool.
//!
//! Construction never blocks: the underlying sqlx pool connects lazily and
//! a spawned initializer verifies connectivity (`SELECT 1`), optionally
//! warms up the minimum connection count, and then flips the pool to
//! ready. Callers block in [`ClusterPool::acquire`] until readiness or
//! their timeout, whichever comes first.

use crate::error::ClusterError;
use multiverse_core::config::{ConnectionConfig, PoolSettings, SslConfig};
use multiverse_core::events::{Event, EventBus};
use multiverse_core::types::{fetch_output, QueryOutput};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const WARMUP_HOLD: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Primary,
    Replica,
}

impl PoolRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

/// Cumulative counters merged with instantaneous gauges from the
/// underlying pool. `active + idle == total` holds at all times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub created: u64,
    pub destroyed: u64,
    pub acquired: u64,
    pub released: u64,
    pub active: u64,
    pub idle: u64,
    pub waiting: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub pool_id: String,
    pub cluster_id: String,
    pub role: PoolRole,
    pub replica_index: Option<usize>,
    pub ready: bool,
    pub closed: bool,
    pub max_connections: u32,
}

/// Identifies where a checked-out connection came from, so statistics and
/// transaction bookkeeping can attribute work without re-routing.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    pub cluster_id: String,
    pub schema: Option<String>,
    pub pool_id: String,
}

struct PoolShared {
    pool_id: String,
    cluster_id: String,
    role: PoolRole,
    replica_index: Option<usize>,
    pool: PgPool,
    max_connections: u32,
    acquire_timeout: Duration,
    ready: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
    ready_notify: Notify,
    created: Arc<AtomicU64>,
    acquired: AtomicU64,
    released: AtomicU64,
    waiting: AtomicU64,
    avg_response_ms: Mutex<f64>,
    events: EventBus,
}

pub struct ClusterPool {
    shared: Arc<PoolShared>,
}

fn connect_options(conn: &ConnectionConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&conn.host)
        .port(conn.port)
        .database(&conn.database)
        .username(&conn.user)
        .password(&conn.password);

    options = match &conn.ssl {
        None => options.ssl_mode(PgSslMode::Prefer),
        Some(SslConfig::Enabled(true)) => options.ssl_mode(PgSslMode::Require),
        Some(SslConfig::Enabled(false)) => options.ssl_mode(PgSslMode::Disable),
        Some(SslConfig::Options(ssl)) => {
            let mode = match ssl.reject_unauthorized {
                Some(false) => PgSslMode::Require,
                _ => PgSslMode::VerifyFull,
            };
            let mut options = options.ssl_mode(mode);
            if let Some(ca) = &ssl.ca {
                options = options.ssl_root_cert(ca);
            }
            if let Some(cert) = &ssl.cert {
                options = options.ssl_client_cert(cert);
            }
            if let Some(key) = &ssl.key {
                options = options.ssl_client_key(key);
            }
            options
        }
    };

    if let Some(search_path) = &conn.search_path {
        options = options.options([("search_path", search_path.as_str())]);
    }
    options
}

impl ClusterPool {
    /// Create the pool and spawn its initializer. Returns immediately; the
    /// pool becomes ready (or failed) in the background.
    pub fn connect(
        cluster_id: &str,
        role: PoolRole,
        replica_index: Option<usize>,
        conn: &ConnectionConfig,
        settings: &PoolSettings,
        events: EventBus,
    ) -> Self {
        let pool_id = match role {
            PoolRole::Primary => format!("{cluster_id}_primary"),
            PoolRole::Replica => {
                format!("{cluster_id}_replica_{}", replica_index.unwrap_or(0))
            }
        };

        let max_connections = settings
            .max
            .or(conn.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let min_connections = settings.min.or(conn.min_connections).unwrap_or(0);
        let acquire_timeout = settings
            .acquire_timeout_millis
            .or(conn.connection_timeout_millis)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT);

        let created = Arc::new(AtomicU64::new(0));
        let created_hook = created.clone();

        let mut pool_options = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .after_connect(move |_conn, _meta| {
                let created = created_hook.clone();
                Box::pin(async move {
                    created.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            });
        if let Some(idle) = settings
            .idle_timeout_millis
            .or(conn.idle_timeout_millis)
            .map(Duration::from_millis)
        {
            pool_options = pool_options.idle_timeout(idle);
        }

        let pool = pool_options.connect_lazy_with(connect_options(conn));

        let shared = Arc::new(PoolShared {
            pool_id,
            cluster_id: cluster_id.to_string(),
            role,
            replica_index,
            pool,
            max_connections,
            acquire_timeout,
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ready_notify: Notify::new(),
            created,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            waiting: AtomicU64::new(0),
            avg_response_ms: Mutex::new(0.0),
            events,
        });

        let warmup = settings.warmup_connections.unwrap_or(false);
        tokio::spawn(Self::initialize(shared.clone(), warmup, min_connections));

        Self { shared }
    }

    async fn initialize(shared: Arc<PoolShared>, warmup: bool, min_connections: u32) {
        let probe = async {
            let mut conn = shared.pool.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(())
        };

        if let Err(e) = probe.await {
            tracing::error!(pool_id = %shared.pool_id, "pool initialization failed: {}", e);
            shared.failed.store(true, Ordering::Release);
            shared.ready_notify.notify_waiters();
            shared.events.emit(Event::Error {
                message: format!("pool {} failed to initialize: {e}", shared.pool_id),
            });
            return;
        }

        if warmup && min_connections > 0 {
            Self::warmup_shared(&shared, min_connections).await;
        }

        shared.ready.store(true, Ordering::Release);
        shared.ready_notify.notify_waiters();
        shared.events.emit(Event::PoolReady {
            pool_id: shared.pool_id.clone(),
        });
        tracing::info!(
            pool_id = %shared.pool_id,
            role = shared.role.as_str(),
            "pool ready"
        );
    }

    async fn warmup_shared(shared: &Arc<PoolShared>, count: u32) {
        let mut held = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match shared.pool.acquire().await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    tracing::warn!(pool_id = %shared.pool_id, "warmup acquire failed: {}", e);
                    break;
                }
            }
        }
        tokio::time::sleep(WARMUP_HOLD).await;
        drop(held);
    }

    /// Open up to `count` connections and release them shortly after, so
    /// the first callers do not pay connection setup.
    pub async fn warmup(&self, count: u32) {
        Self::warmup_shared(&self.shared, count).await;
    }

    pub fn pool_id(&self) -> &str {
        &self.shared.pool_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.shared.cluster_id
    }

    pub fn role(&self) -> PoolRole {
        self.shared.role
    }

    pub fn max_connections(&self) -> u32 {
        self.shared.max_connections
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Block until the initializer finishes, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.ready_notify.notified();
            if self.shared.ready.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ClusterError::PoolClosed(self.shared.pool_id.clone()));
            }
            if self.shared.failed.load(Ordering::Acquire) {
                return Err(ClusterError::PoolNotReady {
                    pool_id: self.shared.pool_id.clone(),
                    reason: "initialization failed".to_string(),
                });
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClusterError::PoolNotReady {
                    pool_id: self.shared.pool_id.clone(),
                    reason: format!("not ready after {timeout:?}"),
                });
            }
        }
    }

    /// Check out a connection. Fails immediately when closed, otherwise
    /// waits for readiness and a free slot up to the acquire timeout.
    pub async fn acquire(&self) -> Result<WrappedConnection, ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::PoolClosed(self.shared.pool_id.clone()));
        }
        self.wait_ready(self.shared.acquire_timeout).await?;

        self.shared.waiting.fetch_add(1, Ordering::Relaxed);
        let result = self.shared.pool.acquire().await;
        self.shared.waiting.fetch_sub(1, Ordering::Relaxed);

        let conn = result.map_err(|e| match e {
            sqlx::Error::PoolClosed => ClusterError::PoolClosed(self.shared.pool_id.clone()),
            other => ClusterError::Driver(other),
        })?;
        self.shared.acquired.fetch_add(1, Ordering::Relaxed);

        Ok(WrappedConnection {
            conn: Some(conn),
            meta: ClusterMetadata {
                cluster_id: self.shared.cluster_id.clone(),
                schema: None,
                pool_id: self.shared.pool_id.clone(),
            },
            shared: self.shared.clone(),
            active_gauge: None,
        })
    }

    /// One-shot statement through a fresh checkout.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryOutput, ClusterError> {
        let mut conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Probe connectivity with `SELECT 1`.
    pub async fn test_connection(&self) -> bool {
        self.query("SELECT 1", &[]).await.is_ok()
    }

    /// Fold a response-time sample into the smoothed average.
    pub fn record_response_time(&self, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let mut avg = self.shared.avg_response_ms.lock().unwrap();
        *avg = if *avg == 0.0 { sample } else { (*avg + sample) / 2.0 };
    }

    pub fn avg_response_time(&self) -> f64 {
        *self.shared.avg_response_ms.lock().unwrap()
    }

    pub fn metrics(&self) -> PoolMetrics {
        let total = self.shared.pool.size() as u64;
        let idle = self.shared.pool.num_idle() as u64;
        let created = self.shared.created.load(Ordering::Relaxed);
        PoolMetrics {
            created,
            destroyed: created.saturating_sub(total),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            active: total.saturating_sub(idle),
            idle,
            waiting: self.shared.waiting.load(Ordering::Relaxed),
            total,
        }
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            pool_id: self.shared.pool_id.clone(),
            cluster_id: self.shared.cluster_id.clone(),
            role: self.shared.role,
            replica_index: self.shared.replica_index,
            ready: self.is_ready(),
            closed: self.is_closed(),
            max_connections: self.shared.max_connections,
        }
    }

    /// End the pool. Subsequent `acquire` calls fail with a closed error.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.ready_notify.notify_waiters();
        self.shared.pool.close().await;
        tracing::debug!(pool_id = %self.shared.pool_id, "pool closed");
    }

    #[cfg(test)]
    pub(crate) fn mark_ready_for_tests(&self) {
        self.shared.ready.store(true, Ordering::Release);
        self.shared.ready_notify.notify_waiters();
    }
}

/// A checked-out connection that carries its origin metadata. Dropping it
/// returns the connection to the pool and counts the release.
pub struct WrappedConnection {
    conn: Option<sqlx::pool::PoolConnection<Postgres>>,
    pub meta: ClusterMetadata,
    shared: Arc<PoolShared>,
    active_gauge: Option<Arc<AtomicU64>>,
}

impl WrappedConnection {
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.meta
    }

    pub(crate) fn attach_gauge(&mut self, gauge: Arc<AtomicU64>) {
        gauge.fetch_add(1, Ordering::Relaxed);
        self.active_gauge = Some(gauge);
    }

    /// Run one statement with JSON parameters on this connection.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutput, ClusterError> {
        let conn = self.conn.as_mut().expect("connection already released");
        Ok(fetch_output(&mut **conn, sql, params).await?)
    }

    /// Run raw SQL (possibly multiple statements) via the simple protocol.
    pub async fn execute_raw(&mut self, sql: &str) -> Result<u64, ClusterError> {
        let conn = self.conn.as_mut().expect("connection already released");
        let done = sqlx::raw_sql(sql).execute(&mut **conn).await?;
        Ok(done.rows_affected())
    }
}

impl Drop for WrappedConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.shared.released.fetch_add(1, Ordering::Relaxed);
            if let Some(gauge) = self.active_gauge.take() {
                gauge.fetch_sub(1, Ordering::Relaxed);
            }
            self.shared.events.emit(Event::ConnectionReleased {
                pool_id: self.shared.pool_id.clone(),
            });
        }
    }
}

impl std::ops::Deref for WrappedConnection {
    type Target = sqlx::pool::PoolConnection<Postgres>;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl std::ops::DerefMut for WrappedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}
