//! Typed event channel surfaced to callers.
//!
//! Components publish through a shared [`EventBus`]; callers subscribe and
//! receive every event kind as one [`Event`] enum with fixed payloads.
//! Fan-out uses a tokio broadcast channel, so a slow subscriber lags and
//! drops events instead of blocking emitters.

use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a cache entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Ttl,
    Size,
    Manual,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ttl => "ttl",
            Self::Size => "size",
            Self::Manual => "manual",
        }
    }
}

/// Every event the coordination layer surfaces to callers.
#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    Closed,
    Error {
        message: String,
    },
    ClusterRegistered {
        cluster_id: String,
    },
    ClusterDown {
        cluster_id: String,
        reason: String,
    },
    ClusterUp {
        cluster_id: String,
    },
    ClusterRecovered {
        cluster_id: String,
        downtime: Duration,
    },
    Failover {
        cluster_id: String,
        new_primary: String,
        old_primary: String,
    },
    PoolReady {
        pool_id: String,
    },
    ConnectionReleased {
        pool_id: String,
    },
    QueryExecuted {
        sql: String,
        params: Vec<serde_json::Value>,
        duration: Duration,
        cluster_id: String,
    },
    QueryError {
        sql: String,
        error: String,
        cluster_id: Option<String>,
    },
    CacheHit {
        key: String,
    },
    CacheMiss {
        key: String,
    },
    CacheEviction {
        key: String,
        reason: EvictionReason,
    },
    /// The fallback cache detected its primary provider coming back.
    CacheSync,
    TransactionStarted {
        id: Uuid,
        clusters: Vec<String>,
    },
    TransactionCommitted {
        id: Uuid,
        distributed: bool,
    },
    TransactionAborted {
        id: Uuid,
        reason: String,
    },
    SchemaRegistered {
        schema: String,
        cluster_id: String,
    },
    ConfigReloaded,
    MigrationStarted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    MigrationCompleted {
        version: String,
        schema: String,
        cluster_id: String,
        execution_time: Duration,
    },
    MigrationFailed {
        version: String,
        schema: String,
        cluster_id: String,
        error: String,
    },
    RollbackStarted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    RollbackCompleted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    RollbackFailed {
        version: String,
        schema: String,
        cluster_id: String,
        error: String,
    },
}

impl Event {
    /// Stable label for log lines and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Closed => "closed",
            Self::Error { .. } => "error",
            Self::ClusterRegistered { .. } => "clusterRegistered",
            Self::ClusterDown { .. } => "clusterDown",
            Self::ClusterUp { .. } => "clusterUp",
            Self::ClusterRecovered { .. } => "clusterRecovered",
            Self::Failover { .. } => "failover",
            Self::PoolReady { .. } => "poolReady",
            Self::ConnectionReleased { .. } => "connectionReleased",
            Self::QueryExecuted { .. } => "queryExecuted",
            Self::QueryError { .. } => "queryError",
            Self::CacheHit { .. } => "cacheHit",
            Self::CacheMiss { .. } => "cacheMiss",
            Self::CacheEviction { .. } => "cacheEviction",
            Self::CacheSync => "cacheSync",
            Self::TransactionStarted { .. } => "transactionStarted",
            Self::TransactionCommitted { .. } => "transactionCommitted",
            Self::TransactionAborted { .. } => "transactionAborted",
            Self::SchemaRegistered { .. } => "schemaRegistered",
            Self::ConfigReloaded => "configReloaded",
            Self::MigrationStarted { .. } => "migrationStarted",
            Self::MigrationCompleted { .. } => "migrationCompleted",
            Self::MigrationFailed { .. } => "migrationFailed",
            Self::RollbackStarted { .. } => "rollbackStarted",
            Self::RollbackCompleted { .. } => "rollbackCompleted",
            Self::RollbackFailed { .. } => "rollbackFailed",
        }
    }
}

/// Cloneable handle to the broadcast channel all components publish on.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.emit(Event::Initialized);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::ClusterUp {
            cluster_id: "a".into(),
        });
        bus.emit(Event::ClusterDown {
            cluster_id: "a".into(),
            reason: "probe failed".into(),
        });

        assert_eq!(rx.recv().await.unwrap().kind(), "clusterUp");
        assert_eq!(rx.recv().await.unwrap().kind(), "clusterDown");
    }

    #[test]
    fn test_eviction_reason_labels() {
        assert_eq!(EvictionReason::Ttl.as_str(), "ttl");
        assert_eq!(EvictionReason::Size.as_str(), "size");
        assert_eq!(EvictionReason::Manual.as_str(), "manual");
    }
}
