//! Fallback wrapper: a primary provider backed by a secondary one.
//!
//! Reads prefer the primary while it is healthy and fall back otherwise.
//! Writes go to the primary when healthy and always also to the fallback,
//! so a primary outage serves recent entries from the secondary. Deletes
//! and invalidations fan out to both.

use crate::{
    CacheEntryMetadata, CacheError, CacheOptions, CacheProvider, CacheStats,
};
use async_trait::async_trait;
use multiverse_core::events::{Event, EventBus};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct FallbackCache {
    primary: Arc<dyn CacheProvider>,
    fallback: Arc<dyn CacheProvider>,
    sync_on_reconnect: bool,
    primary_was_healthy: AtomicBool,
    events: EventBus,
}

impl FallbackCache {
    pub fn new(
        primary: Arc<dyn CacheProvider>,
        fallback: Arc<dyn CacheProvider>,
        sync_on_reconnect: bool,
        events: EventBus,
    ) -> Self {
        let healthy = primary.is_healthy();
        Self {
            primary,
            fallback,
            sync_on_reconnect,
            primary_was_healthy: AtomicBool::new(healthy),
            events,
        }
    }

    /// Track primary health transitions; recovery emits a sync event so a
    /// host can re-warm the primary from the fallback.
    fn observe_primary(&self) -> bool {
        let healthy = self.primary.is_healthy();
        let was = self.primary_was_healthy.swap(healthy, Ordering::AcqRel);
        if healthy && !was {
            tracing::info!("primary cache provider recovered");
            if self.sync_on_reconnect {
                self.events.emit(Event::CacheSync);
            }
        }
        healthy
    }
}

#[async_trait]
impl CacheProvider for FallbackCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if self.observe_primary() {
            match self.primary.get(key).await {
                Ok(value) => return Ok(value),
                Err(e) => tracing::warn!("primary cache get failed, using fallback: {}", e),
            }
        }
        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError> {
        if self.observe_primary() {
            if let Err(e) = self.primary.set(key, value.clone(), options.clone()).await {
                tracing::warn!("primary cache set failed: {}", e);
            }
        }
        self.fallback.set(key, value, options).await
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        if self.observe_primary() {
            if let Ok(true) = self.primary.has(key).await {
                return Ok(true);
            }
        }
        self.fallback.has(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let primary = if self.observe_primary() {
            self.primary.delete(key).await.unwrap_or(false)
        } else {
            false
        };
        let fallback = self.fallback.delete(key).await?;
        Ok(primary || fallback)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<u64, CacheError> {
        let healthy = self.observe_primary();
        let primary = if healthy {
            self.primary.invalidate_by_schema(schema).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_schema(schema).await?;
        Ok(if healthy { primary } else { fallback })
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        let healthy = self.observe_primary();
        let primary = if healthy {
            self.primary.invalidate_by_tags(tags).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_tags(tags).await?;
        Ok(if healthy { primary } else { fallback })
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<u64, CacheError> {
        let healthy = self.observe_primary();
        let primary = if healthy {
            self.primary.invalidate_by_cluster(cluster).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_cluster(cluster).await?;
        Ok(if healthy { primary } else { fallback })
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let healthy = self.observe_primary();
        let primary = if healthy {
            self.primary.invalidate_by_pattern(pattern).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_pattern(pattern).await?;
        Ok(if healthy { primary } else { fallback })
    }

    async fn stats(&self) -> CacheStats {
        if self.observe_primary() {
            self.primary.stats().await
        } else {
            self.fallback.stats().await
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        if self.observe_primary() {
            if let Err(e) = self.primary.clear().await {
                tracing::warn!("primary cache clear failed: {}", e);
            }
        }
        self.fallback.clear().await
    }

    fn is_healthy(&self) -> bool {
        self.primary.is_healthy() || self.fallback.is_healthy()
    }

    async fn metadata(&self, key: &str) -> Result<Option<CacheEntryMetadata>, CacheError> {
        if self.observe_primary() {
            if let Ok(Some(meta)) = self.primary.metadata(key).await {
                return Ok(Some(meta));
            }
        }
        self.fallback.metadata(key).await
    }

    async fn close(&self) {
        self.primary.close().await;
        self.fallback.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCache, MemoryCacheOptions};
    use serde_json::json;
    use std::collections::HashSet;

    /// A provider that is permanently unhealthy, for exercising the
    /// fallback path without a Redis outage.
    struct DeadCache;

    #[async_trait]
    impl CacheProvider for DeadCache {
        async fn get(&self, _key: &str) -> Result<Option<Value>, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn set(
            &self,
            _key: &str,
            _value: Value,
            _options: CacheOptions,
        ) -> Result<(), CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn has(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn invalidate_by_schema(&self, _schema: &str) -> Result<u64, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn invalidate_by_tags(&self, _tags: &[String]) -> Result<u64, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn invalidate_by_cluster(&self, _cluster: &str) -> Result<u64, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn invalidate_by_pattern(&self, _pattern: &str) -> Result<u64, CacheError> {
            Err(CacheError::Disconnected)
        }
        async fn stats(&self) -> CacheStats {
            CacheStats::default()
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::Disconnected)
        }
        fn is_healthy(&self) -> bool {
            false
        }
        async fn metadata(&self, _key: &str) -> Result<Option<CacheEntryMetadata>, CacheError> {
            Ok(None)
        }
    }

    /// Healthy in-memory stand-in whose health can be flipped.
    struct FlakyCache {
        inner: MemoryCache,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl CacheProvider for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: Value,
            options: CacheOptions,
        ) -> Result<(), CacheError> {
            self.inner.set(key, value, options).await
        }
        async fn has(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.has(key).await
        }
        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }
        async fn invalidate_by_schema(&self, schema: &str) -> Result<u64, CacheError> {
            self.inner.invalidate_by_schema(schema).await
        }
        async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
            self.inner.invalidate_by_tags(tags).await
        }
        async fn invalidate_by_cluster(&self, cluster: &str) -> Result<u64, CacheError> {
            self.inner.invalidate_by_cluster(cluster).await
        }
        async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
            self.inner.invalidate_by_pattern(pattern).await
        }
        async fn stats(&self) -> CacheStats {
            self.inner.stats().await
        }
        async fn clear(&self) -> Result<(), CacheError> {
            self.inner.clear().await
        }
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }
        async fn metadata(&self, key: &str) -> Result<Option<CacheEntryMetadata>, CacheError> {
            self.inner.metadata(key).await
        }
    }

    fn memory() -> Arc<dyn CacheProvider> {
        Arc::new(MemoryCache::new(
            MemoryCacheOptions::default(),
            EventBus::new(),
        ))
    }

    #[tokio::test]
    async fn test_unhealthy_primary_serves_from_fallback() {
        let cache = FallbackCache::new(Arc::new(DeadCache), memory(), false, EventBus::new());

        cache.set("k", json!(1), CacheOptions::default()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
        assert!(cache.is_healthy());
    }

    #[tokio::test]
    async fn test_set_writes_to_both_when_primary_healthy() {
        let primary = memory();
        let fallback = memory();
        let cache = FallbackCache::new(primary.clone(), fallback.clone(), false, EventBus::new());

        cache.set("k", json!(2), CacheOptions::default()).await.unwrap();
        assert_eq!(primary.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(fallback.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_invalidation_fans_out() {
        let primary = memory();
        let fallback = memory();
        let cache = FallbackCache::new(primary.clone(), fallback.clone(), false, EventBus::new());
        let options = CacheOptions {
            schema: Some("users".to_string()),
            ..Default::default()
        };
        cache.set("k", json!(1), options).await.unwrap();

        assert_eq!(cache.invalidate_by_schema("users").await.unwrap(), 1);
        assert_eq!(primary.get("k").await.unwrap(), None);
        assert_eq!(fallback.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_event_on_primary_recovery() {
        let flaky = Arc::new(FlakyCache {
            inner: MemoryCache::new(MemoryCacheOptions::default(), EventBus::new()),
            healthy: AtomicBool::new(false),
        });
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let cache = FallbackCache::new(flaky.clone(), memory(), true, events);

        // Primary down: reads come from the fallback, no sync yet.
        assert_eq!(cache.get("k").await.unwrap(), None);

        flaky.healthy.store(true, Ordering::Release);
        let _ = cache.get("k").await.unwrap();

        let mut kinds = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            kinds.insert(event.kind());
        }
        assert!(kinds.contains("cacheSync"));
    }
}
