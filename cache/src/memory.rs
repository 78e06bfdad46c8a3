//! In-process cache backend.
//!
//! TTL is absolute (`now + ttl` at insert). A sweeper task evicts expired
//! entries every 60 seconds; expired entries hit on access are removed
//! there and then. At `max_size` the configured strategy picks one victim
//! before the insert goes through.

use crate::{
    now_millis, CacheEntryMetadata, CacheError, CacheOptions, CacheProvider, CacheStats,
    EvictionStrategy, DEFAULT_MAX_SIZE, DEFAULT_TTL,
};
use async_trait::async_trait;
use multiverse_core::events::{Event, EventBus, EvictionReason};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: Value,
    expires_at: u64,
    created_at: u64,
    last_accessed: u64,
    access_count: u64,
    size: usize,
    tags: HashSet<String>,
    schema: Option<String>,
    cluster: Option<String>,
}

impl Entry {
    fn metadata(&self) -> CacheEntryMetadata {
        CacheEntryMetadata {
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size: self.size,
            tags: self.tags.clone(),
            schema: self.schema.clone(),
            cluster: self.cluster.clone(),
            expires_at: self.expires_at,
        }
    }
}

struct MemoryShared {
    entries: Mutex<HashMap<String, Entry>>,
    max_size: usize,
    strategy: EvictionStrategy,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    events: EventBus,
}

#[derive(Debug, Clone)]
pub struct MemoryCacheOptions {
    pub max_size: usize,
    pub strategy: EvictionStrategy,
    pub default_ttl: Duration,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            strategy: EvictionStrategy::default(),
            default_ttl: DEFAULT_TTL,
        }
    }
}

pub struct MemoryCache {
    shared: Arc<MemoryShared>,
    sweeper: CancellationToken,
}

impl MemoryCache {
    pub fn new(options: MemoryCacheOptions, events: EventBus) -> Self {
        let shared = Arc::new(MemoryShared {
            entries: Mutex::new(HashMap::new()),
            max_size: options.max_size.max(1),
            strategy: options.strategy,
            default_ttl: options.default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            events,
        });

        let sweeper = CancellationToken::new();
        let token = sweeper.clone();
        let sweep_shared = shared.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh cache
            // does not sweep an empty map.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        Self::sweep_expired(&sweep_shared);
                    }
                }
            }
        });

        Self { shared, sweeper }
    }

    fn sweep_expired(shared: &Arc<MemoryShared>) {
        let now = now_millis();
        let mut entries = shared.entries.lock().unwrap();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.remove(&key);
            shared.evictions.fetch_add(1, Ordering::Relaxed);
            shared.events.emit(Event::CacheEviction {
                key,
                reason: EvictionReason::Ttl,
            });
        }
    }

    /// Pick the victim under the configured strategy: smallest
    /// `last_accessed` (LRU), `access_count` (LFU), or `created_at` (FIFO).
    fn evict_one(&self, entries: &mut HashMap<String, Entry>) {
        let victim = match self.shared.strategy {
            EvictionStrategy::Lru => entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Lfu => entries
                .iter()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(k, _)| k.clone()),
            EvictionStrategy::Fifo => entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            entries.remove(&key);
            self.shared.evictions.fetch_add(1, Ordering::Relaxed);
            self.shared.events.emit(Event::CacheEviction {
                key,
                reason: EvictionReason::Size,
            });
        }
    }

    fn remove_matching(&self, predicate: impl Fn(&str, &Entry) -> bool) -> u64 {
        let mut entries = self.shared.entries.lock().unwrap();
        let victims: Vec<String> = entries
            .iter()
            .filter(|(k, e)| predicate(k, e))
            .map(|(k, _)| k.clone())
            .collect();
        let count = victims.len() as u64;
        for key in victims {
            entries.remove(&key);
            self.shared.events.emit(Event::CacheEviction {
                key,
                reason: EvictionReason::Manual,
            });
        }
        count
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = now_millis();
        let mut entries = self.shared.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.access_count += 1;
                entry.last_accessed = now;
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                self.shared.events.emit(Event::CacheEviction {
                    key: key.to_string(),
                    reason: EvictionReason::Ttl,
                });
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError> {
        let now = now_millis();
        let ttl = options.ttl.unwrap_or(self.shared.default_ttl);
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);

        let mut entries = self.shared.entries.lock().unwrap();
        if !entries.contains_key(key) && entries.len() >= self.shared.max_size {
            self.evict_one(&mut entries);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl.as_millis() as u64,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                size,
                tags: options.tags.into_iter().collect(),
                schema: options.schema,
                cluster: options.cluster,
            },
        );
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let now = now_millis();
        let entries = self.shared.entries.lock().unwrap();
        Ok(entries.get(key).map(|e| e.expires_at > now).unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.shared.entries.lock().unwrap().remove(key).is_some();
        if removed {
            self.shared.events.emit(Event::CacheEviction {
                key: key.to_string(),
                reason: EvictionReason::Manual,
            });
        }
        Ok(removed)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<u64, CacheError> {
        Ok(self.remove_matching(|_, e| e.schema.as_deref() == Some(schema)))
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        Ok(self.remove_matching(|_, e| tags.iter().any(|t| e.tags.contains(t))))
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<u64, CacheError> {
        Ok(self.remove_matching(|_, e| e.cluster.as_deref() == Some(cluster)))
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let regex = Regex::new(pattern)?;
        Ok(self.remove_matching(|k, _| regex.is_match(k)))
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            entries: self.shared.entries.lock().unwrap().len() as u64,
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            hit_rate: 0.0,
        }
        .finish()
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.shared.entries.lock().unwrap().clear();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn metadata(&self, key: &str) -> Result<Option<CacheEntryMetadata>, CacheError> {
        Ok(self
            .shared
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(Entry::metadata))
    }

    async fn close(&self) {
        self.sweeper.cancel();
    }
}
