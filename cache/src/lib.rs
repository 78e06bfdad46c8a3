//! Result caching for pg-multiverse.
//!
//! Three providers share one trait:
//! - [`MemoryCache`]: in-process store with absolute-expiry TTL, a
//!   background sweeper, and LRU/LFU/FIFO eviction at capacity
//! - [`RedisCache`]: shared store with a key prefix, JSON values, and
//!   axis index sets backing the invalidation operations
//! - [`FallbackCache`]: wraps a primary provider with a memory fallback
//!   so cache outages degrade instead of failing reads
//!
//! Entries carry tags plus optional schema and cluster attribution, so
//! invalidation can target any of those axes or a key pattern.

mod fallback;
mod memory;
mod redis;

pub use fallback::FallbackCache;
pub use memory::{MemoryCache, MemoryCacheOptions};
pub use self::redis::{RedisCache, RedisCacheOptions};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_KEY_PREFIX: &str = "pg-multiverse:";
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Cache backend disconnected")]
    Disconnected,
}

/// How the memory backend picks a victim at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionStrategy {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

/// Per-entry options for [`CacheProvider::set`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub schema: Option<String>,
    pub cluster: Option<String>,
}

/// Bookkeeping attached to a cached entry.
#[derive(Debug, Clone)]
pub struct CacheEntryMetadata {
    pub created_at: u64,
    pub last_accessed: u64,
    pub access_count: u64,
    pub size: usize,
    pub tags: HashSet<String>,
    pub schema: Option<String>,
    pub cluster: Option<String>,
    /// Absolute expiry, wall-clock milliseconds since the epoch.
    pub expires_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub(crate) fn finish(mut self) -> Self {
        let lookups = self.hits + self.misses;
        self.hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };
        self
    }
}

/// Keyed JSON store with TTL and multi-axis invalidation.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError>;

    async fn has(&self, key: &str) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove entries attributed to `schema`; returns how many went away.
    async fn invalidate_by_schema(&self, schema: &str) -> Result<u64, CacheError>;

    /// Remove entries whose tag set intersects `tags`.
    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError>;

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<u64, CacheError>;

    /// Remove entries whose key matches the regular expression.
    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    async fn stats(&self) -> CacheStats;

    async fn clear(&self) -> Result<(), CacheError>;

    fn is_healthy(&self) -> bool;

    async fn metadata(&self, key: &str) -> Result<Option<CacheEntryMetadata>, CacheError>;

    async fn close(&self) {}
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
