//! Redis cache backend.
//!
//! Every key is prefixed (default `pg-multiverse:`) and stored as JSON.
//! To support invalidation without `KEYS` scans, each `set` also records
//! the key in axis index sets (`schema:<s>`, `cluster:<c>`, `tag:<t>`)
//! plus a global key index; invalidations expand those sets and pipeline
//! the deletions. Access bookkeeping lives in a `<key>:meta` hash and is
//! best-effort.

use crate::{
    now_millis, CacheEntryMetadata, CacheError, CacheOptions, CacheProvider, CacheStats,
    DEFAULT_KEY_PREFIX, DEFAULT_TTL,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const KEY_INDEX: &str = "keys";

#[derive(Debug, Clone)]
pub struct RedisCacheOptions {
    pub url: String,
    pub key_prefix: String,
    pub default_ttl: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RedisCacheOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl: DEFAULT_TTL,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct RedisCache {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    options: RedisCacheOptions,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl RedisCache {
    /// Open the client and establish the first connection.
    pub async fn connect(options: RedisCacheOptions) -> Result<Self, CacheError> {
        let client = redis::Client::open(options.url.as_str())?;
        let cache = Self {
            client,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            options,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        let mut conn = cache.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| cache.fail(e))?;
        Ok(cache)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.options.key_prefix, key)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}{}:meta", self.options.key_prefix, key)
    }

    fn set_key(&self, axis: &str, value: &str) -> String {
        format!("{}{}:{}", self.options.key_prefix, axis, value)
    }

    fn index_key(&self) -> String {
        format!("{}{}", self.options.key_prefix, KEY_INDEX)
    }

    fn fail(&self, e: redis::RedisError) -> CacheError {
        self.connected.store(false, Ordering::Release);
        tracing::warn!("redis cache operation failed: {}", e);
        CacheError::Redis(e)
    }

    /// Current connection, reconnecting with linear backoff when lost.
    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut guard = self.conn.lock().await;
        if self.connected.load(Ordering::Acquire) {
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }
        for attempt in 1..=self.options.max_retries {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    *guard = Some(conn.clone());
                    self.connected.store(true, Ordering::Release);
                    if attempt > 1 {
                        tracing::info!(attempt, "redis cache reconnected");
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = self.options.max_retries,
                        "redis connect failed: {}",
                        e
                    );
                    if attempt < self.options.max_retries {
                        tokio::time::sleep(self.options.retry_delay * attempt).await;
                    }
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        Err(CacheError::Disconnected)
    }

    /// Expand axis sets and pipeline deletion of members and the sets
    /// themselves. Returns the count of keys actually deleted.
    async fn invalidate_sets(&self, set_keys: &[String]) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;

        let mut members: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for set_key in set_keys {
            let found: Vec<String> = redis::cmd("SMEMBERS")
                .arg(set_key)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.fail(e))?;
            for member in found {
                if seen.insert(member.clone()) {
                    members.push(member);
                }
            }
        }

        let index = self.index_key();
        let mut pipe = redis::pipe();
        for member in &members {
            pipe.cmd("DEL").arg(member);
            pipe.cmd("DEL").arg(format!("{member}:meta")).ignore();
            pipe.cmd("SREM").arg(&index).arg(member).ignore();
        }
        for set_key in set_keys {
            pipe.cmd("DEL").arg(set_key).ignore();
        }
        let deleted: Vec<u64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        let count: u64 = deleted.iter().sum();
        self.evictions.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        match raw {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(payload) => {
                let value: Value = serde_json::from_str(&payload)?;
                self.hits.fetch_add(1, Ordering::Relaxed);

                // Best-effort access bookkeeping; a failure must not fail
                // the read.
                let mut pipe = redis::pipe();
                pipe.cmd("HINCRBY")
                    .arg(self.meta_key(key))
                    .arg("accessCount")
                    .arg(1)
                    .ignore();
                pipe.cmd("HSET")
                    .arg(self.meta_key(key))
                    .arg("lastAccessed")
                    .arg(now_millis())
                    .ignore();
                let touched: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
                if let Err(e) = touched {
                    tracing::debug!("cache meta update failed: {}", e);
                }

                Ok(Some(value))
            }
        }
    }

    async fn set(&self, key: &str, value: Value, options: CacheOptions) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&value)?;
        let ttl = options.ttl.unwrap_or(self.options.default_ttl);
        let ttl_ms = ttl.as_millis() as u64;
        let now = now_millis();
        let full_key = self.key(key);

        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(&full_key)
            .arg(&payload)
            .arg("PX")
            .arg(ttl_ms)
            .ignore();

        let meta_key = self.meta_key(key);
        pipe.cmd("HSET")
            .arg(&meta_key)
            .arg("createdAt")
            .arg(now)
            .arg("lastAccessed")
            .arg(now)
            .arg("accessCount")
            .arg(0u64)
            .arg("size")
            .arg(payload.len())
            .arg("expiresAt")
            .arg(now + ttl_ms)
            .arg("tags")
            .arg(serde_json::to_string(&options.tags)?)
            .arg("schema")
            .arg(options.schema.as_deref().unwrap_or(""))
            .arg("cluster")
            .arg(options.cluster.as_deref().unwrap_or(""))
            .ignore();
        pipe.cmd("PEXPIRE").arg(&meta_key).arg(ttl_ms).ignore();

        let index = self.index_key();
        pipe.cmd("SADD").arg(&index).arg(&full_key).ignore();
        pipe.cmd("PEXPIRE").arg(&index).arg(ttl_ms).ignore();

        let mut axis_sets = Vec::new();
        if let Some(schema) = &options.schema {
            axis_sets.push(self.set_key("schema", schema));
        }
        if let Some(cluster) = &options.cluster {
            axis_sets.push(self.set_key("cluster", cluster));
        }
        for tag in &options.tags {
            axis_sets.push(self.set_key("tag", tag));
        }
        for set_key in &axis_sets {
            pipe.cmd("SADD").arg(set_key).arg(&full_key).ignore();
            pipe.cmd("PEXPIRE").arg(set_key).arg(ttl_ms).ignore();
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let full_key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(&full_key);
        pipe.cmd("DEL").arg(self.meta_key(key)).ignore();
        pipe.cmd("SREM").arg(self.index_key()).arg(&full_key).ignore();
        let deleted: Vec<u64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(deleted.first().copied().unwrap_or(0) > 0)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<u64, CacheError> {
        self.invalidate_sets(&[self.set_key("schema", schema)]).await
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        let sets: Vec<String> = tags.iter().map(|t| self.set_key("tag", t)).collect();
        self.invalidate_sets(&sets).await
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<u64, CacheError> {
        self.invalidate_sets(&[self.set_key("cluster", cluster)]).await
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let regex = regex::Regex::new(pattern)?;
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;

        let prefix = &self.options.key_prefix;
        let matched: Vec<String> = members
            .into_iter()
            .filter(|m| regex.is_match(m.strip_prefix(prefix.as_str()).unwrap_or(m)))
            .collect();
        if matched.is_empty() {
            return Ok(0);
        }

        let index = self.index_key();
        let mut pipe = redis::pipe();
        for member in &matched {
            pipe.cmd("DEL").arg(member);
            pipe.cmd("DEL").arg(format!("{member}:meta")).ignore();
            pipe.cmd("SREM").arg(&index).arg(member).ignore();
        }
        let deleted: Vec<u64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        let count: u64 = deleted.iter().sum();
        self.evictions.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }

    async fn stats(&self) -> CacheStats {
        let entries = match self.connection().await {
            Ok(mut conn) => {
                let count: redis::RedisResult<u64> = redis::cmd("SCARD")
                    .arg(self.index_key())
                    .query_async(&mut conn)
                    .await;
                count.unwrap_or(0)
            }
            Err(_) => 0,
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: 0.0,
        }
        .finish()
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        let mut pipe = redis::pipe();
        for member in &members {
            pipe.cmd("DEL").arg(member).ignore();
            pipe.cmd("DEL").arg(format!("{member}:meta")).ignore();
        }
        pipe.cmd("DEL").arg(self.index_key()).ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn metadata(&self, key: &str) -> Result<Option<CacheEntryMetadata>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.meta_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e))?;
        if raw.is_empty() {
            return Ok(None);
        }
        let parse = |field: &str| raw.get(field).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let tags: HashSet<String> = raw
            .get("tags")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let optional = |field: &str| {
            raw.get(field)
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };
        Ok(Some(CacheEntryMetadata {
            created_at: parse("createdAt"),
            last_accessed: parse("lastAccessed"),
            access_count: parse("accessCount"),
            size: parse("size") as usize,
            tags,
            schema: optional("schema"),
            cluster: optional("cluster"),
            expires_at: parse("expiresAt"),
        }))
    }

    async fn close(&self) {
        *self.conn.lock().await = None;
        self.connected.store(false, Ordering::Release);
    }
}

// Integration tests against a live Redis; run with
// `cargo test -p multiverse_cache -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn options() -> RedisCacheOptions {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisCacheOptions {
            key_prefix: "pg-multiverse-test:".to_string(),
            ..RedisCacheOptions::new(url)
        }
    }

    async fn fresh_cache() -> RedisCache {
        let cache = RedisCache::connect(options()).await.unwrap();
        cache.clear().await.unwrap();
        cache
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_set_get_roundtrip() {
        let cache = fresh_cache().await;
        cache
            .set("k1", json!({"n": 1}), CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some(json!({"n": 1})));
        assert!(cache.has("k1").await.unwrap());
        assert!(cache.delete("k1").await.unwrap());
        assert_eq!(cache.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_schema_invalidation_via_index_sets() {
        let cache = fresh_cache().await;
        cache
            .set(
                "u1",
                json!(1),
                CacheOptions {
                    schema: Some("users".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        cache
            .set(
                "o1",
                json!(2),
                CacheOptions {
                    schema: Some("orders".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(cache.invalidate_by_schema("users").await.unwrap(), 1);
        assert!(!cache.has("u1").await.unwrap());
        assert!(cache.has("o1").await.unwrap());
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_metadata_access_count() {
        let cache = fresh_cache().await;
        cache
            .set(
                "k",
                json!(1),
                CacheOptions {
                    tags: vec!["t1".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        cache.get("k").await.unwrap();
        cache.get("k").await.unwrap();
        let meta = cache.metadata("k").await.unwrap().unwrap();
        assert_eq!(meta.access_count, 2);
        assert!(meta.tags.contains("t1"));
    }

    #[tokio::test]
    #[serial]
    #[ignore]
    async fn test_pattern_invalidation_on_logical_keys() {
        let cache = fresh_cache().await;
        cache.set("query:a", json!(1), CacheOptions::default()).await.unwrap();
        cache.set("query:b", json!(2), CacheOptions::default()).await.unwrap();
        cache.set("other", json!(3), CacheOptions::default()).await.unwrap();

        assert_eq!(cache.invalidate_by_pattern("^query:").await.unwrap(), 2);
        assert!(cache.has("other").await.unwrap());
    }
}
