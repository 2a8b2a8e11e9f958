/*!
Fast expiring cache back-ends for the L1 tier:

* **InMemoryFastCache** – in-process LRU with per-entry TTL (dev / single instance).
* **RedisFastCache** – shared Redis cache behind the `with-redis` feature.
*/
use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

#[cfg(feature = "with-redis")]
use {
    anyhow::anyhow,
    bb8::Pool,
    bb8_redis::{redis::AsyncCommands, RedisConnectionManager},
    tracing::info,
};

/// Client contract for a fast, expiring key/value cache.
#[async_trait]
pub trait FastCacheBackend: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Hit/miss counters for cache back-ends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheSlot {
    value: Vec<u8>,
    expires_at: Instant,
}

/// LRU cache with TTL; expired entries are dropped on read.
pub struct InMemoryFastCache {
    inner: Mutex<LruCache<String, CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryFastCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.lock().len(),
        }
    }
}

impl Default for InMemoryFastCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl FastCacheBackend for InMemoryFastCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let slot = CacheSlot {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().put(key.to_string(), slot);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cache = self.inner.lock();
        let now = Instant::now();

        let hit = match cache.get(key) {
            Some(slot) if slot.expires_at > now => Some(slot.value.clone()),
            Some(_) => {
                debug!("Cache entry for {} expired", key);
                cache.pop(key);
                None
            }
            None => None,
        };

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(hit)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().pop(key);
        Ok(())
    }
}

/// Redis distributed cache for multi-instance deployments.
#[cfg(feature = "with-redis")]
pub struct RedisFastCache {
    pool: Pool<RedisConnectionManager>,
    key_prefix: String,
}

#[cfg(feature = "with-redis")]
impl RedisFastCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let manager = RedisConnectionManager::new(redis_url)?;
        let pool = Pool::builder().max_size(10).build(manager).await?;

        // Fail at startup rather than on the first mirror write.
        let _conn = pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self {
            pool,
            key_prefix: "amp:memory:".to_string(),
        })
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[cfg(feature = "with-redis")]
#[async_trait]
impl FastCacheBackend for RedisFastCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.make_key(key), value, seconds).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        let value: Option<Vec<u8>> = conn.get(self.make_key(key)).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))?;
        conn.del::<_, ()>(self.make_key(key)).await?;
        Ok(())
    }
}
