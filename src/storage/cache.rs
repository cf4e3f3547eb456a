use std::future::Future;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

/// Fast key/value cache used in front of the task store
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Return the cached value for `key`, computing and caching it on a miss.
///
/// Empty or absent computed values are not cached. There is no single-flight
/// guard: concurrent callers with the same key may all run `compute`.
pub async fn get_or_compute<F, Fut>(cache: &dyn Cache, key: &str, compute: F) -> Result<Option<String>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    match cache.get(key).await {
        Ok(Some(value)) => {
            debug!("Cache hit: {}", key);
            return Ok(Some(value));
        }
        Ok(None) => {}
        Err(e) => warn!("Cache lookup failed for {}: {}", key, e),
    }

    let value = match compute().await? {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(None),
    };

    if let Err(e) = cache.set(key, &value).await {
        warn!("Failed to populate cache for {}: {}", key, e);
    }

    Ok(Some(value))
}

/// Redis backed cache with a fixed entry lifetime
pub struct RedisCache {
    /// Shared multiplexed connection
    conn: MultiplexedConnection,

    /// Entry lifetime in seconds
    ttl: u64,
}

impl RedisCache {
    pub async fn new(client: &Client, ttl: u64) -> Result<Self> {
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection for cache")?;

        Ok(Self { conn, ttl })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .context("Failed to read cache entry")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, self.ttl as usize)
            .await
            .context("Failed to write cache entry")?;
        Ok(())
    }
}
