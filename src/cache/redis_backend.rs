//! Redis-backed shared tier.
//!
//! Keys are stored as `{key_prefix}{key}`; `KEYS` results are stripped of the
//! prefix before they reach the cache store. `KEYS` is O(n) on the Redis side,
//! which is tolerable for the short-lived, bounded keyspace this gateway
//! writes.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{CacheError, CacheResult};
use super::shared::{escape_glob, SharedBackend};

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Prepended to every key.
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "unblock:".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

pub struct RedisBackend {
    client: Client,
    config: RedisConfig,
    conn: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Validates the URL. No connection is made until [`SharedBackend::connect`].
    pub fn new(config: RedisConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| CacheError::Connection(format!("URL de Redis inválida: {}", e)))?;

        Ok(Self {
            client,
            config,
            conn: RwLock::new(None),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| CacheError::Connection("Redis no conectado".to_string()))
    }

    /// Drops the cached connection when Redis reports it gone.
    async fn check<T>(&self, result: redis::RedisResult<T>) -> CacheResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = CacheError::from(e);
                if err.is_connection_loss() {
                    self.conn.write().await.take();
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

/// Maps a `PTTL` reply: `-1` never expires, `-2` (gone) and `0` are misses.
fn remaining_lifetime(pttl: i64) -> Option<Option<Duration>> {
    match pttl {
        -1 => Some(None),
        ms if ms > 0 => Some(Some(Duration::from_millis(ms as u64))),
        _ => None,
    }
}

#[async_trait]
impl SharedBackend for RedisBackend {
    async fn connect(&self) -> CacheResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CacheError::Connection(format!("Redis connection error: {}", e)))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::Connection(format!("Redis PING failed: {}", e)))?;

        *self.conn.write().await = Some(conn);
        debug!("Redis PING OK");
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection().await?;
        let result = conn.get::<_, Option<String>>(self.prefixed(key)).await;
        self.check(result).await
    }

    async fn get_with_ttl(&self, key: &str) -> CacheResult<Option<(String, Option<Duration>)>> {
        let mut conn = self.connection().await?;
        let key = self.prefixed(key);

        let result = redis::pipe()
            .atomic()
            .get(&key)
            .pttl(&key)
            .query_async::<(Option<String>, i64)>(&mut conn)
            .await;
        let (value, pttl) = self.check(result).await?;

        Ok(value.and_then(|value| remaining_lifetime(pttl).map(|ttl| (value, ttl))))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let key = self.prefixed(key);

        let result = match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis).await
            }
            None => conn.set::<_, _, ()>(key, value).await,
        };
        self.check(result).await
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let full: Vec<String> = keys.iter().map(|k| self.prefixed(k)).collect();
        let result = conn.del::<_, u64>(full).await;
        self.check(result).await
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let full_pattern = format!("{}{}", escape_glob(&self.config.key_prefix), pattern);
        let result = conn.keys::<_, Vec<String>>(full_pattern).await;
        let keys = self.check(result).await?;

        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.config.key_prefix).map(str::to_string))
            .collect())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
