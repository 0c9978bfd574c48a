//! Shared store over a pooled Redis connection.
//!
//! Conditional writes run as Lua scripts, so each is one atomic step on the
//! server for every replica sharing the instance.

use std::time::Duration;

use deadpool_redis::{
    redis::{cmd, AsyncCommands, Script},
    Config, Connection, Pool, Runtime,
};

use crate::error::{ConnectionError, Result, StorageError};
use crate::storage::Storage;

/// `INCR`, setting the expiry only when the key was just created.
///
/// KEYS[1] = key, ARGV[1] = ttl in ms (0 = none)
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = tonumber(ARGV[1])
if count == 1 and ttl > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return count
"#;

/// Replace the value only if it still equals the expected one.
///
/// KEYS[1] = key, ARGV[1] = '1' if a value is expected else '0',
/// ARGV[2] = expected value, ARGV[3] = new value, ARGV[4] = ttl in ms (0 = none)
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Connection settings for [`RedisStorage`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Server URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Prepended to every state key.
    pub key_prefix: String,
    /// Bound on the startup connect and ping.
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "rl:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Defaults pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Prefix every key, e.g. `myapp:rl:`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Cap the pooled connections.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Bound the startup connect and ping.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// [`Storage`] over Redis, shared by every replica pointed at the same server.
///
/// ```ignore
/// use admit_ratelimit::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:rl:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
    increment_script: Script,
    cas_script: Script,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Build the pool and check the server answers `PING`.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = Config::from_url(&config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        let ping = async {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
            let _: () = cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
            Ok::<_, ConnectionError>(())
        };
        tokio::time::timeout(config.connection_timeout, ping)
            .await
            .map_err(|_| ConnectionError::Timeout(config.connection_timeout))??;

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
            increment_script: Script::new(INCREMENT_SCRIPT),
            cas_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    /// [`new`](Self::new) with default settings.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| StorageError::PoolExhausted.into())
    }
}

/// Longest expiry sent to the server. Redis rejects expiries that overflow
/// its millisecond clock, so anything longer is stored without one.
const MAX_TTL_MILLIS: u64 = i64::MAX as u64 / 2;

/// Expiry in milliseconds as the scripts expect it; 0 means none.
fn ttl_millis(ttl: Option<Duration>) -> u64 {
    match ttl.map(|ttl| ttl.as_millis()) {
        Some(ms) if ms > u128::from(MAX_TTL_MILLIS) => 0,
        Some(ms) => (ms as u64).max(1),
        None => 0,
    }
}

fn operation_failed(err: deadpool_redis::redis::RedisError) -> StorageError {
    let retryable = err.is_timeout() || err.is_connection_dropped() || err.is_io_error();
    StorageError::operation_failed(err.to_string(), retryable)
}

impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);

        let result: Option<String> = conn.get(&full_key).await.map_err(operation_failed)?;
        Ok(result)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);

        match ttl_millis(ttl) {
            0 => conn.set::<_, _, ()>(&full_key, value).await,
            ms => conn.pset_ex::<_, _, ()>(&full_key, value, ms).await,
        }
        .map_err(operation_failed)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);

        conn.del::<_, ()>(&full_key).await.map_err(operation_failed)?;

        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);

        let count: i64 = self
            .increment_script
            .key(&full_key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                // INCR refuses values that are not integers
                if e.to_string().contains("not an integer") {
                    StorageError::corrupted(key, e.to_string())
                } else {
                    operation_failed(e)
                }
            })?;

        u64::try_from(count).map_err(|_| StorageError::corrupted(key, format!("negative counter {count}")).into())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let full_key = self.full_key(key);

        let swapped: i64 = self
            .cas_script
            .key(&full_key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(operation_failed)?;

        Ok(swapped == 1)
    }
}
