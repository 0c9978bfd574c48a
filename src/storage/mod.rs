//! Storage backend trait and implementations.
//!
//! The shared store is an external key-value service. This module defines the
//! handful of primitives the algorithms need from it, along with adapters for
//! an in-process map and for Redis.
//!
//! Values are plain strings; turning them into algorithm state is the job of
//! [`crate::codec`].

#[cfg(feature = "memory")]
mod memory_gc;
#[cfg(feature = "redis")]
mod redis_cluster;

#[cfg(feature = "memory")]
pub use memory_gc::{GcConfig, GcInterval, MemoryStorage};

// RedisStorage with connection pooling
#[cfg(feature = "redis")]
pub use redis_cluster::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Storage backend trait for rate limiting state.
///
/// All storage operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`).
///
/// # Required Operations
///
/// - `get`: Retrieve a value, distinguishing absent keys
/// - `set`: Store a value with an optional TTL
/// - `delete`: Remove a value
/// - `increment`: Atomically increment a counter
/// - `compare_and_swap`: Conditionally replace a value
///
/// # Example
///
/// ```ignore
/// use admit_ratelimit::storage::Storage;
///
/// async fn example<S: Storage>(storage: &S) -> admit_ratelimit::Result<()> {
///     storage.set("key", "1".to_string(), Some(Duration::from_secs(60))).await?;
///
///     if let Some(value) = storage.get("key").await? {
///         println!("Value: {}", value);
///     }
///     Ok(())
/// }
/// ```
pub trait Storage: Send + Sync + 'static {
    /// Get a value by key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Set a value, expiring after `ttl` if given.
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete a value.
    ///
    /// Returns success even if the key didn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Atomically increment an integer counter by one.
    ///
    /// A missing key counts as 0. The TTL is applied only when the increment
    /// creates the key. Returns the count AFTER incrementing; fails with
    /// [`crate::StorageError::Corrupted`] if the stored value is not an integer.
    fn increment(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Compare-and-swap operation.
    ///
    /// If the current value equals `expected` (`None` meaning the key is
    /// absent), it is replaced with `new`. Returns `true` if the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        (**self).increment(key, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        (**self).increment(key, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
