//! Process-local store backed by a sharded map.
//!
//! Expired keys are swept lazily on read and periodically by a sweeper.
//! Only replicas in the same process share limits through it; separate
//! processes need the Redis store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, StorageError};
use crate::storage::{current_timestamp_ms, Storage};

/// When the sweeper runs.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// After every N store operations.
    Requests(u64),
    /// On a background timer.
    Duration(Duration),
    /// Only through [`MemoryStorage::run_gc`].
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10000)
    }
}

/// Sweeper settings.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// Sweep schedule.
    pub interval: GcInterval,
    /// Idle age after which entries without a TTL are dropped.
    ///
    /// `None` keeps them until deleted.
    pub max_age: Option<Duration>,
}

impl GcConfig {
    /// Sweep every `count` operations.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count),
            ..Default::default()
        }
    }

    /// Sweep on a timer.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval),
            ..Default::default()
        }
    }

    /// Never sweep automatically.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
            ..Default::default()
        }
    }

    /// Drop TTL-less entries untouched for longer than `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Stored value plus its expiry in epoch milliseconds.
#[derive(Debug, Clone)]
struct InternalEntry {
    value: String,
    expires_at: Option<u64>,
    last_update: u64,
}

impl InternalEntry {
    fn new(value: String, ttl: Option<Duration>, now: u64) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| {
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                now.saturating_add(ttl_ms)
            }),
            last_update: now,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// [`Storage`] over a `DashMap`.
///
/// `increment` and `compare_and_swap` hold the shard lock of their key for
/// the whole read-modify-write.
///
/// ```ignore
/// use admit_ratelimit::storage::{GcConfig, MemoryStorage};
/// use std::time::Duration;
///
/// let storage = MemoryStorage::new();
/// let swept = MemoryStorage::with_gc(GcConfig::on_duration(Duration::from_secs(30)));
/// let manual = MemoryStorage::with_gc(GcConfig::manual());
/// manual.run_gc().await;
/// ```
pub struct MemoryStorage {
    data: Arc<DashMap<String, InternalEntry>>,
    gc_config: GcConfig,
    request_count: AtomicU64,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.data.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Store that sweeps every 10000 operations.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Store with an explicit sweep schedule.
    ///
    /// A timer schedule spawns the sweeper, so this needs a Tokio runtime.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        let storage = Self {
            data: Arc::new(DashMap::new()),
            gc_config: gc_config.clone(),
            request_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        };

        if let GcInterval::Duration(interval) = gc_config.interval {
            storage.start_gc_task(interval);
        }

        storage
    }

    fn start_gc_task(&self, interval: Duration) {
        let data = Arc::clone(&self.data);
        let max_age = self.gc_config.max_age;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        run_gc_on_map(&data, max_age);
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Sweep expired and idle entries now.
    pub async fn run_gc(&self) {
        run_gc_on_map(&self.data, self.gc_config.max_age);
    }

    /// Number of keys held, expired or not.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no keys are held.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.data.clear();
    }

    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count % threshold == 0 && count > 0 {
                // Skip if another caller is already sweeping
                if let Some(_guard) = self.gc_lock.try_lock() {
                    run_gc_on_map(&self.data, self.gc_config.max_age);
                }
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn run_gc_on_map(data: &DashMap<String, InternalEntry>, max_age: Option<Duration>) {
    let now = current_timestamp_ms();
    let idle_cutoff = max_age.map(|age| now.saturating_sub(age.as_millis() as u64));

    data.retain(|_, entry| match entry.expires_at {
        Some(_) => !entry.is_expired(now),
        None => idle_cutoff.is_none_or(|cutoff| entry.last_update > cutoff),
    });
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        if let Some(internal) = self.data.get(key) {
            if !internal.is_expired(now) {
                return Ok(Some(internal.value.clone()));
            }
        }
        // Entry missing or expired; drop it only if it is still expired
        self.data.remove_if(key, |_, internal| internal.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        self.data
            .insert(key.to_string(), InternalEntry::new(value, ttl, now));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<u64> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let internal = occupied.get_mut();
                if internal.is_expired(now) {
                    *internal = InternalEntry::new("1".to_string(), ttl, now);
                    return Ok(1);
                }
                let count: u64 = internal
                    .value
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| StorageError::corrupted(key, e.to_string()))?;
                let count = count + 1;
                internal.value = count.to_string();
                internal.last_update = now;
                Ok(count)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(InternalEntry::new("1".to_string(), ttl, now));
                Ok(1)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.maybe_run_gc();

        let now = current_timestamp_ms();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let matches = {
                    let internal = occupied.get();
                    let current = (!internal.is_expired(now)).then_some(internal.value.as_str());
                    current == expected
                };
                if matches {
                    occupied.insert(InternalEntry::new(new, ttl, now));
                }
                Ok(matches)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(InternalEntry::new(new, ttl, now));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_basic() {
        let storage = MemoryStorage::new();

        storage
            .set("key1", "5".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let result = storage.get("key1").await.unwrap();
        assert_eq!(result.as_deref(), Some("5"));

        storage.delete("key1").await.unwrap();
        assert!(storage.get("key1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_storage_expiration() {
        let storage = MemoryStorage::new();

        storage
            .set("key1", "5".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        // Wait for expiration
        std::thread::sleep(Duration::from_millis(20));

        let result = storage.get("key1").await.unwrap();
        assert!(result.is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_no_ttl_persists() {
        let storage = MemoryStorage::new();
        storage.set("key1", "x".to_string(), None).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(storage.get("key1").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_memory_storage_huge_ttl() {
        let storage = MemoryStorage::new();
        storage
            .set("key1", "x".to_string(), Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(storage.get("key1").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_memory_storage_increment() {
        let storage = MemoryStorage::new();
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(storage.increment("key1", ttl).await.unwrap(), 1);
        assert_eq!(storage.increment("key1", ttl).await.unwrap(), 2);
        assert_eq!(storage.get("key1").await.unwrap().as_deref(), Some("2"));

        // Separate key, separate counter
        assert_eq!(storage.increment("key2", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage_increment_non_integer() {
        let storage = MemoryStorage::new();
        storage.set("key1", "abc".to_string(), None).await.unwrap();

        let err = storage.increment("key1", None).await.unwrap_err();
        assert!(matches!(
            err,
            crate::RateLimitError::Storage(StorageError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_concurrent_increment() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    storage.increment("shared", None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(storage.get("shared").await.unwrap().as_deref(), Some("800"));
    }

    #[tokio::test]
    async fn test_memory_storage_cas() {
        let storage = MemoryStorage::new();
        let ttl = Some(Duration::from_secs(60));

        // CAS on non-existent key
        let success = storage
            .compare_and_swap("key1", None, "a".to_string(), ttl)
            .await
            .unwrap();
        assert!(success);

        // Key now exists, expecting absence fails
        let success = storage
            .compare_and_swap("key1", None, "b".to_string(), ttl)
            .await
            .unwrap();
        assert!(!success);

        // CAS with wrong expected value
        let success = storage
            .compare_and_swap("key1", Some("zzz"), "b".to_string(), ttl)
            .await
            .unwrap();
        assert!(!success);

        // CAS with correct expected value
        let success = storage
            .compare_and_swap("key1", Some("a"), "b".to_string(), ttl)
            .await
            .unwrap();
        assert!(success);
        assert_eq!(storage.get("key1").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_manual_gc_drops_expired() {
        let storage = MemoryStorage::with_gc(GcConfig::manual());
        storage
            .set("short", "1".to_string(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        storage.set("forever", "1".to_string(), None).await.unwrap();

        std::thread::sleep(Duration::from_millis(10));
        storage.run_gc().await;

        assert_eq!(storage.len(), 1);
        assert!(storage.get("forever").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_gc_config() {
        let config = GcConfig::on_requests(1000).with_max_age(Duration::from_secs(3600));

        assert!(matches!(config.interval, GcInterval::Requests(1000)));
        assert_eq!(config.max_age, Some(Duration::from_secs(3600)));
    }
}
