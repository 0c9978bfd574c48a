//! Fixed Window rate limiting algorithm.

use std::time::Duration;

use tracing::warn;

use crate::algorithm::{Algorithm, Variant};
use crate::codec::{self, WindowCounter};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::{RateLimitError, Result, StorageError};
use crate::key::ClientId;
use crate::quota::Quota;
use crate::storage::Storage;

/// Fixed Window rate limiting algorithm.
///
/// Counts requests per client in windows of `floor(now / window)`. The
/// counter is bumped with a single atomic increment and the verdict is taken
/// on the value it held before, so concurrent requests are serialized by the
/// store.
///
/// The stored counter is the number of requests *seen* in the window, not the
/// number admitted: denied requests are counted too. Once a window is
/// exhausted the stored value keeps climbing past the limit while every
/// verdict stays the same, since each one only compares the pre-increment
/// value against the quota. The admitted count is
/// `min(counter, admitted_per_window)`.
///
/// With the default (non-strict) quota a window admits `rate_limit + 1`
/// requests, because the check is `count > rate_limit`.
#[derive(Debug, Clone, Default)]
pub struct FixedWindow;

impl FixedWindow {
    /// Create a new Fixed Window algorithm instance.
    pub fn new() -> Self {
        Self
    }

    /// Index of the window containing `now_ms`.
    pub fn window_index(&self, now_ms: u64, quota: &Quota) -> u64 {
        now_ms / quota.window_ms()
    }

    /// Build rate limit info for a window that has seen `count` requests.
    fn build_info(&self, count: u64, window_index: u64, quota: &Quota) -> RateLimitInfo {
        let admitted = quota.admitted_per_window();
        let reset_at = (window_index + 1) * quota.window_ms();
        RateLimitInfo::new(admitted, admitted.saturating_sub(count), reset_at)
            .with_algorithm("fixed_window")
    }

    fn decide(&self, previous: u64, count: u64, window_index: u64, quota: &Quota, now_ms: u64) -> Decision {
        let info = self.build_info(count, window_index, quota);
        if quota.window_exceeded(previous) {
            let retry_after = Duration::from_millis(info.reset_at_ms.saturating_sub(now_ms));
            Decision::denied(info.with_retry_after(retry_after))
        } else {
            Decision::allowed(info)
        }
    }
}

impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn variant(&self) -> Variant {
        Variant::FixedWindow
    }

    fn state_key(&self, client: &ClientId, quota: &Quota, now_ms: u64) -> String {
        codec::fixed_window_key(client, self.window_index(now_ms, quota))
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> Result<Decision> {
        let window_index = self.window_index(now_ms, quota);
        let key = codec::fixed_window_key(client, window_index);
        let ttl = Some(quota.window());

        let count = match storage.increment(&key, ttl).await {
            Err(RateLimitError::Storage(StorageError::Corrupted { reason, .. })) => {
                warn!(key = %key, reason = %reason, "Resetting undecodable window counter");
                storage.delete(&key).await?;
                storage.increment(&key, ttl).await?
            }
            result => result?,
        };

        // The increment always creates or bumps the key, so count >= 1.
        let previous = count.saturating_sub(1);
        Ok(self.decide(previous, count, window_index, quota, now_ms))
    }

    async fn check<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> Result<Decision> {
        let window_index = self.window_index(now_ms, quota);
        let key = codec::fixed_window_key(client, window_index);

        let raw = storage.get(&key).await?;
        let WindowCounter(count) =
            codec::decode_or_reset::<WindowCounter>(&key, raw.as_deref()).unwrap_or_default();

        Ok(self.decide(count, count, window_index, quota, now_ms))
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_fixed_window_admits_limit_plus_one() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default();
        let client = ClientId::from("10.0.0.1");

        for i in 1..=4 {
            let decision = algorithm
                .check_and_record(&storage, &client, &quota, 1_000 + i)
                .await
                .unwrap();
            assert!(decision.is_allowed(), "Request {} should be allowed", i);
        }

        let decision = algorithm
            .check_and_record(&storage, &client, &quota, 1_010)
            .await
            .unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.info().retry_after, Some(Duration::from_millis(58_990)));
    }

    #[tokio::test]
    async fn test_fixed_window_counts_denied_requests() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default();
        let client = ClientId::from("10.0.0.1");
        let key = algorithm.state_key(&client, &quota, 0);

        let mut verdicts = Vec::new();
        for _ in 0..7 {
            let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
            verdicts.push(decision.is_allowed());
        }

        assert_eq!(verdicts, vec![true, true, true, true, false, false, false]);
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some("7"));

        let decision = algorithm.check(&storage, &client, &quota, 0).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.info().remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_strict() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default().strict();
        let client = ClientId::from("10.0.0.1");

        for _ in 0..3 {
            let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
            assert!(decision.is_allowed());
        }
        let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
        assert!(decision.is_denied());
    }

    #[tokio::test]
    async fn test_fixed_window_remaining() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default();
        let client = ClientId::from("user:1");

        let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
        assert_eq!(decision.info().limit, 4);
        assert_eq!(decision.info().remaining, 3);
        assert_eq!(decision.info().reset_at_ms, 60_000);
        assert_eq!(decision.info().algorithm, Some("fixed_window"));
    }

    #[tokio::test]
    async fn test_fixed_window_check_does_not_record() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default();
        let client = ClientId::from("user:1");

        for _ in 0..5 {
            let decision = algorithm.check(&storage, &client, &quota, 0).await.unwrap();
            assert!(decision.is_allowed());
        }
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_fixed_window_resets_corrupted_counter() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::default();
        let client = ClientId::from("user:1");

        let key = algorithm.state_key(&client, &quota, 0);
        storage.set(&key, "garbage".to_string(), None).await.unwrap();

        let decision = algorithm.check_and_record(&storage, &client, &quota, 0).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(storage.get(&key).await.unwrap().as_deref(), Some("1"));
    }
}
