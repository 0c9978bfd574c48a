//! Sliding Window rate limiting algorithm.
//!
//! Keeps the timestamp of every admitted request still inside the window,
//! giving exact counts over any `window`-long span at the cost of storing up
//! to `rate_limit + 1` timestamps per client.

use std::time::Duration;

use crate::algorithm::{update_with_cas, Algorithm, Variant};
use crate::codec::{self, SlidingWindowLog, StateCodec};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::Result;
use crate::key::ClientId;
use crate::quota::Quota;
use crate::storage::Storage;

/// Sliding Window rate limiting algorithm.
///
/// Each request prunes timestamps at or before `now - window`, then is
/// denied if the remaining count exceeds the limit, otherwise appended. The
/// whole read-prune-append cycle is one compare-and-swap, so two concurrent
/// requests cannot both be admitted into the last free slot.
///
/// A client's first request creates the log like any other request.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_cas_attempts: Option<u32>,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindow {
    /// Create a new Sliding Window algorithm instance.
    pub fn new() -> Self {
        Self {
            max_cas_attempts: None,
        }
    }

    /// Cap the compare-and-swap rounds tried under contention.
    ///
    /// Unbounded by default: a contended update keeps retrying until it
    /// lands, and the caller's timeout decides how long that may take.
    pub fn with_max_attempts(mut self, attempts: impl Into<Option<u32>>) -> Self {
        self.max_cas_attempts = attempts.into();
        self
    }

    /// Build the decision for a pruned log, before recording `now_ms`.
    fn evaluate(&self, log: &SlidingWindowLog, quota: &Quota, now_ms: u64) -> Decision {
        let window_ms = quota.window_ms();
        let admitted = quota.admitted_per_window();
        let live = log.len() as u64;

        if quota.window_exceeded(live) {
            // The request fits once enough of the oldest entries expire.
            let blocking = (live - admitted) as usize;
            let frees_at = log
                .timestamps()
                .get(blocking)
                .map(|ts| ts + window_ms)
                .unwrap_or(now_ms + window_ms);
            let info = RateLimitInfo::new(admitted, 0, frees_at)
                .with_algorithm("sliding_window")
                .with_retry_after(Duration::from_millis(frees_at.saturating_sub(now_ms)));
            Decision::denied(info)
        } else {
            let reset_at = log.oldest().unwrap_or(now_ms) + window_ms;
            let info = RateLimitInfo::new(admitted, admitted - live - 1, reset_at)
                .with_algorithm("sliding_window");
            Decision::allowed(info)
        }
    }
}

impl Algorithm for SlidingWindow {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn variant(&self) -> Variant {
        Variant::SlidingWindow
    }

    fn state_key(&self, client: &ClientId, _quota: &Quota, _now_ms: u64) -> String {
        codec::sliding_window_key(client)
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> Result<Decision> {
        let key = codec::sliding_window_key(client);
        let window_ms = quota.window_ms();
        // Once the newest entry leaves the window the log is empty anyway.
        let ttl = Some(quota.window());

        update_with_cas(storage, &key, ttl, self.max_cas_attempts, |raw| {
            let mut log =
                codec::decode_or_reset::<SlidingWindowLog>(&key, raw).unwrap_or_default();
            log.prune(now_ms, window_ms);

            let decision = self.evaluate(&log, quota, now_ms);
            if decision.is_denied() {
                return Ok((None, decision));
            }

            log.record(now_ms);
            Ok((Some(log.encode()?), decision))
        })
        .await
    }

    async fn check<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> Result<Decision> {
        let key = codec::sliding_window_key(client);

        let raw = storage.get(&key).await?;
        let mut log =
            codec::decode_or_reset::<SlidingWindowLog>(&key, raw.as_deref()).unwrap_or_default();
        log.prune(now_ms, quota.window_ms());

        Ok(self.evaluate(&log, quota, now_ms))
    }
}
