//! Token Bucket rate limiting algorithm.

use std::time::Duration;

use crate::algorithm::{update_with_cas, Algorithm, Variant};
use crate::codec::{self, StateCodec, TokenBucketState};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::Result;
use crate::key::ClientId;
use crate::quota::Quota;
use crate::storage::Storage;

/// Token Bucket rate limiting algorithm.
///
/// Allows controlled bursts while enforcing an average rate limit. The
/// bucket is refilled in whole tokens, `round(elapsed_secs * refill_rate)`,
/// and the refill clock is reset on every request, admitted or not. A client
/// that keeps knocking more often than every `0.5 / refill_rate` seconds
/// therefore never earns a token back.
///
/// The first request from a client creates the bucket with one token already
/// spent.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    max_cas_attempts: Option<u32>,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBucket {
    /// Create a new Token Bucket algorithm instance.
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

    /// Tokens available at `now_secs`, before the current request takes one.
    pub fn refill(&self, state: TokenBucketState, now_secs: u64, quota: &Quota) -> u64 {
        let elapsed = now_secs.saturating_sub(state.last_refill);
        let added = (elapsed as f64 * quota.refill_rate()).round() as u64;
        state
            .tokens
            .saturating_add(added)
            .min(quota.max_bucket_size())
    }

    /// Apply one request to the bucket.
    ///
    /// Returns the state to store and whether the request is admitted.
    fn consume(
        &self,
        state: Option<TokenBucketState>,
        now_secs: u64,
        quota: &Quota,
    ) -> (TokenBucketState, bool) {
        match state {
            None => (
                TokenBucketState::new(quota.max_bucket_size().saturating_sub(1), now_secs),
                true,
            ),
            Some(state) => {
                let available = self.refill(state, now_secs, quota);
                (
                    TokenBucketState::new(available.saturating_sub(1), now_secs),
                    available > 0,
                )
            }
        }
    }

    /// Build rate limit info from the bucket level left after a request.
    fn build_info(&self, tokens: u64, quota: &Quota, now_ms: u64) -> RateLimitInfo {
        let max_tokens = quota.max_bucket_size();
        let rate = quota.refill_rate();

        let missing = max_tokens.saturating_sub(tokens);
        let time_to_full = if missing == 0 || rate <= 0.0 {
            0
        } else {
            // Float to int casts saturate; the multiply must too
            ((missing as f64 / rate).ceil() as u64).saturating_mul(1000)
        };

        RateLimitInfo::new(max_tokens, tokens, now_ms.saturating_add(time_to_full))
            .with_algorithm("token_bucket")
    }

    /// Quiet period after which the next request earns a token.
    ///
    /// Refill is rounded to the nearest token and elapsed time is counted in
    /// whole seconds.
    fn retry_after(&self, quota: &Quota) -> Option<Duration> {
        let rate = quota.refill_rate();
        (rate > 0.0).then(|| Duration::from_secs((0.5 / rate).ceil() as u64))
    }

    /// Store expiry for a bucket.
    ///
    /// After a full refill time an untouched bucket is indistinguishable from
    /// a missing one, so it may be dropped. A bucket that never refills, or
    /// refills too slowly to express, is kept forever.
    fn ttl(&self, quota: &Quota) -> Option<Duration> {
        quota.bucket_refill_time().map(|full| {
            let secs = full.as_secs().saturating_add(u64::from(full.subsec_nanos() > 0));
            Duration::from_secs(secs.saturating_add(1))
        })
    }

    fn decide(&self, state: TokenBucketState, allowed: bool, quota: &Quota, now_ms: u64) -> Decision {
        let info = self.build_info(state.tokens, quota, now_ms);
        if allowed {
            Decision::allowed(info)
        } else {
            match self.retry_after(quota) {
                Some(retry_after) => Decision::denied(info.with_retry_after(retry_after)),
                None => Decision::denied(info),
            }
        }
    }
}

impl Algorithm for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn variant(&self) -> Variant {
        Variant::TokenBucket
    }

    fn state_key(&self, client: &ClientId, _quota: &Quota, _now_ms: u64) -> String {
        codec::token_bucket_key(client)
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> Result<Decision> {
        let key = codec::token_bucket_key(client);
        let now_secs = now_ms / 1000;
        let max_tokens = quota.max_bucket_size();

        update_with_cas(storage, &key, self.ttl(quota), self.max_cas_attempts, |raw| {
            let state = codec::decode_or_reset::<TokenBucketState>(&key, raw)
                .map(|state| state.clamped(max_tokens));

            // The clock advances even when the request is denied.
            let (next, allowed) = self.consume(state, now_secs, quota);
            let decision = self.decide(next, allowed, quota, now_ms);
            Ok((Some(next.encode()?), decision))
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
        let key = codec::token_bucket_key(client);

        let raw = storage.get(&key).await?;
        let state = codec::decode_or_reset::<TokenBucketState>(&key, raw.as_deref())
            .map(|state| state.clamped(quota.max_bucket_size()));

        let available = match state {
            Some(state) => self.refill(state, now_ms / 1000, quota),
            None => quota.max_bucket_size(),
        };
        let info = self.build_info(available, quota, now_ms);

        Ok(if available > 0 || state.is_none() {
            Decision::allowed(info)
        } else {
            self.decide(TokenBucketState::new(0, now_ms / 1000), false, quota, now_ms)
        })
    }
}
