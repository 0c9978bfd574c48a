//! Rate limiting algorithm trait and implementations.
//!
//! This module defines the `Algorithm` trait, the [`Variant`] tag callers use
//! to pick one, and the three implementations.
//!
//! # Available Algorithms
//!
//! - **Fixed Window**: counter per client per window, one atomic increment
//! - **Sliding Window**: log of request timestamps inside a moving window
//! - **Token Bucket**: capped reservoir refilled at a fixed rate
//!
//! All three read and write only through the [`Storage`] trait and keep no
//! state of their own, so any number of engine replicas can share one store.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::decision::Decision;
use crate::error::{ConfigError, Result, StorageError};
use crate::key::ClientId;
use crate::quota::Quota;
use crate::storage::Storage;

/// Lost rounds answered with a plain yield before backing off on the timer.
const CAS_YIELD_ROUNDS: u32 = 2;

/// Upper bound on the pause between two compare-and-swap rounds, in microseconds.
const CAS_MAX_BACKOFF_MICROS: u64 = 2_000;

/// Algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Counter per fixed window.
    #[serde(alias = "fixed_window")]
    FixedWindow,
    /// Timestamp log over a moving window.
    #[serde(alias = "sliding_window")]
    SlidingWindow,
    /// Refilling token reservoir.
    #[serde(alias = "token_bucket")]
    TokenBucket,
}

impl Variant {
    /// Every variant, in declaration order.
    pub const ALL: [Variant; 3] = [Self::FixedWindow, Self::SlidingWindow, Self::TokenBucket];

    /// The tag used in store keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed-window",
            Self::SlidingWindow => "sliding-window",
            Self::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().trim_start_matches('/').to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str() == normalized)
            .ok_or_else(|| ConfigError::InvalidVariant(s.to_string()))
    }
}

/// Rate limiting algorithm trait.
///
/// Implementations receive the current time from the caller instead of
/// reading a clock, which keeps them deterministic under test and lets every
/// replica agree on window boundaries.
pub trait Algorithm: Send + Sync + 'static {
    /// Get the algorithm name (for logging/metrics).
    fn name(&self) -> &'static str;

    /// The variant this algorithm implements.
    fn variant(&self) -> Variant;

    /// Store key holding `client`'s state at time `now_ms`.
    fn state_key(&self, client: &ClientId, quota: &Quota, now_ms: u64) -> String;

    /// Check if a request is allowed AND record it.
    ///
    /// This is the primary method for rate limiting. The state transition for
    /// one request happens exactly once even when other requests for the same
    /// client race against it.
    fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Check without recording (peek at current state).
    ///
    /// Reports whether a request arriving at `now_ms` would be admitted.
    fn check<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> impl Future<Output = Result<Decision>> + Send;

    /// Reset the rate limit for a client.
    fn reset<S: Storage>(
        &self,
        storage: &S,
        client: &ClientId,
        quota: &Quota,
        now_ms: u64,
    ) -> impl Future<Output = Result<()>> + Send {
        let key = self.state_key(client, quota, now_ms);
        async move { storage.delete(&key).await }
    }
}

/// Optimistic read-modify-write against one key.
///
/// `step` receives the raw current value and returns the value to write (or
/// `None` to leave the key untouched) along with the outcome. The write only
/// lands if nobody changed the key in between; otherwise the read and `step`
/// are repeated after a short jittered pause.
///
/// With `max_attempts` of `None` the loop runs until it wins. A lost round
/// means another request's write landed, so some request always makes
/// progress; callers bound the wait with a timeout, as the engine does.
pub(crate) async fn update_with_cas<S, T, F>(
    storage: &S,
    key: &str,
    ttl: Option<Duration>,
    max_attempts: Option<u32>,
    mut step: F,
) -> Result<T>
where
    S: Storage,
    T: Send,
    F: FnMut(Option<&str>) -> Result<(Option<String>, T)> + Send,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);

        let current = storage.get(key).await?;
        let (next, outcome) = step(current.as_deref())?;

        let Some(next) = next else {
            return Ok(outcome);
        };

        if storage
            .compare_and_swap(key, current.as_deref(), next, ttl)
            .await?
        {
            return Ok(outcome);
        }

        if max_attempts.is_some_and(|max| attempt >= max) {
            warn!(key = %key, attempts = attempt, "Giving up after repeated concurrent updates");
            return Err(StorageError::AtomicConflict.into());
        }

        trace!(key = %key, attempt = attempt, "Concurrent update detected, retrying");
        if attempt <= CAS_YIELD_ROUNDS {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(cas_backoff(attempt)).await;
        }
    }
}

/// Pause after the `attempt`th lost round: doubles from 200µs up to
/// [`CAS_MAX_BACKOFF_MICROS`], drawn uniformly from the upper half of that.
fn cas_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(CAS_YIELD_ROUNDS).min(6);
    let cap = (100u64 << shift).min(CAS_MAX_BACKOFF_MICROS);
    Duration::from_micros(rand::thread_rng().gen_range(cap / 2..=cap))
}
