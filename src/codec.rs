//! Store key naming and state encoding.
//!
//! Every value the algorithms keep in the shared store goes through this
//! module. Keys are namespaced by variant so that the three algorithms can run
//! against the same client without touching each other's state:
//!
//! | Variant | Key | Value |
//! |---------|-----|-------|
//! | Fixed window | `fixed-window:{window_index}:{client}` | decimal counter, e.g. `4` |
//! | Sliding window | `sliding-window:{client}` | JSON array, e.g. `[1000,1500]` |
//! | Token bucket | `token-bucket:{client}` | JSON object, e.g. `{"tokens":2,"last_refill":1700000000}` |
//!
//! The client id is always the last segment, so ids containing `:` (IPv6
//! addresses) cannot make two keys collide.
//!
//! Values that fail to decode surface as [`StorageError::Corrupted`]. Callers
//! on the request path use [`decode_or_reset`], which logs and treats the
//! value as absent.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::algorithm::Variant;
use crate::error::{Result, StorageError};
use crate::key::ClientId;

/// Store key for a client's counter in one fixed window.
pub fn fixed_window_key(client: &ClientId, window_index: u64) -> String {
    format!("{}:{}:{}", Variant::FixedWindow, window_index, client)
}

/// Store key for a client's sliding window log.
pub fn sliding_window_key(client: &ClientId) -> String {
    format!("{}:{}", Variant::SlidingWindow, client)
}

/// Store key for a client's token bucket.
pub fn token_bucket_key(client: &ClientId) -> String {
    format!("{}:{}", Variant::TokenBucket, client)
}

/// Conversion between algorithm state and the string the store holds.
pub trait StateCodec: Sized {
    /// Encode the state for storage.
    fn encode(&self) -> Result<String>;

    /// Decode a stored value read from `key`.
    fn decode(key: &str, raw: &str) -> Result<Self>;
}

/// Decode a value, treating undecodable state as absent.
///
/// Rate limit state is advisory, so a corrupted value resets the client
/// instead of failing the request.
pub fn decode_or_reset<T: StateCodec>(key: &str, raw: Option<&str>) -> Option<T> {
    let raw = raw?;
    match T::decode(key, raw) {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(key = %key, error = %err, "Discarding undecodable rate limit state");
            None
        }
    }
}

/// Request counter for one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowCounter(pub u64);

impl StateCodec for WindowCounter {
    fn encode(&self) -> Result<String> {
        Ok(self.0.to_string())
    }

    fn decode(key: &str, raw: &str) -> Result<Self> {
        raw.trim()
            .parse::<u64>()
            .map(WindowCounter)
            .map_err(|e| StorageError::corrupted(key, e.to_string()).into())
    }
}

/// Timestamps (Unix milliseconds) of the requests still inside the window.
///
/// Kept in non-decreasing order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlidingWindowLog {
    timestamps: Vec<u64>,
}

impl SlidingWindowLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log from timestamps, sorting them.
    pub fn from_timestamps(mut timestamps: Vec<u64>) -> Self {
        timestamps.sort_unstable();
        Self { timestamps }
    }

    /// Drop every timestamp not strictly after `now - window_ms`.
    pub fn prune(&mut self, now: u64, window_ms: u64) {
        // Before one full window has elapsed since the epoch nothing expires.
        let Some(cutoff) = now.checked_sub(window_ms) else {
            return;
        };
        let expired = self.timestamps.partition_point(|&ts| ts <= cutoff);
        self.timestamps.drain(..expired);
    }

    /// Record a request at `now`.
    ///
    /// A timestamp older than the newest entry (clock skew between replicas)
    /// is inserted in order rather than appended.
    pub fn record(&mut self, now: u64) {
        let at = self.timestamps.partition_point(|&ts| ts <= now);
        self.timestamps.insert(at, now);
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Oldest live timestamp.
    pub fn oldest(&self) -> Option<u64> {
        self.timestamps.first().copied()
    }

    /// The timestamps, oldest first.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }
}

impl StateCodec for SlidingWindowLog {
    fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()).into())
    }

    fn decode(key: &str, raw: &str) -> Result<Self> {
        let log: SlidingWindowLog = serde_json::from_str(raw)
            .map_err(|e| StorageError::corrupted(key, e.to_string()))?;
        if log.timestamps.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(StorageError::corrupted(key, "timestamps out of order").into());
        }
        Ok(log)
    }
}

/// Token bucket level and the second it was last refilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens left after the last request.
    pub tokens: u64,
    /// Unix seconds of the last refill.
    pub last_refill: u64,
}

impl TokenBucketState {
    /// Create a bucket state.
    pub fn new(tokens: u64, last_refill: u64) -> Self {
        Self {
            tokens,
            last_refill,
        }
    }

    /// Cap the token count at `max_tokens`.
    ///
    /// A stored level can exceed the capacity when the bucket size was
    /// lowered after it was written.
    pub fn clamped(self, max_tokens: u64) -> Self {
        Self {
            tokens: self.tokens.min(max_tokens),
            ..self
        }
    }
}

impl StateCodec for TokenBucketState {
    fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StorageError::Serialization(e.to_string()).into())
    }

    fn decode(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| StorageError::corrupted(key, e.to_string()).into())
    }
}
