//! Admission verdicts.
//!
//! Every timestamp here is Unix milliseconds on the clock the caller passed
//! as `now`.

use std::time::Duration;

/// Allow or deny, plus the client's limit state after the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    allowed: bool,
    info: RateLimitInfo,
}

impl Decision {
    /// Admit the request.
    pub fn allowed(info: RateLimitInfo) -> Self {
        Self {
            allowed: true,
            info,
        }
    }

    /// Reject the request.
    pub fn denied(info: RateLimitInfo) -> Self {
        Self {
            allowed: false,
            info,
        }
    }

    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whether the request was rejected.
    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Whether the verdict came from the failure policy because the store
    /// could not be reached.
    pub fn is_fallback(&self) -> bool {
        self.info.fallback
    }

    /// Limit state behind the verdict.
    pub fn info(&self) -> &RateLimitInfo {
        &self.info
    }

    /// Take the limit state, dropping the verdict.
    pub fn into_info(self) -> RateLimitInfo {
        self.info
    }
}

/// A client's limit state as seen by one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    /// Requests admitted per window, or the bucket capacity.
    pub limit: u64,
    /// Requests still admissible right now.
    pub remaining: u64,
    /// When the limit next frees up (Unix ms).
    pub reset_at_ms: u64,
    /// Suggested wait, set on denials only.
    pub retry_after: Option<Duration>,
    /// Algorithm that decided.
    pub algorithm: Option<&'static str>,
    /// Set when the store was unavailable and the failure policy decided.
    pub fallback: bool,
}

impl RateLimitInfo {
    /// Info for a store-backed verdict.
    pub fn new(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            limit,
            remaining,
            reset_at_ms,
            retry_after: None,
            algorithm: None,
            fallback: false,
        }
    }

    /// Info for a verdict made without consulting the store.
    pub fn fallback(limit: u64, now_ms: u64) -> Self {
        Self {
            fallback: true,
            ..Self::new(limit, 0, now_ms)
        }
    }

    /// Attach the suggested wait.
    pub fn with_retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    /// Tag the deciding algorithm.
    pub fn with_algorithm(mut self, name: &'static str) -> Self {
        self.algorithm = Some(name);
        self
    }

    /// Time from `now_ms` until the limit frees up.
    pub fn time_until_reset(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
    }
}
