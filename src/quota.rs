//! Quota configuration for rate limiting.
//!
//! A `Quota` carries the four limit parameters shared by every variant:
//! window size and request limit for the window algorithms, refill rate and
//! bucket size for the token bucket.
//!
//! # Examples
//!
//! ```ignore
//! use admit_ratelimit::Quota;
//! use std::time::Duration;
//!
//! // 3 requests per minute, 0.2 tokens/s, bucket of 3
//! let quota = Quota::default();
//!
//! // 100 requests per minute, bucket of 150 refilled at 2 tokens/s
//! let quota = Quota::per_minute(100).with_bucket_size(150).with_refill_rate(2.0);
//!
//! // Admit exactly `rate_limit` requests per window
//! let quota = Quota::new(50, Duration::from_secs(30)).strict();
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default window size in milliseconds.
pub const DEFAULT_WINDOW_SIZE_MS: u64 = 60_000;
/// Default number of requests per window.
pub const DEFAULT_RATE_LIMIT: u64 = 3;
/// Default token refill rate per second.
pub const DEFAULT_REFILL_RATE: f64 = 0.2;
/// Default token bucket capacity.
pub const DEFAULT_MAX_BUCKET_SIZE: u64 = 3;

/// Rate limiting quota configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quota {
    /// Window length for fixed and sliding windows, in milliseconds.
    window_size_ms: u64,

    /// Request limit per window.
    rate_limit: u64,

    /// Tokens added per elapsed second (token bucket).
    refill_rate_per_second: f64,

    /// Token bucket capacity.
    max_bucket_size: u64,

    /// Deny once the pre-request count reaches `rate_limit` instead of
    /// exceeding it.
    ///
    /// Off by default: a window admits `rate_limit + 1` requests.
    strict_limit: bool,
}

impl Quota {
    /// Create a new quota with the given request limit and window.
    ///
    /// The token bucket gets a capacity of `rate_limit` and refills at
    /// `rate_limit / window` tokens per second.
    ///
    /// # Panics
    ///
    /// Panics if `rate_limit` is 0 or `window` is shorter than a millisecond.
    pub fn new(rate_limit: u64, window: Duration) -> Self {
        assert!(rate_limit > 0, "rate_limit must be greater than 0");
        assert!(window.as_millis() > 0, "window must be at least 1ms");

        Self {
            window_size_ms: window.as_millis() as u64,
            rate_limit,
            refill_rate_per_second: rate_limit as f64 / window.as_secs_f64(),
            max_bucket_size: rate_limit,
            strict_limit: false,
        }
    }

    /// Create a quota allowing `n` requests per second.
    pub fn per_second(n: u64) -> Self {
        Self::new(n, Duration::from_secs(1))
    }

    /// Create a quota allowing `n` requests per minute.
    pub fn per_minute(n: u64) -> Self {
        Self::new(n, Duration::from_secs(60))
    }

    /// Create a quota allowing `n` requests per hour.
    pub fn per_hour(n: u64) -> Self {
        Self::new(n, Duration::from_secs(3600))
    }

    /// Try to create a new quota, returning an error if invalid.
    pub fn try_new(rate_limit: u64, window: Duration) -> Result<Self> {
        if rate_limit == 0 {
            return Err(ConfigError::InvalidQuota("rate_limit must be greater than 0".into()).into());
        }
        if window.as_millis() == 0 {
            return Err(ConfigError::InvalidQuota("window must be at least 1ms".into()).into());
        }
        Ok(Self::new(rate_limit, window))
    }

    /// Set the token bucket capacity.
    pub fn with_bucket_size(mut self, size: u64) -> Self {
        self.max_bucket_size = size;
        self
    }

    /// Set the token refill rate (tokens per second).
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate_per_second = rate;
        self
    }

    /// Admit at most `rate_limit` requests per window.
    pub fn strict(mut self) -> Self {
        self.strict_limit = true;
        self
    }

    /// Check that every parameter is usable.
    ///
    /// Quotas built through [`Quota::new`] are always valid; deserialized ones
    /// must pass through here.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(ConfigError::InvalidQuota("rate_limit must be greater than 0".into()).into());
        }
        if self.window_size_ms == 0 {
            return Err(ConfigError::InvalidQuota("window_size_ms must be greater than 0".into()).into());
        }
        if self.max_bucket_size == 0 {
            return Err(ConfigError::InvalidQuota("max_bucket_size must be greater than 0".into()).into());
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second < 0.0 {
            return Err(ConfigError::InvalidQuota(format!(
                "refill_rate_per_second must be a non-negative number, got {}",
                self.refill_rate_per_second
            ))
            .into());
        }
        Ok(())
    }

    /// Get the request limit per window.
    pub fn rate_limit(&self) -> u64 {
        self.rate_limit
    }

    /// Get the window duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    /// Get the window size in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_size_ms
    }

    /// Get the refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Get the token bucket capacity.
    pub fn max_bucket_size(&self) -> u64 {
        self.max_bucket_size
    }

    /// Whether the window limit is strict.
    pub fn is_strict(&self) -> bool {
        self.strict_limit
    }

    /// Whether a window that has already seen `count` requests must deny the
    /// next one.
    pub fn window_exceeded(&self, count: u64) -> bool {
        if self.strict_limit {
            count >= self.rate_limit
        } else {
            count > self.rate_limit
        }
    }

    /// Number of requests a single window admits.
    pub fn admitted_per_window(&self) -> u64 {
        if self.strict_limit {
            self.rate_limit
        } else {
            self.rate_limit + 1
        }
    }

    /// Time for an empty bucket to refill completely, or `None` when the
    /// bucket never refills or would take longer than a `Duration` can hold.
    pub fn bucket_refill_time(&self) -> Option<Duration> {
        if self.refill_rate_per_second > 0.0 {
            Duration::try_from_secs_f64(self.max_bucket_size as f64 / self.refill_rate_per_second).ok()
        } else {
            None
        }
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            window_size_ms: DEFAULT_WINDOW_SIZE_MS,
            rate_limit: DEFAULT_RATE_LIMIT,
            refill_rate_per_second: DEFAULT_REFILL_RATE,
            max_bucket_size: DEFAULT_MAX_BUCKET_SIZE,
            strict_limit: false,
        }
    }
}

/// Builder for creating quotas with validation.
#[derive(Debug, Default)]
pub struct QuotaBuilder {
    rate_limit: Option<u64>,
    window: Option<Duration>,
    max_bucket_size: Option<u64>,
    refill_rate: Option<f64>,
    strict: bool,
}

impl QuotaBuilder {
    /// Create a new quota builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request limit per window.
    pub fn rate_limit(mut self, n: u64) -> Self {
        self.rate_limit = Some(n);
        self
    }

    /// Set the window duration.
    pub fn window(mut self, duration: Duration) -> Self {
        self.window = Some(duration);
        self
    }

    /// Set the token bucket capacity.
    pub fn max_bucket_size(mut self, n: u64) -> Self {
        self.max_bucket_size = Some(n);
        self
    }

    /// Set the refill rate.
    pub fn refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = Some(rate);
        self
    }

    /// Use the strict window comparison.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Build the quota, returning an error if invalid.
    pub fn build(self) -> Result<Quota> {
        let rate_limit = self
            .rate_limit
            .ok_or_else(|| ConfigError::MissingRequired("rate_limit".into()))?;
        let window = self
            .window
            .ok_or_else(|| ConfigError::MissingRequired("window".into()))?;

        let mut quota = Quota::try_new(rate_limit, window)?;

        if let Some(size) = self.max_bucket_size {
            quota = quota.with_bucket_size(size);
        }
        if let Some(rate) = self.refill_rate {
            quota = quota.with_refill_rate(rate);
        }
        if self.strict {
            quota = quota.strict();
        }

        quota.validate()?;
        Ok(quota)
    }
}
