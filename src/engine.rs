//! Admission decision engine.
//!
//! The `RateLimiter` dispatches each request to the algorithm its variant
//! names, bounds the store round trips with a timeout, retries a retryable
//! store failure once and, if the store still cannot answer, falls back to the
//! configured [`FailPolicy`].
//!
//! Contended updates retry inside that timeout until they land. Only a store
//! that fails or does not answer in time reaches the failure policy.
//!
//! # Example
//!
//! ```ignore
//! use admit_ratelimit::{ClientId, MemoryStorage, Quota, RateLimiter, Variant};
//!
//! let limiter = RateLimiter::builder()
//!     .quota(Quota::per_minute(100))
//!     .route_pattern("/api/**", Variant::SlidingWindow)
//!     .build(MemoryStorage::new())?;
//!
//! let client = ClientId::from("10.0.0.1");
//! let decision = limiter.decide_now(Variant::TokenBucket, &client).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::algorithm::{Algorithm, FixedWindow, SlidingWindow, TokenBucket, Variant};
use crate::config::{EngineConfig, EngineSettings, FailPolicy};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::{ConfigError, ConnectionError, RateLimitError, Result};
use crate::key::ClientId;
use crate::quota::Quota;
use crate::routes::RouteTable;
use crate::storage::{current_timestamp_ms, Storage};

#[derive(Debug, Clone, Copy)]
enum Mode {
    Record,
    Peek,
}

/// Per-client admission controller over a shared store.
///
/// Holds no per-client state of its own; any number of limiters may share one
/// store and agree on every verdict.
pub struct RateLimiter<S> {
    storage: Arc<S>,
    quota: Quota,
    policy: FailPolicy,
    store_timeout: Duration,
    retry_backoff: Duration,
    routes: RouteTable,
    fixed: FixedWindow,
    sliding: SlidingWindow,
    bucket: TokenBucket,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            quota: self.quota.clone(),
            policy: self.policy,
            store_timeout: self.store_timeout,
            retry_backoff: self.retry_backoff,
            routes: self.routes.clone(),
            fixed: self.fixed.clone(),
            sliding: self.sliding.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

impl<S> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("quota", &self.quota)
            .field("policy", &self.policy)
            .field("store_timeout", &self.store_timeout)
            .field("routes", &self.routes.len())
            .finish()
    }
}

impl<S: Storage> RateLimiter<S> {
    /// Create a limiter from a validated configuration.
    ///
    /// The `storage` section of the configuration is not consulted; the store
    /// handle is passed in already connected.
    pub fn new(storage: Arc<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let routes = if config.routes.is_empty() {
            RouteTable::with_defaults()
        } else {
            RouteTable::from_rules(&config.routes)
        };

        Ok(Self::assemble(storage, config.limits, &config.engine, routes))
    }

    /// Create a new limiter builder.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    fn assemble(storage: Arc<S>, quota: Quota, engine: &EngineSettings, routes: RouteTable) -> Self {
        Self {
            storage,
            quota,
            policy: engine.fail_policy,
            store_timeout: engine.store_timeout(),
            retry_backoff: engine.retry_backoff(),
            routes,
            fixed: FixedWindow::new(),
            sliding: SlidingWindow::new().with_max_attempts(engine.max_cas_attempts),
            bucket: TokenBucket::new().with_max_attempts(engine.max_cas_attempts),
        }
    }

    /// Decide whether `client`'s request at `now_ms` is admitted, and record it.
    ///
    /// Denials are `Ok`; errors are configuration problems or, under
    /// [`FailPolicy::Propagate`], store failures.
    pub async fn decide(&self, variant: Variant, client: &ClientId, now_ms: u64) -> Result<Decision> {
        self.run(variant, client, now_ms, Mode::Record).await
    }

    /// Like [`decide`](Self::decide), using the system clock.
    pub async fn decide_now(&self, variant: Variant, client: &ClientId) -> Result<Decision> {
        self.decide(variant, client, current_timestamp_ms()).await
    }

    /// Decide for a variant given by name (`"token-bucket"`, `"fixed_window"`...).
    pub async fn decide_str(&self, variant: &str, client: &ClientId, now_ms: u64) -> Result<Decision> {
        let variant: Variant = variant.parse()?;
        self.decide(variant, client, now_ms).await
    }

    /// Decide for a request path, selecting the variant from the route table.
    pub async fn decide_for_path(&self, path: &str, client: &ClientId, now_ms: u64) -> Result<Decision> {
        let variant = self.resolve(path)?;
        self.decide(variant, client, now_ms).await
    }

    /// Report what [`decide`](Self::decide) would answer, without recording.
    pub async fn peek(&self, variant: Variant, client: &ClientId, now_ms: u64) -> Result<Decision> {
        self.run(variant, client, now_ms, Mode::Peek).await
    }

    /// Forget `client`'s state for one variant.
    ///
    /// For the fixed window only the window containing `now_ms` is cleared.
    pub async fn reset(&self, variant: Variant, client: &ClientId, now_ms: u64) -> Result<()> {
        let storage = &*self.storage;
        let quota = &self.quota;
        let op = async {
            match variant {
                Variant::FixedWindow => self.fixed.reset(storage, client, quota, now_ms).await,
                Variant::SlidingWindow => self.sliding.reset(storage, client, quota, now_ms).await,
                Variant::TokenBucket => self.bucket.reset(storage, client, quota, now_ms).await,
            }
        };

        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.store_timeout).into()),
        }
    }

    /// Variant configured for `path`.
    pub fn resolve(&self, path: &str) -> Result<Variant> {
        self.routes
            .resolve(path)
            .ok_or_else(|| ConfigError::InvalidVariant(path.to_string()).into())
    }

    /// Get the quota.
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Get the failure policy.
    pub fn fail_policy(&self) -> FailPolicy {
        self.policy
    }

    /// Get the route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Get the storage handle.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    async fn run(&self, variant: Variant, client: &ClientId, now_ms: u64, mode: Mode) -> Result<Decision> {
        let result = match self.attempt(variant, client, now_ms, mode).await {
            Err(err) if err.is_retryable() => {
                debug!(
                    variant = %variant,
                    client = %client,
                    error = %err,
                    "Retrying after store failure"
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(variant, client, now_ms, mode).await
            }
            result => result,
        };

        match result {
            Ok(decision) => {
                if decision.is_denied() {
                    debug!(
                        variant = %variant,
                        client = %client,
                        retry_after_ms = decision.info().retry_after.map(|d| d.as_millis() as u64),
                        "Request denied"
                    );
                } else {
                    trace!(
                        variant = %variant,
                        client = %client,
                        remaining = decision.info().remaining,
                        "Request allowed"
                    );
                }
                Ok(decision)
            }
            Err(err) if err.is_store_failure() => self.fall_back(variant, client, now_ms, err),
            Err(err) => Err(err),
        }
    }

    /// One pass through the algorithm, bounded by the store timeout.
    async fn attempt(&self, variant: Variant, client: &ClientId, now_ms: u64, mode: Mode) -> Result<Decision> {
        let storage = &*self.storage;
        let quota = &self.quota;
        let op = async {
            match (variant, mode) {
                (Variant::FixedWindow, Mode::Record) => {
                    self.fixed.check_and_record(storage, client, quota, now_ms).await
                }
                (Variant::FixedWindow, Mode::Peek) => self.fixed.check(storage, client, quota, now_ms).await,
                (Variant::SlidingWindow, Mode::Record) => {
                    self.sliding.check_and_record(storage, client, quota, now_ms).await
                }
                (Variant::SlidingWindow, Mode::Peek) => self.sliding.check(storage, client, quota, now_ms).await,
                (Variant::TokenBucket, Mode::Record) => {
                    self.bucket.check_and_record(storage, client, quota, now_ms).await
                }
                (Variant::TokenBucket, Mode::Peek) => self.bucket.check(storage, client, quota, now_ms).await,
            }
        };

        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.store_timeout).into()),
        }
    }

    fn fall_back(&self, variant: Variant, client: &ClientId, now_ms: u64, err: RateLimitError) -> Result<Decision> {
        let limit = match variant {
            Variant::TokenBucket => self.quota.max_bucket_size(),
            Variant::FixedWindow | Variant::SlidingWindow => self.quota.admitted_per_window(),
        };
        let info = RateLimitInfo::fallback(limit, now_ms).with_algorithm(match variant {
            Variant::FixedWindow => self.fixed.name(),
            Variant::SlidingWindow => self.sliding.name(),
            Variant::TokenBucket => self.bucket.name(),
        });

        match self.policy {
            FailPolicy::Closed => {
                warn!(variant = %variant, client = %client, error = %err, "Store unavailable, denying request");
                Ok(Decision::denied(info))
            }
            FailPolicy::Open => {
                warn!(variant = %variant, client = %client, error = %err, "Store unavailable, allowing request");
                Ok(Decision::allowed(info))
            }
            FailPolicy::Propagate => Err(err),
        }
    }
}

/// Builder for RateLimiter.
#[derive(Debug, Default)]
pub struct RateLimiterBuilder {
    quota: Quota,
    engine: EngineSettings,
    routes: Option<RouteTable>,
}

impl RateLimiterBuilder {
    /// Create a new builder with default limits and the default routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the quota.
    pub fn quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }

    /// Set the failure policy.
    pub fn fail_policy(mut self, policy: FailPolicy) -> Self {
        self.engine.fail_policy = policy;
        self
    }

    /// Set the bound on one pass of store round trips.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.engine.store_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pause before retrying a failed store call.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.engine.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the compare-and-swap attempt limit.
    pub fn max_cas_attempts(mut self, attempts: u32) -> Self {
        self.engine.max_cas_attempts = Some(attempts);
        self
    }

    /// Route an exact path to a variant.
    ///
    /// The first call replaces the default routes.
    pub fn route(mut self, path: impl Into<String>, variant: Variant) -> Self {
        self.routes = Some(self.routes.unwrap_or_default().route(path, variant));
        self
    }

    /// Route a glob pattern to a variant.
    pub fn route_pattern(mut self, pattern: impl Into<String>, variant: Variant) -> Self {
        self.routes = Some(self.routes.unwrap_or_default().route_pattern(pattern, variant));
        self
    }

    /// Build the limiter over `storage`.
    pub fn build<S: Storage>(self, storage: S) -> Result<RateLimiter<S>> {
        self.build_shared(Arc::new(storage))
    }

    /// Build the limiter over a shared storage handle.
    pub fn build_shared<S: Storage>(self, storage: Arc<S>) -> Result<RateLimiter<S>> {
        let config = EngineConfig {
            limits: self.quota,
            engine: self.engine,
            ..EngineConfig::default()
        };
        config.validate()?;

        let routes = self.routes.unwrap_or_else(RouteTable::with_defaults);
        Ok(RateLimiter::assemble(storage, config.limits, &config.engine, routes))
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn limiter() -> RateLimiter<MemoryStorage> {
        RateLimiter::new(Arc::new(MemoryStorage::new()), EngineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_decide_dispatches_by_variant() {
        let limiter = limiter();
        let client = ClientId::from("10.0.0.1");

        for variant in Variant::ALL {
            let decision = limiter.decide(variant, &client, 1_000).await.unwrap();
            assert!(decision.is_allowed());
            assert!(!decision.is_fallback());
        }

        let storage = limiter.storage();
        assert_eq!(storage.get("fixed-window:0:10.0.0.1").await.unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get("sliding-window:10.0.0.1").await.unwrap().as_deref(), Some("[1000]"));
        assert!(storage.get("token-bucket:10.0.0.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_decide_str_unknown_variant() {
        let limiter = limiter();
        let client = ClientId::from("10.0.0.1");

        let err = limiter.decide_str("leaky-bucket", &client, 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Config(ConfigError::InvalidVariant(_))));
        assert!(limiter.storage().is_empty());
    }

    #[tokio::test]
    async fn test_decide_for_path() {
        let limiter = limiter();
        let client = ClientId::from("10.0.0.1");

        let decision = limiter.decide_for_path("/token-bucket", &client, 0).await.unwrap();
        assert_eq!(decision.info().algorithm, Some("token_bucket"));

        let err = limiter.decide_for_path("/nope", &client, 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Config(ConfigError::InvalidVariant(_))));
    }

    #[tokio::test]
    async fn test_peek_and_reset() {
        let limiter = limiter();
        let client = ClientId::from("user:1");

        for _ in 0..4 {
            limiter.decide(Variant::FixedWindow, &client, 0).await.unwrap();
        }
        assert!(limiter.peek(Variant::FixedWindow, &client, 0).await.unwrap().is_denied());

        limiter.reset(Variant::FixedWindow, &client, 0).await.unwrap();
        assert!(limiter.peek(Variant::FixedWindow, &client, 0).await.unwrap().is_allowed());
        assert!(limiter.decide(Variant::FixedWindow, &client, 0).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_builder_routes_replace_defaults() {
        let limiter = RateLimiter::<MemoryStorage>::builder()
            .route("/login", Variant::TokenBucket)
            .build(MemoryStorage::new())
            .unwrap();

        assert_eq!(limiter.resolve("/login").unwrap(), Variant::TokenBucket);
        assert!(limiter.resolve("/fixed-window").is_err());
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = RateLimiter::<MemoryStorage>::builder()
            .store_timeout(Duration::ZERO)
            .build(MemoryStorage::new());
        assert!(result.is_err());
    }
}
