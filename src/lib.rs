//! Per-client request admission control.
//!
//! `admit_ratelimit` decides, request by request, whether a client may
//! proceed. Every verdict is computed from state kept in a shared key-value
//! store, so any number of engine replicas enforce one limit together:
//!
//! - **Three Algorithms**: Fixed Window, Sliding Window and Token Bucket
//! - **Pluggable Storage**: In-memory with GC, Redis with connection pooling
//! - **Atomic Updates**: Store-side increments and compare-and-swap, no in-process locks
//! - **Failure Policy**: Fail closed, fail open or propagate when the store is down
//! - **Path Routing**: Pick the algorithm from the request path
//!
//! # Quick Start
//!
//! ```ignore
//! use admit_ratelimit::{ClientId, EngineConfig, MemoryStorage, RateLimiter, Variant};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> admit_ratelimit::Result<()> {
//!     let limiter = RateLimiter::new(Arc::new(MemoryStorage::new()), EngineConfig::default())?;
//!     let client = ClientId::from("203.0.113.7");
//!
//!     let decision = limiter.decide_now(Variant::SlidingWindow, &client).await?;
//!     if decision.is_allowed() {
//!         println!("Request allowed! {} remaining", decision.info().remaining);
//!     } else {
//!         println!("Rate limited! Retry after {:?}", decision.info().retry_after);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Algorithms
//!
//! | Algorithm | Best For | State per client |
//! |-----------|----------|------------------|
//! | Fixed Window | Simple use cases | One counter per window |
//! | Sliding Window | Exact counts | Up to `rate_limit + 1` timestamps |
//! | Token Bucket | Bursty traffic | Token level and refill time |
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend
//! - `cli` (default): the `admit` command line tool

pub mod algorithm;
pub mod codec;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod key;
pub mod quota;
pub mod routes;
pub mod storage;

// Re-export main types
pub use algorithm::{Algorithm, Variant};
pub use config::{Backend, EngineConfig, EngineSettings, FailPolicy, StorageSettings};
pub use decision::{Decision, RateLimitInfo};
pub use engine::{RateLimiter, RateLimiterBuilder};
pub use error::{ConfigError, ConnectionError, RateLimitError, Result, StorageError};
pub use key::ClientId;
pub use quota::{Quota, QuotaBuilder};
pub use routes::{RouteRule, RouteTable};
pub use storage::Storage;

// Re-export algorithms
pub use algorithm::{FixedWindow, SlidingWindow, TokenBucket};

// Re-export storage types
#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::{Algorithm, Variant};
    pub use crate::config::{EngineConfig, FailPolicy};
    pub use crate::decision::{Decision, RateLimitInfo};
    pub use crate::engine::RateLimiter;
    pub use crate::error::{RateLimitError, Result};
    pub use crate::key::ClientId;
    pub use crate::quota::Quota;
    pub use crate::storage::Storage;

    pub use crate::algorithm::{FixedWindow, SlidingWindow, TokenBucket};

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryStorage};

    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisConfig, RedisStorage};
}
