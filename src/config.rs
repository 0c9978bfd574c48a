//! Engine configuration.
//!
//! An [`EngineConfig`] bundles the limits, the engine's failure handling, the
//! store connection and the path routes. It can be built in code or loaded
//! from a file layered with `ADMIT__`-prefixed environment variables:
//!
//! ```toml
//! [limits]
//! window_size_ms = 60000
//! rate_limit = 3
//! refill_rate_per_second = 0.2
//! max_bucket_size = 3
//!
//! [engine]
//! fail_policy = "closed"
//! store_timeout_ms = 250
//!
//! [storage]
//! backend = "redis"
//! url = "redis://localhost:6379"
//!
//! [[routes]]
//! path = "/api/**"
//! variant = "sliding-window"
//! ```
//!
//! `ADMIT__LIMITS__RATE_LIMIT=10` overrides `limits.rate_limit`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::quota::Quota;
use crate::routes::RouteRule;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "ADMIT";

/// What to answer when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Deny the request.
    #[default]
    Closed,
    /// Allow the request.
    Open,
    /// Return the store error to the caller.
    Propagate,
}

/// Main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Limit parameters shared by all variants
    #[serde(default)]
    pub limits: Quota,

    /// Decision engine behaviour
    #[serde(default)]
    pub engine: EngineSettings,

    /// Store connection
    #[serde(default)]
    pub storage: StorageSettings,

    /// Path routes; empty means the default one-route-per-variant table
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// Decision engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Verdict when the store fails
    #[serde(default)]
    pub fail_policy: FailPolicy,

    /// Upper bound on the store round trips of one decision, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Pause before the single retry of a retryable store error, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Compare-and-swap rounds before a contended update gives up; unset
    /// retries until `store_timeout_ms` runs out
    #[serde(default)]
    pub max_cas_attempts: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fail_policy: FailPolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_cas_attempts: None,
        }
    }
}

impl EngineSettings {
    /// Store timeout as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Retry backoff as a duration.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_retry_backoff_ms() -> u64 {
    10
}


/// Store backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process map.
    #[default]
    Memory,
    /// Shared Redis instance.
    Redis,
}

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Backend kind
    #[serde(default)]
    pub backend: Backend,

    /// Connection URL, required for Redis
    pub url: Option<String>,

    /// Prefix added to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

#[cfg(feature = "redis")]
impl StorageSettings {
    /// Redis connection settings.
    pub fn redis_config(&self) -> Result<crate::storage::RedisConfig> {
        let url = self
            .url
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired("storage.url".into()))?;

        Ok(crate::storage::RedisConfig::new(url)
            .with_prefix(self.key_prefix.clone())
            .with_pool_size(self.pool_size)
            .with_connection_timeout(Duration::from_millis(self.connection_timeout_ms)))
    }
}

impl EngineConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// The file format follows the extension (TOML, YAML, JSON...).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        Self::from_builder(builder)
    }

    /// Load configuration from a TOML string plus the environment.
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::from_builder(Config::builder().add_source(File::from_str(content, FileFormat::Toml)))
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config: EngineConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.engine.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidStorage("store_timeout_ms must be greater than 0".into()).into());
        }
        if self.engine.max_cas_attempts == Some(0) {
            return Err(ConfigError::InvalidStorage("max_cas_attempts must be greater than 0".into()).into());
        }
        if self.storage.backend == Backend::Redis && self.storage.url.is_none() {
            return Err(ConfigError::MissingRequired("storage.url".into()).into());
        }
        if self.storage.pool_size == 0 {
            return Err(ConfigError::InvalidStorage("pool_size must be greater than 0".into()).into());
        }
        Ok(())
    }
}
