//! Error types for admission decisions.
//!
//! Errors are split by who can act on them: configuration errors are the
//! caller's fault and are never retried, storage and connection errors come
//! from the shared store and feed the engine's failure policy.
//!
//! A denied request is not an error; it is an `Ok` [`Decision`](crate::Decision).

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Why an admission decision could not be made.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The store answered, but not usefully.
    #[error("Store error: {0}")]
    Storage(#[from] StorageError),

    /// The request or the engine is misconfigured.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The store could not be reached in time.
    #[error("Store unavailable: {0}")]
    Connection(#[from] ConnectionError),
}

impl RateLimitError {
    /// Whether this error means the shared store could not be used.
    ///
    /// These are the errors the engine's failure policy applies to. Losing
    /// compare-and-swap races is not one of them: the store answered and
    /// another request's update landed.
    pub fn is_store_failure(&self) -> bool {
        match self {
            Self::Storage(StorageError::AtomicConflict) => false,
            Self::Storage(_) | Self::Connection(_) => true,
            Self::Config(_) => false,
        }
    }

    /// Whether repeating the whole decision may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            Self::Connection(_) => true,
            Self::Config(_) => false,
        }
    }
}

/// Failures of individual store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend rejected or failed an operation.
    #[error("{message}")]
    OperationFailed {
        /// Backend error text.
        message: String,
        /// Whether the same call may succeed if repeated.
        retryable: bool,
    },

    /// A stored value could not be decoded into the expected state.
    #[error("Corrupted value at {key}: {reason}")]
    Corrupted {
        /// Store key holding the value.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// State could not be encoded for the store.
    #[error("Cannot encode state: {0}")]
    Serialization(String),

    /// Every compare-and-swap round lost to a concurrent writer.
    #[error("Gave up after repeated concurrent updates")]
    AtomicConflict,

    /// No pooled connection was available.
    #[error("No store connection available")]
    PoolExhausted,
}

impl StorageError {
    /// Build an [`OperationFailed`](Self::OperationFailed) error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Build a [`Corrupted`](Self::Corrupted) error.
    pub fn corrupted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether the same call may succeed if repeated.
    ///
    /// Contention and pool pressure are transient; corrupted or unencodable
    /// state is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::AtomicConflict | Self::PoolExhausted => true,
            Self::Corrupted { .. } | Self::Serialization(_) => false,
        }
    }
}

/// Configuration problems. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown algorithm variant or unrouted path.
    #[error("Unknown rate limit variant: {0}")]
    InvalidVariant(String),

    /// A limit parameter is out of range.
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),

    /// Engine or store settings are out of range.
    #[error("Invalid storage settings: {0}")]
    InvalidStorage(String),

    /// A setting with no default was not given.
    #[error("Missing setting: {0}")]
    MissingRequired(String),

    /// Configuration source could not be read or parsed.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// The store could not be reached.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connecting or pinging the store failed.
    #[error("Cannot connect to store: {0}")]
    ConnectionFailed(String),

    /// Store round trips did not finish within the timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::operation_failed("reset by peer", true).is_retryable());
        assert!(!StorageError::operation_failed("WRONGTYPE", false).is_retryable());
        assert!(StorageError::AtomicConflict.is_retryable());
        assert!(!StorageError::corrupted("key", "not a number").is_retryable());
    }

    #[test]
    fn test_store_failure_classification() {
        let err: RateLimitError = ConnectionError::Timeout(Duration::from_millis(250)).into();
        assert!(err.is_store_failure());
        assert!(err.is_retryable());

        let err: RateLimitError = StorageError::corrupted("k", "bad").into();
        assert!(err.is_store_failure());
        assert!(!err.is_retryable());

        let err: RateLimitError = StorageError::AtomicConflict.into();
        assert!(!err.is_store_failure());
        assert!(err.is_retryable());

        let err: RateLimitError = ConfigError::InvalidVariant("leaky".into()).into();
        assert!(!err.is_store_failure());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = RateLimitError::from(ConfigError::InvalidVariant("gcra".into()));
        assert_eq!(err.to_string(), "Configuration error: Unknown rate limit variant: gcra");

        let err = StorageError::corrupted("fixed-window:1:10.0.0.1", "invalid digit");
        assert!(err.to_string().contains("fixed-window:1:10.0.0.1"));
    }
}
