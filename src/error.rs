//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The config provider could not answer a lookup
    #[error("Config lookup failed: {0}")]
    ConfigLookupFailed(String),

    /// A persisted rate limit config that cannot be enforced
    #[error("Invalid rate limit config: {0}")]
    InvalidConfig(String),

    /// The bucket state store could not be reached or returned an error
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),

    /// The bucket state store did not answer within the configured timeout
    #[error("Bucket store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Optimistic updates kept losing the race for a key
    #[error("Bucket store contention on {key} after {attempts} attempts")]
    StoreContention { key: String, attempts: u32 },

    /// Audit sink rejected an event
    #[error("Audit sink error: {0}")]
    AuditSink(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl TollgateError {
    /// Whether the bucket store could not be reached in time. Only these
    /// errors are subject to the failure policy.
    ///
    /// Contention is not an outage: the store answered, but other writers
    /// kept winning the key.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TollgateError::StoreUnavailable(_) | TollgateError::StoreTimeout(_)
        )
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
