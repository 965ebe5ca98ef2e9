//! Error types for the Ratewarden service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewarden operations.
///
/// An ordinary rate limit denial is not an error: limiters report it as
/// [`Decision::Denied`](crate::ratelimit::Decision). Only a denial that
/// survives every retry becomes [`RatewardenError::RetryExhausted`].
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// The configured technique name does not map to any limiter
    #[error("Unknown rate limiting technique: {0}")]
    UnknownTechnique(String),

    /// Every attempt was denied
    #[error("Rate limit exceeded after {attempts} attempts")]
    RetryExhausted { attempts: usize },

    /// The store failed and the dispatcher is configured to fail closed
    #[error("Request rejected: counter store unavailable")]
    Rejected,

    /// The shared counter store failed or could not be reached
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The protected operation failed on its own
    #[error("Operation failed: {0}")]
    Operation(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatewardenError {
    /// Wrap a failure of the protected operation.
    pub fn operation<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        RatewardenError::Operation(err.into())
    }

    /// Whether this error is a terminal rejection of the request rather than a fault.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            RatewardenError::RetryExhausted { .. } | RatewardenError::Rejected
        )
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;
