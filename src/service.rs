//! Rate-limited execution of a protected operation.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{Admission, ClientKey, Dispatcher, Technique};
use crate::retry::{Attempt, RetryPolicy};

/// HTTP status for an admitted request.
pub const STATUS_OK: u16 = 200;
/// HTTP status for a rejected request or an internal fault.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Runs protected operations behind the dispatcher and the retry policy.
pub struct RateLimitedService {
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
    /// Technique used by [`handle_request`](Self::handle_request)
    technique: Technique,
}

impl RateLimitedService {
    pub fn new(dispatcher: Arc<Dispatcher>, retry: RetryPolicy, technique: Technique) -> Self {
        Self {
            dispatcher,
            retry,
            technique,
        }
    }

    /// Technique applied by [`handle_request`](Self::handle_request).
    pub fn technique(&self) -> Technique {
        self.technique
    }

    /// Run `operation` once `key` is admitted under `technique`.
    ///
    /// Denials are retried per the retry policy. Unknown techniques, store
    /// failures, fail-closed rejections and errors from `operation` end the
    /// call at once. A
    /// concurrency slot taken for an attempt is released after `operation`
    /// finishes, fails, or is abandoned.
    #[instrument(skip(self, operation), fields(technique = %technique, key = %key))]
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        technique: &str,
        key: &ClientKey,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let technique: Technique = technique.parse()?;
        self.execute_technique(technique, key, operation).await
    }

    /// Same as [`execute_with_rate_limit`](Self::execute_with_rate_limit) with a resolved technique.
    pub async fn execute_technique<T, F, Fut>(
        &self,
        technique: Technique,
        key: &ClientKey,
        operation: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let dispatcher = &self.dispatcher;
        let operation = &operation;

        self.retry
            .execute(move || async move {
                match dispatcher.evaluate_technique(technique, key).await? {
                    Admission::Denied => Ok(Attempt::Denied),
                    Admission::Rejected => Err(RatewardenError::Rejected),
                    Admission::Allowed(permit) => {
                        let outcome = operation().await;
                        // A slot that fails to release is reclaimed by its lease, if any
                        if let Err(e) = permit.release().await {
                            warn!(key = %key, error = %e, "Failed to release concurrency slot");
                        }
                        outcome.map(Attempt::Proceed)
                    }
                }
            })
            .await
    }

    /// Handle one request from `origin` with the configured technique and
    /// return the HTTP status the boundary should answer with.
    pub async fn handle_request<T, F, Fut>(&self, origin: &str, operation: F) -> u16
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = ClientKey::for_origin(self.technique, origin);
        info!(technique = %self.technique, key = %key, "Rate limiting check initiated");

        let result = self.execute_technique(self.technique, &key, operation).await;
        match &result {
            Ok(_) => info!(key = %key, "Request allowed"),
            Err(RatewardenError::Rejected) => warn!(key = %key, "Request rejected, store unavailable"),
            Err(e) if e.is_rate_limited() => info!(key = %key, "Rate limit exceeded"),
            Err(e) => warn!(key = %key, error = %e, "Request failed"),
        }
        status_code(&result)
    }
}

/// Map the outcome of a rate-limited call to its HTTP status.
pub fn status_code<T>(result: &Result<T>) -> u16 {
    match result {
        Ok(_) => STATUS_OK,
        Err(_) => STATUS_TOO_MANY_REQUESTS,
    }
}
