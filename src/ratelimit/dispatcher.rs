//! Technique dispatcher and admission permits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::concurrency::ConcurrencyLimiter;
use super::fixed_window::FixedWindowLimiter;
use super::key::ClientKey;
use super::limiter::{Decision, Limiter};
use super::sliding_window::SlidingWindowLimiter;
use super::technique::Technique;
use super::token_bucket::TokenBucketLimiter;
use crate::clock::Clock;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::store::{CounterStore, StoreError, StoreResult};

/// How the dispatcher treats a request whose limiter could not reach the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Admit the request without taking any capacity
    FailOpen,
    /// Reject the request outright, without retrying
    FailClosed,
}

/// Result of dispatching one request to its limiter.
#[derive(Debug)]
pub enum Admission {
    /// The request may proceed; the permit must be released when it completes
    Allowed(AdmissionPermit),
    /// The limiter denied the request; a later attempt may succeed
    Denied,
    /// The store failed under [`FailurePolicy::FailClosed`]; retrying will not help
    Rejected,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Capacity held on behalf of one admitted request.
///
/// Only concurrency admissions hold anything. Releasing is idempotent per
/// permit; a permit dropped without being released gives its slot back from
/// a background task so an abandoned request never leaks a slot.
#[must_use = "an admitted request must release its permit when it completes"]
pub struct AdmissionPermit {
    slot: Option<(Arc<dyn Limiter>, ClientKey)>,
}

impl AdmissionPermit {
    fn detached() -> Self {
        Self { slot: None }
    }

    fn held(limiter: Arc<dyn Limiter>, key: ClientKey) -> Self {
        Self {
            slot: Some((limiter, key)),
        }
    }

    /// Whether releasing this permit gives capacity back to the store.
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Give the held capacity back.
    ///
    /// The store call runs on its own task, so cancelling the caller while
    /// it awaits this does not cancel the release.
    pub async fn release(mut self) -> StoreResult<()> {
        let Some((limiter, key)) = self.slot.take() else {
            return Ok(());
        };

        tokio::spawn(async move { limiter.release(&key).await })
            .await
            .map_err(|e| StoreError::OperationFailed(format!("release task failed: {}", e)))?
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let Some((limiter, key)) = self.slot.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Permit dropped before release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = limiter.release(&key).await {
                        error!(key = %key, error = %e, "Failed to release abandoned slot");
                    }
                });
            }
            Err(_) => {
                error!(key = %key, "Permit dropped outside a runtime, slot not released");
            }
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.slot.as_ref().map(|(_, key)| key))
            .finish()
    }
}

/// Selects the limiter for a technique and runs it.
///
/// Each technique is bound to exactly one limiter when the dispatcher is
/// built; lookups never fall back to a default.
pub struct Dispatcher {
    fixed_window: Arc<dyn Limiter>,
    sliding_window: Arc<dyn Limiter>,
    token_bucket: Arc<dyn Limiter>,
    concurrency: Arc<dyn Limiter>,
    on_store_failure: FailurePolicy,
}

impl Dispatcher {
    /// Build all four limiters over one shared store.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &RateLimitingConfig,
    ) -> Self {
        Self {
            fixed_window: Arc::new(FixedWindowLimiter::from_config(
                store.clone(),
                &config.fixed_window,
            )),
            sliding_window: Arc::new(SlidingWindowLimiter::from_config(
                store.clone(),
                clock.clone(),
                &config.sliding_window,
            )),
            token_bucket: Arc::new(TokenBucketLimiter::from_config(
                store.clone(),
                clock,
                &config.token_bucket,
            )),
            concurrency: Arc::new(ConcurrencyLimiter::from_config(store, &config.concurrency)),
            on_store_failure: config.on_store_failure,
        }
    }

    /// Build a dispatcher from pre-built limiters.
    pub fn with_limiters(
        fixed_window: Arc<dyn Limiter>,
        sliding_window: Arc<dyn Limiter>,
        token_bucket: Arc<dyn Limiter>,
        concurrency: Arc<dyn Limiter>,
    ) -> Self {
        Self {
            fixed_window,
            sliding_window,
            token_bucket,
            concurrency,
            on_store_failure: FailurePolicy::default(),
        }
    }

    /// Set how store failures are treated.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }

    /// The limiter bound to `technique`.
    pub fn limiter(&self, technique: Technique) -> &Arc<dyn Limiter> {
        match technique {
            Technique::FixedWindow => &self.fixed_window,
            Technique::SlidingWindow => &self.sliding_window,
            Technique::TokenBucket => &self.token_bucket,
            Technique::Concurrency => &self.concurrency,
        }
    }

    /// Check `key` with the technique named `technique`.
    ///
    /// An unrecognised name is a configuration error, never a decision.
    pub async fn evaluate(&self, technique: &str, key: &ClientKey) -> Result<Admission> {
        let technique: Technique = technique.parse()?;
        self.evaluate_technique(technique, key).await
    }

    /// Check `key` with an already-resolved technique.
    pub async fn evaluate_technique(&self, technique: Technique, key: &ClientKey) -> Result<Admission> {
        let limiter = self.limiter(technique);

        let decision = match limiter.is_allowed(key).await {
            Ok(decision) => decision,
            Err(e) => {
                return match self.on_store_failure {
                    FailurePolicy::Propagate => Err(e.into()),
                    FailurePolicy::FailOpen => {
                        warn!(technique = %technique, key = %key, error = %e, "Store failed, admitting request");
                        Ok(Admission::Allowed(AdmissionPermit::detached()))
                    }
                    FailurePolicy::FailClosed => {
                        warn!(technique = %technique, key = %key, error = %e, "Store failed, rejecting request");
                        Ok(Admission::Rejected)
                    }
                };
            }
        };

        match decision {
            Decision::Allowed => {
                debug!(technique = %technique, key = %key, "Admission granted");
                let permit = if limiter.holds_capacity() {
                    AdmissionPermit::held(limiter.clone(), key.clone())
                } else {
                    AdmissionPermit::detached()
                };
                Ok(Admission::Allowed(permit))
            }
            Decision::Denied => {
                debug!(technique = %technique, key = %key, "Admission denied");
                Ok(Admission::Denied)
            }
        }
    }
}
