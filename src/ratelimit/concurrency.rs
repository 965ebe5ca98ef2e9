//! Concurrency slot limiter.
//!
//! Every allowed decision takes a slot that the caller must give back with
//! [`Limiter::release`] once the admitted work ends, whatever its outcome.
//! Denied requests are not queued: the caller's retry policy resubmits them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::ClientKey;
use super::limiter::{limit_arg, reply_at, Decision, Limiter};
use super::technique::Technique;
use crate::clock::duration_millis;
use crate::config::ConcurrencyConfig;
use crate::store::{CounterStore, Script, StoreResult};

/// Caps the number of simultaneously in-flight requests per client.
pub struct ConcurrencyLimiter {
    store: Arc<dyn CounterStore>,
    max_concurrent: u64,
    /// Expiry refreshed on each admission, if any
    lease: Option<Duration>,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn CounterStore>, max_concurrent: u64, lease: Option<Duration>) -> Self {
        Self {
            store,
            max_concurrent,
            lease,
        }
    }

    pub fn from_config(store: Arc<dyn CounterStore>, config: &ConcurrencyConfig) -> Self {
        Self::new(store, config.max_concurrent_requests, config.lease())
    }

    /// Current number of in-flight requests for `key`.
    pub async fn in_flight(&self, key: &ClientKey) -> StoreResult<i64> {
        Ok(self.store.get_value(key.as_str()).await?.unwrap_or(0))
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn technique(&self) -> Technique {
        Technique::Concurrency
    }

    async fn is_allowed(&self, key: &ClientKey) -> StoreResult<Decision> {
        let lease_ms = self.lease.map(duration_millis).unwrap_or(0);
        let reply = self
            .store
            .run_script(
                Script::ConcurrencyAcquire,
                &[key.to_string()],
                &[limit_arg(self.max_concurrent), lease_ms],
            )
            .await?;

        let decision = Decision::from_flag(reply_at(&reply, 0)?);
        debug!(
            key = %key,
            in_flight = reply_at(&reply, 1)?,
            max_concurrent = self.max_concurrent,
            decision = ?decision,
            "Concurrency slot checked"
        );
        Ok(decision)
    }

    async fn release(&self, key: &ClientKey) -> StoreResult<()> {
        let reply = self
            .store
            .run_script(Script::ConcurrencyRelease, &[key.to_string()], &[])
            .await?;

        debug!(key = %key, in_flight = reply_at(&reply, 0)?, "Concurrency slot released");
        Ok(())
    }

    fn holds_capacity(&self) -> bool {
        true
    }
}
