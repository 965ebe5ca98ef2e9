//! Token bucket limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::ClientKey;
use super::limiter::{limit_arg, reply_at, Decision, Limiter};
use super::technique::Technique;
use crate::clock::{duration_millis, Clock};
use crate::config::TokenBucketConfig;
use crate::store::{CounterStore, Script, StoreResult};

/// Grants requests against a replenishing token balance.
///
/// A bucket starts full. Whole refill intervals elapsed since the last refill
/// are added back, capped at capacity, and the refill time only moves when at
/// least one token was added. The refill and the consumption run as one store
/// script so racing callers cannot both spend the same pre-refill balance.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    capacity: u64,
    /// Time to earn back one token
    refill_interval: Duration,
    /// Idle buckets are reclaimed after this long
    bucket_expiry: Duration,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        capacity: u64,
        refill_interval: Duration,
        bucket_expiry: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            capacity,
            refill_interval,
            bucket_expiry,
        }
    }

    pub fn from_config(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &TokenBucketConfig,
    ) -> Self {
        Self::new(
            store,
            clock,
            config.capacity,
            config.refill_interval(),
            config.bucket_expiry(),
        )
    }

    /// Store keys holding the balance and the last refill time for `key`.
    pub fn bucket_keys(key: &ClientKey) -> [String; 2] {
        [key.derived("tokens"), key.derived("lastRefill")]
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn technique(&self) -> Technique {
        Technique::TokenBucket
    }

    async fn is_allowed(&self, key: &ClientKey) -> StoreResult<Decision> {
        let now = self.clock.now_millis();
        let reply = self
            .store
            .run_script(
                Script::TokenBucketTake,
                &Self::bucket_keys(key),
                &[
                    limit_arg(self.capacity),
                    duration_millis(self.refill_interval).max(1),
                    duration_millis(self.bucket_expiry),
                    now,
                ],
            )
            .await?;

        let decision = Decision::from_flag(reply_at(&reply, 0)?);
        let remaining = reply_at(&reply, 1)?;
        let refilled = reply_at(&reply, 2)?;

        if refilled > 0 {
            debug!(key = %key, refilled = refilled, "Token bucket refilled");
        }
        debug!(
            key = %key,
            remaining = remaining,
            capacity = self.capacity,
            decision = ?decision,
            "Token bucket checked"
        );
        Ok(decision)
    }
}
