//! Sliding window log limiter.
//!
//! Each request is recorded as a member of a sorted set scored by its
//! timestamp. Pruning stale events, counting, recording the new event and
//! refreshing the log's expiry go to the store as one atomic batch; running
//! them separately would let concurrent callers count against a log that is
//! missing each other's events.
//!
//! A denied request stays in the log and keeps counting against the client
//! until it ages out of the window, so a client that keeps hammering while
//! denied stays denied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::key::ClientKey;
use super::limiter::{limit_arg, Decision, Limiter};
use super::technique::Technique;
use crate::clock::{duration_millis, Clock};
use crate::config::SlidingWindowConfig;
use crate::store::{CounterStore, StoreError, StoreOp, StoreResult};

/// Counts requests within a trailing window of timestamped events.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    /// Requests allowed in any trailing window
    limit: u64,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
        }
    }

    pub fn from_config(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &SlidingWindowConfig,
    ) -> Self {
        Self::new(store, clock, config.limit, config.window())
    }

    /// Store key of the event log for `key`.
    pub fn log_key(key: &ClientKey) -> String {
        key.derived("requests")
    }

    /// Expiry of the event log. An event scored exactly at the window start
    /// is still counted, so the log must outlive the window by a millisecond.
    fn log_ttl(&self) -> Duration {
        self.window.saturating_add(Duration::from_millis(1))
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn technique(&self) -> Technique {
        Technique::SlidingWindow
    }

    async fn is_allowed(&self, key: &ClientKey) -> StoreResult<Decision> {
        let now = self.clock.now_millis();
        let window_start = now - duration_millis(self.window);
        let log_key = Self::log_key(key);
        // Unique per event so same-millisecond requests are all counted
        let member = format!("{}-{}", now, Uuid::new_v4());

        let replies = self
            .store
            .atomic_batch(vec![
                StoreOp::SortedSetRemoveRange {
                    key: log_key.clone(),
                    min: i64::MIN,
                    max: window_start - 1,
                },
                StoreOp::SortedSetCardinality {
                    key: log_key.clone(),
                },
                StoreOp::SortedSetAdd {
                    key: log_key.clone(),
                    score: now,
                    member,
                },
                StoreOp::Expire {
                    key: log_key,
                    ttl: self.log_ttl(),
                },
            ])
            .await?;

        let prior = replies
            .get(1)
            .copied()
            .ok_or_else(|| StoreError::UnexpectedReply("missing cardinality reply".to_string()))?
            .into_int()?;
        let count = prior + 1;

        let decision = if count > limit_arg(self.limit) {
            Decision::Denied
        } else {
            Decision::Allowed
        };

        debug!(
            key = %key,
            count = count,
            limit = self.limit,
            window_start = window_start,
            decision = ?decision,
            "Sliding window checked"
        );
        Ok(decision)
    }
}
