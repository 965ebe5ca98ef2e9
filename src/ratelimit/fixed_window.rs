//! Fixed window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::ClientKey;
use super::limiter::{limit_arg, reply_at, Decision, Limiter};
use super::technique::Technique;
use crate::clock::duration_millis;
use crate::config::FixedWindowConfig;
use crate::store::{CounterStore, Script, StoreResult};

/// Counts requests per client in a window opened by the client's first request.
///
/// The counter is created with an expiry equal to the window; when the store
/// evicts it the next request opens a fresh window. Windows are not aligned
/// to wall-clock boundaries.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    /// Requests allowed per window
    limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    pub fn from_config(store: Arc<dyn CounterStore>, config: &FixedWindowConfig) -> Self {
        Self::new(store, config.limit, config.window())
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn technique(&self) -> Technique {
        Technique::FixedWindow
    }

    async fn is_allowed(&self, key: &ClientKey) -> StoreResult<Decision> {
        let reply = self
            .store
            .run_script(
                Script::FixedWindowAdmit,
                &[key.to_string()],
                &[limit_arg(self.limit), duration_millis(self.window)],
            )
            .await?;

        let decision = Decision::from_flag(reply_at(&reply, 0)?);
        let count = reply_at(&reply, 1)?;

        debug!(
            key = %key,
            count = count,
            limit = self.limit,
            decision = ?decision,
            "Fixed window checked"
        );
        Ok(decision)
    }
}
