//! Retry executor for denied requests.
//!
//! Semantics:
//! - `retry_count` counts retries, so an action runs at most `retry_count + 1` times.
//! - Only [`Attempt::Denied`] triggers a retry; any `Err` from the action is
//!   returned immediately.
//! - The delay between attempts is fixed and is spent in `tokio::time::sleep`,
//!   so the waiting task yields to others.
//! - Dropping the future returned by [`RetryPolicy::execute`] stops further
//!   attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{RatewardenError, Result};

/// Outcome of a single attempt of a rate-limited action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The action was admitted and produced a value
    Proceed(T),
    /// The action was rate limited and may be retried
    Denied,
}

/// Bounded, fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retry_count: usize,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: usize, delay: Duration) -> Self {
        Self { retry_count, delay }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.retry_count, config.retry_delay())
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total attempts, initial try included.
    pub fn max_attempts(&self) -> usize {
        self.retry_count.saturating_add(1)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` until it proceeds, fails, or runs out of attempts.
    pub async fn execute<T, Fut, Op>(&self, mut action: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            match action().await? {
                Attempt::Proceed(value) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Admitted after retry");
                    }
                    return Ok(value);
                }
                Attempt::Denied if attempt < max_attempts => {
                    warn!(
                        retry = attempt,
                        of = self.retry_count,
                        delay_ms = self.delay.as_millis() as u64,
                        "Rate limited, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Attempt::Denied => {}
            }
        }

        warn!(attempts = max_attempts, "Rate limit retries exhausted");
        Err(RatewardenError::RetryExhausted {
            attempts: max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_permanent_denial_makes_three_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();

        let result: Result<()> = policy
            .execute(|| {
                starts.lock().unwrap().push(origin.elapsed());
                async { Ok(Attempt::Denied) }
            })
            .await;

        assert!(matches!(result, Err(RatewardenError::RetryExhausted { attempts: 3 })));
        let starts = starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 3);
        assert_near(starts[0], Duration::ZERO);
        assert_near(starts[1], Duration::from_secs(1));
        assert_near(starts[2], Duration::from_secs(2));
        // No trailing delay after the last attempt
        assert_near(origin.elapsed(), Duration::from_secs(2));
    }

    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(10),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_denials() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = AtomicUsize::new(0);

        let value = policy
            .execute(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Ok(Attempt::Denied)
                    } else {
                        Ok(Attempt::Proceed("done"))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RatewardenError::Store(StoreError::Unavailable(
                        "down".to_string(),
                    )))
                }
            })
            .await;

        assert!(matches!(result, Err(RatewardenError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_runs_once() {
        let policy = RetryPolicy::no_retry();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(Attempt::Denied) }
            })
            .await;

        assert!(matches!(result, Err(RatewardenError::RetryExhausted { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_attempts() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let execution = policy.execute(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<Attempt<()>, RatewardenError>(Attempt::Denied) }
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(1500), execution).await;
        assert!(timed_out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_does_not_block_other_tasks() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5));
        let other = tokio::spawn(async { 42 });

        let result: Result<()> = policy.execute(|| async { Ok(Attempt::Denied) }).await;

        assert!(result.is_err());
        assert_eq!(other.await.unwrap(), 42);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            retry_count: 4,
            retry_delay_ms: 750,
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(750));
    }
}
