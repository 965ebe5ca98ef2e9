//! Shared counter store consumed by every limiter.
//!
//! The store is the only coordination point between process instances. Any
//! sequence that reads a value and writes back something derived from it must
//! reach the store as a single [`CounterStore::atomic_batch`] or
//! [`CounterStore::run_script`] call.

#[cfg(test)]
mod conformance;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
mod scripts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use scripts::Script;

/// Errors raised by a [`CounterStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store was reached but rejected or failed the operation
    #[error("store operation failed: {0}")]
    OperationFailed(String),
    /// A counter command hit a sorted set or the other way round
    #[error("wrong value type at key {0}")]
    WrongType(String),
    /// The reply did not have the expected shape
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single store command, as queued inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Read an integer value. Replies `Nil` or `Int`.
    Get { key: String },
    /// Overwrite an integer value, optionally with an expiry. Replies `Ok`.
    Set {
        key: String,
        value: i64,
        ttl: Option<Duration>,
    },
    /// Add one, creating the key at zero first. Replies `Int`.
    Increment { key: String },
    /// Subtract one, creating the key at zero first. Replies `Int`.
    Decrement { key: String },
    /// Remove members whose score lies in `[min, max]`. Replies the removed count.
    SortedSetRemoveRange { key: String, min: i64, max: i64 },
    /// Insert or rescore a member. Replies 1 if the member is new.
    SortedSetAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// Number of members. Replies `Int`, zero for a missing key.
    SortedSetCardinality { key: String },
    /// Set a key's time to live. Replies 1 if the key exists.
    Expire { key: String, ttl: Duration },
}

/// Reply to a single [`StoreOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    Nil,
    Int(i64),
    Ok,
}

impl StoreReply {
    /// Interpret the reply as an integer.
    pub fn into_int(self) -> StoreResult<i64> {
        match self {
            StoreReply::Int(v) => Ok(v),
            other => Err(StoreError::UnexpectedReply(format!(
                "expected integer, got {:?}",
                other
            ))),
        }
    }

    /// Interpret the reply as an optional integer.
    pub fn into_optional_int(self) -> StoreResult<Option<i64>> {
        match self {
            StoreReply::Nil => Ok(None),
            StoreReply::Int(v) => Ok(Some(v)),
            StoreReply::Ok => Err(StoreError::UnexpectedReply(
                "expected integer or nil, got OK".to_string(),
            )),
        }
    }
}

/// Key-value and sorted-set store shared by all process instances.
///
/// Implementors provide [`atomic_batch`](CounterStore::atomic_batch) and
/// [`run_script`](CounterStore::run_script); the single-command helpers are
/// one-element batches.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Execute every op without interleaving from other callers.
    ///
    /// Replies are returned in op order and the first failing op fails the
    /// call. [`MemoryStore`] then discards the batch's writes; Redis keeps the
    /// writes of the ops that succeeded, as `MULTI`/`EXEC` does not roll back.
    /// Limiters only batch ops that cannot fail on well-typed keys.
    async fn atomic_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>>;

    /// Run one of the admission scripts atomically at the store.
    async fn run_script(
        &self,
        script: Script,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>>;

    async fn get_value(&self, key: &str) -> StoreResult<Option<i64>> {
        self.single(StoreOp::Get { key: key.to_string() })
            .await?
            .into_optional_int()
    }

    async fn set_value(&self, key: &str, value: i64, ttl: Option<Duration>) -> StoreResult<()> {
        self.single(StoreOp::Set {
            key: key.to_string(),
            value,
            ttl,
        })
        .await
        .map(|_| ())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::Increment { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn decrement(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::Decrement { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn sorted_set_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<i64> {
        self.single(StoreOp::SortedSetRemoveRange {
            key: key.to_string(),
            min,
            max,
        })
        .await?
        .into_int()
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> StoreResult<bool> {
        let added = self
            .single(StoreOp::SortedSetAdd {
                key: key.to_string(),
                score,
                member: member.to_string(),
            })
            .await?
            .into_int()?;
        Ok(added > 0)
    }

    async fn sorted_set_cardinality(&self, key: &str) -> StoreResult<i64> {
        self.single(StoreOp::SortedSetCardinality { key: key.to_string() })
            .await?
            .into_int()
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let applied = self
            .single(StoreOp::Expire {
                key: key.to_string(),
                ttl,
            })
            .await?
            .into_int()?;
        Ok(applied > 0)
    }

    #[doc(hidden)]
    async fn single(&self, op: StoreOp) -> StoreResult<StoreReply> {
        self.atomic_batch(vec![op])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnexpectedReply("empty batch reply".to_string()))
    }
}

/// Open the store selected by `config`.
///
/// The in-memory backend reads expiry time from `clock`; Redis keeps its own.
pub async fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> StoreResult<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis if config.abort_on_connect_fail => {
            info!("Connecting to Redis counter store");
            Ok(Arc::new(RedisStore::connect(&config.redis_url).await?))
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            info!("Using Redis counter store, connecting on first use");
            Ok(Arc::new(RedisStore::lazy(&config.redis_url)?))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => Err(StoreError::OperationFailed(
            "redis backend requires the redis-store feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_open_memory_backend() {
        let clock = Arc::new(ManualClock::default());
        let store = open(&StoreConfig::default(), clock.clone()).await.unwrap();

        tokio_test::assert_ok!(store.set_value("k", 5, Some(Duration::from_secs(1))).await);
        assert_eq!(store.increment("k").await.unwrap(), 6);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get_value("k").await.unwrap(), None);
    }

    #[cfg(feature = "redis-store")]
    #[tokio::test]
    async fn test_open_redis_honours_abort_on_connect_fail() {
        let clock = Arc::new(ManualClock::default());
        let mut config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:9".to_string(),
            ..StoreConfig::default()
        };

        match open(&config, clock.clone()).await {
            Err(StoreError::Unavailable(_)) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("startup should abort when Redis is unreachable"),
        }

        config.abort_on_connect_fail = false;
        let store = open(&config, clock).await.unwrap();
        let err = store.get_value("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "got {:?}", err);
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(StoreReply::Int(3).into_int().unwrap(), 3);
        assert_eq!(StoreReply::Nil.into_optional_int().unwrap(), None);
        assert!(StoreReply::Ok.into_int().is_err());
        assert!(StoreReply::Ok.into_optional_int().is_err());
    }
}
