//! Behavior every [`CounterStore`] backend must share.
//!
//! Each check takes the store under test and a key prefix unique to the run,
//! so backends that persist between runs start from empty keys.

use std::sync::Arc;
use std::time::Duration;

use super::{CounterStore, StoreError, StoreOp, StoreReply};
use crate::clock::Clock;
use crate::ratelimit::{
    ClientKey, ConcurrencyLimiter, Decision, FixedWindowLimiter, Limiter, SlidingWindowLimiter,
    TokenBucketLimiter,
};

pub(crate) async fn batch_replies_in_order(store: Arc<dyn CounterStore>, prefix: &str) {
    let counter = format!("{}:counter", prefix);
    let log = format!("{}:log", prefix);

    let replies = store
        .atomic_batch(vec![
            StoreOp::Set {
                key: counter.clone(),
                value: 4,
                ttl: Some(Duration::from_secs(60)),
            },
            StoreOp::Increment { key: counter.clone() },
            StoreOp::Decrement { key: counter.clone() },
            StoreOp::Get { key: counter.clone() },
            StoreOp::Get {
                key: format!("{}:missing", prefix),
            },
            StoreOp::SortedSetAdd {
                key: log.clone(),
                score: 10,
                member: "a".to_string(),
            },
            StoreOp::SortedSetAdd {
                key: log.clone(),
                score: 20,
                member: "b".to_string(),
            },
            StoreOp::SortedSetRemoveRange {
                key: log.clone(),
                min: i64::MIN,
                max: 10,
            },
            StoreOp::SortedSetCardinality { key: log.clone() },
            StoreOp::Expire {
                key: log,
                ttl: Duration::from_secs(60),
            },
        ])
        .await
        .unwrap();

    assert_eq!(
        replies,
        vec![
            StoreReply::Ok,
            StoreReply::Int(5),
            StoreReply::Int(4),
            StoreReply::Int(4),
            StoreReply::Nil,
            StoreReply::Int(1),
            StoreReply::Int(1),
            StoreReply::Int(1),
            StoreReply::Int(1),
            StoreReply::Int(1),
        ]
    );
}

pub(crate) async fn wrong_type_is_reported(store: Arc<dyn CounterStore>, prefix: &str) {
    let log = format!("{}:log", prefix);
    store.sorted_set_add(&log, 1, "a").await.unwrap();

    let err = store.increment(&log).await.unwrap_err();
    assert!(matches!(err, StoreError::WrongType(_)), "got {:?}", err);
}

pub(crate) async fn fixed_window_admits_up_to_limit(store: Arc<dyn CounterStore>, prefix: &str) {
    let limiter = FixedWindowLimiter::new(store.clone(), 3, Duration::from_secs(60));
    let key = ClientKey::new(format!("{}:FixedWindow", prefix));

    for _ in 0..3 {
        assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Allowed);
    }
    assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Denied);
    // Denials leave the counter at the limit
    assert_eq!(store.get_value(key.as_str()).await.unwrap(), Some(3));
}

pub(crate) async fn sliding_window_admits_up_to_limit(
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: &str,
) {
    let limiter = SlidingWindowLimiter::new(store.clone(), clock, 3, Duration::from_secs(60));
    let key = ClientKey::new(format!("{}:SlidingWindow", prefix));

    for _ in 0..3 {
        assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Allowed);
    }
    assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Denied);

    let log_key = SlidingWindowLimiter::log_key(&key);
    assert_eq!(store.sorted_set_cardinality(&log_key).await.unwrap(), 4);
}

pub(crate) async fn token_bucket_starts_full(
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: &str,
) {
    let limiter = TokenBucketLimiter::new(
        store.clone(),
        clock,
        2,
        Duration::from_secs(3600),
        Duration::from_secs(60),
    );
    let key = ClientKey::new(format!("{}:TokenBucket", prefix));
    let [tokens_key, _] = TokenBucketLimiter::bucket_keys(&key);

    assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Allowed);
    assert_eq!(store.get_value(&tokens_key).await.unwrap(), Some(1));
    assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Allowed);
    assert_eq!(limiter.is_allowed(&key).await.unwrap(), Decision::Denied);
    assert_eq!(store.get_value(&tokens_key).await.unwrap(), Some(0));
}

pub(crate) async fn concurrency_slots_never_negative(store: Arc<dyn CounterStore>, prefix: &str) {
    let limiter = ConcurrencyLimiter::new(store.clone(), 2, Some(Duration::from_secs(60)));
    let key = ClientKey::new(format!("{}:Concurrency", prefix));

    limiter.release(&key).await.unwrap();
    assert_eq!(limiter.in_flight(&key).await.unwrap(), 0);

    assert!(limiter.is_allowed(&key).await.unwrap().is_allowed());
    assert!(limiter.is_allowed(&key).await.unwrap().is_allowed());
    assert!(!limiter.is_allowed(&key).await.unwrap().is_allowed());

    for _ in 0..3 {
        limiter.release(&key).await.unwrap();
    }
    assert_eq!(limiter.in_flight(&key).await.unwrap(), 0);

    // A negative counter left by an outside writer is clamped back to zero
    store.set_value(key.as_str(), -3, None).await.unwrap();
    limiter.release(&key).await.unwrap();
    assert_eq!(limiter.in_flight(&key).await.unwrap(), 0);
}

pub(crate) async fn concurrent_callers_never_over_admit(store: Arc<dyn CounterStore>, prefix: &str) {
    let limiter = Arc::new(FixedWindowLimiter::new(store, 10, Duration::from_secs(60)));
    let key = ClientKey::new(format!("{}:FixedWindow:race", prefix));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.is_allowed(&key).await.unwrap() })
        })
        .collect();

    let allowed = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|d| d.as_ref().unwrap().is_allowed())
        .count();
    assert_eq!(allowed, 10);
}
