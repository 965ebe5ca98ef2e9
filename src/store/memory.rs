//! In-process counter store.
//!
//! Every batch and script runs while holding the keyspace lock, which gives
//! the same no-interleaving guarantee a networked store gives through
//! transactions and server-side scripts. Expired keys are evicted lazily on
//! access and by a periodic sweep, as Redis does, so keys that are never
//! touched again do not accumulate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CounterStore, Script, StoreError, StoreOp, StoreReply, StoreResult};
use crate::clock::{duration_millis, Clock, SystemClock};

/// A counter store living in this process's memory.
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store using the system clock for expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads expiry time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Entries held in memory, expired or not.
    #[cfg(test)]
    fn stored_entries(&self) -> usize {
        self.keyspace.lock().entries.len()
    }

    /// Remaining time to live of a key in milliseconds, if it has one.
    pub fn ttl_millis(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock();
        keyspace
            .live_entry(key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now)
    }

    /// Run `f` against the keyspace, restoring `keys` if it fails.
    fn transact<T, F>(&self, keys: &[&str], f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Keyspace, i64) -> StoreResult<T>,
    {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock();
        let snapshot: Vec<(String, Option<Entry>)> = keys
            .iter()
            .map(|key| (key.to_string(), keyspace.entries.get(*key).cloned()))
            .collect();

        let result = f(&mut *keyspace, now);
        if result.is_err() {
            for (key, entry) in snapshot {
                match entry {
                    Some(entry) => keyspace.entries.insert(key, entry),
                    None => keyspace.entries.remove(&key),
                };
            }
        }
        keyspace.record_operation(now);
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn atomic_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        let keys: Vec<&str> = ops.iter().map(op_key).collect();
        self.transact(&keys, |keyspace, now| {
            ops.iter().map(|op| keyspace.apply(op, now)).collect()
        })
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>> {
        trace!(script = %script, keys = ?keys, args = ?args, "Running script");
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.transact(&key_refs, |keyspace, now| match script {
            Script::FixedWindowAdmit => fixed_window_admit(keyspace, now, keys, args),
            Script::TokenBucketTake => token_bucket_take(keyspace, now, keys, args),
            Script::ConcurrencyAcquire => concurrency_acquire(keyspace, now, keys, args),
            Script::ConcurrencyRelease => concurrency_release(keyspace, now, keys),
        })
    }
}

fn op_key(op: &StoreOp) -> &str {
    match op {
        StoreOp::Get { key }
        | StoreOp::Set { key, .. }
        | StoreOp::Increment { key }
        | StoreOp::Decrement { key }
        | StoreOp::SortedSetRemoveRange { key, .. }
        | StoreOp::SortedSetAdd { key, .. }
        | StoreOp::SortedSetCardinality { key }
        | StoreOp::Expire { key, .. } => key.as_str(),
    }
}

fn script_key<'a>(keys: &'a [String], index: usize) -> StoreResult<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::OperationFailed(format!("missing script key {}", index + 1)))
}

fn script_arg(args: &[i64], index: usize) -> StoreResult<i64> {
    args.get(index)
        .copied()
        .ok_or_else(|| StoreError::OperationFailed(format!("missing script argument {}", index + 1)))
}

fn fixed_window_admit(
    keyspace: &mut Keyspace,
    now: i64,
    keys: &[String],
    args: &[i64],
) -> StoreResult<Vec<i64>> {
    let key = script_key(keys, 0)?;
    let limit = script_arg(args, 0)?;
    let window_ms = script_arg(args, 1)?;

    match keyspace.get(key, now)? {
        None => {
            keyspace.set(key, 1, Some(window_ms), now);
            Ok(vec![1, 1])
        }
        Some(current) if current >= limit => Ok(vec![0, current]),
        Some(_) => Ok(vec![1, keyspace.add(key, 1, now)?]),
    }
}

fn token_bucket_take(
    keyspace: &mut Keyspace,
    now: i64,
    keys: &[String],
    args: &[i64],
) -> StoreResult<Vec<i64>> {
    let tokens_key = script_key(keys, 0)?;
    let last_refill_key = script_key(keys, 1)?;
    let capacity = script_arg(args, 0)?;
    let interval_ms = script_arg(args, 1)?.max(1);
    let expiry_ms = script_arg(args, 2)?;
    let request_time = script_arg(args, 3)?;

    let mut tokens = keyspace.get(tokens_key, now)?.unwrap_or(capacity);
    let mut last_refill = keyspace.get(last_refill_key, now)?.unwrap_or(request_time);

    let mut refill = (request_time - last_refill).div_euclid(interval_ms);
    if refill > 0 {
        tokens = tokens.saturating_add(refill).min(capacity);
        last_refill = request_time;
    } else {
        refill = 0;
    }

    if tokens <= 0 {
        return Ok(vec![0, 0, refill]);
    }

    tokens -= 1;
    keyspace.set(tokens_key, tokens, Some(expiry_ms), now);
    keyspace.set(last_refill_key, last_refill, Some(expiry_ms), now);
    Ok(vec![1, tokens, refill])
}

fn concurrency_acquire(
    keyspace: &mut Keyspace,
    now: i64,
    keys: &[String],
    args: &[i64],
) -> StoreResult<Vec<i64>> {
    let key = script_key(keys, 0)?;
    let max_concurrent = script_arg(args, 0)?;
    let lease_ms = script_arg(args, 1)?;

    let current = keyspace.get(key, now)?.unwrap_or(0);
    if current >= max_concurrent {
        return Ok(vec![0, current]);
    }

    let in_flight = keyspace.add(key, 1, now)?;
    if lease_ms > 0 {
        keyspace.expire(key, lease_ms, now);
    }
    Ok(vec![1, in_flight])
}

fn concurrency_release(
    keyspace: &mut Keyspace,
    now: i64,
    keys: &[String],
) -> StoreResult<Vec<i64>> {
    let key = script_key(keys, 0)?;

    match keyspace.get(key, now)? {
        None => Ok(vec![0]),
        Some(current) if current <= 0 => {
            if current < 0 {
                keyspace.set_keep_ttl(key, 0, now);
            }
            Ok(vec![0])
        }
        Some(_) => Ok(vec![keyspace.add(key, -1, now)?]),
    }
}

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    SortedSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiry time in epoch milliseconds
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Operations between sweeps, at least. A sweep is also deferred until as
/// many operations as there are keys have run, keeping its cost amortised.
const SWEEP_MIN_OPERATIONS: usize = 1024;

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    operations_since_sweep: usize,
}

impl Keyspace {
    fn record_operation(&mut self, now: i64) {
        self.operations_since_sweep += 1;
        if self.operations_since_sweep >= SWEEP_MIN_OPERATIONS.max(self.entries.len()) {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: i64) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.operations_since_sweep = 0;

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.entries.len(), "Swept expired keys");
        }
    }

    fn live_entry(&mut self, key: &str, now: i64) -> Option<&mut Entry> {
        if self.entries.get(key).map_or(false, |e| e.is_expired(now)) {
            trace!(key = %key, "Evicting expired key");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn apply(&mut self, op: &StoreOp, now: i64) -> StoreResult<StoreReply> {
        match op {
            StoreOp::Get { key } => Ok(self.get(key, now)?.map_or(StoreReply::Nil, StoreReply::Int)),
            StoreOp::Set { key, value, ttl } => {
                self.set(key, *value, ttl.map(duration_millis), now);
                Ok(StoreReply::Ok)
            }
            StoreOp::Increment { key } => self.add(key, 1, now).map(StoreReply::Int),
            StoreOp::Decrement { key } => self.add(key, -1, now).map(StoreReply::Int),
            StoreOp::SortedSetRemoveRange { key, min, max } => {
                self.sorted_set_remove_range(key, *min, *max, now).map(StoreReply::Int)
            }
            StoreOp::SortedSetAdd { key, score, member } => {
                self.sorted_set_add(key, *score, member, now).map(StoreReply::Int)
            }
            StoreOp::SortedSetCardinality { key } => {
                self.sorted_set_cardinality(key, now).map(StoreReply::Int)
            }
            StoreOp::Expire { key, ttl } => {
                Ok(StoreReply::Int(self.expire(key, duration_millis(*ttl), now)))
            }
        }
    }

    fn get(&mut self, key: &str, now: i64) -> StoreResult<Option<i64>> {
        match self.live_entry(key, now) {
            None => Ok(None),
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => Ok(Some(*v)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: &str, value: i64, ttl_ms: Option<i64>, now: i64) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
            },
        );
    }

    fn set_keep_ttl(&mut self, key: &str, value: i64, now: i64) {
        let expires_at = self.live_entry(key, now).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at,
            },
        );
    }

    fn add(&mut self, key: &str, delta: i64, now: i64) -> StoreResult<i64> {
        match self.live_entry(key, now) {
            None => {
                self.set(key, delta, None, now);
                Ok(delta)
            }
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => {
                *v = v.checked_add(delta).ok_or_else(|| {
                    StoreError::OperationFailed(format!("increment would overflow at key {}", key))
                })?;
                Ok(*v)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn expire(&mut self, key: &str, ttl_ms: i64, now: i64) -> i64 {
        match self.live_entry(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(ttl_ms));
                1
            }
            None => 0,
        }
    }

    fn sorted_set_add(&mut self, key: &str, score: i64, member: &str, now: i64) -> StoreResult<i64> {
        match self.live_entry(key, now) {
            None => {
                let mut members = HashMap::new();
                members.insert(member.to_string(), score);
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::SortedSet(members),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => Ok(match members.insert(member.to_string(), score) {
                Some(_) => 0,
                None => 1,
            }),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_set_remove_range(&mut self, key: &str, min: i64, max: i64, now: i64) -> StoreResult<i64> {
        let removed = match self.live_entry(key, now) {
            None => return Ok(0),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => {
                let before = members.len();
                members.retain(|_, score| *score < min || *score > max);
                (before - members.len()) as i64
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };

        // Empty sets cease to exist
        if let Some(Entry {
            value: Value::SortedSet(members),
            ..
        }) = self.entries.get(key)
        {
            if members.is_empty() {
                self.entries.remove(key);
            }
        }
        Ok(removed)
    }

    fn sorted_set_cardinality(&mut self, key: &str, now: i64) -> StoreResult<i64> {
        match self.live_entry(key, now) {
            None => Ok(0),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => Ok(members.len() as i64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}
