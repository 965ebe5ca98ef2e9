//! Redis-backed counter store.
//!
//! Batches run as `MULTI`/`EXEC` pipelines and admission scripts run through
//! `EVALSHA`, so every read-modify-write sequence is atomic at the server no
//! matter how many processes share it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{from_redis_value, RedisError, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{CounterStore, Script, StoreError, StoreOp, StoreReply, StoreResult};
use crate::clock::duration_millis;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.code() == Some("WRONGTYPE") {
            StoreError::WrongType(err.to_string())
        } else if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::OperationFailed(err.to_string())
        }
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_RETRIES: usize = 2;

/// A counter store shared through a Redis server.
pub struct RedisStore {
    client: redis::Client,
    /// Multiplexed connection that reconnects on failure, opened on first use
    /// when the store was created lazily
    conn: OnceCell<ConnectionManager>,
    /// Loaded admission scripts, hashed once
    scripts: HashMap<Script, redis::Script>,
}

impl RedisStore {
    /// Connect to the server at `url`, failing if it cannot be reached.
    ///
    /// `redis://` and `rediss://` (TLS) URLs are accepted, with optional
    /// `user:password@` credentials.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let store = Self::lazy(url)?;
        store.connection().await?;
        info!("Connected to Redis counter store");
        Ok(store)
    }

    /// Create a store that connects on first use and keeps retrying the
    /// connection on later operations until the server answers.
    pub fn lazy(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let scripts = Script::ALL
            .iter()
            .map(|script| (*script, redis::Script::new(script.lua())))
            .collect();

        Ok(Self {
            client,
            conn: OnceCell::new(),
            scripts,
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(CONNECT_TIMEOUT)
                    .set_number_of_retries(CONNECT_RETRIES);
                ConnectionManager::new_with_config(self.client.clone(), config)
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "Redis connection attempt failed");
                        StoreError::from(e)
                    })
            })
            .await?;
        Ok(conn.clone())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.conn.initialized())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn atomic_batch(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                StoreOp::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                StoreOp::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(*value);
                    if let Some(ttl) = ttl {
                        pipe.arg("PX").arg(duration_millis(*ttl));
                    }
                }
                StoreOp::Increment { key } => {
                    pipe.cmd("INCR").arg(key);
                }
                StoreOp::Decrement { key } => {
                    pipe.cmd("DECR").arg(key);
                }
                StoreOp::SortedSetRemoveRange { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                }
                StoreOp::SortedSetAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                StoreOp::SortedSetCardinality { key } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(duration_millis(*ttl));
                }
            }
        }

        let mut conn = self.connection().await?;
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        if values.len() != ops.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                ops.len(),
                values.len()
            )));
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| to_reply(op, value))
            .collect()
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>> {
        let loaded = self
            .scripts
            .get(&script)
            .ok_or_else(|| StoreError::OperationFailed(format!("script {} not loaded", script)))?;

        let mut invocation = loaded.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        debug!(script = %script, keys = ?keys, "Invoking Redis script");
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }
}

fn to_reply(op: &StoreOp, value: &Value) -> StoreResult<StoreReply> {
    match op {
        StoreOp::Set { .. } => Ok(StoreReply::Ok),
        StoreOp::Get { .. } => {
            let parsed: Option<i64> = from_redis_value(value)?;
            Ok(parsed.map_or(StoreReply::Nil, StoreReply::Int))
        }
        _ => {
            let parsed: i64 = from_redis_value(value)?;
            Ok(StoreReply::Int(parsed))
        }
    }
}
