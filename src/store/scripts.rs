//! Server-side admission scripts.
//!
//! Each script is a complete read-compute-write sequence for one limiter. A
//! networked store runs the Lua source; [`MemoryStore`](super::MemoryStore)
//! runs an equivalent routine under its keyspace lock. Both must agree on the
//! key, argument and reply layout documented per variant.

/// The closed set of scripts a limiter may ask the store to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// KEYS: `[counter]`. ARGV: `[limit, window_ms]`.
    /// Reply: `[allowed, count]`.
    FixedWindowAdmit,
    /// KEYS: `[tokens, last_refill]`. ARGV: `[capacity, refill_interval_ms, expiry_ms, now_ms]`.
    /// Reply: `[allowed, remaining_tokens, refilled]`.
    TokenBucketTake,
    /// KEYS: `[slots]`. ARGV: `[max_concurrent, lease_ms]`, a lease of 0 means no expiry.
    /// Reply: `[allowed, in_flight]`.
    ConcurrencyAcquire,
    /// KEYS: `[slots]`. ARGV: none.
    /// Reply: `[in_flight]`.
    ConcurrencyRelease,
}

impl Script {
    pub const ALL: [Script; 4] = [
        Script::FixedWindowAdmit,
        Script::TokenBucketTake,
        Script::ConcurrencyAcquire,
        Script::ConcurrencyRelease,
    ];

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Script::FixedWindowAdmit => "fixed_window_admit",
            Script::TokenBucketTake => "token_bucket_take",
            Script::ConcurrencyAcquire => "concurrency_acquire",
            Script::ConcurrencyRelease => "concurrency_release",
        }
    }

    /// Lua source for stores that evaluate scripts server side.
    pub fn lua(&self) -> &'static str {
        match self {
            Script::FixedWindowAdmit => FIXED_WINDOW_ADMIT,
            Script::TokenBucketTake => TOKEN_BUCKET_TAKE,
            Script::ConcurrencyAcquire => CONCURRENCY_ACQUIRE,
            Script::ConcurrencyRelease => CONCURRENCY_RELEASE,
        }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const FIXED_WINDOW_ADMIT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
  return {1, 1}
end
current = tonumber(current)
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
return {1, redis.call('INCR', KEYS[1])}
"#;

const TOKEN_BUCKET_TAKE: &str = r#"
local capacity = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local tokens = tonumber(redis.call('GET', KEYS[1])) or capacity
local last = tonumber(redis.call('GET', KEYS[2])) or now
local refill = math.floor((now - last) / interval)
if refill > 0 then
  tokens = math.min(tokens + refill, capacity)
  last = now
else
  refill = 0
end
if tokens <= 0 then
  return {0, 0, refill}
end
tokens = tokens - 1
redis.call('SET', KEYS[1], string.format('%d', tokens), 'PX', expiry)
redis.call('SET', KEYS[2], string.format('%d', last), 'PX', expiry)
return {1, tokens, refill}
"#;

const CONCURRENCY_ACQUIRE: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1])) or 0
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
local in_flight = redis.call('INCR', KEYS[1])
if tonumber(ARGV[2]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {1, in_flight}
"#;

const CONCURRENCY_RELEASE: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]))
if current == nil then
  return {0}
end
if current <= 0 then
  if current < 0 then
    redis.call('SET', KEYS[1], 0, 'KEEPTTL')
  end
  return {0}
end
return {redis.call('DECR', KEYS[1])}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_script_has_source() {
        for script in Script::ALL {
            assert!(script.lua().contains("redis.call"), "{} has no body", script);
        }
    }

    #[test]
    fn test_script_names_are_unique() {
        let mut names: Vec<_> = Script::ALL.iter().map(|s| s.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Script::ALL.len());
    }
}
