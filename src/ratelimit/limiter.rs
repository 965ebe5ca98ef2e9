//! Limiter trait shared by every rate limiting technique.

use async_trait::async_trait;

use super::key::ClientKey;
use super::technique::Technique;
use crate::store::{StoreError, StoreResult};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Decode the `allowed` flag returned by an admission script.
    pub(crate) fn from_flag(flag: i64) -> Self {
        if flag == 1 {
            Decision::Allowed
        } else {
            Decision::Denied
        }
    }
}

/// Trait for rate limiter implementations.
///
/// Limiters never swallow store errors: a store failure is returned as
/// `Err`, never folded into either decision.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Which technique this limiter implements.
    fn technique(&self) -> Technique;

    /// Decide whether one more request for `key` may proceed.
    async fn is_allowed(&self, key: &ClientKey) -> StoreResult<Decision>;

    /// Give back capacity taken by an allowed decision.
    ///
    /// Only limiters that track in-flight work hold anything to give back.
    async fn release(&self, _key: &ClientKey) -> StoreResult<()> {
        Ok(())
    }

    /// Whether an allowed decision obliges the caller to [`release`](Limiter::release).
    fn holds_capacity(&self) -> bool {
        false
    }
}

/// Convert a configured limit to a store argument. Limits beyond `i64::MAX`
/// are unbounded in practice and saturate.
pub(crate) fn limit_arg(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Read the `index`-th integer of a script reply.
pub(crate) fn reply_at(reply: &[i64], index: usize) -> StoreResult<i64> {
    reply.get(index).copied().ok_or_else(|| {
        StoreError::UnexpectedReply(format!(
            "script reply has {} values, expected at least {}",
            reply.len(),
            index + 1
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_from_flag() {
        assert_eq!(Decision::from_flag(1), Decision::Allowed);
        assert_eq!(Decision::from_flag(0), Decision::Denied);
        assert!(Decision::Allowed.is_allowed());
        assert!(!Decision::Denied.is_allowed());
    }

    #[test]
    fn test_limit_arg_saturates() {
        assert_eq!(limit_arg(500), 500);
        assert_eq!(limit_arg(i64::MAX as u64), i64::MAX);
        assert_eq!(limit_arg(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_reply_at_short_reply() {
        assert_eq!(reply_at(&[1, 5], 1).unwrap(), 5);
        assert!(matches!(
            reply_at(&[1], 1),
            Err(StoreError::UnexpectedReply(_))
        ));
    }
}
