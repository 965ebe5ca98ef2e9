//! The closed set of rate limiting techniques.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RatewardenError;

/// A rate limiting algorithm the dispatcher can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technique {
    /// Counts requests in a window that starts at the client's first request
    FixedWindow,
    /// Counts requests in a trailing window of timestamped events
    SlidingWindow,
    /// Grants requests against a replenishing token balance
    TokenBucket,
    /// Caps the number of in-flight requests
    Concurrency,
}

impl Technique {
    pub const ALL: [Technique; 4] = [
        Technique::FixedWindow,
        Technique::SlidingWindow,
        Technique::TokenBucket,
        Technique::Concurrency,
    ];

    /// The configuration name of this technique.
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::FixedWindow => "FixedWindow",
            Technique::SlidingWindow => "SlidingWindow",
            Technique::TokenBucket => "TokenBucket",
            Technique::Concurrency => "Concurrency",
        }
    }
}

impl FromStr for Technique {
    type Err = RatewardenError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Technique::ALL
            .into_iter()
            .find(|technique| technique.as_str() == name)
            .ok_or_else(|| RatewardenError::UnknownTechnique(name.to_string()))
    }
}

impl std::fmt::Display for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
