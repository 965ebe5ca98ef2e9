//! Rate limiting algorithms and technique dispatch.

mod concurrency;
mod dispatcher;
mod fixed_window;
mod key;
mod limiter;
mod sliding_window;
mod technique;
mod token_bucket;

pub use concurrency::ConcurrencyLimiter;
pub use dispatcher::{Admission, AdmissionPermit, Dispatcher, FailurePolicy};
pub use fixed_window::FixedWindowLimiter;
pub use key::ClientKey;
pub use limiter::{Decision, Limiter};
pub use sliding_window::SlidingWindowLimiter;
pub use technique::Technique;
pub use token_bucket::TokenBucketLimiter;
