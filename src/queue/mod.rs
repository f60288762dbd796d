//! Retry queue
//!
//! A deduplicating work queue of object keys plus the rate limiters that
//! space out retries of failing keys.

pub mod rate_limiter;
pub mod rate_limiting;
pub mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use rate_limiting::RateLimitingQueue;
pub use work_queue::WorkQueue;
