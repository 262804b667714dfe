//! Token-bucket admission control for the remote API.
//!
//! [`ApiRateLimiter`] holds three buckets (general, batch metadata,
//! export); [`AdaptiveLimiter`] layers quota feedback on top, halving the
//! rate under 429 pressure and growing it back after a cooldown.
//! Cancelling a blocked wait never consumes budget.

mod adaptive;
mod bucket;
mod limiter;

pub use adaptive::AdaptiveLimiter;
pub use bucket::TokenBucket;
pub use limiter::{
    ApiRateLimiter, DEFAULT_BATCH_BURST, DEFAULT_BATCH_RATE, DEFAULT_EXPORT_BURST,
    DEFAULT_EXPORT_RATE, DEFAULT_GENERAL_BURST, DEFAULT_GENERAL_RATE, RateLimiterMetrics,
};
