//! Sliding-minute ticket bucket rate limiting for LLM provider clients.
//!
//! Each provider gets its own [`RateLimiter`], configured from that provider's
//! requests-per-minute budget. Limiters start conservatively and ramp their
//! per-second capacity up over the first ~30-40 seconds; a 429 response zeroes
//! the current second and pauses the limiter until a [`LivenessProbe`] reports
//! the provider is accepting traffic again. A single [`RateLimiterMonitor`]
//! ticks every registered limiter once per second.

mod bucket;
pub mod limiter;
pub mod monitor;
pub mod ticket;

pub use limiter::{LivenessProbe, RateLimiter, RateLimiterConfig, MAX_PROBE_INTERVAL, MIN_PROBE_INTERVAL};
pub use monitor::RateLimiterMonitor;
pub use ticket::{BucketId, RateLimitEvent, Ticket};
