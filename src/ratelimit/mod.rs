//! Sliding-window rate limiting.

mod backoff;
mod limiter;
mod window;

pub use backoff::Backoff;
pub use limiter::{LimiterState, ProbePolicy, SlidingWindowLimiter};
pub use window::{BatchOutcome, DeniedRequestPolicy, WindowBatch, WindowKey, WindowMember};
