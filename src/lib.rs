//! Windowkeeper - Distributed Sliding-Window Rate Limiting
//!
//! This crate decides whether a caller may make another request, given a
//! quota over a trailing time window. Window state lives in a shared Redis
//! store and every decision is one atomic batch against it, so any number of
//! service instances enforce one consistent limit per identifier.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;

pub use config::WindowkeeperConfig;
pub use error::{LimiterError, Result, StoreError};
pub use gate::AdmissionGate;
pub use ratelimit::{DeniedRequestPolicy, SlidingWindowLimiter};
