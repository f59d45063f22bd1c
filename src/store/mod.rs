//! Shared window stores.
//!
//! A store keeps one ordered set per window key and applies a decision
//! batch (evict, count, add, expire) to it as one indivisible unit.

mod memory;
mod pool;
mod redis;

pub use self::memory::MemoryWindowStore;
pub use self::pool::{PoolSettings, PooledSession, SessionPool};
pub use self::redis::RedisWindowStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ratelimit::{BatchOutcome, WindowBatch};

/// Trait for window store implementations.
///
/// This trait abstracts over the Redis-backed store and the in-process
/// store so the limiter can drive either.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Trivial round trip used as a liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Apply one decision batch atomically to the batch's key.
    ///
    /// Concurrent batches for the same key must be serialized with respect
    /// to each other; the returned count reflects only earlier members.
    async fn apply(&self, batch: &WindowBatch) -> Result<BatchOutcome, StoreError>;

    /// Release every held connection. Idempotent.
    async fn close(&self);

    /// Human-readable location of the store, for logs and errors.
    fn endpoint(&self) -> String;
}

/// A store shared between limiters.
///
/// Closing through one handle leaves the store open while other handles
/// exist; only the last owner closes it. Connections held by a store that
/// is never closed are released when the final handle is dropped.
#[async_trait]
impl<S: WindowStore + ?Sized> WindowStore for std::sync::Arc<S> {
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn apply(&self, batch: &WindowBatch) -> Result<BatchOutcome, StoreError> {
        (**self).apply(batch).await
    }

    async fn close(&self) {
        if std::sync::Arc::strong_count(self) == 1 {
            (**self).close().await
        }
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}
