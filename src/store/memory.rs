//! In-process window store.
//!
//! Applies the same batch semantics as the Redis store against a local map.
//! Every batch runs under the map's per-key entry lock, which serializes
//! concurrent batches on one key. Expired keys are dropped when read and by
//! a periodic sweep during applies.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::WindowStore;
use crate::error::StoreError;
use crate::ratelimit::{BatchOutcome, WindowBatch};

/// One key's ordered set plus its expiry.
#[derive(Debug, Default)]
struct WindowSet {
    /// (score, value), ordered by score first
    members: BTreeSet<(i64, String)>,
    expires_at: Option<Instant>,
}

impl WindowSet {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Applies between sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 256;

/// Window store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, WindowSet>,
    applies: AtomicU64,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members currently stored for a key, ignoring expired keys.
    pub fn member_count(&self, key: &str) -> usize {
        self.expire_key(key);
        self.windows
            .get(key)
            .map(|set| set.members.len())
            .unwrap_or(0)
    }

    /// Remaining time to live of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.expire_key(key);
        let now = Instant::now();
        self.windows
            .get(key)
            .and_then(|set| set.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of keys with live state.
    pub fn key_count(&self) -> usize {
        self.purge_expired(Instant::now());
        self.windows.len()
    }

    fn expire_key(&self, key: &str) {
        let now = Instant::now();
        self.windows.remove_if(key, |_, set| set.is_expired(now));
    }

    /// Drop every key whose expiry has passed.
    fn purge_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, set| !set.is_expired(now));
        before.saturating_sub(self.windows.len())
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn apply(&self, batch: &WindowBatch) -> Result<BatchOutcome, StoreError> {
        let now = Instant::now();

        // Must run before the entry lock below is taken.
        if self.applies.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            let purged = self.purge_expired(now);
            if purged > 0 {
                trace!(purged = purged, "Swept expired windows");
            }
        }

        let mut set = self
            .windows
            .entry(batch.key.as_str().to_string())
            .or_default();

        if set.is_expired(now) {
            *set = WindowSet::default();
        }

        // Scores in [0, evict_until_ms] are outside the window.
        set.members
            .retain(|(score, _)| *score < 0 || *score > batch.evict_until_ms);

        let prior_count = set.members.len() as u64;

        if batch.records(prior_count) {
            set.members
                .insert((batch.member.score, batch.member.value.clone()));
        }
        if !set.members.is_empty() {
            // No expiry when the deadline is past what `Instant` can represent.
            set.expires_at = now.checked_add(Duration::from_secs(batch.ttl_secs));
        }

        trace!(
            key = %batch.key,
            prior_count = prior_count,
            "Applied window batch in memory"
        );

        Ok(BatchOutcome { prior_count })
    }

    async fn close(&self) {
        self.windows.clear();
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{DeniedRequestPolicy, WindowKey};

    fn batch_at(now_ms: i64, max: u64, policy: DeniedRequestPolicy) -> WindowBatch {
        WindowBatch::new(WindowKey::new("test:", "u"), now_ms, 1, max, policy)
    }

    #[tokio::test]
    async fn test_count_excludes_current_request() {
        let store = MemoryWindowStore::new();

        let first = store.apply(&batch_at(1_000, 5, DeniedRequestPolicy::Record)).await.unwrap();
        let second = store.apply(&batch_at(1_001, 5, DeniedRequestPolicy::Record)).await.unwrap();

        assert_eq!(first.prior_count, 0);
        assert_eq!(second.prior_count, 1);
        assert_eq!(store.member_count("test:u"), 2);
    }

    #[tokio::test]
    async fn test_eviction_bound_is_inclusive() {
        let store = MemoryWindowStore::new();

        store.apply(&batch_at(1_000, 5, DeniedRequestPolicy::Record)).await.unwrap();
        store.apply(&batch_at(1_500, 5, DeniedRequestPolicy::Record)).await.unwrap();

        // At 2_000 the window is (1_000, 2_000]: the member at 1_000 is evicted.
        let outcome = store.apply(&batch_at(2_000, 5, DeniedRequestPolicy::Record)).await.unwrap();
        assert_eq!(outcome.prior_count, 1);
    }

    #[tokio::test]
    async fn test_same_millisecond_requests_occupy_distinct_slots() {
        let store = MemoryWindowStore::new();

        for _ in 0..3 {
            store.apply(&batch_at(5_000, 10, DeniedRequestPolicy::Record)).await.unwrap();
        }

        assert_eq!(store.member_count("test:u"), 3);
    }

    #[tokio::test]
    async fn test_discard_policy_skips_denied_member() {
        let store = MemoryWindowStore::new();

        store.apply(&batch_at(1_000, 1, DeniedRequestPolicy::Discard)).await.unwrap();
        let denied = store.apply(&batch_at(1_001, 1, DeniedRequestPolicy::Discard)).await.unwrap();

        assert_eq!(denied.prior_count, 1);
        assert_eq!(store.member_count("test:u"), 1);
    }

    #[tokio::test]
    async fn test_batch_refreshes_ttl() {
        let store = MemoryWindowStore::new();
        store.apply(&batch_at(1_000, 5, DeniedRequestPolicy::Record)).await.unwrap();

        let ttl = store.ttl("test:u").unwrap();
        assert!(ttl <= Duration::from_secs(1));
        assert!(ttl > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_expired_key_is_reclaimed() {
        let store = MemoryWindowStore::new();
        store.apply(&batch_at(1_000, 5, DeniedRequestPolicy::Record)).await.unwrap();
        assert_eq!(store.key_count(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(store.member_count("test:u"), 0);
        assert_eq!(store.windows.len(), 0);
    }

    #[tokio::test]
    async fn test_idle_identifiers_are_swept() {
        let store = MemoryWindowStore::new();
        for i in 0..1000 {
            let batch = WindowBatch::new(
                WindowKey::new("test:", &format!("k{}", i)),
                1_000,
                1,
                5,
                DeniedRequestPolicy::Record,
            );
            store.apply(&batch).await.unwrap();
        }
        assert_eq!(store.windows.len(), 1000);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        // Enough applies on one live key to trigger a sweep.
        for i in 0..SWEEP_INTERVAL as i64 {
            store.apply(&batch_at(2_000 + i, 1_000, DeniedRequestPolicy::Record)).await.unwrap();
        }
        assert_eq!(store.windows.len(), 1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow_expiry() {
        let store = MemoryWindowStore::new();
        let window_seconds = (i64::MAX / 1000) as u64;
        let batch = WindowBatch::new(
            WindowKey::new("test:", "u"),
            1_000,
            window_seconds,
            5,
            DeniedRequestPolicy::Record,
        );

        let outcome = store.apply(&batch).await.unwrap();
        assert_eq!(outcome.prior_count, 0);
        assert_eq!(store.member_count("test:u"), 1);
    }

    #[tokio::test]
    async fn test_close_drops_state() {
        let store = MemoryWindowStore::new();
        store.apply(&batch_at(1_000, 5, DeniedRequestPolicy::Record)).await.unwrap();

        store.close().await;
        store.close().await;

        assert_eq!(store.key_count(), 0);
    }
}
