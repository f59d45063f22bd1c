//! Window keys, members, and the decision batch sent to a store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens to a request that is denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeniedRequestPolicy {
    /// Denied requests are still recorded and occupy a window slot, so a
    /// client retrying at high frequency keeps its window full.
    #[default]
    Record,
    /// Only admitted requests are recorded.
    Discard,
}

/// The store key holding one identifier's sliding window.
///
/// The key is the configured namespace prefix followed by the identifier,
/// which is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    /// Create a window key for an identifier.
    pub fn new(prefix: &str, identifier: &str) -> Self {
        Self(format!("{}{}", prefix, identifier))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recorded request: scored by arrival time, valued uniquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowMember {
    /// Arrival time in milliseconds since the Unix epoch
    pub score: i64,
    /// `<score>-<uuid>`; distinct even for requests in the same millisecond
    pub value: String,
}

impl WindowMember {
    pub fn new(now_ms: i64) -> Self {
        Self {
            score: now_ms,
            value: format!("{}-{}", now_ms, Uuid::new_v4().simple()),
        }
    }
}

/// Everything a store needs to apply one atomic decision batch.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub key: WindowKey,
    /// Members scored at or below this are evicted before counting
    pub evict_until_ms: i64,
    /// The member recorded for the request being decided
    pub member: WindowMember,
    /// Expiry applied to the key, in seconds
    pub ttl_secs: u64,
    /// Quota the decision is taken against
    pub max_requests: u64,
    pub policy: DeniedRequestPolicy,
}

impl WindowBatch {
    /// Build the batch for a request arriving at `now_ms`.
    pub fn new(
        key: WindowKey,
        now_ms: i64,
        window_seconds: u64,
        max_requests: u64,
        policy: DeniedRequestPolicy,
    ) -> Self {
        let window_ms = (window_seconds as i64).saturating_mul(1000);
        Self {
            key,
            evict_until_ms: now_ms.saturating_sub(window_ms),
            member: WindowMember::new(now_ms),
            ttl_secs: window_seconds,
            max_requests,
            policy,
        }
    }

    /// Whether a request with `prior_count` earlier members is admitted.
    pub fn admits(&self, prior_count: u64) -> bool {
        prior_count < self.max_requests
    }

    /// Whether the current request's member is written for this outcome.
    pub fn records(&self, prior_count: u64) -> bool {
        match self.policy {
            DeniedRequestPolicy::Record => true,
            DeniedRequestPolicy::Discard => self.admits(prior_count),
        }
    }
}

/// What a store reports back from a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Members in the window after eviction, before the current request
    pub prior_count: u64,
}
