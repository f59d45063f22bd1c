//! Admission gate for request-handling layers.
//!
//! The limiter only answers allow/deny. The gate is the thin layer a
//! service puts in front of it: it pulls the caller identifier out of the
//! request, rejects requests without one, and maps decisions and failures
//! onto HTTP status semantics without depending on any web framework.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::LimiterError;
use crate::ratelimit::SlidingWindowLimiter;
use crate::store::{RedisWindowStore, WindowStore};

/// Header carrying the caller identifier.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Result of passing a request through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The request may proceed
    Admitted,
    /// The caller is over its quota
    Throttled,
}

impl GateOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            GateOutcome::Admitted => 200,
            GateOutcome::Throttled => 429,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            GateOutcome::Admitted => "Resource accessed successfully",
            GateOutcome::Throttled => "Too Many Requests: Rate limit exceeded",
        }
    }
}

/// Failures the gate reports instead of a decision.
#[derive(Error, Debug)]
pub enum GateError {
    /// No usable identifier on the request
    #[error("X-User-Id header is required")]
    MissingIdentifier,

    /// The limiter could not decide
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

impl GateError {
    /// Client error for a missing identifier, server error otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::MissingIdentifier => 400,
            GateError::Limiter(_) => 500,
        }
    }
}

/// Find the caller identifier among request headers.
///
/// Header names match case-insensitively; blank values count as missing.
pub fn identifier_from_headers<'a, I>(headers: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(USER_ID_HEADER))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Validates callers and consults a shared limiter.
pub struct AdmissionGate<S: WindowStore = RedisWindowStore> {
    limiter: Arc<SlidingWindowLimiter<S>>,
}

impl<S: WindowStore> AdmissionGate<S> {
    pub fn new(limiter: Arc<SlidingWindowLimiter<S>>) -> Self {
        Self { limiter }
    }

    /// Decide on a request from `identifier`.
    ///
    /// Surrounding whitespace is not part of the identifier. Limiter errors are passed through so the caller fails the request
    /// with a server error rather than quietly admitting it.
    #[instrument(skip(self))]
    pub async fn admit(&self, identifier: Option<&str>) -> Result<GateOutcome, GateError> {
        let identifier = match identifier.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => {
                warn!("Received request without a caller identifier");
                return Err(GateError::MissingIdentifier);
            }
        };

        if self.limiter.try_admit(identifier).await? {
            debug!(identifier = %identifier, "Request admitted");
            Ok(GateOutcome::Admitted)
        } else {
            warn!(identifier = %identifier, "Rate limit exceeded");
            Ok(GateOutcome::Throttled)
        }
    }

    /// Decide on a request given its headers.
    pub async fn admit_headers<'a, I>(&self, headers: I) -> Result<GateOutcome, GateError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.admit(identifier_from_headers(headers)).await
    }

    pub fn limiter(&self) -> &Arc<SlidingWindowLimiter<S>> {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::store::MemoryWindowStore;
    use tokio_test::{assert_err, assert_ok};

    async fn memory_gate(max_requests: u64) -> AdmissionGate<MemoryWindowStore> {
        let limiter = SlidingWindowLimiter::with_store(
            MemoryWindowStore::new(),
            LimiterConfig::new(max_requests, 10),
        )
        .await
        .unwrap();
        AdmissionGate::new(Arc::new(limiter))
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = [("accept", "*/*"), ("x-user-id", " alice ")];
        assert_eq!(identifier_from_headers(headers), Some("alice"));
    }

    #[test]
    fn test_blank_header_counts_as_missing() {
        assert_eq!(identifier_from_headers([("X-User-Id", "   ")]), None);
        assert_eq!(identifier_from_headers([("Accept", "*/*")]), None);
    }

    #[tokio::test]
    async fn test_missing_identifier_rejected() {
        let gate = memory_gate(5).await;

        let err = assert_err!(gate.admit(None).await);
        assert!(matches!(err, GateError::MissingIdentifier));
        assert_eq!(err.status_code(), 400);

        let err = assert_err!(gate.admit(Some("")).await);
        assert!(matches!(err, GateError::MissingIdentifier));
    }

    #[tokio::test]
    async fn test_over_quota_maps_to_too_many_requests() {
        let gate = memory_gate(2).await;

        for _ in 0..2 {
            let outcome = gate.admit(Some("bob")).await.unwrap();
            assert_eq!(outcome, GateOutcome::Admitted);
            assert_eq!(outcome.status_code(), 200);
        }

        let outcome = gate.admit(Some("bob")).await.unwrap();
        assert_eq!(outcome, GateOutcome::Throttled);
        assert_eq!(outcome.status_code(), 429);
        assert_eq!(outcome.message(), "Too Many Requests: Rate limit exceeded");
    }

    #[tokio::test]
    async fn test_admit_from_headers() {
        let gate = memory_gate(1).await;

        let outcome = assert_ok!(gate.admit_headers([("X-User-Id", "carol")]).await);
        assert_eq!(outcome, GateOutcome::Admitted);

        let outcome = assert_ok!(gate.admit_headers([("x-user-id", "carol")]).await);
        assert_eq!(outcome, GateOutcome::Throttled);
    }

    #[tokio::test]
    async fn test_padded_identifier_shares_the_header_window() {
        let gate = memory_gate(1).await;

        let outcome = assert_ok!(gate.admit(Some(" erin ")).await);
        assert_eq!(outcome, GateOutcome::Admitted);

        let outcome = assert_ok!(gate.admit_headers([("X-User-Id", "erin")]).await);
        assert_eq!(outcome, GateOutcome::Throttled);

        let store = gate.limiter().store();
        assert_eq!(store.member_count("rate_limiter:erin"), 2);
        assert_eq!(store.member_count("rate_limiter: erin "), 0);
    }

    #[tokio::test]
    async fn test_limiter_failure_maps_to_server_error() {
        let gate = memory_gate(5).await;
        gate.limiter().shutdown().await;

        let err = assert_err!(gate.admit(Some("dave")).await);
        assert!(matches!(err, GateError::Limiter(LimiterError::Shutdown)));
        assert_eq!(err.status_code(), 500);
    }
}
