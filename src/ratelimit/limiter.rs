//! Sliding-window limiter.

use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::window::{WindowBatch, WindowKey};
use crate::config::{LimiterConfig, WindowkeeperConfig};
use crate::error::{LimiterError, Result, StoreError};
use crate::store::{RedisWindowStore, WindowStore};

/// Lifecycle of a limiter's store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// Store connectivity is being established
    Constructing,
    /// Decisions can be taken
    Ready,
    /// Connections released; terminal
    Shutdown,
}

/// How construction probes the store before declaring it usable.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    /// Total liveness probes, at least one
    pub attempts: u32,
    /// Delay before the second probe; doubles afterwards
    pub initial_backoff: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Decides, per identifier, whether a request may proceed, counting requests
/// in a trailing window held by a shared store.
///
/// The limiter holds no per-identifier state of its own. Every decision is
/// one atomic batch against the store, so any number of limiter instances
/// sharing a store enforce one limit. It is `Send + Sync`; share it with `Arc`.
pub struct SlidingWindowLimiter<S: WindowStore = RedisWindowStore> {
    store: S,
    config: LimiterConfig,
    state: RwLock<LimiterState>,
}

impl SlidingWindowLimiter<RedisWindowStore> {
    /// Connect to the configured Redis store and verify it is alive.
    ///
    /// Fails with [`LimiterError::Config`] before any network traffic if the
    /// configuration is invalid, and with [`LimiterError::StoreUnavailable`]
    /// if the store cannot be reached.
    pub async fn connect(config: &WindowkeeperConfig) -> Result<Self> {
        config.validate()?;

        info!(
            endpoint = %config.store.endpoint(),
            max_requests = config.limiter.max_requests,
            window_seconds = config.limiter.window_seconds,
            policy = ?config.limiter.denied_policy,
            "Initializing sliding window limiter"
        );

        let store = RedisWindowStore::connect(&config.store)
            .await
            .map_err(|source| {
                error!(endpoint = %config.store.endpoint(), error = %source, "Failed to open Redis store");
                LimiterError::StoreUnavailable {
                    endpoint: config.store.endpoint(),
                    source,
                }
            })?;

        let probe = ProbePolicy {
            attempts: config.store.connect_attempts,
            initial_backoff: config.store.connect_backoff(),
        };
        Self::start(store, config.limiter.clone(), probe).await
    }
}

impl<S: WindowStore> SlidingWindowLimiter<S> {
    /// Build a limiter over an existing store with a single liveness probe.
    pub async fn with_store(store: S, config: LimiterConfig) -> Result<Self> {
        Self::start(store, config, ProbePolicy::default()).await
    }

    /// Build a limiter over an existing store.
    ///
    /// The store is closed again if it never answers a probe.
    pub async fn start(store: S, config: LimiterConfig, probe: ProbePolicy) -> Result<Self> {
        config.validate()?;

        let limiter = Self {
            store,
            config,
            state: RwLock::new(LimiterState::Constructing),
        };

        if let Err(source) = limiter.probe_store(&probe).await {
            let endpoint = limiter.store.endpoint();
            error!(endpoint = %endpoint, error = %source, "Store failed liveness check");
            limiter.store.close().await;
            return Err(LimiterError::StoreUnavailable { endpoint, source });
        }

        *limiter.state.write() = LimiterState::Ready;
        info!(endpoint = %limiter.store.endpoint(), "Sliding window limiter ready");
        Ok(limiter)
    }

    async fn probe_store(&self, probe: &ProbePolicy) -> std::result::Result<(), StoreError> {
        let attempts = probe.attempts.max(1);
        let mut backoff = Backoff::new(probe.initial_backoff);
        let mut attempt = 1;

        loop {
            match self.store.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt = attempt,
                        attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store liveness check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decide whether a request from `identifier` may proceed.
    ///
    /// The identifier is used verbatim as part of the window key; callers
    /// must reject empty identifiers before calling this. Store failures are
    /// returned as [`LimiterError::StoreCommunication`] and are never
    /// retried or turned into a decision.
    pub async fn try_admit(&self, identifier: &str) -> Result<bool> {
        if self.state() != LimiterState::Ready {
            return Err(LimiterError::Shutdown);
        }

        let key = WindowKey::new(&self.config.key_prefix, identifier);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let batch = WindowBatch::new(
            key,
            now_ms,
            self.config.window_seconds,
            self.config.max_requests,
            self.config.denied_policy,
        );

        let outcome = self.store.apply(&batch).await.map_err(|source| {
            error!(identifier = %identifier, error = %source, "Store communication error");
            LimiterError::StoreCommunication {
                identifier: identifier.to_string(),
                source,
            }
        })?;

        let allowed = batch.admits(outcome.prior_count);
        if allowed {
            debug!(
                identifier = %identifier,
                count = outcome.prior_count + 1,
                limit = self.config.max_requests,
                "Request allowed"
            );
        } else {
            warn!(
                identifier = %identifier,
                count = outcome.prior_count,
                limit = self.config.max_requests,
                "Request blocked"
            );
        }

        Ok(allowed)
    }

    /// Release all store connections. Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == LimiterState::Shutdown {
                debug!("Limiter already shut down");
                return;
            }
            *state = LimiterState::Shutdown;
        }

        info!(endpoint = %self.store.endpoint(), "Shutting down sliding window limiter");
        self.store.close().await;
        info!("Sliding window limiter shut down");
    }

    pub fn state(&self) -> LimiterState {
        *self.state.read()
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
