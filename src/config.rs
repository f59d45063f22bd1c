//! Configuration management for Windowkeeper.
//!
//! Configuration is read from an optional file (YAML, TOML or JSON, picked by
//! extension) and then from environment variables prefixed with
//! `WINDOWKEEPER`, using `__` to separate nested values:
//!
//! - `WINDOWKEEPER__STORE__HOST=redis.internal` -> `store.host`
//! - `WINDOWKEEPER__LIMITER__MAX_REQUESTS=100` -> `limiter.max_requests`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ratelimit::DeniedRequestPolicy;

const ENV_PREFIX: &str = "WINDOWKEEPER";

/// Main configuration for a Windowkeeper limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowkeeperConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Sliding window configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Connection settings for the shared window store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bound on every store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of concurrently borrowed sessions
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Sessions opened eagerly at construction
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Ping idle sessions before handing them out
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,

    /// Ping sessions before putting them back into the idle set
    #[serde(default = "default_true")]
    pub test_on_return: bool,

    /// Liveness probes attempted during construction before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Initial delay between construction probes, in milliseconds
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            pool_size: default_pool_size(),
            min_idle: default_min_idle(),
            test_on_borrow: true,
            test_on_return: true,
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl StoreConfig {
    /// Store config pointing at the given endpoint, defaults elsewhere.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Connection URL understood by the Redis client.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// `host:port`, used in logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Round-trip bound as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Validate store settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("store.host is required".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("store.port must be positive".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "store.pool_size must be positive".to_string(),
            ));
        }
        if self.min_idle > self.pool_size {
            return Err(ConfigError::Invalid(format!(
                "store.min_idle ({}) exceeds store.pool_size ({})",
                self.min_idle, self.pool_size
            )));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sliding window settings shared by every identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admitted requests per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Namespace prepended to every identifier to form its window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Whether denied requests still occupy a window slot
    #[serde(default)]
    pub denied_policy: DeniedRequestPolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            key_prefix: default_key_prefix(),
            denied_policy: DeniedRequestPolicy::default(),
        }
    }
}

impl LimiterConfig {
    /// `max_requests` per `window_seconds`, defaults elsewhere.
    pub fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            ..Default::default()
        }
    }

    /// Override the denied-request policy.
    pub fn with_denied_policy(mut self, policy: DeniedRequestPolicy) -> Self {
        self.denied_policy = policy;
        self
    }

    /// Validate limiter settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "limiter.max_requests must be positive".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "limiter.window_seconds must be positive".to_string(),
            ));
        }
        // Scores are milliseconds in an i64.
        if self.window_seconds > (i64::MAX / 1000) as u64 {
            return Err(ConfigError::Invalid(
                "limiter.window_seconds is too large".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_pool_size() -> usize {
    128
}

fn default_min_idle() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_connect_attempts() -> u32 {
    1
}

fn default_connect_backoff_ms() -> u64 {
    100
}

fn default_max_requests() -> u64 {
    10
}

fn default_window_seconds() -> u64 {
    60
}

fn default_key_prefix() -> String {
    "rate_limiter:".to_string()
}

impl WindowkeeperConfig {
    /// Build a configuration from the four required values.
    pub fn new(host: impl Into<String>, port: u16, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            store: StoreConfig::new(host, port),
            limiter: LimiterConfig::new(max_requests, window_seconds),
        }
    }

    /// Load configuration from an optional file, then the environment.
    ///
    /// Environment variables override file values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.limiter.validate()?;
        Ok(())
    }
}
