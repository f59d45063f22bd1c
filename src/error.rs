//! Error types for the Windowkeeper limiter.

use std::time::Duration;
use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The store could not be reached or failed its liveness check during construction.
    #[error("Store unavailable at {endpoint}: {source}")]
    StoreUnavailable {
        endpoint: String,
        #[source]
        source: StoreError,
    },

    /// A decision batch could not be completed against the store.
    #[error("Store communication failed for identifier {identifier}: {source}")]
    StoreCommunication {
        identifier: String,
        #[source]
        source: StoreError,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The limiter has been shut down.
    #[error("Limiter has been shut down")]
    Shutdown,
}

/// Failures reported by a window store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis client or server errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A round trip did not complete within the configured bound.
    #[error("Store round trip timed out after {0:?}")]
    Timeout(Duration),

    /// The session pool was closed.
    #[error("Session pool is closed")]
    PoolClosed,

    /// The store returned a reply the limiter could not interpret.
    #[error("Unexpected store reply: {0}")]
    Reply(String),
}

impl StoreError {
    /// Whether this error means the underlying connection can no longer be trusted.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            StoreError::Timeout(_) => true,
            StoreError::PoolClosed | StoreError::Reply(_) => false,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_connection_error() {
        assert!(StoreError::Timeout(Duration::from_millis(10)).is_connection_error());
        assert!(!StoreError::PoolClosed.is_connection_error());
        assert!(!StoreError::Reply("nil".to_string()).is_connection_error());
    }

    #[test]
    fn test_io_redis_error_is_connection_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = StoreError::Redis(redis::RedisError::from(io));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_server_redis_error_is_not_connection_error() {
        let err = StoreError::Redis(redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "WRONGTYPE",
        )));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_communication_error_carries_identifier() {
        let err = LimiterError::StoreCommunication {
            identifier: "user-7".to_string(),
            source: StoreError::Timeout(Duration::from_millis(2000)),
        };
        let message = err.to_string();
        assert!(message.contains("user-7"));
        assert!(message.contains("timed out"));
    }
}
