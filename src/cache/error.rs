//! Cache error types.

use thiserror::Error;

/// Errors raised by the shared cache tier.
///
/// None of these escape [`CacheStore`](super::CacheStore): they are logged and
/// the store falls back to the local tier.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The backend is not connected or the connection dropped.
    #[error("Cache connection failed: {0}")]
    Connection(String),

    /// A value could not be encoded or decoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backend did not answer in time.
    #[error("Cache operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Any other backend failure.
    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Whether the failure means the backend is gone and should be reconnected.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, CacheError::Connection(_) | CacheError::Timeout(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_io_error() || err.is_connection_refusal() {
            CacheError::Connection(err.to_string())
        } else if err.is_timeout() {
            CacheError::Timeout(std::time::Duration::ZERO)
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::Connection("redis://localhost:6379".to_string());
        assert!(err.to_string().contains("redis://localhost:6379"));

        let err = CacheError::Serialization("invalid JSON".to_string());
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn test_connection_loss_classification() {
        assert!(CacheError::Connection("gone".into()).is_connection_loss());
        assert!(CacheError::Timeout(Duration::from_secs(1)).is_connection_loss());
        assert!(!CacheError::Serialization("bad".into()).is_connection_loss());
        assert!(!CacheError::Backend("WRONGTYPE".into()).is_connection_loss());
    }
}
