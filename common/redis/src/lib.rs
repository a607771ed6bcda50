use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// True when the error says something about Redis itself (down, slow,
    /// misconfigured) rather than about the key that was asked for.
    pub fn is_infrastructure_error(&self) -> bool {
        matches!(
            self,
            CustomRedisError::Timeout
                | CustomRedisError::InvalidConfiguration(_)
                | CustomRedisError::Redis(_)
        )
    }
}

/// Messages received on a pub/sub channel, as UTF-8 payloads.
pub type MessageStream = BoxStream<'static, String>;

#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String) -> Result<(), CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;

    /// Publish a message on a channel. Delivery is at-most-once: subscribers
    /// that are not connected at publish time never see the message.
    async fn publish(&self, channel: String, message: String) -> Result<(), CustomRedisError>;

    /// Subscribe to a channel. The stream ends when the underlying
    /// subscription connection is lost; callers are expected to resubscribe.
    async fn subscribe(&self, channel: String) -> Result<MessageStream, CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_infrastructure_error() {
        assert!(CustomRedisError::Timeout.is_infrastructure_error());
    }

    #[test]
    fn test_not_found_is_not_infrastructure_error() {
        assert!(!CustomRedisError::NotFound.is_infrastructure_error());
    }

    #[test]
    fn test_parse_error_is_not_infrastructure_error() {
        let err = CustomRedisError::ParseError("invalid data".to_string());
        assert!(!err.is_infrastructure_error());
    }

    #[test]
    fn test_connection_refused_is_infrastructure_error() {
        let err = CustomRedisError::from_redis_kind(RedisErrorKind::IoError, "Connection refused");
        assert!(err.is_infrastructure_error());
    }

    #[test]
    fn test_redis_timeout_maps_to_timeout_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err: CustomRedisError = redis::RedisError::from(io_err).into();
        assert!(matches!(err, CustomRedisError::Timeout));
    }
}
