//! Error types for the Ratewall limiter.

use thiserror::Error;

/// Main error type for Ratewall operations.
#[derive(Error, Debug)]
pub enum RatewallError {
    /// Configuration could not be read or deserialized
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration was read but holds values the limiter cannot run with
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatewallError {
    /// Whether this error came from the counter store rather than from setup.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RatewallError::StoreUnavailable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RatewallError {
    fn from(err: redis::RedisError) -> Self {
        RatewallError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for RatewallError {
    fn from(err: config::ConfigError) -> Self {
        RatewallError::Config(err.to_string())
    }
}

/// Result type alias for Ratewall operations.
pub type Result<T> = std::result::Result<T, RatewallError>;
