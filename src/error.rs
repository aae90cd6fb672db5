//! Error types for signal-courier
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in the delivery pipeline
#[derive(Debug, Error)]
pub enum CourierError {
    /// Shared store unreachable or returned an error
    #[error("Store error: {0}")]
    Store(String),

    /// Schedule values out of range
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Missing or malformed configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Chat provider client could not be built
    #[error("Chat error: {0}")]
    Chat(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CourierError {
    fn from(err: redis::RedisError) -> Self {
        CourierError::Store(err.to_string())
    }
}

/// Result type alias for signal-courier operations
pub type Result<T> = std::result::Result<T, CourierError>;
