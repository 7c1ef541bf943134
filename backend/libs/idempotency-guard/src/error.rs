//! Error types for the idempotency guard

use thiserror::Error;

/// Result type for idempotency operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while reserving or settling an idempotency key
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// Key validation failed (empty or too long)
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    /// Check if error is transient (the caller may retry the whole request)
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::Redis(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped()
            }
            _ => false,
        }
    }
}
