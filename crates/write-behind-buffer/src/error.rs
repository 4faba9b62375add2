//! Error types for the write-behind buffer.

use thiserror::Error;

/// Buffer error type.
///
/// Backpressure and shutdown rejections are not errors; they come back as
/// [`crate::Offer::Rejected`].
#[derive(Error, Debug)]
pub enum BufferError {
    /// Redis connection or script error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload or envelope (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (dead-letter file backup, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A script or backend returned a shape we do not understand
    #[error("Unexpected backend reply: {0}")]
    Protocol(String),

    /// Backend reported a failure that is not a Redis error
    #[error("Backend error: {0}")]
    Backend(String),
}

impl BufferError {
    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BufferError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            BufferError::Io(_) | BufferError::Backend(_) => true,
            BufferError::Serialization(_) | BufferError::Config(_) | BufferError::Protocol(_) => {
                false
            }
        }
    }
}

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;
