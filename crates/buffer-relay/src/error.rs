//! Error types for the relay.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Buffer or Redis failure
    #[error("Buffer error: {0}")]
    Buffer(#[from] write_behind_buffer::BufferError),

    /// Dead-letter file backup failure
    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] write_behind_buffer::DeadLetterError),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed config file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
