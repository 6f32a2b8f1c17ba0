//! Error types for diffnest

use thiserror::Error;

/// diffnest error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Arithmetic overflow
    #[error("Overflow: {0}")]
    Overflow(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
