//! Content history error types

use thiserror::Error;

/// Content history error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared storage access error (quota, unavailable medium, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Tagging / enrichment error
    #[error("Tagging error: {0}")]
    Tagging(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for content history operations
pub type Result<T> = std::result::Result<T, Error>;
