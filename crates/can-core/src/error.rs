//! Error types for `can` core library.

use thiserror::Error;

/// Result type alias using `can` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `can` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
