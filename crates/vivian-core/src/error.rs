//! Error type for fallible Vivian operations.
//!
//! Callback failures (event handlers, job functions) never surface here:
//! they are absorbed and logged at the component boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VivianError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Job store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, VivianError>;
