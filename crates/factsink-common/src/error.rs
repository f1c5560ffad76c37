//! Error types for facts

use thiserror::Error;

/// Result type alias for fact operations
pub type Result<T> = std::result::Result<T, FactError>;

/// Errors raised while encoding or decoding a fact
#[derive(Error, Debug)]
pub enum FactError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Fact payload is empty")]
    EmptyPayload,

    #[error("Fact must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}
