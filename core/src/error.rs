/// Error types for the conversation sync core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
