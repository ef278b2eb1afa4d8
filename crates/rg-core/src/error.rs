//! Error types shared across the runtime

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration variable: {0}/{1}")]
    MissingConfig(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("State error: {0}")]
    State(String),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
