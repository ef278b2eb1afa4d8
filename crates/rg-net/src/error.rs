//! Network logic error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Bad signature")]
    BadSignature,

    #[error("Unexpected frame type {0:#06x}")]
    UnexpectedType(u16),

    #[error("Bad payload: {0}")]
    BadPayload(String),

    #[error("No SIP stack available")]
    NoSipStack,

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NetResult<T> = Result<T, NetError>;
