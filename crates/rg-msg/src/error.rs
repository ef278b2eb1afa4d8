//! Message handler error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MsgError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported WAV file: {0}")]
    BadWav(String),

    #[error("No such DTMF digit: {0}")]
    BadDtmfDigit(char),

    #[error("No GSM decoder registered")]
    NoGsmDecoder,
}

pub type MsgResult<T> = Result<T, MsgError>;
