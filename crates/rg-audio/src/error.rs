//! Audio graph error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Recorder not open")]
    RecorderNotOpen,

    #[error("Wiring error: {0}")]
    Wiring(String),
}

pub type AudioResult<T> = Result<T, AudioError>;
