//! Runner errors.

use thiserror::Error;

use taskbroker_core::CoreError;

/// Errors that end a broker connection or prevent startup.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Registration refused: {0}")]
    RegistrationFailed(String),
}

impl From<CoreError> for RunnerError {
    fn from(err: CoreError) -> Self {
        RunnerError::Protocol(err.to_string())
    }
}
