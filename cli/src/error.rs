use thiserror::Error;
use ultrafsk_core::{CipherError, DecodeError, EncodeError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported WAV format: {0}")]
    UnsupportedWav(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key: {0}")]
    KeyEncoding(#[from] base64::DecodeError),

    #[error("invalid key: {0}")]
    Key(#[from] CipherError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{0} settings issue(s) found")]
    InvalidSettings(usize),

    #[error("no message recovered")]
    NoMessage,
}
