use serde::Serialize;
use thiserror::Error;

use crate::settings::ValidationIssue;

/// Call-level failures of [`crate::Encoder::encode`]. Nothing is modulated when
/// one of these is returned.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid settings: {}", format_issues(.0))]
    InvalidSettings(Vec<ValidationIssue>),

    #[error("payload of {len} bytes exceeds the frame limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("capacity exceeded: carrier needs {required} samples but only {available} are available")]
    CapacityExceeded { required: usize, available: usize },

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Call-level failures of [`crate::Decoder::decode`]. An absent carrier is not an
/// error: it is an empty result list.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid settings: {}", format_issues(.0))]
    InvalidSettings(Vec<ValidationIssue>),

    #[error("FFT error: {0}")]
    Fft(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Per-region failures. These never abort a decode call; they are attached to the
/// region's [`crate::DecodeResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum IntegrityError {
    #[error("frame malformed: {0}")]
    FrameMalformed(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FecError {
    #[error("block {block} is unrecoverable")]
    Unrecoverable { block: usize },

    #[error("{corrected} of {units} units needed correction, above tolerance {tolerance}")]
    ToleranceExceeded {
        corrected: usize,
        units: usize,
        tolerance: f32,
    },

    #[error("coded stream too short: need {needed} bits, have {available}")]
    Truncated { needed: usize, available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("ciphertext shorter than nonce and tag")]
    Truncated,

    #[error("padding length {0} overruns the payload")]
    BadPadding(usize),

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("encryption failed")]
    EncryptionFailed,
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
