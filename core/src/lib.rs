//! Near-ultrasonic FSK data carrier for audio
//!
//! Hides short payloads in host audio as M-ary FSK tones above the audible band,
//! behind a Barker-7 preamble, and recovers them with confidence scores

pub mod assembler;
pub mod audio;
pub mod cipher;
pub mod compression;
pub mod confidence;
pub mod control;
pub mod decoder;
pub mod embed;
pub mod encoder;
pub mod error;
pub mod fec;
pub mod framing;
pub mod fsk;
pub mod settings;
pub mod spectrum;
pub mod sync;

pub use audio::AudioBuffer;
pub use cipher::CipherKey;
pub use control::{CancellationToken, Progress, ProgressObserver, Stage};
pub use decoder::{
    AnalysisReport, DecodeMetadata, DecodeResult, DecodeWarning, Decoder, DetectedRegion,
    SignalMonitor,
};
pub use embed::{EncodeWarning, Embedded};
pub use encoder::Encoder;
pub use error::{CipherError, DecodeError, EncodeError, IntegrityError};
pub use settings::{
    validate, DecodingSettings, DetectionSensitivity, EncodingSettings, EnvelopeShape,
    ErrorCorrectionLevel, FrequencyRange, ToneLayout, Validate, ValidationIssue, WindowFunction,
};

// Frame configuration
pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_HEADER_BYTES: usize = 2;
pub const FRAME_HEADER_BITS: usize = FRAME_HEADER_BYTES * 8;
pub const MAX_PAYLOAD_SIZE: usize = 255;
/// Payloads up to this length are protected by CRC-8, longer ones by CRC-16.
pub const SHORT_FRAME_PAYLOAD_LIMIT: usize = 16;

/// Magnitudes below this are treated as silence.
pub const ABS_FLOOR: f32 = 1e-5;

// Confidence weights, summing to 1
pub const CONFIDENCE_PREAMBLE_WEIGHT: f32 = 0.3;
pub const CONFIDENCE_SNR_WEIGHT: f32 = 0.3;
pub const CONFIDENCE_CORRECTION_WEIGHT: f32 = 0.2;
pub const CONFIDENCE_INTEGRITY_WEIGHT: f32 = 0.2;
/// Mean symbol SNR that earns the full SNR term.
pub const SNR_FULL_SCALE_DB: f32 = 30.0;
/// Results below this confidence carry a low-confidence warning.
pub const LOW_CONFIDENCE_FLOOR: f32 = 0.5;

/// Embed `payload` into a copy of `host` with `settings`.
pub fn encode(
    payload: &[u8],
    host: &AudioBuffer,
    settings: &EncodingSettings,
) -> Result<Embedded, EncodeError> {
    Encoder::new(settings.clone())?.encode(payload, host)
}

/// Decode every carrier in `audio` with `settings`.
pub fn decode(
    audio: &AudioBuffer,
    settings: &DecodingSettings,
) -> Result<Vec<DecodeResult>, DecodeError> {
    Decoder::new(settings.clone())?.decode(audio)
}
