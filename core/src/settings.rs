//! Caller-supplied configuration and its validation.
//!
//! Settings are plain value objects: they are validated once when an encode or
//! decode call starts and are never mutated by the codec. [`validate`] is pure and
//! can be called ahead of time by any front end.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cipher::CipherKey;

/// Lowest carrier frequency accepted for any tone.
pub const MIN_CARRIER_FREQUENCY_HZ: f32 = 20.0;

/// Largest supported tone alphabet.
pub const MAX_TONE_COUNT: usize = 16;

pub const MIN_BIT_DURATION_MS: f32 = 1.0;
pub const MAX_BIT_DURATION_MS: f32 = 1000.0;
pub const MAX_GUARD_INTERVAL_MS: f32 = 1000.0;

/// Fewest samples a symbol may span at the call's sample rate.
pub const MIN_SYMBOL_SAMPLES: usize = 32;

pub const MIN_REDUNDANCY_FACTOR: u8 = 3;
pub const MAX_REDUNDANCY_FACTOR: u8 = 7;

pub const MAX_COMPRESSION_LEVEL: u32 = 9;

pub const MIN_WINDOW_SIZE: usize = 64;
pub const MAX_WINDOW_SIZE: usize = 65_536;
pub const MAX_WINDOW_OVERLAP: f32 = 0.95;

pub const MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCorrectionLevel {
    #[default]
    None,
    Basic,
    Advanced,
}

impl ErrorCorrectionLevel {
    /// Two-bit code carried in the frame header.
    pub fn to_bits(self) -> u8 {
        match self {
            ErrorCorrectionLevel::None => 0,
            ErrorCorrectionLevel::Basic => 1,
            ErrorCorrectionLevel::Advanced => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(ErrorCorrectionLevel::None),
            1 => Some(ErrorCorrectionLevel::Basic),
            2 => Some(ErrorCorrectionLevel::Advanced),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCorrectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCorrectionLevel::None => "none",
            ErrorCorrectionLevel::Basic => "basic",
            ErrorCorrectionLevel::Advanced => "advanced",
        };
        f.write_str(name)
    }
}

/// How readily the demodulator accepts a tone decision. Higher sensitivity
/// accepts weaker winners (fewer erasures, more false accepts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl DetectionSensitivity {
    /// Minimum ratio between the strongest tone and the runner-up.
    pub fn dominance_margin(self) -> f32 {
        match self {
            DetectionSensitivity::Low => 2.0,
            DetectionSensitivity::Medium => 1.5,
            DetectionSensitivity::High => 1.15,
        }
    }

    /// Margin used on retry `attempt` (0 = first pass). Each retry halves the
    /// excess over unity.
    pub fn relaxed_margin(self, attempt: u32) -> f32 {
        let excess = self.dominance_margin() - 1.0;
        1.0 + excess / (1u32 << attempt.min(16)) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowFunction {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

/// Amplitude ramp applied at each symbol edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeShape {
    Linear,
    #[default]
    RaisedCosine,
}

/// The tone plan shared by encoder and decoder. Two settings are compatible when
/// their layouts are equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToneLayout {
    pub base_frequency: f32,
    pub frequency_separation: f32,
    pub tone_count: usize,
    pub bit_duration_ms: f32,
    pub guard_interval_ms: f32,
}

impl Default for ToneLayout {
    fn default() -> Self {
        Self {
            base_frequency: 19_000.0,
            frequency_separation: 1_000.0,
            tone_count: 4,
            bit_duration_ms: 50.0,
            guard_interval_ms: 0.0,
        }
    }
}

impl ToneLayout {
    pub fn tone_frequency(&self, index: usize) -> f32 {
        self.base_frequency + index as f32 * self.frequency_separation
    }

    pub fn highest_frequency(&self) -> f32 {
        self.tone_frequency(self.tone_count.saturating_sub(1))
    }

    pub fn tone_frequencies(&self) -> Vec<f32> {
        (0..self.tone_count).map(|k| self.tone_frequency(k)).collect()
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.tone_count.max(2).trailing_zeros() as usize
    }

    /// Samples during which a tone is held.
    pub fn bit_samples(&self, sample_rate: u32) -> usize {
        ms_to_samples(self.bit_duration_ms, sample_rate)
    }

    pub fn guard_samples(&self, sample_rate: u32) -> usize {
        ms_to_samples(self.guard_interval_ms, sample_rate)
    }

    /// Distance between the starts of consecutive symbols.
    pub fn symbol_period_samples(&self, sample_rate: u32) -> usize {
        self.bit_samples(sample_rate) + self.guard_samples(sample_rate)
    }

    fn check(&self, issues: &mut Vec<ValidationIssue>) {
        if !(self.base_frequency.is_finite() && self.base_frequency >= MIN_CARRIER_FREQUENCY_HZ) {
            issues.push(ValidationIssue::new(
                "baseFrequency",
                format!("must be at least {MIN_CARRIER_FREQUENCY_HZ} Hz"),
            ));
        }
        if !self.tone_count.is_power_of_two() || !(2..=MAX_TONE_COUNT).contains(&self.tone_count) {
            issues.push(ValidationIssue::new(
                "toneCount",
                format!("must be a power of two between 2 and {MAX_TONE_COUNT}"),
            ));
        }
        if !(self.bit_duration_ms.is_finite()
            && (MIN_BIT_DURATION_MS..=MAX_BIT_DURATION_MS).contains(&self.bit_duration_ms))
        {
            issues.push(ValidationIssue::new(
                "bitDurationMs",
                format!("must be between {MIN_BIT_DURATION_MS} and {MAX_BIT_DURATION_MS} ms"),
            ));
        } else {
            // Tones closer than one DFT bin of the symbol window cannot be told apart.
            let min_separation = 1000.0 / self.bit_duration_ms;
            if !(self.frequency_separation.is_finite()
                && self.frequency_separation >= min_separation)
            {
                issues.push(ValidationIssue::new(
                    "frequencySeparation",
                    format!(
                        "must be at least {min_separation:.1} Hz for {} ms symbols",
                        self.bit_duration_ms
                    ),
                ));
            }
        }
        if !(self.guard_interval_ms.is_finite()
            && (0.0..=MAX_GUARD_INTERVAL_MS).contains(&self.guard_interval_ms))
        {
            issues.push(ValidationIssue::new(
                "guardIntervalMs",
                format!("must be between 0 and {MAX_GUARD_INTERVAL_MS} ms"),
            ));
        }
    }

    fn check_sample_rate(&self, sample_rate: u32, issues: &mut Vec<ValidationIssue>) {
        let nyquist = sample_rate as f32 / 2.0;
        if self.highest_frequency() >= nyquist {
            issues.push(ValidationIssue::new(
                "sampleRate",
                format!(
                    "highest tone {} Hz is not below the Nyquist frequency {} Hz",
                    self.highest_frequency(),
                    nyquist
                ),
            ));
        }
        if self.bit_samples(sample_rate) < MIN_SYMBOL_SAMPLES {
            issues.push(ValidationIssue::new(
                "bitDurationMs",
                format!("symbols must span at least {MIN_SYMBOL_SAMPLES} samples at {sample_rate} Hz"),
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyRange {
    pub low_hz: f32,
    pub high_hz: f32,
}

impl FrequencyRange {
    pub fn contains(&self, frequency: f32) -> bool {
        frequency >= self.low_hz && frequency <= self.high_hz
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodingSettings {
    #[serde(flatten)]
    pub layout: ToneLayout,
    pub amplitude: f32,
    pub fade_in_ms: f32,
    pub fade_out_ms: f32,
    pub envelope: EnvelopeShape,
    pub error_correction_level: ErrorCorrectionLevel,
    /// Copies per bit for [`ErrorCorrectionLevel::Basic`]; ignored otherwise.
    pub redundancy_factor: u8,
    pub encryption_enabled: bool,
    #[serde(skip)]
    pub encryption_key: Option<CipherKey>,
    /// Prefix encrypted payloads with 1 to 32 random bytes.
    pub obfuscate: bool,
    /// DEFLATE level, 0 disables compression.
    pub compression_level: u32,
    /// Where the carrier starts inside the host audio.
    pub embed_offset_ms: f32,
}

impl Default for EncodingSettings {
    fn default() -> Self {
        Self {
            layout: ToneLayout::default(),
            amplitude: 0.1,
            fade_in_ms: 5.0,
            fade_out_ms: 5.0,
            envelope: EnvelopeShape::default(),
            error_correction_level: ErrorCorrectionLevel::None,
            redundancy_factor: 3,
            encryption_enabled: false,
            encryption_key: None,
            obfuscate: false,
            compression_level: 0,
            embed_offset_ms: 0.0,
        }
    }
}

impl EncodingSettings {
    /// Validation including the constraints that depend on the host audio.
    pub fn validate_for(&self, sample_rate: u32) -> Vec<ValidationIssue> {
        let mut issues = self.validate();
        self.layout.check_sample_rate(sample_rate, &mut issues);
        issues
    }
}

impl Validate for EncodingSettings {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.layout.check(&mut issues);

        if !(self.amplitude.is_finite() && (0.0..=1.0).contains(&self.amplitude)) {
            issues.push(ValidationIssue::new("amplitude", "must be within [0, 1]"));
        }
        if !(self.fade_in_ms.is_finite() && self.fade_in_ms >= 0.0) {
            issues.push(ValidationIssue::new("fadeInMs", "must be non-negative"));
        }
        if !(self.fade_out_ms.is_finite() && self.fade_out_ms >= 0.0) {
            issues.push(ValidationIssue::new("fadeOutMs", "must be non-negative"));
        }
        if self.fade_in_ms + self.fade_out_ms > self.layout.bit_duration_ms {
            issues.push(ValidationIssue::new(
                "fadeInMs",
                "fade-in plus fade-out must fit inside bitDurationMs",
            ));
        }
        if self.error_correction_level == ErrorCorrectionLevel::Basic
            && (self.redundancy_factor % 2 == 0
                || !(MIN_REDUNDANCY_FACTOR..=MAX_REDUNDANCY_FACTOR)
                    .contains(&self.redundancy_factor))
        {
            issues.push(ValidationIssue::new(
                "redundancyFactor",
                format!("must be odd and between {MIN_REDUNDANCY_FACTOR} and {MAX_REDUNDANCY_FACTOR}"),
            ));
        }
        if self.encryption_enabled && self.encryption_key.is_none() {
            issues.push(ValidationIssue::new(
                "encryptionEnabled",
                "encryption requires a key",
            ));
        }
        if self.obfuscate && !self.encryption_enabled {
            issues.push(ValidationIssue::new(
                "obfuscate",
                "padding is only applied to encrypted payloads",
            ));
        }
        if self.compression_level > MAX_COMPRESSION_LEVEL {
            issues.push(ValidationIssue::new(
                "compressionLevel",
                format!("must be between 0 and {MAX_COMPRESSION_LEVEL}"),
            ));
        }
        if !(self.embed_offset_ms.is_finite() && self.embed_offset_ms >= 0.0) {
            issues.push(ValidationIssue::new("embedOffsetMs", "must be non-negative"));
        }
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecodingSettings {
    #[serde(flatten)]
    pub layout: ToneLayout,
    /// Restricts the band used for noise-floor estimation.
    pub frequency_range_hint: Option<FrequencyRange>,
    pub detection_sensitivity: DetectionSensitivity,
    /// Minimum normalized preamble correlation in (0, 1] for a region to count.
    pub min_signal_strength: f32,
    pub window_size: usize,
    /// Fraction of `window_size` shared by consecutive analysis windows.
    pub window_overlap: f32,
    pub window_function: WindowFunction,
    /// Largest fraction of corrected code units still accepted.
    pub error_tolerance: f32,
    /// Extra demodulation passes with relaxed sensitivity after a failed frame.
    pub max_retries: u32,
    #[serde(skip)]
    pub decryption_key: Option<CipherKey>,
}

impl Default for DecodingSettings {
    fn default() -> Self {
        Self {
            layout: ToneLayout::default(),
            frequency_range_hint: None,
            detection_sensitivity: DetectionSensitivity::default(),
            min_signal_strength: 0.35,
            window_size: 1024,
            window_overlap: 0.5,
            window_function: WindowFunction::default(),
            error_tolerance: 0.25,
            max_retries: 2,
            decryption_key: None,
        }
    }
}

impl DecodingSettings {
    /// Analysis hop in samples.
    pub fn hop_size(&self) -> usize {
        ((self.window_size as f32 * (1.0 - self.window_overlap)).round() as usize).max(1)
    }

    pub fn validate_for(&self, sample_rate: u32) -> Vec<ValidationIssue> {
        let mut issues = self.validate();
        self.layout.check_sample_rate(sample_rate, &mut issues);
        let bit_samples = self.layout.bit_samples(sample_rate);
        if self.window_size > bit_samples {
            issues.push(ValidationIssue::new(
                "windowSize",
                format!(
                    "must not exceed the symbol length ({bit_samples} samples at {sample_rate} Hz)"
                ),
            ));
        }
        issues
    }
}

impl Validate for DecodingSettings {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.layout.check(&mut issues);

        if let Some(range) = self.frequency_range_hint {
            if !(range.low_hz.is_finite() && range.high_hz.is_finite() && range.low_hz < range.high_hz)
            {
                issues.push(ValidationIssue::new(
                    "frequencyRangeHint",
                    "low bound must be below high bound",
                ));
            } else if !(range.contains(self.layout.base_frequency)
                && range.contains(self.layout.highest_frequency()))
            {
                issues.push(ValidationIssue::new(
                    "frequencyRangeHint",
                    "must contain every carrier tone",
                ));
            }
        }
        if !(self.min_signal_strength > 0.0 && self.min_signal_strength <= 1.0) {
            issues.push(ValidationIssue::new(
                "minSignalStrength",
                "must be within (0, 1]",
            ));
        }
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.window_size) {
            issues.push(ValidationIssue::new(
                "windowSize",
                format!("must be between {MIN_WINDOW_SIZE} and {MAX_WINDOW_SIZE}"),
            ));
        }
        if !(self.window_overlap.is_finite()
            && (0.0..=MAX_WINDOW_OVERLAP).contains(&self.window_overlap))
        {
            issues.push(ValidationIssue::new(
                "windowOverlap",
                format!("must be within [0, {MAX_WINDOW_OVERLAP}]"),
            ));
        }
        if !(self.error_tolerance.is_finite() && (0.0..=1.0).contains(&self.error_tolerance)) {
            issues.push(ValidationIssue::new("errorTolerance", "must be within [0, 1]"));
        }
        if self.max_retries > MAX_RETRIES {
            issues.push(ValidationIssue::new(
                "maxRetries",
                format!("must not exceed {MAX_RETRIES}"),
            ));
        }
        issues
    }
}

/// One problem found in a settings object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: &'static str,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub trait Validate {
    /// Sample-rate independent checks. Pure: never mutates `self`.
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn validate<S: Validate + ?Sized>(settings: &S) -> Vec<ValidationIssue> {
    settings.validate()
}

pub(crate) fn ms_to_samples(ms: f32, sample_rate: u32) -> usize {
    if !ms.is_finite() || ms <= 0.0 {
        return 0;
    }
    (ms * sample_rate as f32 / 1000.0).round() as usize
}
