use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::assembler::{Assembly, FrameAssembler, RegionState, RegionTracker};
use crate::audio::AudioBuffer;
use crate::cipher::CipherCodec;
use crate::compression::decompress;
use crate::confidence::{ConfidenceBreakdown, ConfidenceScorer};
use crate::control::{CancellationToken, Control, ProgressObserver, Stage};
use crate::error::{DecodeError, IntegrityError};
use crate::framing::FrameFlags;
use crate::fsk::{FskDemodulator, SymbolDecision, SymbolStream};
use crate::settings::{DecodingSettings, ErrorCorrectionLevel, Validate};
use crate::spectrum::{SpectralAnalyzer, SpectralStream};
use crate::sync::{PreambleMatch, RegionDetector};
use crate::LOW_CONFIDENCE_FLOOR;

/// Non-fatal conditions attached to a region result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DecodeWarning {
    LowConfidence { confidence: f32 },
    /// The frame only assembled after `retries` passes with a relaxed
    /// dominance margin.
    RelaxedSensitivity { retries: u32 },
    /// Some symbols had no clear winning tone.
    Erasures { count: usize },
    /// The frame is encrypted and no decryption key was configured.
    MissingDecryptionKey,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeWarning::LowConfidence { confidence } => {
                write!(f, "low confidence ({confidence:.2})")
            }
            DecodeWarning::RelaxedSensitivity { retries } => {
                write!(f, "decoded after {retries} relaxed retries")
            }
            DecodeWarning::Erasures { count } => write!(f, "{count} symbols erased"),
            DecodeWarning::MissingDecryptionKey => f.write_str("frame is encrypted but no key was given"),
        }
    }
}

/// Where a carrier was found, in seconds from the start of the audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedRegion {
    pub start_time: f32,
    pub end_time: f32,
    /// Estimated frequency of the lowest tone.
    pub frequency: f32,
}

/// Decoder-side details about a region.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeMetadata {
    pub error_correction_level: Option<ErrorCorrectionLevel>,
    pub redundancy_factor: Option<u8>,
    pub flags: Option<FrameFlags>,
    /// Length of the framed payload, before decryption and decompression.
    pub payload_len: Option<usize>,
    pub symbols: usize,
    pub erased_symbols: usize,
    pub mean_snr_db: f32,
    pub retries: u32,
    pub state: RegionState,
}

/// Outcome for one detected region. `message` is present only when every
/// integrity check passed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeResult {
    pub message: Option<Vec<u8>>,
    pub confidence: f32,
    pub confidence_breakdown: ConfidenceBreakdown,
    pub detected_region: DetectedRegion,
    pub errors_corrected: usize,
    pub warnings: Vec<DecodeWarning>,
    pub failure: Option<IntegrityError>,
    pub metadata: DecodeMetadata,
}

impl DecodeResult {
    pub fn is_success(&self) -> bool {
        self.message.is_some()
    }

    /// The message as UTF-8, if it decoded and is valid text.
    pub fn message_str(&self) -> Option<&str> {
        self.message
            .as_deref()
            .and_then(|m| std::str::from_utf8(m).ok())
    }
}

/// Demodulation outcome of one pass over a region.
struct RegionPass {
    assembly: Assembly,
    symbols: usize,
    erased: usize,
    mean_snr_db: f32,
}

impl RegionPass {
    fn new(assembly: Assembly, decisions: &[SymbolDecision]) -> Self {
        let symbols = assembly
            .frame_symbols
            .unwrap_or(decisions.len())
            .min(decisions.len());
        let used = &decisions[..symbols];
        let erased = used.iter().filter(|d| d.erased).count();
        let mean_snr_db = if used.is_empty() {
            0.0
        } else {
            used.iter().map(|d| d.snr_db).sum::<f32>() / used.len() as f32
        };
        Self {
            assembly,
            symbols,
            erased,
            mean_snr_db,
        }
    }
}

/// Finds carriers in audio and recovers their payloads.
pub struct Decoder {
    settings: DecodingSettings,
    control: Control,
}

impl Decoder {
    pub fn new(settings: DecodingSettings) -> Result<Self, DecodeError> {
        let issues = settings.validate();
        if !issues.is_empty() {
            return Err(DecodeError::InvalidSettings(issues));
        }
        Ok(Self {
            settings,
            control: Control::default(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.control = self.control.with_cancellation(token);
        self
    }

    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.control = self.control.with_observer(observer);
        self
    }

    pub fn settings(&self) -> &DecodingSettings {
        &self.settings
    }

    fn check(&self, sample_rate: u32) -> Result<(), DecodeError> {
        let issues = self.settings.validate_for(sample_rate);
        if !issues.is_empty() {
            return Err(DecodeError::InvalidSettings(issues));
        }
        Ok(())
    }

    /// Decode every carrier in `audio`, ordered by start time. Audio without a
    /// carrier yields an empty list.
    pub fn decode(&self, audio: &AudioBuffer) -> Result<Vec<DecodeResult>, DecodeError> {
        let sample_rate = audio.sample_rate();
        self.check(sample_rate)?;
        if self.control.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        let mono = audio.to_mono();
        let detector = RegionDetector::new(&self.settings, sample_rate);
        let matches = detector.detect(&mono, &self.control)?;
        log::debug!("{} preamble candidates in {:.2} s", matches.len(), audio.duration_secs());

        let mut results = Vec::new();
        let mut claimed_until = 0usize;
        for (region, preamble) in matches.iter().enumerate() {
            if preamble.start < claimed_until {
                log::debug!(
                    "skipping candidate at sample {} inside the previous region",
                    preamble.start
                );
                continue;
            }
            let mut tracker = RegionTracker::new(region);
            tracker.advance(RegionState::PreambleLocked);
            let (result, end) = match self.decode_region(&mono, sample_rate, &detector, preamble, &mut tracker) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracker.advance(RegionState::Abandoned);
                    return Err(e);
                }
            };
            claimed_until = end;
            results.push(result);
        }
        Ok(results)
    }

    /// Demodulate the frame following `preamble`, retrying with relaxed
    /// sensitivity while it fails. Returns the result and the sample where the
    /// region ends.
    fn decode_region(
        &self,
        samples: &[f32],
        sample_rate: u32,
        detector: &RegionDetector<'_>,
        preamble: &PreambleMatch,
        tracker: &mut RegionTracker,
    ) -> Result<(DecodeResult, usize), DecodeError> {
        tracker.advance(RegionState::Demodulating);
        let layout = self.settings.layout;
        let period = layout.symbol_period_samples(sample_rate);
        let first_symbol = preamble.start + detector.preamble_len();
        let assembler = FrameAssembler::new(&layout, self.settings.error_tolerance);

        let mut retries = 0;
        let pass = loop {
            let margin = self.settings.detection_sensitivity.relaxed_margin(retries);
            let demodulator = FskDemodulator::new(layout, sample_rate, margin);
            let mut stream = SymbolStream::new(&demodulator, samples, first_symbol, &self.control);
            let assembly = assembler.assemble(&mut stream)?;
            let current = RegionPass::new(assembly, stream.decisions());
            if current.assembly.outcome.is_ok() || retries == self.settings.max_retries {
                break current;
            }
            log::debug!(
                "region at sample {}: pass {retries} (margin {margin:.3}) failed",
                preamble.start
            );
            retries += 1;
        };

        let mut warnings = Vec::new();
        if retries > 0 && pass.assembly.outcome.is_ok() {
            warnings.push(DecodeWarning::RelaxedSensitivity { retries });
        }
        if pass.erased > 0 {
            warnings.push(DecodeWarning::Erasures { count: pass.erased });
        }

        let header = pass.assembly.header;
        let mut metadata = DecodeMetadata {
            error_correction_level: header.map(|h| h.ec_level),
            redundancy_factor: header.map(|h| h.redundancy),
            flags: header.map(|h| h.flags),
            payload_len: header.map(|h| h.payload_len),
            symbols: pass.symbols,
            erased_symbols: pass.erased,
            mean_snr_db: pass.mean_snr_db,
            retries,
            state: tracker.state(),
        };

        let mut message = None;
        let mut failure = None;
        let mut errors_corrected = 0;
        let mut corrected_fraction = 1.0;

        match pass.assembly.outcome {
            Err(e) => {
                log::info!("region at sample {}: {e}", preamble.start);
                tracker.advance(RegionState::IntegrityFailed);
                failure = Some(e);
            }
            Ok(assembled) => {
                tracker.advance(RegionState::FrameValidated);
                errors_corrected = assembled.fec.errors_corrected;
                corrected_fraction = assembled.fec.corrected_fraction();
                let flags = assembled.frame.header().flags;
                match self.unwrap_payload(assembled.frame.into_payload(), flags, tracker, &mut warnings) {
                    Ok(payload) => {
                        tracker.advance(RegionState::Complete);
                        message = Some(payload);
                    }
                    Err(e) => {
                        log::info!("region at sample {}: {e}", preamble.start);
                        tracker.advance(RegionState::IntegrityFailed);
                        failure = Some(e);
                    }
                }
            }
        }
        metadata.state = tracker.state();

        let (confidence, confidence_breakdown) = ConfidenceScorer::score(
            preamble.correlation,
            pass.mean_snr_db,
            corrected_fraction,
            message.is_some(),
        );
        if confidence < LOW_CONFIDENCE_FLOOR {
            warnings.push(DecodeWarning::LowConfidence { confidence });
        }

        let symbols_end = first_symbol + pass.assembly.frame_symbols.unwrap_or(0) * period;
        let end = symbols_end.min(samples.len());
        let result = DecodeResult {
            message,
            confidence,
            confidence_breakdown,
            detected_region: DetectedRegion {
                start_time: preamble.start as f32 / sample_rate as f32,
                end_time: end as f32 / sample_rate as f32,
                frequency: preamble.frequency,
            },
            errors_corrected,
            warnings,
            failure,
            metadata,
        };
        Ok((result, end))
    }

    /// Undo encryption and compression on a validated frame payload.
    fn unwrap_payload(
        &self,
        payload: Vec<u8>,
        flags: FrameFlags,
        tracker: &mut RegionTracker,
        warnings: &mut Vec<DecodeWarning>,
    ) -> Result<Vec<u8>, IntegrityError> {
        let mut body = payload;
        if flags.encrypted {
            tracker.advance(RegionState::Decrypting);
            let Some(key) = &self.settings.decryption_key else {
                warnings.push(DecodeWarning::MissingDecryptionKey);
                return Err(IntegrityError::DecryptionFailed(
                    "frame is encrypted but no decryption key was given".into(),
                ));
            };
            body = CipherCodec::open_padded(key, &body)
                .map_err(|e| IntegrityError::DecryptionFailed(e.to_string()))?;
        }
        if flags.compressed {
            body = decompress(&body)
                .map_err(|e| IntegrityError::FrameMalformed(format!("payload does not inflate: {e}")))?;
        }
        Ok(body)
    }

    /// RMS magnitude of the carrier band over the whole of `audio`.
    pub fn signal_strength(&self, audio: &AudioBuffer) -> Result<f32, DecodeError> {
        let sample_rate = audio.sample_rate();
        self.check(sample_rate)?;
        let mono = audio.to_mono();
        let mut monitor = SignalMonitor::new(&self.settings, sample_rate);

        let total = monitor.stream.analyzer().frame_count(mono.len());
        for chunk in mono.chunks(monitor.stream.analyzer().hop()) {
            if self.control.is_cancelled() {
                return Err(DecodeError::Cancelled);
            }
            monitor.push(chunk)?;
            self.control.report(Stage::Analyzing, monitor.frames(), total);
        }
        Ok(monitor.strength())
    }

    /// Describe `audio` and decode whatever it carries.
    pub fn analyze(&self, audio: &AudioBuffer) -> Result<AnalysisReport, DecodeError> {
        let signal_strength = self.signal_strength(audio)?;
        let results = self.decode(audio)?;
        let layout = self.settings.layout;
        Ok(AnalysisReport {
            duration_secs: audio.duration_secs(),
            sample_rate: audio.sample_rate(),
            channels: audio.channels(),
            signal_strength,
            frequency_range: (layout.base_frequency, layout.highest_frequency()),
            has_signal: !results.is_empty(),
            decoded: results.iter().any(DecodeResult::is_success),
            results,
        })
    }
}

/// Summary of a recording produced by [`Decoder::analyze`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub duration_secs: f32,
    pub sample_rate: u32,
    pub channels: u16,
    /// RMS level of the carrier band.
    pub signal_strength: f32,
    /// Lowest and highest tone in Hz.
    pub frequency_range: (f32, f32),
    /// At least one preamble was found.
    pub has_signal: bool,
    /// At least one region yielded a message.
    pub decoded: bool,
    pub results: Vec<DecodeResult>,
}

/// Carrier-band level of audio that arrives in chunks, such as live input.
#[derive(Debug, Clone)]
pub struct SignalMonitor {
    stream: SpectralStream,
    low: usize,
    high: usize,
    power_sum: f64,
    frames: usize,
}

impl SignalMonitor {
    pub fn new(settings: &DecodingSettings, sample_rate: u32) -> Self {
        let analyzer = SpectralAnalyzer::from_settings(settings, sample_rate);
        let layout = settings.layout;
        let half_sep = layout.frequency_separation / 2.0;
        let low = analyzer.bin_of((layout.base_frequency - half_sep).max(0.0));
        let high = analyzer.bin_of(layout.highest_frequency() + half_sep);
        Self {
            stream: SpectralStream::new(analyzer),
            low,
            high,
            power_sum: 0.0,
            frames: 0,
        }
    }

    /// Append `chunk` and return the band RMS of every window it completed.
    pub fn push(&mut self, chunk: &[f32]) -> Result<Vec<f32>, DecodeError> {
        let frames = self.stream.push(chunk)?;
        let analyzer = self.stream.analyzer();
        Ok(frames
            .iter()
            .map(|frame| {
                let power = analyzer.band_power(&frame.magnitudes, self.low, self.high);
                self.power_sum += power as f64;
                self.frames += 1;
                power.sqrt()
            })
            .collect())
    }

    /// Windows analysed so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// RMS band level over everything pushed so far, zero before the first
    /// full window.
    pub fn strength(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        ((self.power_sum / self.frames as f64) as f32).sqrt()
    }
}
