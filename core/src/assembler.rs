//! Frame reassembly from demodulated symbols, and the per-region state machine.

use serde::Serialize;

use crate::error::{DecodeError, FecError, IntegrityError};
use crate::fec::{ErrorCorrectionCodec, FecDecoded};
use crate::framing::{bits_to_bytes, Frame, FrameDecoder, FrameHeader};
use crate::fsk::SymbolStream;
use crate::settings::{ErrorCorrectionLevel, ToneLayout};
use crate::FRAME_HEADER_BITS;

/// Lifecycle of one detected region.
///
/// ```text
/// Scanning -> PreambleLocked -> Demodulating -> FrameValidated -> [Decrypting ->] Complete
///                                    |                 |               |
///                                    +-----------------+---------------+--> IntegrityFailed
/// any state -> Abandoned (cancellation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RegionState {
    Scanning,
    PreambleLocked,
    Demodulating,
    FrameValidated,
    Decrypting,
    Complete,
    IntegrityFailed,
    Abandoned,
}

impl RegionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RegionState::Complete | RegionState::IntegrityFailed | RegionState::Abandoned
        )
    }

    pub fn can_transition_to(self, next: RegionState) -> bool {
        use RegionState::*;
        match (self, next) {
            (from, Abandoned) => !from.is_terminal(),
            (Scanning, PreambleLocked)
            | (PreambleLocked, Demodulating)
            | (Demodulating, FrameValidated)
            | (Demodulating, IntegrityFailed)
            | (FrameValidated, Decrypting)
            | (FrameValidated, Complete)
            | (FrameValidated, IntegrityFailed)
            | (Decrypting, Complete)
            | (Decrypting, IntegrityFailed) => true,
            _ => false,
        }
    }
}

/// Tracks and traces the state of one region.
#[derive(Debug)]
pub struct RegionTracker {
    region: usize,
    state: RegionState,
}

impl RegionTracker {
    pub fn new(region: usize) -> Self {
        Self {
            region,
            state: RegionState::Scanning,
        }
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn advance(&mut self, next: RegionState) {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "region {}: unexpected transition {:?} -> {:?}",
                self.region,
                self.state,
                next
            );
        }
        log::trace!("region {}: {:?} -> {:?}", self.region, self.state, next);
        self.state = next;
    }
}

/// Error-correction configurations tried, in order, when reading a frame.
pub const EC_CANDIDATES: [(ErrorCorrectionLevel, u8); 5] = [
    (ErrorCorrectionLevel::None, 0),
    (ErrorCorrectionLevel::Basic, 3),
    (ErrorCorrectionLevel::Basic, 5),
    (ErrorCorrectionLevel::Basic, 7),
    (ErrorCorrectionLevel::Advanced, 0),
];

#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame: Frame,
    pub codec: ErrorCorrectionCodec,
    pub fec: FecDecoded,
}

/// Result of reading one region's frame.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub outcome: Result<AssembledFrame, IntegrityError>,
    /// Symbols occupied by the frame, when a header could be read.
    pub frame_symbols: Option<usize>,
    pub header: Option<FrameHeader>,
}

pub struct FrameAssembler {
    bits_per_symbol: usize,
    tolerance: f32,
}

impl FrameAssembler {
    pub fn new(layout: &ToneLayout, tolerance: f32) -> Self {
        Self {
            bits_per_symbol: layout.bits_per_symbol(),
            tolerance,
        }
    }

    fn symbols_for(&self, coded_bits: usize) -> usize {
        coded_bits.div_ceil(self.bits_per_symbol)
    }

    /// Read the header under `codec`. `None` unless it decodes to a header that
    /// names that same configuration.
    fn read_header(
        &self,
        stream: &mut SymbolStream<'_>,
        codec: &ErrorCorrectionCodec,
    ) -> Result<Option<FrameHeader>, DecodeError> {
        let coded = codec.encoded_len(FRAME_HEADER_BITS);
        let symbols = self.symbols_for(coded);
        if stream.ensure(symbols)? < symbols {
            return Ok(None);
        }
        let (bits, erasures) = stream.bits(symbols);
        let Ok(decoded) = codec.decode(&bits[..coded], &erasures[..coded], FRAME_HEADER_BITS, 1.0)
        else {
            return Ok(None);
        };
        let bytes = bits_to_bytes(&decoded.bits);
        let Ok(header) = FrameHeader::from_bytes([bytes[0], bytes[1]]) else {
            return Ok(None);
        };
        if header.ec_level != codec.level() || header.redundancy != codec.redundancy() {
            return Ok(None);
        }
        Ok(Some(header))
    }

    /// Try every error-correction configuration and return the first frame
    /// whose header and checksum agree. When none does, the failure of the
    /// first configuration that produced a plausible header is reported.
    pub fn assemble(&self, stream: &mut SymbolStream<'_>) -> Result<Assembly, DecodeError> {
        let mut first_failure: Option<Assembly> = None;

        for (level, redundancy) in EC_CANDIDATES {
            let codec = ErrorCorrectionCodec::new(level, redundancy);
            let Some(header) = self.read_header(stream, &codec)? else {
                continue;
            };

            let frame_bits = header.frame_bytes() * 8;
            let coded = codec.encoded_len(frame_bits);
            let symbols = self.symbols_for(coded);
            let available = stream.ensure(symbols)?;

            let failure = |error: IntegrityError| Assembly {
                outcome: Err(error),
                frame_symbols: Some(symbols),
                header: Some(header),
            };

            if available < symbols {
                log::debug!("{level} frame needs {symbols} symbols, only {available} available");
                first_failure.get_or_insert(failure(IntegrityError::FrameMalformed(format!(
                    "frame of {symbols} symbols runs past the end of the audio ({available} available)"
                ))));
                continue;
            }

            let (bits, erasures) = stream.bits(symbols);
            let fec = match codec.decode(&bits[..coded], &erasures[..coded], frame_bits, self.tolerance) {
                Ok(fec) => fec,
                Err(e) => {
                    log::debug!("{level} error correction failed: {e}");
                    let error = match e {
                        FecError::Truncated { .. } => IntegrityError::FrameMalformed(e.to_string()),
                        _ => IntegrityError::IntegrityFailed(e.to_string()),
                    };
                    first_failure.get_or_insert(failure(error));
                    continue;
                }
            };

            match FrameDecoder::decode(&bits_to_bytes(&fec.bits)) {
                Ok(frame) => {
                    log::debug!(
                        "frame accepted: {} payload bytes, ec {level}, {} bits corrected",
                        frame.header().payload_len,
                        fec.errors_corrected
                    );
                    return Ok(Assembly {
                        outcome: Ok(AssembledFrame { frame, codec, fec }),
                        frame_symbols: Some(symbols),
                        header: Some(header),
                    });
                }
                Err(e) => {
                    log::debug!("{level} frame rejected: {e}");
                    first_failure.get_or_insert(failure(e));
                }
            }
        }

        Ok(first_failure.unwrap_or(Assembly {
            outcome: Err(IntegrityError::FrameMalformed(
                "no decodable frame header".to_string(),
            )),
            frame_symbols: None,
            header: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use crate::framing::{bytes_to_bits, FrameEncoder, FrameFlags};
    use crate::fsk::{FskDemodulator, FskModulator};
    use crate::settings::EnvelopeShape;
    use crate::sync::PREAMBLE_CHIPS;

    const SAMPLE_RATE: u32 = 44_100;

    /// Modulate `payload` under `codec`, flipping the listed channel bits first.
    fn carrier(payload: &[u8], codec: ErrorCorrectionCodec, flips: &[usize]) -> Vec<f32> {
        let frame = Frame::new(
            payload.to_vec(),
            FrameFlags::default(),
            codec.level(),
            codec.redundancy(),
        )
        .unwrap();
        let mut bits = codec.encode(&bytes_to_bits(&FrameEncoder::encode(&frame)));
        for &i in flips {
            bits[i] ^= 1;
        }
        let modulator = FskModulator::new(
            ToneLayout::default(),
            SAMPLE_RATE,
            5.0,
            5.0,
            EnvelopeShape::RaisedCosine,
        );
        modulator.modulate(&bits, &Control::default()).unwrap()
    }

    fn assemble(samples: &[f32]) -> Assembly {
        let layout = ToneLayout::default();
        let demodulator = FskDemodulator::new(layout, SAMPLE_RATE, 1.5);
        let control = Control::default();
        let first = PREAMBLE_CHIPS.len() * layout.symbol_period_samples(SAMPLE_RATE);
        let mut stream = SymbolStream::new(&demodulator, samples, first, &control);
        FrameAssembler::new(&layout, 0.25)
            .assemble(&mut stream)
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert!(RegionState::Scanning.can_transition_to(RegionState::PreambleLocked));
        assert!(RegionState::FrameValidated.can_transition_to(RegionState::Complete));
        assert!(RegionState::Demodulating.can_transition_to(RegionState::Abandoned));
        assert!(!RegionState::Complete.can_transition_to(RegionState::Abandoned));
        assert!(!RegionState::Scanning.can_transition_to(RegionState::Complete));

        let mut tracker = RegionTracker::new(0);
        tracker.advance(RegionState::PreambleLocked);
        tracker.advance(RegionState::Demodulating);
        assert_eq!(tracker.state(), RegionState::Demodulating);
    }

    #[test]
    fn test_discovers_each_error_correction_level() {
        for (level, redundancy) in EC_CANDIDATES {
            let codec = ErrorCorrectionCodec::new(level, redundancy);
            let assembly = assemble(&carrier(b"status:ok\n", codec, &[]));
            let assembled = assembly.outcome.unwrap();
            assert_eq!(assembled.frame.payload(), b"status:ok\n");
            assert_eq!(assembled.codec, codec);
            assert_eq!(assembled.fec.errors_corrected, 0);
        }
    }

    #[test]
    fn test_advanced_corrects_injected_errors() {
        let codec = ErrorCorrectionCodec::new(ErrorCorrectionLevel::Advanced, 0);
        // One flip in each of three codewords of the second super-block.
        let flips = [64 + 1, 64 + 8 + 2, 64 + 40 + 5];
        let assembled = assemble(&carrier(b"status:ok\n", codec, &flips))
            .outcome
            .unwrap();
        assert_eq!(assembled.frame.payload(), b"status:ok\n");
        assert_eq!(assembled.fec.errors_corrected, flips.len());
    }

    #[test]
    fn test_advanced_double_error_fails_integrity() {
        let codec = ErrorCorrectionCodec::new(ErrorCorrectionLevel::Advanced, 0);
        // Two flips in codeword 0 of the second super-block.
        let assembly = assemble(&carrier(b"status:ok\n", codec, &[64, 72]));
        match assembly.outcome {
            Err(IntegrityError::IntegrityFailed(_)) => {}
            other => panic!("Expected IntegrityFailed, got {:?}", other),
        }
        assert_eq!(assembly.header.map(|h| h.ec_level), Some(ErrorCorrectionLevel::Advanced));
    }

    #[test]
    fn test_corrupt_checksum_without_correction() {
        let codec = ErrorCorrectionCodec::new(ErrorCorrectionLevel::None, 0);
        let assembly = assemble(&carrier(b"status:ok\n", codec, &[40]));
        match assembly.outcome {
            Err(IntegrityError::IntegrityFailed(_)) => {}
            other => panic!("Expected IntegrityFailed, got {:?}", other),
        }
        assert_eq!(assembly.frame_symbols, Some(52));
    }

    #[test]
    fn test_truncated_region_is_malformed() {
        let codec = ErrorCorrectionCodec::new(ErrorCorrectionLevel::None, 0);
        let samples = carrier(b"status:ok\n", codec, &[]);
        let assembly = assemble(&samples[..samples.len() - 10 * 2205]);
        match assembly.outcome {
            Err(IntegrityError::FrameMalformed(_)) => {}
            other => panic!("Expected FrameMalformed, got {:?}", other),
        }
    }
}
