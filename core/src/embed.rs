use serde::Serialize;

use crate::audio::AudioBuffer;
use crate::control::{Control, Stage};
use crate::error::EncodeError;

/// Non-fatal conditions reported alongside an encoded buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EncodeWarning {
    /// Mixed samples left [-1, 1]. The samples are kept as-is; the caller
    /// decides whether to clip or rescale.
    EncodingClipped { samples: usize, peak: f32 },
}

impl std::fmt::Display for EncodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeWarning::EncodingClipped { samples, peak } => {
                write!(f, "{samples} samples exceed full scale (peak {peak:.3})")
            }
        }
    }
}

/// Output of an encode call: the host audio with the carrier mixed in.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub audio: AudioBuffer,
    pub warnings: Vec<EncodeWarning>,
    /// Carrier start, seconds from the beginning of the buffer.
    pub start_time: f32,
    pub end_time: f32,
    pub symbol_count: usize,
}

/// Mixes a carrier into host audio.
#[derive(Debug, Clone, Copy)]
pub struct CarrierEmbedder {
    amplitude: f32,
    offset_frames: usize,
}

/// Frames between progress reports while mixing.
const EMBED_REPORT_INTERVAL: usize = 4096;

impl CarrierEmbedder {
    pub fn new(amplitude: f32, offset_frames: usize) -> Self {
        Self {
            amplitude,
            offset_frames,
        }
    }

    /// Frames available to a carrier in `host`.
    pub fn available(&self, host: &AudioBuffer) -> usize {
        host.frames().saturating_sub(self.offset_frames)
    }

    /// Add `carrier * amplitude` to every channel of a copy of `host`, starting
    /// at the configured offset. Never clamps.
    pub fn embed(
        &self,
        host: &AudioBuffer,
        carrier: &[f32],
        control: &Control,
    ) -> Result<(AudioBuffer, Vec<EncodeWarning>), EncodeError> {
        let available = self.available(host);
        if carrier.len() > available {
            return Err(EncodeError::CapacityExceeded {
                required: carrier.len(),
                available,
            });
        }

        let channels = host.channels() as usize;
        let mut audio = host.clone();
        let samples = audio.samples_mut();
        let mut clipped = 0usize;
        let mut peak = 0.0f32;

        for (i, chunk) in carrier.chunks(EMBED_REPORT_INTERVAL).enumerate() {
            if control.is_cancelled() {
                return Err(EncodeError::Cancelled);
            }
            let base = i * EMBED_REPORT_INTERVAL;
            for (j, &value) in chunk.iter().enumerate() {
                let frame = self.offset_frames + base + j;
                for sample in &mut samples[frame * channels..(frame + 1) * channels] {
                    *sample += value * self.amplitude;
                    if sample.abs() > 1.0 {
                        clipped += 1;
                        peak = peak.max(sample.abs());
                    }
                }
            }
            control.report(Stage::Embedding, base + chunk.len(), carrier.len());
        }

        let mut warnings = Vec::new();
        if clipped > 0 {
            log::warn!("{clipped} samples exceed full scale after embedding (peak {peak:.3})");
            warnings.push(EncodeWarning::EncodingClipped {
                samples: clipped,
                peak,
            });
        }
        Ok((audio, warnings))
    }
}
