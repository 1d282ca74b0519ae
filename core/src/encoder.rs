use std::sync::Arc;

use crate::audio::AudioBuffer;
use crate::cipher::{CipherCodec, MAX_PADDING, PADDED_OVERHEAD};
use crate::compression::compress;
use crate::control::{CancellationToken, Control, ProgressObserver};
use crate::embed::{CarrierEmbedder, Embedded};
use crate::error::EncodeError;
use crate::fec::ErrorCorrectionCodec;
use crate::framing::{bytes_to_bits, frame_bytes_for, Frame, FrameEncoder, FrameFlags};
use crate::fsk::FskModulator;
use crate::settings::{ms_to_samples, EncodingSettings, Validate};
use crate::MAX_PAYLOAD_SIZE;

/// Embeds payloads into host audio.
///
/// Pipeline: compress -> encrypt -> frame -> error correction -> modulate ->
/// mix. Every configuration problem is reported before anything is modulated.
pub struct Encoder {
    settings: EncodingSettings,
    control: Control,
}

impl Encoder {
    /// Fails with [`EncodeError::InvalidSettings`] when `settings` do not
    /// validate; checks that depend on the host sample rate run in
    /// [`Encoder::encode`].
    pub fn new(settings: EncodingSettings) -> Result<Self, EncodeError> {
        let issues = settings.validate();
        if !issues.is_empty() {
            return Err(EncodeError::InvalidSettings(issues));
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

    pub fn settings(&self) -> &EncodingSettings {
        &self.settings
    }

    /// Compress and encrypt `payload` as configured, returning the bytes that go
    /// into the frame and the matching header flags.
    fn prepare_payload(&self, payload: &[u8]) -> Result<(Vec<u8>, FrameFlags), EncodeError> {
        let mut flags = FrameFlags::default();
        let mut body = payload.to_vec();

        if self.settings.compression_level > 0 {
            if let Some(compressed) = compress(&body, self.settings.compression_level)
                .map_err(|e| EncodeError::Compression(e.to_string()))?
            {
                log::debug!("compressed payload {} -> {} bytes", body.len(), compressed.len());
                body = compressed;
                flags.compressed = true;
            }
        }

        if self.settings.encryption_enabled {
            let key = self
                .settings
                .encryption_key
                .as_ref()
                .ok_or_else(|| EncodeError::InvalidSettings(self.settings.validate()))?;
            let padding = if self.settings.obfuscate {
                CipherCodec::random_padding()
            } else {
                0
            };
            body = CipherCodec::seal_padded(key, &body, padding)?;
            flags.encrypted = true;
        }

        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(EncodeError::PayloadTooLarge {
                len: body.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok((body, flags))
    }

    /// Embed `payload` into a copy of `host`.
    pub fn encode(&self, payload: &[u8], host: &AudioBuffer) -> Result<Embedded, EncodeError> {
        let sample_rate = host.sample_rate();
        let issues = self.settings.validate_for(sample_rate);
        if !issues.is_empty() {
            return Err(EncodeError::InvalidSettings(issues));
        }
        if self.control.is_cancelled() {
            return Err(EncodeError::Cancelled);
        }

        let (body, flags) = self.prepare_payload(payload)?;
        let body_len = body.len();
        let frame = Frame::new(
            body,
            flags,
            self.settings.error_correction_level,
            self.settings.redundancy_factor,
        )
        .ok_or(EncodeError::PayloadTooLarge {
            len: body_len,
            max: MAX_PAYLOAD_SIZE,
        })?;

        let codec = ErrorCorrectionCodec::new(
            self.settings.error_correction_level,
            self.settings.redundancy_factor,
        );
        let bits = codec.encode(&bytes_to_bits(&FrameEncoder::encode(&frame)));

        let modulator = FskModulator::new(
            self.settings.layout,
            sample_rate,
            self.settings.fade_in_ms,
            self.settings.fade_out_ms,
            self.settings.envelope,
        );
        let symbol_count = modulator.symbol_count(bits.len());
        let required = modulator.carrier_len(symbol_count);

        let offset = ms_to_samples(self.settings.embed_offset_ms, sample_rate);
        let embedder = CarrierEmbedder::new(self.settings.amplitude, offset);
        let available = embedder.available(host);
        if required > available {
            return Err(EncodeError::CapacityExceeded {
                required,
                available,
            });
        }

        log::debug!(
            "encoding {} payload bytes as {} channel bits in {} symbols ({} samples at offset {})",
            payload.len(),
            bits.len(),
            symbol_count,
            required,
            offset
        );

        let carrier = modulator.modulate(&bits, &self.control)?;
        let (audio, warnings) = embedder.embed(host, &carrier, &self.control)?;

        Ok(Embedded {
            audio,
            warnings,
            start_time: offset as f32 / sample_rate as f32,
            end_time: (offset + carrier.len()) as f32 / sample_rate as f32,
            symbol_count,
        })
    }

    /// Host duration in seconds needed to carry `payload_len` bytes at
    /// `sample_rate`, assuming compression does not shrink the payload and
    /// random padding takes its largest size.
    pub fn required_duration(&self, payload_len: usize, sample_rate: u32) -> f32 {
        let mut body = payload_len;
        if self.settings.encryption_enabled {
            body += PADDED_OVERHEAD;
            if self.settings.obfuscate {
                body += MAX_PADDING;
            }
        }
        let codec = ErrorCorrectionCodec::new(
            self.settings.error_correction_level,
            self.settings.redundancy_factor,
        );
        let coded = codec.encoded_len(frame_bytes_for(body) * 8);
        let modulator = FskModulator::new(
            self.settings.layout,
            sample_rate,
            self.settings.fade_in_ms,
            self.settings.fade_out_ms,
            self.settings.envelope,
        );
        let samples = modulator.carrier_len(modulator.symbol_count(coded))
            + ms_to_samples(self.settings.embed_offset_ms, sample_rate);
        samples as f32 / sample_rate as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherKey;
    use crate::embed::EncodeWarning;
    use crate::settings::ErrorCorrectionLevel;

    fn example_settings() -> EncodingSettings {
        EncodingSettings {
            amplitude: 0.3,
            ..Default::default()
        }
    }

    #[test]
    fn test_example_fits_three_seconds() {
        let encoder = Encoder::new(example_settings()).unwrap();
        let host = AudioBuffer::silence(3.0, 44_100, 1);
        let embedded = encoder.encode(b"status:ok\n", &host).unwrap();
        assert_eq!(embedded.symbol_count, 52);
        assert_eq!(embedded.audio.frames(), host.frames());
        assert!(embedded.warnings.is_empty());
        assert!(embedded.audio.peak() <= 0.3 + 1e-6);
        assert!(encoder.required_duration(10, 44_100) <= 3.0);
    }

    #[test]
    fn test_invalid_settings_rejected_up_front() {
        let settings = EncodingSettings {
            amplitude: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            Encoder::new(settings),
            Err(EncodeError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_nyquist_checked_against_host() {
        let encoder = Encoder::new(example_settings()).unwrap();
        let host = AudioBuffer::silence(3.0, 22_050, 1);
        match encoder.encode(b"x", &host) {
            Err(EncodeError::InvalidSettings(issues)) => {
                assert!(issues.iter().any(|i| i.field == "sampleRate"))
            }
            other => panic!("Expected InvalidSettings, got {:?}", other.map(|e| e.symbol_count)),
        }
    }

    #[test]
    fn test_capacity_exceeded_is_not_truncated() {
        let encoder = Encoder::new(example_settings()).unwrap();
        let host = AudioBuffer::silence(1.0, 44_100, 1);
        match encoder.encode(b"status:ok\n", &host) {
            Err(EncodeError::CapacityExceeded {
                required,
                available,
            }) => {
                assert_eq!(required, 59 * 2205);
                assert_eq!(available, 44_100);
            }
            other => panic!("Expected CapacityExceeded, got {:?}", other.map(|e| e.symbol_count)),
        }
    }

    #[test]
    fn test_payload_too_large() {
        let encoder = Encoder::new(example_settings()).unwrap();
        let host = AudioBuffer::silence(1.0, 44_100, 1);
        assert!(matches!(
            encoder.encode(&[0u8; 300], &host),
            Err(EncodeError::PayloadTooLarge { len: 300, max: 255 })
        ));
    }

    #[test]
    fn test_clipping_is_a_warning() {
        let encoder = Encoder::new(EncodingSettings {
            amplitude: 0.5,
            ..Default::default()
        })
        .unwrap();
        let host = AudioBuffer::mono(vec![0.8; 3 * 44_100], 44_100);
        let embedded = encoder.encode(b"ok", &host).unwrap();
        assert!(matches!(
            embedded.warnings.as_slice(),
            [EncodeWarning::EncodingClipped { .. }]
        ));
        assert!(embedded.audio.peak() > 1.0);
    }

    #[test]
    fn test_encryption_adds_overhead() {
        let settings = EncodingSettings {
            encryption_enabled: true,
            encryption_key: Some(CipherKey::generate(16).unwrap()),
            error_correction_level: ErrorCorrectionLevel::None,
            ..example_settings()
        };
        let encoder = Encoder::new(settings).unwrap();
        let (body, flags) = encoder.prepare_payload(b"status:ok\n").unwrap();
        assert!(flags.encrypted);
        assert_eq!(body.len(), 10 + PADDED_OVERHEAD);
        assert_eq!(body[0], 0);
    }

    #[test]
    fn test_obfuscation_pads_and_is_budgeted() {
        let key = CipherKey::generate(16).unwrap();
        let plain = Encoder::new(EncodingSettings {
            encryption_enabled: true,
            encryption_key: Some(key.clone()),
            ..example_settings()
        })
        .unwrap();
        let padded = Encoder::new(EncodingSettings {
            encryption_enabled: true,
            encryption_key: Some(key),
            obfuscate: true,
            ..example_settings()
        })
        .unwrap();

        let (body, _) = padded.prepare_payload(b"k1").unwrap();
        let padding = body[0] as usize;
        assert!((1..=MAX_PADDING).contains(&padding));
        assert_eq!(body.len(), 2 + PADDED_OVERHEAD + padding);
        assert!(padded.required_duration(2, 44_100) > plain.required_duration(2, 44_100));

        // The worst-case estimate always leaves room for the carrier.
        let host = AudioBuffer::silence(padded.required_duration(2, 44_100), 44_100, 1);
        for _ in 0..4 {
            padded.encode(b"k1", &host).unwrap();
        }
    }

    #[test]
    fn test_obfuscation_requires_encryption() {
        let settings = EncodingSettings {
            obfuscate: true,
            ..example_settings()
        };
        match Encoder::new(settings) {
            Err(EncodeError::InvalidSettings(issues)) => assert_eq!(issues[0].field, "obfuscate"),
            other => panic!("Expected InvalidSettings, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let encoder = Encoder::new(example_settings())
            .unwrap()
            .with_cancellation(token);
        let host = AudioBuffer::silence(3.0, 44_100, 1);
        assert!(matches!(
            encoder.encode(b"status:ok\n", &host),
            Err(EncodeError::Cancelled)
        ));
    }
}
