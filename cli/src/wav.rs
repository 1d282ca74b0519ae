use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ultrafsk_core::AudioBuffer;

use crate::error::CliError;

/// Sample encoding of a WAV file, kept so output matches the host file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavFormat {
    Int { bits: u16 },
    Float,
}

impl Default for WavFormat {
    fn default() -> Self {
        WavFormat::Int { bits: 16 }
    }
}

/// Read a WAV file into interleaved f32 samples in [-1, 1].
pub fn read_wav(path: &Path) -> Result<(AudioBuffer, WavFormat), CliError> {
    let mut reader: WavReader<BufReader<File>> = WavReader::open(path)?;
    let spec = reader.spec();
    tracing::debug!(
        "read {}: {} Hz, {} channels, {} bits {:?}",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    let (samples, format) = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => {
            let samples = reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?;
            (samples, WavFormat::Float)
        }
        (SampleFormat::Int, bits @ (8 | 16 | 24 | 32)) => {
            let scale = 1.0 / (1i64 << (bits - 1)) as f32;
            let samples = reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?;
            (samples, WavFormat::Int { bits })
        }
        (format, bits) => {
            return Err(CliError::UnsupportedWav(format!(
                "{bits}-bit {format:?} samples"
            )))
        }
    };

    Ok((
        AudioBuffer::new(samples, spec.sample_rate, spec.channels),
        format,
    ))
}

/// Write `audio` as a WAV file. Integer output is clamped to full scale and
/// returns how many samples had to be clamped.
pub fn write_wav(path: &Path, audio: &AudioBuffer, format: WavFormat) -> Result<usize, CliError> {
    let spec = WavSpec {
        channels: audio.channels(),
        sample_rate: audio.sample_rate(),
        bits_per_sample: match format {
            WavFormat::Int { bits } => bits,
            WavFormat::Float => 32,
        },
        sample_format: match format {
            WavFormat::Int { .. } => SampleFormat::Int,
            WavFormat::Float => SampleFormat::Float,
        },
    };
    let mut writer = WavWriter::create(path, spec)?;
    let mut clamped = 0;

    match format {
        WavFormat::Float => {
            for &sample in audio.samples() {
                writer.write_sample(sample)?;
            }
        }
        WavFormat::Int { bits } => {
            let full_scale = ((1i64 << (bits - 1)) - 1) as f32;
            for &sample in audio.samples() {
                if sample.abs() > 1.0 {
                    clamped += 1;
                }
                let value = (sample.clamp(-1.0, 1.0) * full_scale).round() as i32;
                writer.write_sample(value)?;
            }
        }
    }
    writer.finalize()?;
    Ok(clamped)
}
