//! Short-time spectral analysis.
//!
//! Frames are produced lazily: [`SpectralAnalyzer::frames`] walks a borrowed
//! buffer one window at a time, and [`SpectralStream`] accepts audio in
//! arbitrary chunks for real-time use. Neither holds more than one window of
//! spectra at once.

use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::error::DecodeError;
use crate::settings::{DecodingSettings, WindowFunction};

pub fn window_coefficients(function: WindowFunction, len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    let denom = (len - 1) as f32;
    (0..len)
        .map(|i| {
            let x = 2.0 * PI * i as f32 / denom;
            match function {
                WindowFunction::Rectangular => 1.0,
                WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
                WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
            }
        })
        .collect()
}

/// Magnitude spectrum of one analysis window.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    pub index: usize,
    /// First sample of the window.
    pub start: usize,
    /// One entry per bin `0..=window_size/2`, scaled so a sine of amplitude A
    /// centred on a bin reads A.
    pub magnitudes: Vec<f32>,
}

#[derive(Clone)]
pub struct SpectralAnalyzer {
    window_size: usize,
    hop: usize,
    sample_rate: u32,
    window: Vec<f32>,
    scale: f32,
    power_scale: f32,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl std::fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("window_size", &self.window_size)
            .field("hop", &self.hop)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl SpectralAnalyzer {
    pub fn new(window_size: usize, overlap: f32, function: WindowFunction, sample_rate: u32) -> Self {
        let window_size = window_size.max(2);
        let hop = ((window_size as f32 * (1.0 - overlap)).round() as usize).max(1);
        let window = window_coefficients(function, window_size);
        let gain: f32 = window.iter().sum();
        let energy: f32 = window.iter().map(|w| w * w).sum();
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            window_size,
            hop,
            sample_rate,
            scale: if gain > 0.0 { 2.0 / gain } else { 0.0 },
            power_scale: if energy > 0.0 {
                gain * gain / (2.0 * window_size as f32 * energy)
            } else {
                0.0
            },
            window,
            fft: planner.plan_fft_forward(window_size),
        }
    }

    pub fn from_settings(settings: &DecodingSettings, sample_rate: u32) -> Self {
        Self::new(
            settings.window_size,
            settings.window_overlap,
            settings.window_function,
            sample_rate,
        )
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bin_count(&self) -> usize {
        self.window_size / 2 + 1
    }

    pub fn bin_width(&self) -> f32 {
        self.sample_rate as f32 / self.window_size as f32
    }

    /// Nearest bin to `frequency`, clamped to the spectrum.
    pub fn bin_of(&self, frequency: f32) -> usize {
        ((frequency / self.bin_width()).round().max(0.0) as usize).min(self.bin_count() - 1)
    }

    pub fn frequency_of(&self, bin: f32) -> f32 {
        bin * self.bin_width()
    }

    /// Mean-square signal level carried by bins `low..=high` of a frame.
    pub fn band_power(&self, magnitudes: &[f32], low: usize, high: usize) -> f32 {
        let high = high.min(magnitudes.len().saturating_sub(1));
        if low > high {
            return 0.0;
        }
        magnitudes[low..=high].iter().map(|m| m * m).sum::<f32>() * self.power_scale
    }

    /// Number of full windows that fit in `len` samples.
    pub fn frame_count(&self, len: usize) -> usize {
        if len < self.window_size {
            0
        } else {
            (len - self.window_size) / self.hop + 1
        }
    }

    fn transform(
        &self,
        segment: &[f32],
        input: &mut [f32],
        output: &mut [Complex<f32>],
    ) -> Result<Vec<f32>, DecodeError> {
        for ((dst, &s), &w) in input.iter_mut().zip(segment).zip(&self.window) {
            *dst = s * w;
        }
        self.fft
            .process(input, output)
            .map_err(|e| DecodeError::Fft(e.to_string()))?;
        Ok(output.iter().map(|c| c.norm() * self.scale).collect())
    }

    /// Magnitude spectrum of exactly one window of samples.
    pub fn analyze(&self, segment: &[f32]) -> Result<Vec<f32>, DecodeError> {
        if segment.len() != self.window_size {
            return Err(DecodeError::Fft(format!(
                "expected {} samples, got {}",
                self.window_size,
                segment.len()
            )));
        }
        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();
        self.transform(segment, &mut input, &mut output)
    }

    /// Lazily iterate the frames of `samples`.
    pub fn frames<'a>(&'a self, samples: &'a [f32]) -> Frames<'a> {
        Frames {
            analyzer: self,
            samples,
            index: 0,
            input: self.fft.make_input_vec(),
            output: self.fft.make_output_vec(),
        }
    }
}

pub struct Frames<'a> {
    analyzer: &'a SpectralAnalyzer,
    samples: &'a [f32],
    index: usize,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
}

impl Iterator for Frames<'_> {
    type Item = Result<SpectralFrame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.index * self.analyzer.hop;
        let end = start + self.analyzer.window_size;
        if end > self.samples.len() {
            return None;
        }
        let index = self.index;
        self.index += 1;
        Some(
            self.analyzer
                .transform(&self.samples[start..end], &mut self.input, &mut self.output)
                .map(|magnitudes| SpectralFrame {
                    index,
                    start,
                    magnitudes,
                }),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .analyzer
            .frame_count(self.samples.len())
            .saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

/// Push-based analysis over audio that arrives in chunks. Frame indices and
/// start offsets count from the first sample ever pushed.
#[derive(Debug, Clone)]
pub struct SpectralStream {
    analyzer: SpectralAnalyzer,
    pending: Vec<f32>,
    /// Absolute sample index of `pending[0]`.
    offset: usize,
    next_index: usize,
}

impl SpectralStream {
    pub fn new(analyzer: SpectralAnalyzer) -> Self {
        Self {
            analyzer,
            pending: Vec::new(),
            offset: 0,
            next_index: 0,
        }
    }

    /// Append `chunk` and return every frame that became complete.
    pub fn push(&mut self, chunk: &[f32]) -> Result<Vec<SpectralFrame>, DecodeError> {
        self.pending.extend_from_slice(chunk);
        let mut input = self.analyzer.fft.make_input_vec();
        let mut output = self.analyzer.fft.make_output_vec();
        let mut frames = Vec::new();

        loop {
            let start = self.next_index * self.analyzer.hop;
            let local = start - self.offset;
            if local + self.analyzer.window_size > self.pending.len() {
                break;
            }
            let magnitudes = self.analyzer.transform(
                &self.pending[local..local + self.analyzer.window_size],
                &mut input,
                &mut output,
            )?;
            frames.push(SpectralFrame {
                index: self.next_index,
                start,
                magnitudes,
            });
            self.next_index += 1;
        }

        // Drop samples no future window can reach.
        let next_start = self.next_index * self.analyzer.hop;
        let consumed = (next_start - self.offset).min(self.pending.len());
        self.pending.drain(..consumed);
        self.offset += consumed;
        Ok(frames)
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(frequency: f32, amplitude: f32, len: usize, sample_rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_hop_and_frame_count() {
        let analyzer = SpectralAnalyzer::new(1024, 0.5, WindowFunction::Hann, 44_100);
        assert_eq!(analyzer.hop(), 512);
        assert_eq!(analyzer.frame_count(1023), 0);
        assert_eq!(analyzer.frame_count(1024), 1);
        assert_eq!(analyzer.frame_count(2048), 3);
        let zero_overlap = SpectralAnalyzer::new(256, 0.0, WindowFunction::Rectangular, 8000);
        assert_eq!(zero_overlap.hop(), 256);
    }

    #[test]
    fn test_sine_magnitude_is_amplitude() {
        let sample_rate = 44_100;
        let analyzer = SpectralAnalyzer::new(1024, 0.5, WindowFunction::Hann, sample_rate);
        // Exactly on bin 464.
        let frequency = analyzer.frequency_of(464.0);
        let samples = sine(frequency, 0.3, 1024, sample_rate);
        let spectrum = analyzer.analyze(&samples).unwrap();
        assert_eq!(spectrum.len(), 513);
        assert!((spectrum[464] - 0.3).abs() < 0.01, "got {}", spectrum[464]);
        assert!(spectrum[400] < 0.001);
    }

    #[test]
    fn test_band_power_matches_sine_rms() {
        let sample_rate = 48_000;
        let analyzer = SpectralAnalyzer::new(2048, 0.5, WindowFunction::Hann, sample_rate);
        let samples = sine(19_000.0, 0.2, 2048, sample_rate);
        let spectrum = analyzer.analyze(&samples).unwrap();
        let low = analyzer.bin_of(18_500.0);
        let high = analyzer.bin_of(19_500.0);
        let rms = analyzer.band_power(&spectrum, low, high).sqrt();
        assert!((rms - 0.2 / 2f32.sqrt()).abs() < 0.01, "rms={}", rms);
    }

    #[test]
    fn test_frames_iterate_lazily() {
        let analyzer = SpectralAnalyzer::new(256, 0.5, WindowFunction::Blackman, 8000);
        let samples = sine(1000.0, 0.5, 2000, 8000);
        let mut frames = analyzer.frames(&samples);
        assert_eq!(frames.size_hint(), (14, Some(14)));
        let first = frames.next().unwrap().unwrap();
        assert_eq!(first.start, 0);
        assert_eq!(frames.count(), 13);
    }

    #[test]
    fn test_stream_matches_batch() {
        let analyzer = SpectralAnalyzer::new(128, 0.75, WindowFunction::Hamming, 8000);
        let samples = sine(1500.0, 0.4, 1000, 8000);
        let batch: Vec<SpectralFrame> = analyzer
            .frames(&samples)
            .collect::<Result<_, _>>()
            .unwrap();

        let mut stream = SpectralStream::new(analyzer.clone());
        let mut streamed = Vec::new();
        for chunk in samples.chunks(97) {
            streamed.extend(stream.push(chunk).unwrap());
        }
        assert_eq!(streamed.len(), batch.len());
        for (a, b) in streamed.iter().zip(&batch) {
            assert_eq!(a.start, b.start);
            assert_eq!(a.index, b.index);
            assert_eq!(a.magnitudes, b.magnitudes);
        }
    }

    #[test]
    fn test_wrong_segment_length() {
        let analyzer = SpectralAnalyzer::new(256, 0.5, WindowFunction::Hann, 8000);
        assert!(matches!(analyzer.analyze(&[0.0; 100]), Err(DecodeError::Fft(_))));
    }
}
