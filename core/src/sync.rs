//! Preamble detection and timing recovery.
//!
//! The preamble is a Barker-7 sequence of chips, one symbol period each. A `+`
//! chip is a chord of the lowest and highest tones, which no data symbol can
//! produce; a `-` chip is silence. Detection runs in two passes:
//!
//! 1. Every spectral frame is reduced to a *chord score* in [0, 1]: how far both
//!    chord tones stand above the band's median noise floor. Correlating the
//!    chord score against the chip pattern at every frame-aligned start gives a
//!    preamble score in [-1, 1]; local maxima above `min_signal_strength` are
//!    candidates.
//! 2. Each candidate is refined to sample accuracy: parabolic interpolation on
//!    the frame scores, then a search on raw samples that maximizes the energy
//!    contrast between `+` and `-` chips.

use crate::control::{Control, Stage};
use crate::error::DecodeError;
use crate::fsk::tone_power;
use crate::settings::{DecodingSettings, ToneLayout};
use crate::spectrum::SpectralAnalyzer;
use crate::ABS_FLOOR;

/// Barker-7 chip pattern.
pub const PREAMBLE_CHIPS: [i8; 7] = [1, 1, 1, -1, -1, 1, -1];

/// Half-saturation point of the chord score: a chord whose weaker tone sits
/// this many times above the floor scores 0.5.
const CHORD_SCORE_KNEE: f32 = 4.0;

/// Bins on each side of a tone bin excluded from the noise-floor estimate.
const FLOOR_GUARD_BINS: usize = 2;

const REFINE_EPSILON: f32 = 1e-12;

/// Contrast values this close to the best count as tied during refinement.
const PLATEAU_TOLERANCE: f32 = 1e-6;

/// A located preamble.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreambleMatch {
    /// First sample of the preamble.
    pub start: usize,
    /// Frame-level preamble score in [-1, 1] that triggered detection.
    pub score: f32,
    /// Energy contrast between `+` and `-` chips at the refined start, in [0, 1].
    pub correlation: f32,
    /// Estimated frequency of the lowest tone.
    pub frequency: f32,
}

pub struct RegionDetector<'a> {
    layout: ToneLayout,
    settings: &'a DecodingSettings,
    analyzer: SpectralAnalyzer,
    sample_rate: u32,
    bit_samples: usize,
    period: usize,
}

impl<'a> RegionDetector<'a> {
    pub fn new(settings: &'a DecodingSettings, sample_rate: u32) -> Self {
        let layout = settings.layout;
        Self {
            layout,
            settings,
            analyzer: SpectralAnalyzer::from_settings(settings, sample_rate),
            sample_rate,
            bit_samples: layout.bit_samples(sample_rate),
            period: layout.symbol_period_samples(sample_rate),
        }
    }

    /// Samples spanned by the preamble.
    pub fn preamble_len(&self) -> usize {
        PREAMBLE_CHIPS.len() * self.period
    }

    /// Chord score of every frame in `samples`.
    pub fn chord_scores(&self, samples: &[f32], control: &Control) -> Result<Vec<f32>, DecodeError> {
        let chord = [
            self.analyzer.bin_of(self.layout.tone_frequency(0)),
            self.analyzer.bin_of(self.layout.highest_frequency()),
        ];
        let tone_bins: Vec<usize> = self
            .layout
            .tone_frequencies()
            .iter()
            .map(|&f| self.analyzer.bin_of(f))
            .collect();
        let (band_low, band_high) = match self.settings.frequency_range_hint {
            Some(range) => (self.analyzer.bin_of(range.low_hz), self.analyzer.bin_of(range.high_hz)),
            None => (
                self.analyzer
                    .bin_of(self.layout.base_frequency - 2.0 * self.layout.frequency_separation),
                self.analyzer
                    .bin_of(self.layout.highest_frequency() + 2.0 * self.layout.frequency_separation),
            ),
        };
        let floor_bins: Vec<usize> = (band_low..=band_high)
            .filter(|&bin| {
                tone_bins
                    .iter()
                    .all(|&tone| bin.abs_diff(tone) > FLOOR_GUARD_BINS)
            })
            .collect();

        let total = self.analyzer.frame_count(samples.len());
        let mut scores = Vec::with_capacity(total);
        let mut scratch = Vec::with_capacity(floor_bins.len());

        for frame in self.analyzer.frames(samples) {
            if control.is_cancelled() {
                return Err(DecodeError::Cancelled);
            }
            let frame = frame?;
            let peak = |bin: usize| {
                let low = bin.saturating_sub(1);
                let high = (bin + 1).min(frame.magnitudes.len() - 1);
                frame.magnitudes[low..=high]
                    .iter()
                    .fold(0.0f32, |acc, &m| acc.max(m))
            };

            scratch.clear();
            scratch.extend(floor_bins.iter().map(|&bin| frame.magnitudes[bin]));
            let floor = median(&mut scratch).max(ABS_FLOOR);

            let strength = peak(chord[0]).min(peak(chord[1])) / floor;
            scores.push(strength / (strength + CHORD_SCORE_KNEE));
            control.report(Stage::Analyzing, scores.len(), total);
        }
        Ok(scores)
    }

    /// Frame ranges (inclusive) whose windows lie inside each chip, relative to a
    /// frame-aligned preamble start.
    fn chip_frames(&self) -> Vec<(usize, usize)> {
        let hop = self.analyzer.hop();
        let window = self.analyzer.window_size();
        (0..PREAMBLE_CHIPS.len())
            .map(|k| {
                let chip_start = k * self.period;
                let first = chip_start.div_ceil(hop);
                let last_end = chip_start + self.bit_samples;
                if last_end >= window && (last_end - window) / hop >= first {
                    (first, (last_end - window) / hop)
                } else {
                    // Window longer than the usable chip: take the frame centred on it.
                    let centre = (chip_start + self.bit_samples / 2).saturating_sub(window / 2);
                    let frame = (centre as f32 / hop as f32).round() as usize;
                    (frame, frame)
                }
            })
            .collect()
    }

    /// Preamble score for every frame-aligned start.
    pub fn preamble_scores(&self, chord: &[f32]) -> Vec<f32> {
        let chips = self.chip_frames();
        let reach = chips.iter().map(|&(_, last)| last).max().unwrap_or(0);
        if chord.len() <= reach {
            return Vec::new();
        }
        let positive = PREAMBLE_CHIPS.iter().filter(|&&c| c > 0).count() as f32;
        let negative = PREAMBLE_CHIPS.len() as f32 - positive;

        (0..chord.len() - reach)
            .map(|f| {
                let mut plus = 0.0;
                let mut minus = 0.0;
                for (&sign, &(first, last)) in PREAMBLE_CHIPS.iter().zip(&chips) {
                    let frames = &chord[f + first..=f + last];
                    let mean = frames.iter().sum::<f32>() / frames.len() as f32;
                    if sign > 0 {
                        plus += mean;
                    } else {
                        minus += mean;
                    }
                }
                plus / positive - minus / negative
            })
            .collect()
    }

    /// Locate every preamble in `samples`, ordered by start time.
    pub fn detect(&self, samples: &[f32], control: &Control) -> Result<Vec<PreambleMatch>, DecodeError> {
        let chord = self.chord_scores(samples, control)?;
        let scores = self.preamble_scores(&chord);
        let threshold = self.settings.min_signal_strength;

        let mut peaks: Vec<usize> = (0..scores.len())
            .filter(|&f| {
                let s = scores[f];
                s >= threshold
                    && (f == 0 || s >= scores[f - 1])
                    && (f + 1 == scores.len() || s > scores[f + 1])
            })
            .collect();
        peaks.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        // Greedy suppression: a stronger peak owns its whole preamble span.
        let span = self.preamble_len().div_ceil(self.analyzer.hop());
        let mut accepted: Vec<usize> = Vec::new();
        for f in peaks {
            if accepted.iter().all(|&a| a.abs_diff(f) >= span) {
                accepted.push(f);
            }
        }
        accepted.sort_unstable();

        let mut matches = Vec::with_capacity(accepted.len());
        for (i, &f) in accepted.iter().enumerate() {
            if control.is_cancelled() {
                return Err(DecodeError::Cancelled);
            }
            let coarse = self.interpolate(&scores, f);
            let (start, correlation) = self.refine(samples, coarse);
            let frequency = self.estimate_frequency(samples, start)?;
            log::debug!(
                "preamble candidate at sample {start} (score {:.3}, correlation {correlation:.3}, {frequency:.1} Hz)",
                scores[f]
            );
            matches.push(PreambleMatch {
                start,
                score: scores[f],
                correlation,
                frequency,
            });
            control.report(Stage::Detecting, i + 1, accepted.len());
        }
        Ok(matches)
    }

    /// Sub-frame start estimate from a parabola through the neighbouring scores.
    fn interpolate(&self, scores: &[f32], f: usize) -> f32 {
        let hop = self.analyzer.hop() as f32;
        if f == 0 || f + 1 >= scores.len() {
            return f as f32 * hop;
        }
        let (a, b, c) = (scores[f - 1], scores[f], scores[f + 1]);
        let denom = a - 2.0 * b + c;
        let delta = if denom.abs() > f32::EPSILON {
            (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        (f as f32 + delta) * hop
    }

    /// Energy contrast between `+` and `-` chips for a preamble starting at
    /// `start`, or `None` when the preamble would leave the buffer.
    fn contrast(&self, samples: &[f32], start: isize) -> Option<f32> {
        if start < 0 {
            return None;
        }
        let start = start as usize;
        if start + self.preamble_len() > samples.len() {
            return None;
        }
        let low = self.layout.tone_frequency(0);
        let high = self.layout.highest_frequency();
        let (mut plus, mut minus) = (0.0f32, 0.0f32);
        for (k, &sign) in PREAMBLE_CHIPS.iter().enumerate() {
            let chip_start = start + k * self.period;
            let chip = &samples[chip_start..chip_start + self.bit_samples];
            let energy = tone_power(chip, low, self.sample_rate) + tone_power(chip, high, self.sample_rate);
            if sign > 0 {
                plus += energy;
            } else {
                minus += energy;
            }
        }
        Some((plus - minus) / (plus + minus + REFINE_EPSILON))
    }

    /// Sample-accurate start: coarse search around the interpolated estimate,
    /// then a finer pass around the coarse winner.
    fn refine(&self, samples: &[f32], coarse: f32) -> (usize, f32) {
        let hop = self.analyzer.hop() as isize;
        let centre = coarse.round() as isize;

        // The contrast is flat while the misalignment stays inside the symbol
        // fades, so ties resolve to the middle of the plateau.
        let search = |centre: isize, radius: isize, step: isize| {
            let scored: Vec<(isize, f32)> = (0..)
                .map(|i| centre - radius + i * step)
                .take_while(|&candidate| candidate <= centre + radius)
                .filter_map(|candidate| Some((candidate, self.contrast(samples, candidate)?)))
                .collect();
            let best = scored.iter().map(|&(_, r)| r).fold(f32::NEG_INFINITY, f32::max);
            let plateau: Vec<&(isize, f32)> = scored
                .iter()
                .filter(|&&(_, r)| r >= best - PLATEAU_TOLERANCE)
                .collect();
            plateau.get(plateau.len() / 2).map(|&&entry| entry)
        };

        let coarse_step = (hop / 8).max(1);
        let Some((first, _)) = search(centre, hop, coarse_step) else {
            return (centre.max(0) as usize, 0.0);
        };
        let fine_step = (coarse_step / 8).max(1);
        let (best, correlation) = search(first, coarse_step, fine_step).unwrap_or((first, 0.0));
        (best.max(0) as usize, correlation.clamp(0.0, 1.0))
    }

    /// Frequency of the lowest tone, from a parabolic fit over the chord chips.
    fn estimate_frequency(&self, samples: &[f32], start: usize) -> Result<f32, DecodeError> {
        let window = self.analyzer.window_size();
        let bin = self.analyzer.bin_of(self.layout.tone_frequency(0));
        let mut accumulated = vec![0.0f32; self.analyzer.bin_count()];
        let mut used = 0;

        for (k, &sign) in PREAMBLE_CHIPS.iter().enumerate() {
            if sign <= 0 {
                continue;
            }
            let offset = start + k * self.period + self.bit_samples.saturating_sub(window) / 2;
            if offset + window > samples.len() {
                continue;
            }
            let spectrum = self.analyzer.analyze(&samples[offset..offset + window])?;
            for (acc, m) in accumulated.iter_mut().zip(spectrum) {
                *acc += m;
            }
            used += 1;
        }
        let nominal = self.layout.tone_frequency(0);
        if used == 0 || bin == 0 || bin + 1 >= accumulated.len() {
            return Ok(nominal);
        }

        // Peak bin within one bin of the nominal tone.
        let peak = (bin - 1..=bin + 1)
            .max_by(|&a, &b| accumulated[a].total_cmp(&accumulated[b]))
            .unwrap_or(bin);
        if peak == 0 || peak + 1 >= accumulated.len() {
            return Ok(nominal);
        }
        let (a, b, c) = (accumulated[peak - 1], accumulated[peak], accumulated[peak + 1]);
        let denom = a - 2.0 * b + c;
        let delta = if denom.abs() > f32::EPSILON {
            (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        Ok(self.analyzer.frequency_of(peak as f32 + delta))
    }

    pub fn analyzer(&self) -> &SpectralAnalyzer {
        &self.analyzer
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, value, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    *value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsk::FskModulator;
    use crate::settings::EnvelopeShape;

    const SAMPLE_RATE: u32 = 44_100;

    fn carrier(layout: ToneLayout) -> Vec<f32> {
        let modulator = FskModulator::new(layout, SAMPLE_RATE, 5.0, 5.0, EnvelopeShape::RaisedCosine);
        let bits: Vec<u8> = (0..64).map(|i| ((i * 7) % 3 == 0) as u8).collect();
        modulator
            .modulate(&bits, &Control::default())
            .unwrap()
            .into_iter()
            .map(|s| s * 0.3)
            .collect()
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut []), 0.0);
    }

    #[test]
    fn test_detects_offset_preamble() {
        let settings = DecodingSettings::default();
        let detector = RegionDetector::new(&settings, SAMPLE_RATE);
        let offset = 12_345;
        let mut samples = vec![0.0f32; offset];
        samples.extend(carrier(settings.layout));
        samples.extend(vec![0.0; 20_000]);

        let matches = detector.detect(&samples, &Control::default()).unwrap();
        assert_eq!(matches.len(), 1);
        let found = matches[0];
        assert!(
            found.start.abs_diff(offset) <= 32,
            "start={} expected={}",
            found.start,
            offset
        );
        assert!(found.score > 0.6, "score={}", found.score);
        assert!(found.correlation > 0.95, "correlation={}", found.correlation);
        assert!((found.frequency - 19_000.0).abs() < 25.0, "frequency={}", found.frequency);
    }

    #[test]
    fn test_silence_has_no_preamble() {
        let settings = DecodingSettings::default();
        let detector = RegionDetector::new(&settings, SAMPLE_RATE);
        let samples = vec![0.0f32; 5 * SAMPLE_RATE as usize];
        assert!(detector.detect(&samples, &Control::default()).unwrap().is_empty());
    }

    #[test]
    fn test_data_tones_alone_do_not_trigger() {
        let settings = DecodingSettings::default();
        let detector = RegionDetector::new(&settings, SAMPLE_RATE);
        let layout = settings.layout;
        let modulator = FskModulator::new(layout, SAMPLE_RATE, 5.0, 5.0, EnvelopeShape::RaisedCosine);
        let samples: Vec<f32> = (0..40u8)
            .flat_map(|i| modulator.modulate_symbol(i % 4))
            .collect();
        assert!(detector.detect(&samples, &Control::default()).unwrap().is_empty());
    }

    #[test]
    fn test_two_preambles_are_separate_regions() {
        let settings = DecodingSettings::default();
        let detector = RegionDetector::new(&settings, SAMPLE_RATE);
        let mut samples = vec![0.0f32; 5_000];
        samples.extend(carrier(settings.layout));
        let second = samples.len() + 30_000;
        samples.extend(vec![0.0; 30_000]);
        samples.extend(carrier(settings.layout));
        samples.extend(vec![0.0; 5_000]);

        let matches = detector.detect(&samples, &Control::default()).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].start.abs_diff(5_000) <= 32);
        assert!(matches[1].start.abs_diff(second) <= 32);
    }
}
