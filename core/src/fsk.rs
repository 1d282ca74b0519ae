//! M-ary FSK modulation and tone-decision demodulation.
//!
//! Every symbol carries `log2(tone_count)` bits, Gray-coded onto the tone index
//! so that confusing two neighbouring tones costs a single bit. A symbol is a
//! sine at `base_frequency + tone * frequency_separation` held for the bit
//! duration, shaped by fade-in/fade-out ramps and followed by a silent guard.

use std::f32::consts::PI;

use crate::control::{Control, Stage};
use crate::error::{DecodeError, EncodeError};
use crate::settings::{ms_to_samples, EnvelopeShape, ToneLayout};
use crate::sync::PREAMBLE_CHIPS;
use crate::ABS_FLOOR;

/// Fraction of a symbol, centred, that the demodulator analyses. The edges are
/// skipped so fades and small timing errors do not leak neighbouring symbols in.
pub const DEMOD_ANALYSIS_FRACTION: f32 = 0.8;

/// Per-symbol SNR estimates are clamped to this range (dB).
pub const MIN_SYMBOL_SNR_DB: f32 = -10.0;
pub const MAX_SYMBOL_SNR_DB: f32 = 60.0;

/// Relative early/late energy difference needed before the timing gate moves.
const TIMING_GATE_HYSTERESIS: f32 = 0.1;

/// Gray-code a symbol value onto a tone index.
pub fn gray_encode(value: u8) -> u8 {
    value ^ (value >> 1)
}

/// Inverse of [`gray_encode`].
pub fn gray_decode(tone: u8) -> u8 {
    let mut value = tone;
    let mut shift = tone >> 1;
    while shift != 0 {
        value ^= shift;
        shift >>= 1;
    }
    value
}

/// Group bits (MSB first) into symbol values of `bits_per_symbol` bits. The last
/// symbol is zero-padded.
pub fn bits_to_symbols(bits: &[u8], bits_per_symbol: usize) -> Vec<u8> {
    bits.chunks(bits_per_symbol)
        .map(|chunk| {
            let value = chunk.iter().fold(0u8, |acc, &bit| (acc << 1) | (bit & 1));
            value << (bits_per_symbol - chunk.len())
        })
        .collect()
}

/// Raw Goertzel power at an arbitrary (not necessarily bin-centred) frequency.
fn goertzel_power(samples: impl Iterator<Item = f32>, frequency: f32, sample_rate: u32) -> f32 {
    let omega = 2.0 * PI * frequency / sample_rate as f32;
    let coeff = 2.0 * omega.cos();
    let mut q1 = 0.0f32;
    let mut q2 = 0.0f32;
    for sample in samples {
        let q0 = coeff * q1 - q2 + sample;
        q2 = q1;
        q1 = q0;
    }
    (q1 * q1 + q2 * q2 - coeff * q1 * q2).max(0.0)
}

/// Amplitude of `frequency` in `samples` weighted by `window`. A sine of
/// amplitude A reads as A regardless of window shape.
pub fn tone_magnitude(samples: &[f32], window: &[f32], frequency: f32, sample_rate: u32) -> f32 {
    let gain: f32 = window.iter().take(samples.len()).sum();
    if gain <= 0.0 {
        return 0.0;
    }
    let power = goertzel_power(
        samples.iter().zip(window).map(|(s, w)| s * w),
        frequency,
        sample_rate,
    );
    2.0 * power.sqrt() / gain
}

/// Unwindowed Goertzel power, used where only relative energies matter.
pub fn tone_power(samples: &[f32], frequency: f32, sample_rate: u32) -> f32 {
    goertzel_power(samples.iter().copied(), frequency, sample_rate)
}

pub fn hann_window(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (len - 1) as f32).cos())
        .collect()
}

/// Gain ramp applied over a symbol: rises over `fade_in`, falls over `fade_out`.
fn envelope(len: usize, fade_in: usize, fade_out: usize, shape: EnvelopeShape) -> Vec<f32> {
    let ramp = |progress: f32| match shape {
        EnvelopeShape::Linear => progress,
        EnvelopeShape::RaisedCosine => (PI * progress / 2.0).sin().powi(2),
    };

    let mut window = vec![1.0; len];
    let fade_in = fade_in.min(len);
    let fade_out = fade_out.min(len - fade_in);
    for i in 0..fade_in {
        window[i] = ramp(i as f32 / fade_in as f32);
    }
    for i in 0..fade_out {
        window[len - 1 - i] = window[len - 1 - i].min(ramp(i as f32 / fade_out as f32));
    }
    window
}

/// Turns coded bits into a unit-amplitude carrier: preamble followed by one
/// tone per symbol.
#[derive(Debug, Clone)]
pub struct FskModulator {
    layout: ToneLayout,
    sample_rate: u32,
    bit_samples: usize,
    guard_samples: usize,
    envelope: Vec<f32>,
}

impl FskModulator {
    pub fn new(
        layout: ToneLayout,
        sample_rate: u32,
        fade_in_ms: f32,
        fade_out_ms: f32,
        shape: EnvelopeShape,
    ) -> Self {
        let bit_samples = layout.bit_samples(sample_rate);
        Self {
            layout,
            sample_rate,
            bit_samples,
            guard_samples: layout.guard_samples(sample_rate),
            envelope: envelope(
                bit_samples,
                ms_to_samples(fade_in_ms, sample_rate),
                ms_to_samples(fade_out_ms, sample_rate),
                shape,
            ),
        }
    }

    pub fn symbol_period(&self) -> usize {
        self.bit_samples + self.guard_samples
    }

    /// Number of symbols needed for `coded_bits` channel bits.
    pub fn symbol_count(&self, coded_bits: usize) -> usize {
        coded_bits.div_ceil(self.layout.bits_per_symbol())
    }

    /// Length of the complete carrier (preamble included) for `symbols` symbols.
    pub fn carrier_len(&self, symbols: usize) -> usize {
        (PREAMBLE_CHIPS.len() + symbols) * self.symbol_period()
    }

    fn tone(&self, frequencies: &[f32], out: &mut Vec<f32>) {
        let scale = 1.0 / frequencies.len() as f32;
        let omegas: Vec<f32> = frequencies
            .iter()
            .map(|f| 2.0 * PI * f / self.sample_rate as f32)
            .collect();
        out.extend(self.envelope.iter().enumerate().map(|(n, &gain)| {
            let sum: f32 = omegas.iter().map(|w| (w * n as f32).sin()).sum();
            sum * scale * gain
        }));
        out.resize(out.len() + self.guard_samples, 0.0);
    }

    /// The synchronization preamble: each `+` chip is a chord of the lowest and
    /// highest tones, each `-` chip is silence.
    pub fn preamble(&self) -> Vec<f32> {
        let chord = [self.layout.tone_frequency(0), self.layout.highest_frequency()];
        let mut out = Vec::with_capacity(PREAMBLE_CHIPS.len() * self.symbol_period());
        for &chip in PREAMBLE_CHIPS.iter() {
            if chip > 0 {
                self.tone(&chord, &mut out);
            } else {
                out.resize(out.len() + self.symbol_period(), 0.0);
            }
        }
        out
    }

    pub fn modulate_symbol(&self, value: u8) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.symbol_period());
        let tone = gray_encode(value) as usize % self.layout.tone_count;
        self.tone(&[self.layout.tone_frequency(tone)], &mut out);
        out
    }

    /// Modulate coded bits into a full carrier. Checks for cancellation before
    /// every symbol.
    pub fn modulate(&self, bits: &[u8], control: &Control) -> Result<Vec<f32>, EncodeError> {
        let symbols = bits_to_symbols(bits, self.layout.bits_per_symbol());
        let mut out = Vec::with_capacity(self.carrier_len(symbols.len()));
        out.extend(self.preamble());

        for (i, &value) in symbols.iter().enumerate() {
            if control.is_cancelled() {
                return Err(EncodeError::Cancelled);
            }
            let tone = gray_encode(value) as usize % self.layout.tone_count;
            self.tone(&[self.layout.tone_frequency(tone)], &mut out);
            control.report(Stage::Modulating, i + 1, symbols.len());
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolDecision {
    /// Decoded symbol value (after Gray decoding).
    pub value: u8,
    pub tone: usize,
    /// Winner magnitude over the strongest competitor or noise.
    pub dominance: f32,
    pub snr_db: f32,
    /// The winner did not clear the sensitivity margin; `value` is still the
    /// best guess.
    pub erased: bool,
    /// Sample index the symbol was read at.
    pub start: usize,
}

/// Per-symbol tone decisions.
#[derive(Debug, Clone)]
pub struct FskDemodulator {
    layout: ToneLayout,
    sample_rate: u32,
    bit_samples: usize,
    analysis_offset: usize,
    window: Vec<f32>,
    tones: Vec<f32>,
    probes: Vec<f32>,
    margin: f32,
}

impl FskDemodulator {
    /// `margin` is the dominance ratio below which a symbol is erased.
    pub fn new(layout: ToneLayout, sample_rate: u32, margin: f32) -> Self {
        let bit_samples = layout.bit_samples(sample_rate);
        let analysis_len = ((bit_samples as f32 * DEMOD_ANALYSIS_FRACTION).round() as usize)
            .clamp(1, bit_samples.max(1));
        let analysis_offset = (bit_samples - analysis_len.min(bit_samples)) / 2;

        let tones = layout.tone_frequencies();
        let nyquist = sample_rate as f32 / 2.0;
        let half = layout.frequency_separation / 2.0;
        let mut probes: Vec<f32> = tones.windows(2).map(|pair| (pair[0] + pair[1]) / 2.0).collect();
        probes.extend(
            [layout.base_frequency - half, layout.highest_frequency() + half]
                .into_iter()
                .filter(|&f| f > 0.0 && f < nyquist),
        );

        Self {
            layout,
            sample_rate,
            bit_samples,
            analysis_offset,
            window: hann_window(analysis_len),
            tones,
            probes,
            margin,
        }
    }

    pub fn bit_samples(&self) -> usize {
        self.bit_samples
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    fn analysis<'a>(&self, symbol: &'a [f32]) -> &'a [f32] {
        let start = self.analysis_offset.min(symbol.len());
        let end = (start + self.window.len()).min(symbol.len());
        &symbol[start..end]
    }

    /// Decide one symbol from `bit_samples` samples starting at the symbol edge.
    pub fn decide(&self, symbol: &[f32], start: usize) -> SymbolDecision {
        let region = self.analysis(symbol);
        let magnitudes: Vec<f32> = self
            .tones
            .iter()
            .map(|&f| tone_magnitude(region, &self.window, f, self.sample_rate))
            .collect();

        let (mut best, mut second) = (0usize, None::<usize>);
        for k in 1..magnitudes.len() {
            if magnitudes[k] > magnitudes[best] {
                second = Some(best);
                best = k;
            } else if second.map_or(true, |s| magnitudes[k] > magnitudes[s]) {
                second = Some(k);
            }
        }
        let best_magnitude = magnitudes[best];
        let second_magnitude = second.map_or(0.0, |s| magnitudes[s]);

        let noise = if self.probes.is_empty() {
            0.0
        } else {
            self.probes
                .iter()
                .map(|&f| tone_magnitude(region, &self.window, f, self.sample_rate))
                .sum::<f32>()
                / self.probes.len() as f32
        };

        let dominance = best_magnitude / second_magnitude.max(noise).max(ABS_FLOOR);
        let snr_db = (20.0 * (best_magnitude.max(ABS_FLOOR) / noise.max(ABS_FLOOR)).log10())
            .clamp(MIN_SYMBOL_SNR_DB, MAX_SYMBOL_SNR_DB);

        SymbolDecision {
            value: gray_decode(best as u8),
            tone: best,
            dominance,
            snr_db,
            erased: dominance < self.margin,
            start,
        }
    }

    /// Energy of `tone` with the analysis window placed at `start` (may be
    /// negative or run past the end, in which case it is zero).
    fn gate_energy(&self, samples: &[f32], start: isize, tone: usize) -> f32 {
        if start < 0 {
            return 0.0;
        }
        let start = start as usize;
        if start + self.bit_samples > samples.len() {
            return 0.0;
        }
        let region = self.analysis(&samples[start..start + self.bit_samples]);
        tone_magnitude(region, &self.window, self.tones[tone], self.sample_rate)
    }

    pub fn layout(&self) -> &ToneLayout {
        &self.layout
    }
}

/// Lazily demodulated symbols of one region. Symbols are read sequentially
/// since every symbol boundary depends on the timing correction accumulated so
/// far; already decided symbols are cached so callers can ask for more as the
/// frame length becomes known.
pub struct SymbolStream<'a> {
    demodulator: &'a FskDemodulator,
    samples: &'a [f32],
    control: &'a Control,
    next_start: usize,
    period: usize,
    drift: isize,
    decisions: Vec<SymbolDecision>,
}

impl<'a> SymbolStream<'a> {
    pub fn new(
        demodulator: &'a FskDemodulator,
        samples: &'a [f32],
        first_symbol: usize,
        control: &'a Control,
    ) -> Self {
        Self {
            demodulator,
            samples,
            control,
            next_start: first_symbol,
            period: demodulator.layout.symbol_period_samples(demodulator.sample_rate),
            drift: 0,
            decisions: Vec::new(),
        }
    }

    /// Demodulate until `count` symbols are available or the audio runs out.
    /// Returns how many symbols are available.
    pub fn ensure(&mut self, count: usize) -> Result<usize, DecodeError> {
        let bit_samples = self.demodulator.bit_samples;
        let gate = (bit_samples / 16).max(1) as isize;
        let step = (bit_samples / 64).max(1) as isize;
        let cap = (bit_samples / 4) as isize;

        while self.decisions.len() < count {
            if self.control.is_cancelled() {
                return Err(DecodeError::Cancelled);
            }
            let start = (self.next_start as isize + self.drift).max(0) as usize;
            if start + bit_samples > self.samples.len() {
                break;
            }

            let decision = self
                .demodulator
                .decide(&self.samples[start..start + bit_samples], start);

            if !decision.erased {
                // Early/late gate: nudge the symbol clock towards the side with
                // more energy of the winning tone.
                let early =
                    self.demodulator
                        .gate_energy(self.samples, start as isize - gate, decision.tone);
                let late =
                    self.demodulator
                        .gate_energy(self.samples, start as isize + gate, decision.tone);
                if late > early * (1.0 + TIMING_GATE_HYSTERESIS) {
                    self.drift = (self.drift + step).min(cap);
                } else if early > late * (1.0 + TIMING_GATE_HYSTERESIS) {
                    self.drift = (self.drift - step).max(-cap);
                }
            }

            self.decisions.push(decision);
            self.next_start += self.period;
            self.control
                .report(Stage::Demodulating, self.decisions.len(), count);
        }
        Ok(self.decisions.len())
    }

    pub fn decisions(&self) -> &[SymbolDecision] {
        &self.decisions
    }

    /// Channel bits and per-bit erasure flags of the first `symbols` symbols.
    pub fn bits(&self, symbols: usize) -> (Vec<u8>, Vec<bool>) {
        let bits_per_symbol = self.demodulator.layout.bits_per_symbol();
        let mut bits = Vec::with_capacity(symbols * bits_per_symbol);
        let mut erasures = Vec::with_capacity(symbols * bits_per_symbol);
        for decision in self.decisions.iter().take(symbols) {
            for i in (0..bits_per_symbol).rev() {
                bits.push((decision.value >> i) & 1);
                erasures.push(decision.erased);
            }
        }
        (bits, erasures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ToneLayout;

    const SAMPLE_RATE: u32 = 44_100;

    fn modulator(layout: ToneLayout) -> FskModulator {
        FskModulator::new(layout, SAMPLE_RATE, 5.0, 5.0, EnvelopeShape::RaisedCosine)
    }

    #[test]
    fn test_gray_code_round_trip() {
        assert_eq!(
            (0..8).map(gray_encode).collect::<Vec<_>>(),
            vec![0, 1, 3, 2, 6, 7, 5, 4]
        );
        for value in 0..16u8 {
            assert_eq!(gray_decode(gray_encode(value)), value);
        }
    }

    #[test]
    fn test_bits_to_symbols_pads_last() {
        assert_eq!(bits_to_symbols(&[1, 0, 1, 1, 0, 1, 1], 2), vec![2, 3, 1, 2]);
        assert_eq!(bits_to_symbols(&[1, 1, 1, 1], 3), vec![7, 4]);
    }

    #[test]
    fn test_fsk_symbol_has_edge_taper() {
        let modulator = modulator(ToneLayout::default());
        let samples = modulator.modulate_symbol(2);
        assert_eq!(samples.len(), 2205);
        assert!(samples[0].abs() < 1e-4);
        assert!(samples[samples.len() - 1].abs() < 0.05);
        assert!(samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs())) <= 1.0);
    }

    #[test]
    fn test_tone_magnitude_reads_amplitude() {
        let n = 1764;
        let window = hann_window(n);
        let samples: Vec<f32> = (0..n)
            .map(|i| 0.3 * (2.0 * PI * 20_000.0 * i as f32 / SAMPLE_RATE as f32).sin())
            .collect();
        let magnitude = tone_magnitude(&samples, &window, 20_000.0, SAMPLE_RATE);
        assert!((magnitude - 0.3).abs() < 0.01, "magnitude={}", magnitude);
        let off = tone_magnitude(&samples, &window, 20_500.0, SAMPLE_RATE);
        assert!(off < 0.001, "off={}", off);
    }

    #[test]
    fn test_fsk_roundtrip_every_symbol() {
        for tone_count in [2usize, 4, 8, 16] {
            let layout = ToneLayout {
                base_frequency: 17_000.0,
                frequency_separation: 250.0,
                tone_count,
                ..Default::default()
            };
            let modulator = modulator(layout);
            let demodulator = FskDemodulator::new(layout, SAMPLE_RATE, 1.5);
            for value in 0..tone_count as u8 {
                let samples = modulator.modulate_symbol(value);
                let decision = demodulator.decide(&samples[..demodulator.bit_samples()], 0);
                assert_eq!(decision.value, value, "tone_count={}", tone_count);
                assert!(!decision.erased);
                assert!(decision.snr_db > 30.0);
            }
        }
    }

    #[test]
    fn test_silence_is_erased() {
        let layout = ToneLayout::default();
        let demodulator = FskDemodulator::new(layout, SAMPLE_RATE, 1.5);
        let decision = demodulator.decide(&vec![0.0; 2205], 0);
        assert!(decision.erased);
        assert_eq!(decision.snr_db, 0.0);
    }

    #[test]
    fn test_preamble_chips() {
        let modulator = modulator(ToneLayout::default());
        let preamble = modulator.preamble();
        assert_eq!(preamble.len(), PREAMBLE_CHIPS.len() * 2205);
        // Fourth chip is silent, first is not.
        assert!(preamble[3 * 2205..4 * 2205].iter().all(|&s| s == 0.0));
        assert!(preamble[..2205].iter().any(|&s| s.abs() > 0.5));
    }

    #[test]
    fn test_symbol_stream_reads_carrier() {
        let layout = ToneLayout::default();
        let modulator = modulator(layout);
        let bits: Vec<u8> = vec![0, 0, 0, 1, 1, 1, 1, 0, 0, 1, 1, 0];
        let control = Control::default();
        let carrier = modulator.modulate(&bits, &control).unwrap();

        let demodulator = FskDemodulator::new(layout, SAMPLE_RATE, 1.5);
        let first = PREAMBLE_CHIPS.len() * modulator.symbol_period();
        let mut stream = SymbolStream::new(&demodulator, &carrier, first, &control);
        assert_eq!(stream.ensure(6).unwrap(), 6);
        // Asking for more than the audio holds stops at the end.
        assert_eq!(stream.ensure(10).unwrap(), 6);

        let (decoded, erasures) = stream.bits(6);
        assert_eq!(decoded, bits);
        assert!(erasures.iter().all(|&e| !e));
    }

    #[test]
    fn test_symbol_stream_honors_cancellation() {
        let layout = ToneLayout::default();
        let demodulator = FskDemodulator::new(layout, SAMPLE_RATE, 1.5);
        let token = crate::control::CancellationToken::new();
        token.cancel();
        let control = Control::new(Some(token), None);
        let samples = vec![0.0; 44_100];
        let mut stream = SymbolStream::new(&demodulator, &samples, 0, &control);
        assert!(matches!(stream.ensure(4), Err(DecodeError::Cancelled)));
    }
}
