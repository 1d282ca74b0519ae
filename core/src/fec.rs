//! Bit-level forward error correction applied to the serialized frame.
//!
//! * `none`: pass-through.
//! * `basic`: repetition code over 16-bit groups. Each group is sent `factor`
//!   times back to back so a burst hits different copies of a bit, and the
//!   decoder takes a majority vote in which erased copies abstain.
//! * `advanced`: extended Hamming(8,4) SECDED. Eight codewords form a 64-bit
//!   super-block that is transmitted transposed, so consecutive channel bits
//!   belong to different codewords. One error per codeword is corrected; two are
//!   corrected only when both bits are erased and are otherwise reported as
//!   unrecoverable.

use crate::error::FecError;
use crate::settings::ErrorCorrectionLevel;

/// Data bits per repetition group.
pub const REPETITION_GROUP_BITS: usize = 16;

/// Codewords per interleaved super-block.
pub const HAMMING_BLOCK_CODEWORDS: usize = 8;
const HAMMING_DATA_BITS: usize = 4;
const HAMMING_CODE_BITS: usize = 8;
/// Data bits carried by one super-block.
pub const HAMMING_BLOCK_DATA_BITS: usize = HAMMING_BLOCK_CODEWORDS * HAMMING_DATA_BITS;
/// Channel bits of one super-block.
pub const HAMMING_BLOCK_CODE_BITS: usize = HAMMING_BLOCK_CODEWORDS * HAMMING_CODE_BITS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecDecoded {
    pub bits: Vec<u8>,
    /// Channel bits that had to be flipped.
    pub errors_corrected: usize,
    /// Code units (data bits for repetition, codewords for Hamming) that needed
    /// any correction.
    pub corrected_units: usize,
    pub units: usize,
}

impl FecDecoded {
    pub fn corrected_fraction(&self) -> f32 {
        if self.units == 0 {
            0.0
        } else {
            self.corrected_units as f32 / self.units as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCorrectionCodec {
    level: ErrorCorrectionLevel,
    factor: usize,
}

impl ErrorCorrectionCodec {
    /// `redundancy` is the repetition factor and only matters for basic.
    pub fn new(level: ErrorCorrectionLevel, redundancy: u8) -> Self {
        let factor = match level {
            ErrorCorrectionLevel::Basic => redundancy.max(1) as usize,
            _ => 1,
        };
        Self { level, factor }
    }

    pub fn level(&self) -> ErrorCorrectionLevel {
        self.level
    }

    pub fn redundancy(&self) -> u8 {
        match self.level {
            ErrorCorrectionLevel::Basic => self.factor as u8,
            _ => 0,
        }
    }

    /// Channel bits produced for `data_bits` input bits.
    pub fn encoded_len(&self, data_bits: usize) -> usize {
        match self.level {
            ErrorCorrectionLevel::None => data_bits,
            ErrorCorrectionLevel::Basic => data_bits * self.factor,
            ErrorCorrectionLevel::Advanced => {
                data_bits.div_ceil(HAMMING_BLOCK_DATA_BITS) * HAMMING_BLOCK_CODE_BITS
            }
        }
    }

    pub fn encode(&self, bits: &[u8]) -> Vec<u8> {
        match self.level {
            ErrorCorrectionLevel::None => bits.to_vec(),
            ErrorCorrectionLevel::Basic => {
                let mut out = Vec::with_capacity(bits.len() * self.factor);
                for group in bits.chunks(REPETITION_GROUP_BITS) {
                    for _ in 0..self.factor {
                        out.extend_from_slice(group);
                    }
                }
                out
            }
            ErrorCorrectionLevel::Advanced => {
                let mut out = Vec::with_capacity(self.encoded_len(bits.len()));
                for block in bits.chunks(HAMMING_BLOCK_DATA_BITS) {
                    let mut data = [0u8; HAMMING_BLOCK_DATA_BITS];
                    data[..block.len()].copy_from_slice(block);
                    let codewords: Vec<[u8; HAMMING_CODE_BITS]> = data
                        .chunks_exact(HAMMING_DATA_BITS)
                        .map(|d| hamming_encode([d[0], d[1], d[2], d[3]]))
                        .collect();
                    for position in 0..HAMMING_CODE_BITS {
                        for codeword in &codewords {
                            out.push(codeword[position]);
                        }
                    }
                }
                out
            }
        }
    }

    /// Recover `data_bits` bits from the channel bits. `erasures[i]` marks channel
    /// bit `i` as unreliable; a shorter slice means the rest are reliable.
    pub fn decode(
        &self,
        coded: &[u8],
        erasures: &[bool],
        data_bits: usize,
        tolerance: f32,
    ) -> Result<FecDecoded, FecError> {
        let needed = self.encoded_len(data_bits);
        if coded.len() < needed {
            return Err(FecError::Truncated {
                needed,
                available: coded.len(),
            });
        }
        let erased = |i: usize| erasures.get(i).copied().unwrap_or(false);

        let decoded = match self.level {
            ErrorCorrectionLevel::None => FecDecoded {
                bits: coded[..data_bits].to_vec(),
                errors_corrected: 0,
                corrected_units: 0,
                units: data_bits,
            },
            ErrorCorrectionLevel::Basic => self.decode_repetition(coded, &erased, data_bits),
            ErrorCorrectionLevel::Advanced => decode_hamming(coded, &erased, data_bits)?,
        };

        if decoded.corrected_fraction() > tolerance {
            return Err(FecError::ToleranceExceeded {
                corrected: decoded.corrected_units,
                units: decoded.units,
                tolerance,
            });
        }
        Ok(decoded)
    }

    fn decode_repetition(
        &self,
        coded: &[u8],
        erased: &dyn Fn(usize) -> bool,
        data_bits: usize,
    ) -> FecDecoded {
        let mut bits = Vec::with_capacity(data_bits);
        let mut errors_corrected = 0;
        let mut corrected_units = 0;
        let mut base = 0;

        let mut remaining = data_bits;
        while remaining > 0 {
            let group = remaining.min(REPETITION_GROUP_BITS);
            for i in 0..group {
                let positions = (0..self.factor).map(|copy| base + copy * group + i);
                let (mut ones, mut zeros, mut all_ones) = (0usize, 0usize, 0usize);
                for p in positions.clone() {
                    let bit = coded[p] & 1;
                    all_ones += bit as usize;
                    if !erased(p) {
                        if bit == 1 {
                            ones += 1;
                        } else {
                            zeros += 1;
                        }
                    }
                }
                let value = if ones != zeros {
                    (ones > zeros) as u8
                } else {
                    (all_ones * 2 > self.factor) as u8
                };
                let disagreeing = positions.filter(|&p| coded[p] & 1 != value).count();
                if disagreeing > 0 {
                    corrected_units += 1;
                    errors_corrected += disagreeing;
                }
                bits.push(value);
            }
            base += group * self.factor;
            remaining -= group;
        }

        FecDecoded {
            bits,
            errors_corrected,
            corrected_units,
            units: data_bits,
        }
    }
}

fn hamming_encode(d: [u8; HAMMING_DATA_BITS]) -> [u8; HAMMING_CODE_BITS] {
    let p1 = d[0] ^ d[1] ^ d[3];
    let p2 = d[0] ^ d[2] ^ d[3];
    let p3 = d[1] ^ d[2] ^ d[3];
    let mut word = [p1, p2, d[0], p3, d[1], d[2], d[3], 0];
    word[7] = word[..7].iter().fold(0, |acc, b| acc ^ b);
    word
}

/// Hamming syndrome (1-based error position within the first seven bits) and
/// overall parity.
fn hamming_syndrome(w: &[u8; HAMMING_CODE_BITS]) -> (usize, u8) {
    let s1 = w[0] ^ w[2] ^ w[4] ^ w[6];
    let s2 = w[1] ^ w[2] ^ w[5] ^ w[6];
    let s3 = w[3] ^ w[4] ^ w[5] ^ w[6];
    let parity = w.iter().fold(0, |acc, b| acc ^ b);
    ((s1 | (s2 << 1) | (s3 << 2)) as usize, parity)
}

/// Whether flipping `positions` turns `word` into a valid codeword.
fn lands_on_codeword(word: &[u8; HAMMING_CODE_BITS], positions: &[usize]) -> bool {
    let mut candidate = *word;
    for &position in positions {
        candidate[position] ^= 1;
    }
    hamming_syndrome(&candidate) == (0, 0)
}

/// Correct one codeword in place, returning the number of flipped bits, or
/// `None` for an uncorrectable or ambiguous pattern.
///
/// Odd parity means one (or three) flipped bits. The syndrome names the single
/// bit; every three-bit pattern is one bit away from another codeword, so when
/// the syndrome bit is trusted and three erased bits also lead to a codeword
/// the word is rejected instead of guessed. Even parity with a non-zero
/// syndrome means two flipped bits, which are repaired only when both are
/// erased.
fn hamming_correct(word: &mut [u8; HAMMING_CODE_BITS], erased: &[bool; HAMMING_CODE_BITS]) -> Option<usize> {
    let erased_positions: Vec<usize> = (0..HAMMING_CODE_BITS).filter(|&i| erased[i]).collect();

    match hamming_syndrome(word) {
        (0, 0) => Some(0),
        (syndrome, 1) => {
            let position = if syndrome == 0 { 7 } else { syndrome - 1 };
            if !erased[position] && erased_positions.len() >= 3 {
                let ambiguous = (0..erased_positions.len()).any(|a| {
                    (a + 1..erased_positions.len()).any(|b| {
                        (b + 1..erased_positions.len()).any(|c| {
                            lands_on_codeword(
                                word,
                                &[erased_positions[a], erased_positions[b], erased_positions[c]],
                            )
                        })
                    })
                });
                if ambiguous {
                    return None;
                }
            }
            word[position] ^= 1;
            Some(1)
        }
        _ => {
            let pair = (0..erased_positions.len()).find_map(|a| {
                (a + 1..erased_positions.len())
                    .map(|b| [erased_positions[a], erased_positions[b]])
                    .find(|pair| lands_on_codeword(word, pair))
            })?;
            for position in pair {
                word[position] ^= 1;
            }
            Some(2)
        }
    }
}

fn decode_hamming(
    coded: &[u8],
    erased: &dyn Fn(usize) -> bool,
    data_bits: usize,
) -> Result<FecDecoded, FecError> {
    let blocks = data_bits.div_ceil(HAMMING_BLOCK_DATA_BITS);
    let mut bits = Vec::with_capacity(blocks * HAMMING_BLOCK_DATA_BITS);
    let mut errors_corrected = 0;
    let mut corrected_units = 0;

    for block in 0..blocks {
        let base = block * HAMMING_BLOCK_CODE_BITS;
        for j in 0..HAMMING_BLOCK_CODEWORDS {
            let mut word = [0u8; HAMMING_CODE_BITS];
            let mut flags = [false; HAMMING_CODE_BITS];
            for position in 0..HAMMING_CODE_BITS {
                let index = base + position * HAMMING_BLOCK_CODEWORDS + j;
                word[position] = coded[index] & 1;
                flags[position] = erased(index);
            }
            let flipped = hamming_correct(&mut word, &flags).ok_or(FecError::Unrecoverable {
                block: block * HAMMING_BLOCK_CODEWORDS + j,
            })?;
            if flipped > 0 {
                corrected_units += 1;
                errors_corrected += flipped;
            }
            bits.extend_from_slice(&[word[2], word[4], word[5], word[6]]);
        }
    }
    bits.truncate(data_bits);

    Ok(FecDecoded {
        bits,
        errors_corrected,
        corrected_units,
        units: blocks * HAMMING_BLOCK_CODEWORDS,
    })
}
