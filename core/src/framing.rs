use serde::Serialize;

use crate::error::IntegrityError;
use crate::settings::ErrorCorrectionLevel;
use crate::{FRAME_HEADER_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, SHORT_FRAME_PAYLOAD_LIMIT};

/// CRC-16-CCITT for frames carrying more than [`SHORT_FRAME_PAYLOAD_LIMIT`] bytes
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u32 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u32) << 8;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x10000 != 0 {
                crc ^= 0x1021;
            }
        }
    }
    (crc & 0xFFFF) as u16
}

/// CRC-8, polynomial 0xD5 (x^8 + x^7 + x^6 + x^4 + x^2 + 1)
/// Detects all single-bit errors and burst errors up to 8 bits
pub fn crc8(data: &[u8]) -> u8 {
    const POLYNOMIAL: u8 = 0xD5;
    let mut crc = 0u8;

    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ POLYNOMIAL;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameFlags {
    pub encrypted: bool,
    pub compressed: bool,
}

/// The fixed 16-bit frame header:
///
/// ```text
/// byte 0: version:2 | ec:2 | redundancy:2 | encrypted:1 | compressed:1
/// byte 1: payload length in bytes
/// ```
///
/// `redundancy` stores `(factor - 1) / 2` for basic error correction and zero
/// for every other level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub ec_level: ErrorCorrectionLevel,
    /// Repetition factor, zero unless `ec_level` is basic.
    pub redundancy: u8,
    pub flags: FrameFlags,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_BYTES] {
        let redundancy = if self.ec_level == ErrorCorrectionLevel::Basic {
            (self.redundancy.saturating_sub(1) / 2) & 0b11
        } else {
            0
        };
        let byte0 = (PROTOCOL_VERSION << 6)
            | (self.ec_level.to_bits() << 4)
            | (redundancy << 2)
            | ((self.flags.encrypted as u8) << 1)
            | self.flags.compressed as u8;
        [byte0, self.payload_len as u8]
    }

    pub fn from_bytes(bytes: [u8; FRAME_HEADER_BYTES]) -> Result<Self, IntegrityError> {
        let version = bytes[0] >> 6;
        if version != PROTOCOL_VERSION {
            return Err(IntegrityError::FrameMalformed(format!(
                "unsupported frame version {version}"
            )));
        }
        let ec_level = ErrorCorrectionLevel::from_bits((bytes[0] >> 4) & 0b11).ok_or_else(|| {
            IntegrityError::FrameMalformed("unknown error correction level".to_string())
        })?;
        let code = (bytes[0] >> 2) & 0b11;
        let redundancy = match (ec_level, code) {
            (ErrorCorrectionLevel::Basic, 0) => {
                return Err(IntegrityError::FrameMalformed(
                    "basic error correction without redundancy".to_string(),
                ))
            }
            (ErrorCorrectionLevel::Basic, r) => 2 * r + 1,
            (_, 0) => 0,
            (_, _) => {
                return Err(IntegrityError::FrameMalformed(
                    "redundancy set for non-repetition code".to_string(),
                ))
            }
        };
        Ok(Self {
            ec_level,
            redundancy,
            flags: FrameFlags {
                encrypted: bytes[0] & 0b10 != 0,
                compressed: bytes[0] & 0b01 != 0,
            },
            payload_len: bytes[1] as usize,
        })
    }

    /// Width of the trailing integrity field.
    pub fn integrity_bytes(&self) -> usize {
        integrity_bytes_for(self.payload_len)
    }

    /// Total frame size (header, payload and integrity field).
    pub fn frame_bytes(&self) -> usize {
        FRAME_HEADER_BYTES + self.payload_len + self.integrity_bytes()
    }
}

pub fn integrity_bytes_for(payload_len: usize) -> usize {
    if payload_len <= SHORT_FRAME_PAYLOAD_LIMIT {
        1
    } else {
        2
    }
}

/// Total encoded frame size for a payload of `payload_len` bytes.
pub fn frame_bytes_for(payload_len: usize) -> usize {
    FRAME_HEADER_BYTES + payload_len + integrity_bytes_for(payload_len)
}

/// An immutable frame: header plus the bytes it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    /// Returns `None` when the payload does not fit the 8-bit length field.
    pub fn new(
        payload: Vec<u8>,
        flags: FrameFlags,
        ec_level: ErrorCorrectionLevel,
        redundancy: u8,
    ) -> Option<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return None;
        }
        let redundancy = if ec_level == ErrorCorrectionLevel::Basic {
            redundancy
        } else {
            0
        };
        Some(Self {
            header: FrameHeader {
                ec_level,
                redundancy,
                flags,
                payload_len: payload.len(),
            },
            payload,
        })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

pub struct FrameEncoder;
pub struct FrameDecoder;

impl FrameEncoder {
    /// Serialize header, payload and integrity field.
    pub fn encode(frame: &Frame) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(frame.header.frame_bytes());
        encoded.extend_from_slice(&frame.header.to_bytes());
        encoded.extend_from_slice(&frame.payload);

        if frame.header.integrity_bytes() == 1 {
            encoded.push(crc8(&encoded));
        } else {
            let crc = crc16(&encoded);
            encoded.extend_from_slice(&crc.to_be_bytes());
        }
        encoded
    }
}

impl FrameDecoder {
    pub fn decode_header(data: &[u8]) -> Result<FrameHeader, IntegrityError> {
        if data.len() < FRAME_HEADER_BYTES {
            return Err(IntegrityError::FrameMalformed(format!(
                "{} bytes is shorter than the frame header",
                data.len()
            )));
        }
        FrameHeader::from_bytes([data[0], data[1]])
    }

    /// Decode a complete frame. `data` must hold exactly the bytes the header
    /// declares.
    pub fn decode(data: &[u8]) -> Result<Frame, IntegrityError> {
        let header = Self::decode_header(data)?;
        let expected = header.frame_bytes();
        if data.len() != expected {
            return Err(IntegrityError::FrameMalformed(format!(
                "declared payload of {} bytes needs {expected} frame bytes, found {}",
                header.payload_len,
                data.len()
            )));
        }

        let body_end = FRAME_HEADER_BYTES + header.payload_len;
        let body = &data[..body_end];
        let valid = match header.integrity_bytes() {
            1 => crc8(body) == data[body_end],
            _ => crc16(body) == u16::from_be_bytes([data[body_end], data[body_end + 1]]),
        };
        if !valid {
            return Err(IntegrityError::IntegrityFailed(
                "frame checksum mismatch".to_string(),
            ));
        }

        Ok(Frame {
            header,
            payload: data[FRAME_HEADER_BYTES..body_end].to_vec(),
        })
    }
}

/// Expand bytes into one `0`/`1` entry per bit, MSB first.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |i| (byte >> i) & 1))
        .collect()
}

/// Pack bits (MSB first) into bytes. A trailing partial byte is zero-padded.
pub fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit & 1) << (7 - i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Frame {
        Frame::new(
            payload.to_vec(),
            FrameFlags::default(),
            ErrorCorrectionLevel::None,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_frame_encode_decode() {
        let encoded = FrameEncoder::encode(&frame(b"status:ok\n"));
        // 2 header bytes + 10 payload bytes + CRC-8
        assert_eq!(encoded.len(), 13);

        let decoded = FrameDecoder::decode(&encoded).unwrap();
        assert_eq!(decoded.payload(), b"status:ok\n");
        assert_eq!(decoded.header().payload_len, 10);
        assert_eq!(decoded.header().ec_level, ErrorCorrectionLevel::None);
    }

    #[test]
    fn test_long_frames_use_crc16() {
        let payload = vec![0xA5; 40];
        let encoded = FrameEncoder::encode(&frame(&payload));
        assert_eq!(encoded.len(), 2 + 40 + 2);
        assert_eq!(FrameDecoder::decode(&encoded).unwrap().payload(), &payload[..]);
    }

    #[test]
    fn test_header_fields_round_trip() {
        let frame = Frame::new(
            b"abc".to_vec(),
            FrameFlags {
                encrypted: true,
                compressed: false,
            },
            ErrorCorrectionLevel::Basic,
            5,
        )
        .unwrap();
        let encoded = FrameEncoder::encode(&frame);
        let header = FrameDecoder::decode_header(&encoded).unwrap();
        assert_eq!(header.ec_level, ErrorCorrectionLevel::Basic);
        assert_eq!(header.redundancy, 5);
        assert!(header.flags.encrypted);
        assert!(!header.flags.compressed);
    }

    #[test]
    fn test_frame_payload_crc_validation() {
        let mut encoded = FrameEncoder::encode(&frame(b"Hello"));
        encoded[FRAME_HEADER_BYTES] = b'G';

        match FrameDecoder::decode(&encoded) {
            Err(IntegrityError::IntegrityFailed(_)) => {}
            other => panic!("Expected IntegrityFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let encoded = FrameEncoder::encode(&frame(b"Hello World"));
        match FrameDecoder::decode(&encoded[..encoded.len() - 3]) {
            Err(IntegrityError::FrameMalformed(_)) => {}
            other => panic!("Expected FrameMalformed, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_version_is_malformed() {
        let mut encoded = FrameEncoder::encode(&frame(b"x"));
        encoded[0] &= 0b0011_1111;
        match FrameDecoder::decode_header(&encoded) {
            Err(IntegrityError::FrameMalformed(_)) => {}
            other => panic!("Expected FrameMalformed, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(Frame::new(
            vec![0; MAX_PAYLOAD_SIZE + 1],
            FrameFlags::default(),
            ErrorCorrectionLevel::None,
            0
        )
        .is_none());
    }

    #[test]
    fn test_bit_packing() {
        let bits = bytes_to_bits(&[0b1010_0001]);
        assert_eq!(bits, vec![1, 0, 1, 0, 0, 0, 0, 1]);
        assert_eq!(bits_to_bytes(&bits), vec![0b1010_0001]);
        assert_eq!(bits_to_bytes(&[1, 1]), vec![0b1100_0000]);
    }
}
