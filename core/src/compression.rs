//! Raw DEFLATE payload compression.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::MAX_PAYLOAD_SIZE;

/// Compress `data` at `level` (1-9). Returns `None` when the output is not
/// smaller than the input, in which case the payload is sent as-is.
pub fn compress(data: &[u8], level: u32) -> std::io::Result<Option<Vec<u8>>> {
    if level == 0 || data.is_empty() {
        return Ok(None);
    }
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Inflate a compressed payload. Output larger than any payload the encoder
/// accepts is treated as corrupt.
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let limit = (MAX_PAYLOAD_SIZE * 64) as u64;
    let mut out = Vec::new();
    DeflateDecoder::new(data).take(limit + 1).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed payload exceeds limit",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_payload_shrinks() {
        let data = b"status:ok status:ok status:ok status:ok status:ok\n";
        let compressed = compress(data, 9).unwrap().unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_incompressible_payload_is_kept() {
        assert!(compress(b"ok", 6).unwrap().is_none());
        assert!(compress(b"status:ok status:ok", 0).unwrap().is_none());
    }

    #[test]
    fn test_garbage_fails_to_inflate() {
        assert!(decompress(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
