//! Opportunistic frame compression (LZ4 block format)

use crate::error::ProtocolError;

/// Payloads below this size are always sent raw
pub const COMPRESSION_MIN_SIZE: usize = 1024;

/// Compressed output is kept only below this fraction of the input size
pub const COMPRESSION_RATIO_THRESHOLD: f32 = 0.8;

/// Compress `data` if it is large enough and the result is worth keeping.
pub fn maybe_compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESSION_MIN_SIZE {
        return None;
    }
    let compressed = lz4_flex::block::compress(data);
    let ratio = compressed.len() as f32 / data.len() as f32;
    if ratio < COMPRESSION_RATIO_THRESHOLD {
        tracing::trace!(
            "Compressed frame: {} -> {} bytes ({:.1}%)",
            data.len(),
            compressed.len(),
            ratio * 100.0
        );
        Some(compressed)
    } else {
        None
    }
}

pub fn decompress(data: &[u8], original_size: usize) -> Result<Vec<u8>, ProtocolError> {
    lz4_flex::block::decompress(data, original_size)
        .map_err(|e| ProtocolError::Malformed(format!("decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payloads_stay_raw() {
        assert!(maybe_compress(&[0u8; 100]).is_none());
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        // xorshift noise does not compress
        let mut state = 0x2545_F491_u32;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        assert!(maybe_compress(&noise).is_none());
    }

    #[test]
    fn test_compress_round_trip() {
        let data: Vec<u8> = b"   ..::--==++**##%%@@".iter().cycle().take(8000).copied().collect();
        let compressed = maybe_compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        assert!(decompress(&[0xFF, 0xFF, 0xFF], 1000).is_err());
    }
}
