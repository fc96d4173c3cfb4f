//! CRC32-C (Castagnoli) checksums
//!
//! The implementation is picked once at first use: the SSE4.2 `crc32`
//! instruction when the CPU has it, otherwise a portable table-driven
//! version. Both produce identical results.

use std::sync::OnceLock;

/// Reflected Castagnoli polynomial
const POLY: u32 = 0x82F6_3B78;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

type CrcFn = fn(&[u8]) -> u32;

static SELECTED: OnceLock<(CrcFn, bool)> = OnceLock::new();

fn select() -> (CrcFn, bool) {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("sse4.2") {
            tracing::debug!("Using SSE4.2 CRC32-C");
            return (crc32_hw, true);
        }
    }
    tracing::debug!("Using portable CRC32-C");
    (crc32_sw, false)
}

/// Checksum `data` with the fastest available implementation.
pub fn crc32(data: &[u8]) -> u32 {
    let (f, _) = SELECTED.get_or_init(select);
    f(data)
}

/// Whether the hardware path was selected.
pub fn hw_available() -> bool {
    SELECTED.get_or_init(select).1
}

/// Portable table-driven implementation.
pub fn crc32_sw(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc = TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

#[cfg(target_arch = "x86_64")]
fn crc32_hw(data: &[u8]) -> u32 {
    // SAFETY: only ever selected after runtime detection of SSE4.2.
    unsafe { crc32_sse42(data) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32_sse42(data: &[u8]) -> u32 {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    let mut crc = u64::from(!0u32);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        crc = _mm_crc32_u64(crc, u64::from_le_bytes(word));
    }

    let mut crc = crc as u32;
    for &byte in chunks.remainder() {
        crc = _mm_crc32_u8(crc, byte);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(crc32_sw(b""), 0);
        assert_eq!(crc32_sw(b"123456789"), 0xE306_9283);
        assert_eq!(crc32_sw(b"Hello, World!"), 0x4D55_1068);
    }

    #[test]
    fn test_selected_matches_portable() {
        let mut data = Vec::new();
        for len in [0usize, 1, 7, 8, 9, 15, 16, 17, 255, 1024, 4099] {
            data.clear();
            data.extend((0..len).map(|i| (i * 31 + 7) as u8));
            assert_eq!(crc32(&data), crc32_sw(&data), "length {}", len);
        }
    }

    #[test]
    fn test_selection_is_cached() {
        let first = hw_available();
        for _ in 0..4 {
            assert_eq!(hw_available(), first);
        }
    }

    #[test]
    fn test_single_byte_flip_changes_checksum() {
        let data: Vec<u8> = (0..64u8).collect();
        let reference = crc32(&data);
        for i in 0..data.len() {
            let mut corrupted = data.clone();
            corrupted[i] ^= 0x01;
            assert_ne!(crc32(&corrupted), reference);
        }
    }
}
