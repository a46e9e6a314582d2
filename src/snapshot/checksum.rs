//! CRC32 checksums of snapshot payloads
//!
//! Checksums are rendered as `crc32:XXXXXXXX` (lowercase hex, zero-padded).

use crc32fast::Hasher;

/// CRC32 (IEEE) of `data`
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn format_checksum(checksum: u32) -> String {
    format!("crc32:{:08x}", checksum)
}

/// Parse a `crc32:XXXXXXXX` string; `None` if malformed
pub fn parse_checksum(formatted: &str) -> Option<u32> {
    let stripped = formatted.strip_prefix("crc32:")?;
    u32::from_str_radix(stripped, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_changes() {
        assert_eq!(compute_checksum(b"cards"), compute_checksum(b"cards"));
        assert_ne!(compute_checksum(b"cards"), compute_checksum(b"cardz"));
    }

    #[test]
    fn test_format_checksum() {
        assert_eq!(format_checksum(0xDEADBEEF), "crc32:deadbeef");
        assert_eq!(format_checksum(0x00000001), "crc32:00000001");
    }

    #[test]
    fn test_parse_checksum() {
        assert_eq!(parse_checksum("crc32:deadbeef"), Some(0xDEADBEEF));
        assert_eq!(parse_checksum("crc32:DEADBEEF"), Some(0xDEADBEEF));
        assert_eq!(parse_checksum("crc32:"), None);
        assert_eq!(parse_checksum("md5:deadbeef"), None);
    }
}
