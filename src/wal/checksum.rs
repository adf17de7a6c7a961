//! CRC32 checksums for log record bodies
//!
//! The checksum covers the record type byte and the body, but not the
//! position fields of the header: those are rewritten when a transaction
//! cache is copied into a log file at its final offset.

use crc32fast::Hasher;

/// Computes the checksum stored in a record trailer.
pub fn record_checksum(record_type: u8, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(body);
    hasher.finalize()
}

/// Returns true if `expected` matches the checksum of `record_type` and `body`.
pub fn verify_record_checksum(record_type: u8, body: &[u8], expected: u32) -> bool {
    record_checksum(record_type, body) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        let body = b"BEGIN";
        assert_eq!(record_checksum(2, body), record_checksum(2, body));
    }

    #[test]
    fn test_type_byte_is_covered() {
        let body = 42u64.to_le_bytes();
        assert_ne!(record_checksum(16, &body), record_checksum(2, &body));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut body = vec![0x00, 0x01, 0x02, 0x03, 0x04];
        let sum = record_checksum(30, &body);
        body[2] ^= 0x01;
        assert!(!verify_record_checksum(30, &body, sum));
    }

    #[test]
    fn test_empty_body() {
        let sum = record_checksum(3, &[]);
        assert!(verify_record_checksum(3, &[], sum));
    }
}
