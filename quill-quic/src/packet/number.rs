//! Packet number truncation and expansion (RFC 9000 Section 17.1,
//! Appendix A).
//!
//! The sender truncates against the largest acknowledged number in the same
//! space; the receiver expands by picking the candidate closest to
//! `largest_received + 1`.

use crate::types::PacketNumber;

/// Result of truncating a packet number for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNumEncoding {
    /// Low bits of the packet number, already masked to `length` bytes.
    pub truncated: u64,
    /// Encoded length in bytes (1..=4).
    pub length: usize,
}

/// Choose the shortest encoding that lets the receiver recover `pn` given
/// that everything up to `largest_acked` is already acknowledged.
pub fn encode_packet_number(
    pn: PacketNumber,
    largest_acked: Option<PacketNumber>,
) -> PacketNumEncoding {
    // Twice the distance must fit in the encoded window.
    let base = largest_acked.map(|l| l + 1).unwrap_or(0);
    let distance = pn.saturating_sub(base).max(1);
    let range = distance * 2;
    let length = if range < (1 << 8) {
        1
    } else if range < (1 << 16) {
        2
    } else if range < (1 << 24) {
        3
    } else {
        4
    };
    let mask = if length == 4 {
        0xffff_ffff
    } else {
        (1u64 << (length * 8)) - 1
    };
    PacketNumEncoding {
        truncated: pn & mask,
        length,
    }
}

/// Expand a truncated packet number (RFC 9000 Appendix A.3).
pub fn decode_packet_number(
    largest_received: Option<PacketNumber>,
    truncated: u64,
    length: usize,
) -> PacketNumber {
    let expected = largest_received.map(|l| l + 1).unwrap_or(0);
    let pn_nbits = length * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

/// Write the truncated number big-endian into `out`.
pub fn append_packet_number_bytes(encoding: PacketNumEncoding, out: &mut impl bytes::BufMut) {
    let be = encoding.truncated.to_be_bytes();
    out.put_slice(&be[8 - encoding.length..]);
}

/// Read `length` big-endian bytes as a truncated packet number.
pub fn read_packet_number_bytes(bytes: &[u8], length: usize) -> Option<u64> {
    if bytes.len() < length || !(1..=4).contains(&length) {
        return None;
    }
    let mut value = 0u64;
    for &b in &bytes[..length] {
        value = (value << 8) | b as u64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_small_gap() {
        let enc = encode_packet_number(42, Some(40));
        assert_eq!(enc.length, 1);
        assert_eq!(decode_packet_number(Some(41), enc.truncated, enc.length), 42);
    }

    #[test]
    fn test_roundtrip_across_byte_wrap() {
        // 1-byte wrap: largest received 255, next packet 256 arrives as 0x00.
        let enc = encode_packet_number(256, Some(254));
        assert_eq!(decode_packet_number(Some(255), enc.truncated, enc.length), 256);
    }

    #[test]
    fn test_rfc_appendix_example() {
        // RFC 9000 A.3: largest 0xa82f30ea, truncated 0x9b32 over 16 bits.
        assert_eq!(
            decode_packet_number(Some(0xa82f30ea), 0x9b32, 2),
            0xa82f9b32
        );
    }

    #[test]
    fn test_rfc_encode_example() {
        // RFC 9000 A.2: sending 0xac5c02 with largest acked 0xabe8b3
        // requires 16 bits.
        let enc = encode_packet_number(0xac5c02, Some(0xabe8b3));
        assert_eq!(enc.length, 2);
        assert_eq!(enc.truncated, 0x5c02);
    }

    #[test]
    fn test_roundtrip_exhaustive_window() {
        // Invariant: expand(truncate(pn), expected, len) == pn for the
        // encoder's own choice of length.
        let mut largest_acked = None;
        let mut largest_received = None;
        for pn in [0u64, 1, 2, 57, 255, 256, 65_535, 65_536, 1 << 30] {
            let enc = encode_packet_number(pn, largest_acked);
            assert_eq!(
                decode_packet_number(largest_received, enc.truncated, enc.length),
                pn,
                "pn {pn}"
            );
            largest_acked = Some(pn);
            largest_received = Some(pn);
        }
    }

    #[test]
    fn test_first_packet_in_space() {
        let enc = encode_packet_number(0, None);
        assert_eq!(enc.length, 1);
        assert_eq!(decode_packet_number(None, enc.truncated, enc.length), 0);
    }

    #[test]
    fn test_wire_byte_helpers() {
        let enc = PacketNumEncoding {
            truncated: 0x00c0ffee,
            length: 4,
        };
        let mut out = bytes::BytesMut::new();
        append_packet_number_bytes(enc, &mut out);
        assert_eq!(&out[..], &[0x00, 0xc0, 0xff, 0xee]);
        assert_eq!(read_packet_number_bytes(&out, 4), Some(0x00c0ffee));
        assert_eq!(read_packet_number_bytes(&out[..2], 4), None);
    }
}
