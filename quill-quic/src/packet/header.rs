//! Packet header codec (RFC 9000 Section 17, RFC 8999).
//!
//! Long form: `1 F T T R R P P` | version | DCIL DCID | SCIL SCID |
//! per-type tail. Short form: `0 F S R R K P P` | DCID | PN. The packet
//! number itself is written by the builder after truncation and read by
//! the receive path after header protection removal; this module parses
//! everything up to the protected packet number bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::packet::number::PacketNumEncoding;
use crate::types::{ConnectionId, PacketNumber, PacketNumberSpace, Token, VarIntCodec, MAX_CID_LENGTH};

/// QUIC v1 version number.
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

pub const HEADER_FORM_MASK: u8 = 0x80;
pub const FIXED_BIT_MASK: u8 = 0x40;
pub const LONG_TYPE_MASK: u8 = 0x30;
pub const LONG_TYPE_SHIFT: u8 = 4;
pub const LONG_RESERVED_MASK: u8 = 0x0c;
pub const SHORT_KEY_PHASE_MASK: u8 = 0x04;
pub const SHORT_RESERVED_MASK: u8 = 0x18;
pub const PACKET_NUM_LEN_MASK: u8 = 0x03;

/// Long header packet types (type bits 0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial = 0x0,
    ZeroRtt = 0x1,
    Handshake = 0x2,
    Retry = 0x3,
}

impl LongHeaderType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0x0 => LongHeaderType::Initial,
            0x1 => LongHeaderType::ZeroRtt,
            0x2 => LongHeaderType::Handshake,
            _ => LongHeaderType::Retry,
        }
    }
}

/// Write-form long header.
#[derive(Debug, Clone)]
pub struct LongHeader {
    pub packet_type: LongHeaderType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    /// Address validation token; Initial packets only.
    pub token: Option<Token>,
    pub packet_number: PacketNumber,
}

/// Write-form short (1-RTT) header.
#[derive(Debug, Clone)]
pub struct ShortHeader {
    pub dcid: ConnectionId,
    pub packet_number: PacketNumber,
    pub key_phase: bool,
}

/// Header of a packet under construction.
#[derive(Debug, Clone)]
pub enum PacketHeader {
    Long(LongHeader),
    Short(ShortHeader),
}

impl PacketHeader {
    pub fn packet_number(&self) -> PacketNumber {
        match self {
            PacketHeader::Long(h) => h.packet_number,
            PacketHeader::Short(h) => h.packet_number,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, PacketHeader::Long(_))
    }

    /// Which packet number space this header sends in.
    pub fn space(&self) -> PacketNumberSpace {
        match self {
            PacketHeader::Long(h) => match h.packet_type {
                LongHeaderType::Initial => PacketNumberSpace::Initial,
                LongHeaderType::Handshake => PacketNumberSpace::Handshake,
                LongHeaderType::ZeroRtt | LongHeaderType::Retry => PacketNumberSpace::AppData,
            },
            PacketHeader::Short(_) => PacketNumberSpace::AppData,
        }
    }
}

// ============================================================================
// Receive-Side Parsing
// ============================================================================

/// Long header fields parsed up to the packet number.
#[derive(Debug, Clone)]
pub struct ParsedLongHeader {
    pub packet_type: LongHeaderType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: Option<Token>,
    /// Length field: packet number bytes + payload + cipher overhead.
    pub payload_len: u64,
}

#[derive(Debug, Clone)]
pub struct ParsedShortHeader {
    pub dcid: ConnectionId,
}

#[derive(Debug, Clone)]
pub struct ParsedRetry {
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub original_dcid: ConnectionId,
    pub retry_token: Bytes,
}

#[derive(Debug, Clone)]
pub struct ParsedVersionNegotiation {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub supported_versions: Vec<u32>,
}

/// Result of parsing one packet's header. For `Long` and `Short` the input
/// cursor is left at the first (protected) packet number byte.
#[derive(Debug, Clone)]
pub enum ParsedHeader {
    VersionNegotiation(ParsedVersionNegotiation),
    Retry(ParsedRetry),
    Long(ParsedLongHeader),
    Short(ParsedShortHeader),
}

impl ParsedHeader {
    pub fn dcid(&self) -> &ConnectionId {
        match self {
            ParsedHeader::VersionNegotiation(h) => &h.dcid,
            ParsedHeader::Retry(h) => &h.dcid,
            ParsedHeader::Long(h) => &h.dcid,
            ParsedHeader::Short(h) => &h.dcid,
        }
    }
}

/// Parse one packet header from the front of `buf`.
///
/// `local_cid_len` supplies the out-of-band DCID length for short headers
/// (the receiving endpoint knows the length of ids it issues).
pub fn parse_header(buf: &mut Bytes, local_cid_len: usize) -> Result<ParsedHeader, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::BufferTooShort);
    }
    let first = buf.chunk()[0];
    if first & HEADER_FORM_MASK != 0 {
        parse_long(buf)
    } else {
        parse_short(buf, local_cid_len)
    }
}

fn get_cid(buf: &mut Bytes, len: usize) -> Result<ConnectionId, CodecError> {
    if len > MAX_CID_LENGTH {
        return Err(CodecError::InvalidCidLength(len));
    }
    if buf.remaining() < len {
        return Err(CodecError::BufferTooShort);
    }
    let bytes = buf.split_to(len);
    ConnectionId::new(bytes).ok_or(CodecError::InvalidCidLength(len))
}

fn parse_long(buf: &mut Bytes) -> Result<ParsedHeader, CodecError> {
    if buf.remaining() < 5 {
        return Err(CodecError::BufferTooShort);
    }
    let first = buf.get_u8();
    let version = buf.get_u32();

    if buf.remaining() < 1 {
        return Err(CodecError::BufferTooShort);
    }
    let dcid_len = buf.get_u8() as usize;
    let dcid = get_cid(buf, dcid_len)?;
    if buf.remaining() < 1 {
        return Err(CodecError::BufferTooShort);
    }
    let scid_len = buf.get_u8() as usize;
    let scid = get_cid(buf, scid_len)?;

    if version == 0 {
        // Version Negotiation: the rest is a list of 32-bit versions.
        let mut supported_versions = Vec::new();
        while buf.remaining() >= 4 {
            supported_versions.push(buf.get_u32());
        }
        if supported_versions.is_empty() || buf.has_remaining() {
            return Err(CodecError::InvalidFrameField("version_negotiation"));
        }
        return Ok(ParsedHeader::VersionNegotiation(ParsedVersionNegotiation {
            dcid,
            scid,
            supported_versions,
        }));
    }

    let packet_type = LongHeaderType::from_bits((first & LONG_TYPE_MASK) >> LONG_TYPE_SHIFT);
    match packet_type {
        LongHeaderType::Retry => {
            if buf.remaining() < 1 {
                return Err(CodecError::BufferTooShort);
            }
            let odcid_len = buf.get_u8() as usize;
            let original_dcid = get_cid(buf, odcid_len)?;
            let retry_token = buf.split_to(buf.remaining());
            if retry_token.is_empty() {
                return Err(CodecError::InvalidFrameField("retry"));
            }
            Ok(ParsedHeader::Retry(ParsedRetry {
                version,
                dcid,
                scid,
                original_dcid,
                retry_token,
            }))
        }
        LongHeaderType::Initial => {
            let token_len = VarIntCodec::decode(buf)? as usize;
            if buf.remaining() < token_len {
                return Err(CodecError::BufferTooShort);
            }
            let token_bytes = buf.split_to(token_len);
            let payload_len = VarIntCodec::decode(buf)?;
            Ok(ParsedHeader::Long(ParsedLongHeader {
                packet_type,
                version,
                dcid,
                scid,
                token: if token_bytes.is_empty() {
                    None
                } else {
                    Some(Token::new(token_bytes))
                },
                payload_len,
            }))
        }
        LongHeaderType::ZeroRtt | LongHeaderType::Handshake => {
            let payload_len = VarIntCodec::decode(buf)?;
            Ok(ParsedHeader::Long(ParsedLongHeader {
                packet_type,
                version,
                dcid,
                scid,
                token: None,
                payload_len,
            }))
        }
    }
}

fn parse_short(buf: &mut Bytes, local_cid_len: usize) -> Result<ParsedHeader, CodecError> {
    if buf.remaining() < 1 + local_cid_len {
        return Err(CodecError::BufferTooShort);
    }
    let _first = buf.get_u8();
    let dcid = get_cid(buf, local_cid_len)?;
    Ok(ParsedHeader::Short(ParsedShortHeader { dcid }))
}

// ============================================================================
// Send-Side Encoding
// ============================================================================

/// Encode the header bytes that precede the deferred fields.
///
/// Short headers come back complete except for the packet number bytes;
/// long headers stop before the Length field (the builder writes Length
/// and packet number at finish time). The first byte already carries the
/// packet number length with reserved bits zero.
pub fn encode_header_prefix(header: &PacketHeader, pn: PacketNumEncoding) -> BytesMut {
    let mut out = BytesMut::with_capacity(64);
    match header {
        PacketHeader::Long(h) => {
            let mut first = HEADER_FORM_MASK | FIXED_BIT_MASK;
            first |= (h.packet_type as u8) << LONG_TYPE_SHIFT;
            first |= (pn.length as u8 - 1) & PACKET_NUM_LEN_MASK;
            first &= !LONG_RESERVED_MASK;
            out.put_u8(first);
            out.put_u32(h.version);
            out.put_u8(h.dcid.len() as u8);
            out.put_slice(h.dcid.as_bytes());
            out.put_u8(h.scid.len() as u8);
            out.put_slice(h.scid.as_bytes());
            if h.packet_type == LongHeaderType::Initial {
                let token = h.token.as_ref();
                let token_len = token.map(|t| t.len()).unwrap_or(0);
                VarIntCodec::encode(token_len as u64, &mut out).expect("token length fits varint");
                if let Some(token) = token {
                    out.put_slice(token.as_bytes());
                }
            }
        }
        PacketHeader::Short(h) => {
            let mut first = FIXED_BIT_MASK;
            if h.key_phase {
                first |= SHORT_KEY_PHASE_MASK;
            }
            first |= (pn.length as u8 - 1) & PACKET_NUM_LEN_MASK;
            first &= !SHORT_RESERVED_MASK;
            out.put_u8(first);
            out.put_slice(h.dcid.as_bytes());
        }
    }
    out
}

/// Build a complete Version Negotiation packet: high bit set, version
/// zero, the echoed connection ids, then the supported version list.
pub fn build_version_negotiation_packet(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    supported_versions: &[u32],
) -> Bytes {
    debug_assert!(!supported_versions.is_empty());
    let mut first = [0u8; 1];
    let _ = getrandom::getrandom(&mut first);
    let mut out = BytesMut::with_capacity(16 + dcid.len() + scid.len() + supported_versions.len() * 4);
    out.put_u8(first[0] | HEADER_FORM_MASK);
    out.put_u32(0);
    out.put_u8(dcid.len() as u8);
    out.put_slice(dcid.as_bytes());
    out.put_u8(scid.len() as u8);
    out.put_slice(scid.as_bytes());
    for &version in supported_versions {
        out.put_u32(version);
    }
    out.freeze()
}

/// Build a stateless reset: a short-header-shaped datagram of random
/// bytes ending in the 16-byte token. Sent by an endpoint that has no
/// state for the DCID of an arriving short-header packet of at least
/// [`crate::types::MIN_STATELESS_RESET_SIZE`] bytes.
pub fn build_stateless_reset_packet(token: &crate::types::StatelessResetToken) -> Bytes {
    let mut filler = [0u8; 24];
    let _ = getrandom::getrandom(&mut filler);
    let mut out = BytesMut::with_capacity(filler.len() + token.len() + 1);
    out.put_u8(FIXED_BIT_MASK | (filler[0] & !HEADER_FORM_MASK & !FIXED_BIT_MASK));
    out.put_slice(&filler[1..]);
    out.put_slice(token);
    out.freeze()
}

/// Build a complete Retry packet. No packet number; the token must be
/// non-empty.
pub fn build_retry_packet(
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    original_dcid: &ConnectionId,
    retry_token: &[u8],
) -> Bytes {
    debug_assert!(!retry_token.is_empty());
    let mut out = BytesMut::with_capacity(32 + retry_token.len());
    let first = HEADER_FORM_MASK
        | FIXED_BIT_MASK
        | ((LongHeaderType::Retry as u8) << LONG_TYPE_SHIFT);
    out.put_u8(first);
    out.put_u32(version);
    out.put_u8(dcid.len() as u8);
    out.put_slice(dcid.as_bytes());
    out.put_u8(scid.len() as u8);
    out.put_slice(scid.as_bytes());
    out.put_u8(original_dcid.len() as u8);
    out.put_slice(original_dcid.as_bytes());
    out.put_slice(retry_token);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::number::encode_packet_number;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_long_header_prefix_parse_roundtrip() {
        let header = PacketHeader::Long(LongHeader {
            packet_type: LongHeaderType::Initial,
            version: QUIC_VERSION_1,
            dcid: cid(&[1, 2, 3, 4, 5, 6, 7, 8]),
            scid: cid(&[9, 10, 11, 12]),
            token: Some(Token::from_slice(b"tok")),
            packet_number: 7,
        });
        let pn = encode_packet_number(7, None);
        let mut prefix = encode_header_prefix(&header, pn);
        // Append a Length field so the parser has one to read.
        VarIntCodec::encode(100, &mut prefix).unwrap();
        let mut wire = prefix.freeze();
        let parsed = parse_header(&mut wire, 8).unwrap();
        match parsed {
            ParsedHeader::Long(h) => {
                assert_eq!(h.packet_type, LongHeaderType::Initial);
                assert_eq!(h.version, QUIC_VERSION_1);
                assert_eq!(h.dcid, cid(&[1, 2, 3, 4, 5, 6, 7, 8]));
                assert_eq!(h.scid, cid(&[9, 10, 11, 12]));
                assert_eq!(h.token, Some(Token::from_slice(b"tok")));
                assert_eq!(h.payload_len, 100);
            }
            other => panic!("expected long header, got {other:?}"),
        }
    }

    #[test]
    fn test_short_header_parse_needs_cid_length() {
        let header = PacketHeader::Short(ShortHeader {
            dcid: cid(&[7; 8]),
            packet_number: 3,
            key_phase: true,
        });
        let pn = encode_packet_number(3, Some(1));
        let prefix = encode_header_prefix(&header, pn);
        let first_byte = prefix[0];
        assert_eq!(first_byte & HEADER_FORM_MASK, 0);
        assert_ne!(first_byte & SHORT_KEY_PHASE_MASK, 0);
        assert_eq!(first_byte & SHORT_RESERVED_MASK, 0);

        let mut wire = prefix.freeze();
        match parse_header(&mut wire, 8).unwrap() {
            ParsedHeader::Short(h) => assert_eq!(h.dcid, cid(&[7; 8])),
            other => panic!("expected short header, got {other:?}"),
        }
        // Cursor sits at the packet number (nothing appended here).
        assert!(wire.is_empty());
    }

    #[test]
    fn test_long_reserved_bits_zero() {
        let header = PacketHeader::Long(LongHeader {
            packet_type: LongHeaderType::Handshake,
            version: QUIC_VERSION_1,
            dcid: cid(&[1; 4]),
            scid: cid(&[2; 4]),
            token: None,
            packet_number: 0,
        });
        let prefix = encode_header_prefix(&header, encode_packet_number(0, None));
        assert_eq!(prefix[0] & LONG_RESERVED_MASK, 0);
    }

    #[test]
    fn test_version_negotiation_roundtrip() {
        let wire = build_version_negotiation_packet(
            &cid(&[1, 2]),
            &cid(&[3, 4]),
            &[QUIC_VERSION_1, 0xff00_001d],
        );
        assert_ne!(wire[0] & HEADER_FORM_MASK, 0);
        let mut buf = wire;
        match parse_header(&mut buf, 0).unwrap() {
            ParsedHeader::VersionNegotiation(vn) => {
                assert_eq!(vn.dcid, cid(&[1, 2]));
                assert_eq!(vn.scid, cid(&[3, 4]));
                assert_eq!(vn.supported_versions, vec![QUIC_VERSION_1, 0xff00_001d]);
            }
            other => panic!("expected version negotiation, got {other:?}"),
        }
    }

    #[test]
    fn test_version_negotiation_requires_versions() {
        // Hand-build a VN packet with no version entries.
        let mut out = BytesMut::new();
        out.put_u8(0x80);
        out.put_u32(0);
        out.put_u8(1);
        out.put_u8(0xaa);
        out.put_u8(1);
        out.put_u8(0xbb);
        let mut wire = out.freeze();
        assert!(parse_header(&mut wire, 0).is_err());
    }

    #[test]
    fn test_retry_roundtrip() {
        let wire = build_retry_packet(
            QUIC_VERSION_1,
            &cid(&[1; 8]),
            &cid(&[2; 8]),
            &cid(&[3; 8]),
            b"retry-token",
        );
        let mut buf = wire;
        match parse_header(&mut buf, 0).unwrap() {
            ParsedHeader::Retry(r) => {
                assert_eq!(r.version, QUIC_VERSION_1);
                assert_eq!(r.original_dcid, cid(&[3; 8]));
                assert_eq!(&r.retry_token[..], b"retry-token");
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_stateless_reset_shape() {
        let token = [0x5a; 16];
        let wire = build_stateless_reset_packet(&token);
        assert!(wire.len() >= crate::types::MIN_STATELESS_RESET_SIZE);
        // Short-header form with the fixed bit set.
        assert_eq!(wire[0] & HEADER_FORM_MASK, 0);
        assert_ne!(wire[0] & FIXED_BIT_MASK, 0);
        assert_eq!(&wire[wire.len() - 16..], &token);
    }

    #[test]
    fn test_oversized_cid_rejected() {
        let mut out = BytesMut::new();
        out.put_u8(0xc0); // long header, initial
        out.put_u32(QUIC_VERSION_1);
        out.put_u8(21); // dcid too long
        out.put_slice(&[0u8; 21]);
        out.put_u8(0);
        let mut wire = out.freeze();
        assert!(matches!(
            parse_header(&mut wire, 0),
            Err(CodecError::InvalidCidLength(21))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut wire = Bytes::from_static(&[0xc0, 0x00, 0x00]);
        assert!(matches!(
            parse_header(&mut wire, 0),
            Err(CodecError::BufferTooShort)
        ));
    }
}
