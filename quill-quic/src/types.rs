//! # Core transport types (RFC 8999, RFC 9000)
//!
//! Fundamental types shared by every layer of the datapath: the
//! variable-length integer codec, connection identifiers, stream
//! identifiers, packet numbers and the deterministic clock.

use bytes::{Buf, BufMut, Bytes};
use core::time::Duration;

use crate::error::CodecError;

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-Length Integer (RFC 9000 Section 16)
///
/// The first two bits of the first byte select the encoded length:
/// 00=1 byte, 01=2 bytes, 10=4 bytes, 11=8 bytes.
pub type VarInt = u64;

/// Maximum value representable as a VarInt (2^62 - 1).
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt encoding and decoding utilities.
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt, consuming 1, 2, 4 or 8 bytes from `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<VarInt, CodecError> {
        if !buf.has_remaining() {
            return Err(CodecError::BufferTooShort);
        }
        let prefix = buf.chunk()[0] >> 6;
        let len = 1usize << prefix;
        if buf.remaining() < len {
            return Err(CodecError::BufferTooShort);
        }
        let value = match len {
            1 => (buf.get_u8() & 0x3f) as u64,
            2 => (buf.get_u16() & 0x3fff) as u64,
            4 => (buf.get_u32() & 0x3fff_ffff) as u64,
            8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
            _ => unreachable!(),
        };
        Ok(value)
    }

    /// Encode `value` in the shortest form that fits, returning bytes written.
    ///
    /// Values at or above 2^62 are not representable.
    pub fn encode<B: BufMut>(value: VarInt, buf: &mut B) -> Result<usize, CodecError> {
        if value > VARINT_MAX {
            return Err(CodecError::VarIntTooLarge(value));
        }
        if value < 0x40 {
            buf.put_u8(value as u8);
            Ok(1)
        } else if value < 0x4000 {
            buf.put_u16(value as u16 | 0x4000);
            Ok(2)
        } else if value < 0x4000_0000 {
            buf.put_u32(value as u32 | 0x8000_0000);
            Ok(4)
        } else {
            buf.put_u64(value | 0xc000_0000_0000_0000);
            Ok(8)
        }
    }

    /// Encoded size of `value` in bytes.
    pub fn size(value: VarInt) -> usize {
        if value < 0x40 {
            1
        } else if value < 0x4000 {
            2
        } else if value < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a connection ID in bytes.
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID: an opaque byte sequence chosen by an endpoint.
///
/// Zero-length ids are permitted (only meaningful for the peer side).
/// Equality and hashing are byte-wise.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a ConnectionId, rejecting lengths above [`MAX_CID_LENGTH`].
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// A zero-length connection id.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({:02x?})", &self.bytes[..])
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Stateless reset token carried with an issued connection id.
pub type StatelessResetToken = [u8; 16];

// ============================================================================
// Address Validation Token (RFC 9000 Section 8.1)
// ============================================================================

/// Opaque token issued by servers for address validation; clients echo it
/// in subsequent Initial packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    bytes: Bytes,
}

impl Token {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(slice),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Packet Numbers and Spaces (RFC 9000 Section 12.3)
// ============================================================================

/// Packet number: monotonically increasing within one packet number space.
pub type PacketNumber = u64;

/// Largest legal packet number (2^62 - 1).
pub const MAX_PACKET_NUMBER: u64 = (1u64 << 62) - 1;

/// Independent packet number spaces, each with its own keys, ACK state and
/// loss bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketNumberSpace {
    Initial = 0,
    Handshake = 1,
    AppData = 2,
}

impl PacketNumberSpace {
    /// All spaces, in handshake order.
    pub const ALL: [PacketNumberSpace; 3] = [
        PacketNumberSpace::Initial,
        PacketNumberSpace::Handshake,
        PacketNumberSpace::AppData,
    ];
}

// ============================================================================
// Stream Identifiers (RFC 9000 Section 2.1)
// ============================================================================

/// Stream ID. The two low bits encode initiator and directionality:
/// bit 0: 0=client-initiated, 1=server-initiated;
/// bit 1: 0=bidirectional, 1=unidirectional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_bidirectional(self) -> bool {
        (self.0 & 0x02) == 0
    }

    pub fn is_unidirectional(self) -> bool {
        (self.0 & 0x02) != 0
    }

    pub fn is_client_initiated(self) -> bool {
        (self.0 & 0x01) == 0
    }

    pub fn is_server_initiated(self) -> bool {
        (self.0 & 0x01) == 1
    }

    pub fn initiator(self) -> Side {
        if self.is_client_initiated() {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Index of this stream within its (initiator, directionality) class.
    /// Used against MAX_STREAMS limits, which count streams, not ids.
    pub fn stream_index(self) -> u64 {
        self.0 >> 2
    }

    /// Compose a stream id from its class and per-class index.
    pub fn from_parts(initiator: Side, bidirectional: bool, index: u64) -> Self {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x01;
        }
        if !bidirectional {
            id |= 0x02;
        }
        Self(id)
    }
}

/// Byte offset within a stream.
pub type StreamOffset = u64;

// ============================================================================
// Endpoint Side
// ============================================================================

/// Which end of the connection this state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

// ============================================================================
// Deterministic Clock
// ============================================================================

/// Monotonic timestamp used for all datapath timing.
///
/// The embedding layer supplies a monotonic clock source; tests drive the
/// state machine with synthetic timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    pub const ZERO: Instant = Instant { nanos: 0 };

    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros.saturating_mul(1_000),
        }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Duration since `other`, or `None` if `other` is later.
    pub fn duration_since(&self, other: Instant) -> Option<Duration> {
        if self.nanos >= other.nanos {
            Some(Duration::from_nanos(self.nanos - other.nanos))
        } else {
            None
        }
    }

    /// Duration since `other`, clamping negative spans to zero.
    pub fn saturating_duration_since(&self, other: Instant) -> Duration {
        self.duration_since(other).unwrap_or(Duration::ZERO)
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        let nanos = duration.as_nanos();
        if nanos > u64::MAX as u128 {
            return None;
        }
        self.nanos
            .checked_add(nanos as u64)
            .map(|n| Instant { nanos: n })
    }

    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        let nanos = duration.as_nanos();
        if nanos > u64::MAX as u128 {
            return None;
        }
        self.nanos
            .checked_sub(nanos as u64)
            .map(|n| Instant { nanos: n })
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        self.checked_add(rhs)
            .unwrap_or(Instant { nanos: u64::MAX })
    }
}

// ============================================================================
// Wire Constants (RFC 9000 Section 14)
// ============================================================================

/// Default UDP payload budget for outgoing packets.
pub const DEFAULT_UDP_SEND_PACKET_LEN: usize = 1252;

/// Minimum size of a client Initial datagram.
pub const MIN_INITIAL_PACKET_SIZE: usize = 1200;

/// AEAD sample size needed for header protection.
pub const HEADER_PROTECTION_SAMPLE_SIZE: usize = 16;

/// Maximum bytes a truncated packet number occupies on the wire.
pub const MAX_PACKET_NUM_ENCODING_SIZE: usize = 4;

/// Minimum datagram size that may elicit a stateless reset.
pub const MIN_STATELESS_RESET_SIZE: usize = 22;

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_roundtrip_boundaries() {
        // One value on each side of every length boundary.
        let cases = [
            0u64,
            1,
            63,
            64,
            16_383,
            16_384,
            1_073_741_823,
            1_073_741_824,
            VARINT_MAX,
        ];
        for &value in &cases {
            let mut buf = BytesMut::new();
            let written = VarIntCodec::encode(value, &mut buf).unwrap();
            assert_eq!(written, VarIntCodec::size(value));
            let mut bytes = buf.freeze();
            assert_eq!(VarIntCodec::decode(&mut bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_shortest_form() {
        let mut buf = BytesMut::new();
        assert_eq!(VarIntCodec::encode(37, &mut buf).unwrap(), 1);
        let mut buf = BytesMut::new();
        assert_eq!(VarIntCodec::encode(15_293, &mut buf).unwrap(), 2);
        let mut buf = BytesMut::new();
        assert_eq!(VarIntCodec::encode(494_878_333, &mut buf).unwrap(), 4);
        let mut buf = BytesMut::new();
        assert_eq!(
            VarIntCodec::encode(151_288_809_941_952_652, &mut buf).unwrap(),
            8
        );
    }

    #[test]
    fn test_varint_rfc_examples() {
        // RFC 9000 Appendix A.1 sample encodings.
        let mut buf = Bytes::from_static(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);
        assert_eq!(VarIntCodec::decode(&mut buf).unwrap(), 151_288_809_941_952_652);
        let mut buf = Bytes::from_static(&[0x9d, 0x7f, 0x3e, 0x7d]);
        assert_eq!(VarIntCodec::decode(&mut buf).unwrap(), 494_878_333);
        let mut buf = Bytes::from_static(&[0x7b, 0xbd]);
        assert_eq!(VarIntCodec::decode(&mut buf).unwrap(), 15_293);
        let mut buf = Bytes::from_static(&[0x25]);
        assert_eq!(VarIntCodec::decode(&mut buf).unwrap(), 37);
    }

    #[test]
    fn test_varint_too_large() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            VarIntCodec::encode(1u64 << 62, &mut buf),
            Err(CodecError::VarIntTooLarge(_))
        ));
    }

    #[test]
    fn test_varint_truncated_input() {
        let mut buf = Bytes::from_static(&[0x40]);
        assert!(matches!(
            VarIntCodec::decode(&mut buf),
            Err(CodecError::BufferTooShort)
        ));
    }

    #[test]
    fn test_connection_id_bounds() {
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; 21]).is_none());
        assert!(ConnectionId::empty().is_empty());
    }

    #[test]
    fn test_connection_id_equality_bytewise() {
        let a = ConnectionId::from_slice(&[1, 2, 3]).unwrap();
        let b = ConnectionId::from_slice(&[1, 2, 3]).unwrap();
        let c = ConnectionId::from_slice(&[1, 2, 4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_id_classes() {
        let id = StreamId::new(0);
        assert!(id.is_client_initiated() && id.is_bidirectional());
        let id = StreamId::new(1);
        assert!(id.is_server_initiated() && id.is_bidirectional());
        let id = StreamId::new(2);
        assert!(id.is_client_initiated() && id.is_unidirectional());
        let id = StreamId::new(3);
        assert!(id.is_server_initiated() && id.is_unidirectional());
    }

    #[test]
    fn test_stream_id_from_parts() {
        let id = StreamId::from_parts(Side::Client, true, 3);
        assert_eq!(id.value(), 12);
        assert_eq!(id.stream_index(), 3);
        let id = StreamId::from_parts(Side::Server, false, 1);
        assert_eq!(id.value(), 7);
    }

    #[test]
    fn test_instant_arithmetic() {
        let base = Instant::from_millis(10);
        let later = base + Duration::from_millis(5);
        assert_eq!(later.duration_since(base), Some(Duration::from_millis(5)));
        assert_eq!(base.duration_since(later), None);
        assert_eq!(
            base.saturating_duration_since(later),
            Duration::ZERO
        );
    }
}
