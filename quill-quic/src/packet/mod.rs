//! Packet-level machinery: header codec, packet number truncation, the
//! per-space receive/ACK state, the outstanding-packet registry and the
//! packet builder.

pub mod builder;
pub mod header;
pub mod number;
pub mod outstanding;
pub mod space;

pub use builder::{BuiltPacket, PacketBuilder};
pub use header::{
    build_retry_packet, build_stateless_reset_packet, build_version_negotiation_packet,
    parse_header, LongHeader, LongHeaderType, PacketHeader, ParsedHeader, ShortHeader,
    QUIC_VERSION_1,
};
pub use number::{decode_packet_number, encode_packet_number, PacketNumEncoding};
pub use outstanding::{
    OutstandingPacket, OutstandingPackets, PacketEvent, PacketEventSet, SentPacketMeta,
};
pub use space::{AckIntervalSet, PacketNumberSpaceSet, PacketNumberSpaceState};
