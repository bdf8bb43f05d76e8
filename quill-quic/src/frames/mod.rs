//! # Frame types (RFC 9000 Section 19)
//!
//! The write-form [`Frame`] union is what packets record and what the
//! rebuild engine clones. Stream and crypto payloads are reference-counted
//! [`Bytes`] so cloning a frame never copies data.
//!
//! Beyond the RFC 9000 set, the partial-reliability frames
//! MIN_STREAM_DATA / EXPIRED_STREAM_DATA and an internal no-op variant are
//! carried.

pub mod build;
pub mod parse;

use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

use crate::types::{ConnectionId, PacketNumber, StatelessResetToken, StreamId, StreamOffset, VarInt};

// ============================================================================
// Frame Type Constants
// ============================================================================

pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u64 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08..=0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_MIN_STREAM_DATA: u64 = 0xfe;
pub const FRAME_TYPE_EXPIRED_STREAM_DATA: u64 = 0xff;

/// STREAM frame flag bits embedded in the type byte (0x08..=0x0f).
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

// ============================================================================
// Frame Structs
// ============================================================================

/// One contiguous acknowledged packet-number range, inclusive on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBlock {
    pub start: PacketNumber,
    pub end: PacketNumber,
}

impl AckBlock {
    pub fn new(start: PacketNumber, end: PacketNumber) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }
}

/// ACK frame in write form.
///
/// Blocks are ordered descending by `start`; the first block contains the
/// largest acknowledged packet number. An ACK always carries at least one
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAckFrame {
    pub ack_blocks: TinyVec<[AckBlock; 8]>,
    pub ack_delay: Duration,
}

impl WriteAckFrame {
    pub fn largest_acked(&self) -> PacketNumber {
        self.ack_blocks.first().map(|b| b.end).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_size: StreamOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: StreamOffset,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM frame in write form. The LEN bit is an encoding decision made at
/// serialization time; the write form always knows its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: StreamOffset,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub max_streams: u64,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub data_limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub stream_limit: u64,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChallengeFrame {
    pub path_data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResponseFrame {
    pub path_data: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    /// Wire error code; transport (0x1c) or application (0x1d) namespace.
    pub error_code: u64,
    /// Offending frame type; only present on transport closes.
    pub frame_type: Option<VarInt>,
    pub reason: Bytes,
    pub application: bool,
}

/// Receiver-driven partial reliability: advertises stream flow control and
/// asks the sender to advance its minimum retransmittable offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_data: u64,
    pub minimum_stream_offset: StreamOffset,
}

/// Sender-driven partial reliability: informs the receiver that data below
/// the offset will never be retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredStreamDataFrame {
    pub stream_id: StreamId,
    pub minimum_stream_offset: StreamOffset,
}

// ============================================================================
// The Frame Union
// ============================================================================

/// Write-form frame: what a packet records having carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack(WriteAckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    NewToken(NewTokenFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ConnectionClose(ConnectionCloseFrame),
    MinStreamData(MinStreamDataFrame),
    ExpiredStreamData(ExpiredStreamDataFrame),
    /// Internal placeholder; never serialized. Simplifies rebuild-list
    /// fixups where a slot must survive without wire effect.
    Noop,
}

impl Frame {
    /// ACK-eliciting frames oblige the peer to acknowledge (RFC 9000
    /// Section 13.2): everything except ACK, PADDING and CONNECTION_CLOSE.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_) | Frame::Noop
        )
    }

    /// Frames whose loss obliges some form of recovery action.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_) | Frame::Noop
        )
    }
}
