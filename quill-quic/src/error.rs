//! Error types for the transport datapath.
//!
//! Wire-visible transport error codes (carried in CONNECTION_CLOSE), local
//! errors that never reach the wire, and the codec error type shared by the
//! header and frame parsers.

use thiserror::Error;

use crate::types::VarInt;

/// Errors raised by the wire codecs (varint, header, frame).
///
/// A codec error on a frame body is fatal to the connection
/// (FRAME_ENCODING_ERROR); a codec error on a datagram header only drops
/// the datagram.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short")]
    BufferTooShort,

    #[error("value {0} exceeds varint range")]
    VarIntTooLarge(u64),

    #[error("invalid packet type bits {0:#04x}")]
    InvalidPacketType(u8),

    #[error("connection id length {0} out of range")]
    InvalidCidLength(usize),

    #[error("unknown frame type {0:#x}")]
    UnknownFrameType(u64),

    #[error("malformed {0} frame")]
    InvalidFrameField(&'static str),
}

/// Transport error codes carried in CONNECTION_CLOSE frames of type 0x1c.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    #[error("no error")]
    NoError,

    #[error("internal error")]
    InternalError,

    #[error("flow control error")]
    FlowControlError,

    #[error("stream limit error")]
    StreamLimitError,

    #[error("stream state error")]
    StreamStateError,

    #[error("final size error")]
    FinalSizeError,

    #[error("frame encoding error")]
    FrameEncodingError,

    #[error("transport parameter error")]
    TransportParameterError,

    #[error("protocol violation")]
    ProtocolViolation,

    #[error("invalid migration")]
    InvalidMigration,

    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    #[error("crypto error: tls alert {0:#x}")]
    Crypto(u8),
}

impl TransportErrorCode {
    /// Wire representation of this code.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ProtocolViolation => 0x0a,
            TransportErrorCode::InvalidMigration => 0x0c,
            TransportErrorCode::CryptoBufferExceeded => 0x0d,
            TransportErrorCode::Crypto(alert) => 0x100 + alert as u64,
        }
    }

    /// Parse a wire error code. Unknown codes map to `ProtocolViolation`
    /// rather than failing; a peer's close is honored either way.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x0a => TransportErrorCode::ProtocolViolation,
            0x0c => TransportErrorCode::InvalidMigration,
            0x0d => TransportErrorCode::CryptoBufferExceeded,
            0x100..=0x1ff => TransportErrorCode::Crypto((code - 0x100) as u8),
            _ => TransportErrorCode::ProtocolViolation,
        }
    }
}

/// Errors that stay local to this endpoint: the datagram (or connection)
/// is dropped without any wire emission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LocalError {
    /// AEAD open failed; the datagram is dropped and a stat incremented.
    #[error("packet decryption failed")]
    DecryptionFailure,

    /// Short-header DCID does not match any currently-valid self id.
    #[error("unknown destination connection id")]
    UnknownDestinationConnectionId,

    /// Peer speaks a version we do not; a Version Negotiation packet is
    /// emitted by the server side, nothing by the client.
    #[error("unsupported quic version {0:#010x}")]
    VersionMismatch(u32),

    /// Negotiated idle period elapsed with no activity.
    #[error("idle timeout")]
    IdleTimeout,

    /// Internal invariant failure.
    #[error("internal datapath error")]
    Internal,
}

/// A fatal connection error: what we will tell the peer (if anything)
/// and why.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Close with a transport-level code (CONNECTION_CLOSE 0x1c).
    #[error("transport error: {code} ({reason})")]
    Transport {
        code: TransportErrorCode,
        /// Frame type that provoked the error, when known.
        frame_type: Option<VarInt>,
        reason: &'static str,
    },

    /// Close with an opaque application code (CONNECTION_CLOSE 0x1d).
    #[error("application error: {code:#x}")]
    Application { code: u64 },

    /// Local-only close; nothing is emitted.
    #[error(transparent)]
    Local(#[from] LocalError),
}

impl ConnectionError {
    pub fn transport(code: TransportErrorCode, reason: &'static str) -> Self {
        ConnectionError::Transport {
            code,
            frame_type: None,
            reason,
        }
    }

    /// Whether this error emits a CONNECTION_CLOSE frame.
    pub fn is_wire_visible(&self) -> bool {
        !matches!(self, ConnectionError::Local(_))
    }
}

impl From<CodecError> for ConnectionError {
    fn from(_: CodecError) -> Self {
        ConnectionError::transport(
            TransportErrorCode::FrameEncodingError,
            "malformed frame",
        )
    }
}

/// Crate-wide result alias for connection-level operations.
pub type Result<T> = core::result::Result<T, ConnectionError>;
