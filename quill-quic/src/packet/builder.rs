//! Packet builder (the one place packet bytes are assembled).
//!
//! A builder is created per packet with a remaining-bytes budget, the
//! header to use, the largest acknowledged packet number in the same space
//! (for packet number truncation) and the cipher overhead of the sealing
//! AEAD. Frames append until space runs out; `finish` pads the body for
//! header-protection sampling and back-writes the long-header Length
//! field.
//!
//! The caller must only append frames belonging to the header's packet
//! number space.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frames::{build as frame_build, Frame};
use crate::packet::header::{encode_header_prefix, LongHeaderType, PacketHeader};
use crate::packet::number::{
    append_packet_number_bytes, encode_packet_number, PacketNumEncoding,
};
use crate::types::{
    PacketNumber, HEADER_PROTECTION_SAMPLE_SIZE, MAX_PACKET_NUM_ENCODING_SIZE,
};

/// Length field is always written as a 2-byte varint so its size is known
/// before the payload is.
const PACKET_LEN_FIELD_SIZE: usize = 2;

/// A finished plaintext packet, ready for sealing.
#[derive(Debug, Clone)]
pub struct BuiltPacket {
    pub header: PacketHeader,
    pub frames: Vec<Frame>,
    /// Encoded header including packet number bytes.
    pub header_bytes: Bytes,
    /// Plaintext body (unsealed).
    pub body: Bytes,
    /// AEAD expansion the wire packet will carry.
    pub cipher_overhead: usize,
    /// Encoded packet number length; the trailing bytes of
    /// `header_bytes`.
    pub pn_len: usize,
}

impl BuiltPacket {
    pub fn packet_number(&self) -> PacketNumber {
        self.header.packet_number()
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// Size on the wire after sealing.
    pub fn wire_size(&self) -> usize {
        self.header_bytes.len() + self.body.len() + self.cipher_overhead
    }
}

/// Assembles one protected packet within a byte budget.
pub struct PacketBuilder {
    remaining: usize,
    header: PacketHeader,
    header_bytes: BytesMut,
    body: BytesMut,
    frames: Vec<Frame>,
    pn_encoding: PacketNumEncoding,
    cipher_overhead: usize,
    ack_delay_exponent: u64,
    buildable: bool,
}

impl PacketBuilder {
    /// `remaining_bytes` is the total wire budget for this packet
    /// (header + body + cipher overhead).
    pub fn new(
        remaining_bytes: usize,
        header: PacketHeader,
        largest_acked: Option<PacketNumber>,
        cipher_overhead: usize,
        ack_delay_exponent: u64,
    ) -> Self {
        let pn_encoding = encode_packet_number(header.packet_number(), largest_acked);
        let header_prefix = encode_header_prefix(&header, pn_encoding);
        let fixed_size = header_prefix.len()
            + pn_encoding.length
            + cipher_overhead
            + if is_long_non_retry(&header) {
                PACKET_LEN_FIELD_SIZE
            } else {
                0
            };
        let buildable = remaining_bytes >= fixed_size + 1;
        let remaining = if buildable {
            remaining_bytes - fixed_size
        } else {
            0
        };
        Self {
            remaining,
            header,
            header_bytes: header_prefix,
            body: BytesMut::with_capacity(remaining),
            frames: Vec::new(),
            pn_encoding,
            cipher_overhead,
            ack_delay_exponent,
            buildable,
        }
    }

    /// Whether the minimal header fit the budget at all.
    pub fn can_build(&self) -> bool {
        self.buildable
    }

    /// Body bytes still available for frames.
    pub fn remaining_space(&self) -> usize {
        if self.buildable {
            self.remaining
        } else {
            0
        }
    }

    pub fn packet_number(&self) -> PacketNumber {
        self.header.packet_number()
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn has_frames(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Serialize `frame` into the body if it fits. Returns false (leaving
    /// the packet unchanged) when there is not enough space or the header
    /// never fit.
    pub fn append_frame(&mut self, frame: Frame) -> bool {
        if !self.buildable {
            return false;
        }
        let size = frame_build::encoded_size(&frame, self.ack_delay_exponent);
        if size > self.remaining {
            return false;
        }
        frame_build::encode_frame(&frame, self.ack_delay_exponent, &mut self.body);
        self.remaining -= size;
        if !matches!(frame, Frame::Padding) {
            self.frames.push(frame);
        }
        true
    }

    /// Append raw bytes to the body (already-serialized frame content).
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if !self.buildable || bytes.len() > self.remaining {
            return false;
        }
        self.body.put_slice(bytes);
        self.remaining -= bytes.len();
        true
    }

    /// Finish the packet: pad for the header-protection sample, write the
    /// Length field and packet number. Returns `None` if the header never
    /// fit or nothing was written.
    pub fn finish(mut self) -> Option<BuiltPacket> {
        if !self.buildable || (self.frames.is_empty() && self.body.is_empty()) {
            return None;
        }
        // The header-protection sample starts 4 bytes past the start of
        // the packet number; everything it reads must exist.
        let min_body = MAX_PACKET_NUM_ENCODING_SIZE - self.pn_encoding.length
            + HEADER_PROTECTION_SAMPLE_SIZE;
        while self.body.len() + self.cipher_overhead < min_body && self.remaining > 0 {
            self.body.put_u8(0);
            self.remaining -= 1;
        }

        if is_long_non_retry(&self.header) {
            let length =
                (self.pn_encoding.length + self.body.len() + self.cipher_overhead) as u64;
            debug_assert!(length < 0x4000);
            self.header_bytes.put_u16(length as u16 | 0x4000);
        }
        append_packet_number_bytes(self.pn_encoding, &mut self.header_bytes);

        Some(BuiltPacket {
            header: self.header,
            frames: self.frames,
            header_bytes: self.header_bytes.freeze(),
            body: self.body.freeze(),
            cipher_overhead: self.cipher_overhead,
            pn_len: self.pn_encoding.length,
        })
    }
}

fn is_long_non_retry(header: &PacketHeader) -> bool {
    match header {
        PacketHeader::Long(h) => h.packet_type != LongHeaderType::Retry,
        PacketHeader::Short(_) => false,
    }
}
