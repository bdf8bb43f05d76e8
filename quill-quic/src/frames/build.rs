//! Frame serialization.
//!
//! Frames encode into a caller-provided buffer; the packet builder checks
//! [`encoded_size`] against its remaining space before committing. ACK
//! frames get a planning step that truncates the block list to the space
//! available, since an ACK must fit or carry fewer ranges rather than fail.

use bytes::{BufMut, BytesMut};
use core::time::Duration;
use tinyvec::TinyVec;

use super::*;
use crate::types::VarIntCodec;

/// Scale an ACK delay for the wire: microseconds shifted down by the
/// space's ack delay exponent.
pub fn scale_ack_delay(delay: Duration, exponent: u64) -> u64 {
    (delay.as_micros() as u64) >> exponent
}

/// Reverse of [`scale_ack_delay`], saturating on overflow.
pub fn unscale_ack_delay(scaled: u64, exponent: u64) -> Duration {
    let micros = if exponent >= 64 {
        u64::MAX
    } else {
        scaled.checked_shl(exponent as u32).unwrap_or(u64::MAX)
    };
    Duration::from_micros(micros)
}

/// Exact serialized size of `frame` in bytes.
///
/// `Noop` occupies zero bytes; it exists only in write-form lists.
pub fn encoded_size(frame: &Frame, ack_delay_exponent: u64) -> usize {
    match frame {
        Frame::Padding => 1,
        Frame::Ping => 1,
        Frame::Ack(ack) => ack_frame_size(ack, ack_delay_exponent),
        Frame::ResetStream(f) => {
            1 + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.error_code)
                + VarIntCodec::size(f.final_size)
        }
        Frame::StopSending(f) => {
            1 + VarIntCodec::size(f.stream_id.value()) + VarIntCodec::size(f.error_code)
        }
        Frame::Crypto(f) => {
            1 + VarIntCodec::size(f.offset)
                + VarIntCodec::size(f.data.len() as u64)
                + f.data.len()
        }
        Frame::NewToken(f) => 1 + VarIntCodec::size(f.token.len() as u64) + f.token.len(),
        Frame::Stream(f) => {
            let mut size = 1 + VarIntCodec::size(f.stream_id.value());
            if f.offset > 0 {
                size += VarIntCodec::size(f.offset);
            }
            size += VarIntCodec::size(f.data.len() as u64);
            size + f.data.len()
        }
        Frame::MaxData(f) => 1 + VarIntCodec::size(f.maximum_data),
        Frame::MaxStreamData(f) => {
            1 + VarIntCodec::size(f.stream_id.value()) + VarIntCodec::size(f.maximum_data)
        }
        Frame::MaxStreams(f) => 1 + VarIntCodec::size(f.max_streams),
        Frame::DataBlocked(f) => 1 + VarIntCodec::size(f.data_limit),
        Frame::StreamDataBlocked(f) => {
            1 + VarIntCodec::size(f.stream_id.value()) + VarIntCodec::size(f.data_limit)
        }
        Frame::StreamsBlocked(f) => 1 + VarIntCodec::size(f.stream_limit),
        Frame::NewConnectionId(f) => {
            1 + VarIntCodec::size(f.sequence_number)
                + VarIntCodec::size(f.retire_prior_to)
                + 1
                + f.connection_id.len()
                + 16
        }
        Frame::RetireConnectionId(f) => 1 + VarIntCodec::size(f.sequence_number),
        Frame::PathChallenge(_) | Frame::PathResponse(_) => 1 + 8,
        Frame::ConnectionClose(f) => {
            1 + VarIntCodec::size(f.error_code)
                + if f.application {
                    0
                } else {
                    VarIntCodec::size(f.frame_type.unwrap_or(0))
                }
                + VarIntCodec::size(f.reason.len() as u64)
                + f.reason.len()
        }
        Frame::MinStreamData(f) => {
            VarIntCodec::size(FRAME_TYPE_MIN_STREAM_DATA)
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.maximum_data)
                + VarIntCodec::size(f.minimum_stream_offset)
        }
        Frame::ExpiredStreamData(f) => {
            VarIntCodec::size(FRAME_TYPE_EXPIRED_STREAM_DATA)
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.minimum_stream_offset)
        }
        Frame::Noop => 0,
    }
}

fn ack_frame_size(ack: &WriteAckFrame, ack_delay_exponent: u64) -> usize {
    let largest = ack.largest_acked();
    let first = ack.ack_blocks.first().copied().unwrap_or_default();
    let mut size = 1
        + VarIntCodec::size(largest)
        + VarIntCodec::size(scale_ack_delay(ack.ack_delay, ack_delay_exponent))
        + VarIntCodec::size(ack.ack_blocks.len().saturating_sub(1) as u64)
        + VarIntCodec::size(first.end - first.start);
    let mut prev_start = first.start;
    for block in ack.ack_blocks.iter().skip(1) {
        size += VarIntCodec::size(prev_start - block.end - 2);
        size += VarIntCodec::size(block.end - block.start);
        prev_start = block.start;
    }
    size
}

/// Serialize `frame` into `out`. The caller has already verified the frame
/// fits; this function only writes.
pub fn encode_frame(frame: &Frame, ack_delay_exponent: u64, out: &mut BytesMut) {
    match frame {
        Frame::Padding => out.put_u8(FRAME_TYPE_PADDING as u8),
        Frame::Ping => out.put_u8(FRAME_TYPE_PING as u8),
        Frame::Ack(ack) => encode_ack(ack, ack_delay_exponent, out),
        Frame::ResetStream(f) => {
            out.put_u8(FRAME_TYPE_RESET_STREAM as u8);
            put_varint(f.stream_id.value(), out);
            put_varint(f.error_code, out);
            put_varint(f.final_size, out);
        }
        Frame::StopSending(f) => {
            out.put_u8(FRAME_TYPE_STOP_SENDING as u8);
            put_varint(f.stream_id.value(), out);
            put_varint(f.error_code, out);
        }
        Frame::Crypto(f) => {
            out.put_u8(FRAME_TYPE_CRYPTO as u8);
            put_varint(f.offset, out);
            put_varint(f.data.len() as u64, out);
            out.put_slice(&f.data);
        }
        Frame::NewToken(f) => {
            out.put_u8(FRAME_TYPE_NEW_TOKEN as u8);
            put_varint(f.token.len() as u64, out);
            out.put_slice(&f.token);
        }
        Frame::Stream(f) => {
            let mut type_byte = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
            if f.offset > 0 {
                type_byte |= STREAM_FRAME_BIT_OFF;
            }
            if f.fin {
                type_byte |= STREAM_FRAME_BIT_FIN;
            }
            out.put_u8(type_byte as u8);
            put_varint(f.stream_id.value(), out);
            if f.offset > 0 {
                put_varint(f.offset, out);
            }
            put_varint(f.data.len() as u64, out);
            out.put_slice(&f.data);
        }
        Frame::MaxData(f) => {
            out.put_u8(FRAME_TYPE_MAX_DATA as u8);
            put_varint(f.maximum_data, out);
        }
        Frame::MaxStreamData(f) => {
            out.put_u8(FRAME_TYPE_MAX_STREAM_DATA as u8);
            put_varint(f.stream_id.value(), out);
            put_varint(f.maximum_data, out);
        }
        Frame::MaxStreams(f) => {
            out.put_u8(if f.bidirectional {
                FRAME_TYPE_MAX_STREAMS_BIDI
            } else {
                FRAME_TYPE_MAX_STREAMS_UNI
            } as u8);
            put_varint(f.max_streams, out);
        }
        Frame::DataBlocked(f) => {
            out.put_u8(FRAME_TYPE_DATA_BLOCKED as u8);
            put_varint(f.data_limit, out);
        }
        Frame::StreamDataBlocked(f) => {
            out.put_u8(FRAME_TYPE_STREAM_DATA_BLOCKED as u8);
            put_varint(f.stream_id.value(), out);
            put_varint(f.data_limit, out);
        }
        Frame::StreamsBlocked(f) => {
            out.put_u8(if f.bidirectional {
                FRAME_TYPE_STREAMS_BLOCKED_BIDI
            } else {
                FRAME_TYPE_STREAMS_BLOCKED_UNI
            } as u8);
            put_varint(f.stream_limit, out);
        }
        Frame::NewConnectionId(f) => {
            out.put_u8(FRAME_TYPE_NEW_CONNECTION_ID as u8);
            put_varint(f.sequence_number, out);
            put_varint(f.retire_prior_to, out);
            out.put_u8(f.connection_id.len() as u8);
            out.put_slice(f.connection_id.as_bytes());
            out.put_slice(&f.stateless_reset_token);
        }
        Frame::RetireConnectionId(f) => {
            out.put_u8(FRAME_TYPE_RETIRE_CONNECTION_ID as u8);
            put_varint(f.sequence_number, out);
        }
        Frame::PathChallenge(f) => {
            out.put_u8(FRAME_TYPE_PATH_CHALLENGE as u8);
            out.put_u64(f.path_data);
        }
        Frame::PathResponse(f) => {
            out.put_u8(FRAME_TYPE_PATH_RESPONSE as u8);
            out.put_u64(f.path_data);
        }
        Frame::ConnectionClose(f) => {
            out.put_u8(if f.application {
                FRAME_TYPE_CONNECTION_CLOSE_APP
            } else {
                FRAME_TYPE_CONNECTION_CLOSE
            } as u8);
            put_varint(f.error_code, out);
            if !f.application {
                put_varint(f.frame_type.unwrap_or(0), out);
            }
            put_varint(f.reason.len() as u64, out);
            out.put_slice(&f.reason);
        }
        Frame::MinStreamData(f) => {
            put_varint(FRAME_TYPE_MIN_STREAM_DATA, out);
            put_varint(f.stream_id.value(), out);
            put_varint(f.maximum_data, out);
            put_varint(f.minimum_stream_offset, out);
        }
        Frame::ExpiredStreamData(f) => {
            put_varint(FRAME_TYPE_EXPIRED_STREAM_DATA, out);
            put_varint(f.stream_id.value(), out);
            put_varint(f.minimum_stream_offset, out);
        }
        Frame::Noop => {}
    }
}

fn put_varint(value: u64, out: &mut BytesMut) {
    VarIntCodec::encode(value, out).expect("frame field fits varint");
}

fn encode_ack(ack: &WriteAckFrame, ack_delay_exponent: u64, out: &mut BytesMut) {
    let first = ack.ack_blocks.first().copied().unwrap_or_default();
    out.put_u8(FRAME_TYPE_ACK as u8);
    put_varint(first.end, out);
    put_varint(scale_ack_delay(ack.ack_delay, ack_delay_exponent), out);
    put_varint(ack.ack_blocks.len().saturating_sub(1) as u64, out);
    put_varint(first.end - first.start, out);
    let mut prev_start = first.start;
    for block in ack.ack_blocks.iter().skip(1) {
        put_varint(prev_start - block.end - 2, out);
        put_varint(block.end - block.start, out);
        prev_start = block.start;
    }
}

/// Plan an ACK frame that fits in `space_limit` bytes.
///
/// Takes the candidate blocks descending by start, keeps as many as fit and
/// returns the resulting frame. Returns `None` when even a single-block ACK
/// does not fit (the scheduler then skips the ACK for this packet).
pub fn plan_ack_frame(
    blocks: &[AckBlock],
    ack_delay: Duration,
    ack_delay_exponent: u64,
    space_limit: usize,
) -> Option<WriteAckFrame> {
    let first = *blocks.first()?;
    let mut kept: TinyVec<[AckBlock; 8]> = TinyVec::new();
    kept.push(first);
    for block in blocks.iter().skip(1) {
        kept.push(*block);
        let candidate = WriteAckFrame {
            ack_blocks: kept.clone(),
            ack_delay,
        };
        if ack_frame_size(&candidate, ack_delay_exponent) > space_limit {
            kept.pop();
            break;
        }
    }
    let frame = WriteAckFrame {
        ack_blocks: kept,
        ack_delay,
    };
    if ack_frame_size(&frame, ack_delay_exponent) > space_limit {
        return None;
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::parse::FrameDecoder;
    use crate::types::StreamId;
    use bytes::Bytes;

    fn roundtrip(frame: Frame) -> Frame {
        let mut out = BytesMut::new();
        encode_frame(&frame, 3, &mut out);
        assert_eq!(out.len(), encoded_size(&frame, 3), "size mismatch for {frame:?}");
        let mut decoder = FrameDecoder::new(out.freeze(), 3);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert!(decoder.next_frame().unwrap().is_none());
        decoded
    }

    #[test]
    fn test_stream_frame_roundtrip() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(4),
            offset: 1200,
            data: Bytes::from_static(b"hello quic"),
            fin: true,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_stream_frame_zero_offset_omits_off_bit() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(0),
            offset: 0,
            data: Bytes::from_static(b"abc"),
            fin: false,
        });
        let mut out = BytesMut::new();
        encode_frame(&frame, 3, &mut out);
        assert_eq!(out[0] as u64 & STREAM_FRAME_BIT_OFF, 0);
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ack_frame_roundtrip_multi_block() {
        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        blocks.push(AckBlock::new(90, 100));
        blocks.push(AckBlock::new(50, 60));
        blocks.push(AckBlock::new(10, 20));
        let frame = Frame::Ack(WriteAckFrame {
            ack_blocks: blocks,
            ack_delay: Duration::from_micros(800),
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_ack_delay_scaling() {
        assert_eq!(scale_ack_delay(Duration::from_micros(800), 3), 100);
        assert_eq!(unscale_ack_delay(100, 3), Duration::from_micros(800));
    }

    #[test]
    fn test_connection_close_roundtrip() {
        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0a,
            frame_type: Some(FRAME_TYPE_NEW_CONNECTION_ID),
            reason: Bytes::from_static(b"cid misuse"),
            application: false,
        });
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 77,
            frame_type: None,
            reason: Bytes::from_static(b"app says bye"),
            application: true,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_new_connection_id_roundtrip() {
        let frame = Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number: 3,
            retire_prior_to: 1,
            connection_id: crate::types::ConnectionId::from_slice(&[9; 8]).unwrap(),
            stateless_reset_token: [0xab; 16],
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_partial_reliability_frames_roundtrip() {
        let frame = Frame::MinStreamData(MinStreamDataFrame {
            stream_id: StreamId::new(8),
            maximum_data: 65536,
            minimum_stream_offset: 4096,
        });
        assert_eq!(roundtrip(frame.clone()), frame);

        let frame = Frame::ExpiredStreamData(ExpiredStreamDataFrame {
            stream_id: StreamId::new(8),
            minimum_stream_offset: 2048,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_path_frames_roundtrip() {
        let frame = Frame::PathChallenge(PathChallengeFrame {
            path_data: 0xdead_beef_cafe_f00d,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
        let frame = Frame::PathResponse(PathResponseFrame {
            path_data: 0xdead_beef_cafe_f00d,
        });
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_plan_ack_truncates_blocks_to_space() {
        let blocks: Vec<AckBlock> = (0..64)
            .rev()
            .map(|i| AckBlock::new(i * 100, i * 100 + 10))
            .collect();
        let full = plan_ack_frame(&blocks, Duration::ZERO, 3, 4096).unwrap();
        assert_eq!(full.ack_blocks.len(), 64);

        let truncated = plan_ack_frame(&blocks, Duration::ZERO, 3, 40).unwrap();
        assert!(truncated.ack_blocks.len() < 64);
        assert!(!truncated.ack_blocks.is_empty());
        // Largest-acked block always survives.
        assert_eq!(truncated.largest_acked(), 63 * 100 + 10);

        assert!(plan_ack_frame(&blocks, Duration::ZERO, 3, 2).is_none());
    }

    #[test]
    fn test_noop_is_invisible() {
        let mut out = BytesMut::new();
        encode_frame(&Frame::Noop, 3, &mut out);
        assert!(out.is_empty());
        assert_eq!(encoded_size(&Frame::Noop, 3), 0);
    }
}
