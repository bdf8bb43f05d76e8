//! Frame parsing.
//!
//! The decoder walks a decrypted packet body and yields write-form frames.
//! Payload slices are taken by reference count from the input buffer, not
//! copied. Any malformation is a [`CodecError`]; the connection converts it
//! to FRAME_ENCODING_ERROR and transitions to Closing.

use bytes::{Buf, Bytes};
use tinyvec::TinyVec;

use super::*;
use crate::error::CodecError;
use crate::types::{ConnectionId, StreamId, VarIntCodec};

/// Streaming frame decoder over one packet body.
pub struct FrameDecoder {
    buf: Bytes,
    ack_delay_exponent: u64,
}

impl FrameDecoder {
    /// `ack_delay_exponent` is the value negotiated for the packet's space
    /// (Initial/Handshake use the default 3).
    pub fn new(buf: Bytes, ack_delay_exponent: u64) -> Self {
        Self {
            buf,
            ack_delay_exponent,
        }
    }

    /// Decode the next frame, or `None` at end of body.
    ///
    /// Runs of PADDING coalesce into a single `Frame::Padding`.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        let frame_type = VarIntCodec::decode(&mut self.buf)?;
        let frame = match frame_type {
            FRAME_TYPE_PADDING => {
                while self.buf.has_remaining() && self.buf.chunk()[0] == 0 {
                    self.buf.advance(1);
                }
                Frame::Padding
            }
            FRAME_TYPE_PING => Frame::Ping,
            FRAME_TYPE_ACK => self.parse_ack()?,
            FRAME_TYPE_RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
                stream_id: StreamId::new(self.varint()?),
                error_code: self.varint()?,
                final_size: self.varint()?,
            }),
            FRAME_TYPE_STOP_SENDING => Frame::StopSending(StopSendingFrame {
                stream_id: StreamId::new(self.varint()?),
                error_code: self.varint()?,
            }),
            FRAME_TYPE_CRYPTO => {
                let offset = self.varint()?;
                let len = self.varint()? as usize;
                Frame::Crypto(CryptoFrame {
                    offset,
                    data: self.take(len, "crypto")?,
                })
            }
            FRAME_TYPE_NEW_TOKEN => {
                let len = self.varint()? as usize;
                if len == 0 {
                    return Err(CodecError::InvalidFrameField("new_token"));
                }
                Frame::NewToken(NewTokenFrame {
                    token: self.take(len, "new_token")?,
                })
            }
            t if (FRAME_TYPE_STREAM_BASE..=FRAME_TYPE_STREAM_BASE + 0x07).contains(&t) => {
                self.parse_stream(t)?
            }
            FRAME_TYPE_MAX_DATA => Frame::MaxData(MaxDataFrame {
                maximum_data: self.varint()?,
            }),
            FRAME_TYPE_MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: StreamId::new(self.varint()?),
                maximum_data: self.varint()?,
            }),
            FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
                Frame::MaxStreams(MaxStreamsFrame {
                    max_streams: self.varint()?,
                    bidirectional: frame_type == FRAME_TYPE_MAX_STREAMS_BIDI,
                })
            }
            FRAME_TYPE_DATA_BLOCKED => Frame::DataBlocked(DataBlockedFrame {
                data_limit: self.varint()?,
            }),
            FRAME_TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id: StreamId::new(self.varint()?),
                data_limit: self.varint()?,
            }),
            FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
                Frame::StreamsBlocked(StreamsBlockedFrame {
                    stream_limit: self.varint()?,
                    bidirectional: frame_type == FRAME_TYPE_STREAMS_BLOCKED_BIDI,
                })
            }
            FRAME_TYPE_NEW_CONNECTION_ID => self.parse_new_connection_id()?,
            FRAME_TYPE_RETIRE_CONNECTION_ID => {
                Frame::RetireConnectionId(RetireConnectionIdFrame {
                    sequence_number: self.varint()?,
                })
            }
            FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge(PathChallengeFrame {
                path_data: self.u64_be("path_challenge")?,
            }),
            FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse(PathResponseFrame {
                path_data: self.u64_be("path_response")?,
            }),
            FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                let application = frame_type == FRAME_TYPE_CONNECTION_CLOSE_APP;
                let error_code = self.varint()?;
                let offending = if application {
                    None
                } else {
                    Some(self.varint()?)
                };
                let reason_len = self.varint()? as usize;
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    frame_type: offending,
                    reason: self.take(reason_len, "connection_close")?,
                    application,
                })
            }
            FRAME_TYPE_MIN_STREAM_DATA => Frame::MinStreamData(MinStreamDataFrame {
                stream_id: StreamId::new(self.varint()?),
                maximum_data: self.varint()?,
                minimum_stream_offset: self.varint()?,
            }),
            FRAME_TYPE_EXPIRED_STREAM_DATA => Frame::ExpiredStreamData(ExpiredStreamDataFrame {
                stream_id: StreamId::new(self.varint()?),
                minimum_stream_offset: self.varint()?,
            }),
            other => return Err(CodecError::UnknownFrameType(other)),
        };
        Ok(Some(frame))
    }

    /// Decode the whole body into a frame list.
    pub fn decode_all(mut self) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        VarIntCodec::decode(&mut self.buf)
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<Bytes, CodecError> {
        if self.buf.remaining() < len {
            return Err(CodecError::InvalidFrameField(field));
        }
        Ok(self.buf.split_to(len))
    }

    fn u64_be(&mut self, field: &'static str) -> Result<u64, CodecError> {
        if self.buf.remaining() < 8 {
            return Err(CodecError::InvalidFrameField(field));
        }
        Ok(self.buf.get_u64())
    }

    fn parse_ack(&mut self) -> Result<Frame, CodecError> {
        let largest = self.varint()?;
        let delay_scaled = self.varint()?;
        let additional = self.varint()?;
        let first_range = self.varint()?;
        if first_range > largest {
            return Err(CodecError::InvalidFrameField("ack"));
        }
        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        let mut start = largest - first_range;
        blocks.push(AckBlock::new(start, largest));
        for _ in 0..additional {
            let gap = self.varint()?;
            let range = self.varint()?;
            // end = previous start - gap - 2; start = end - range
            let end = start
                .checked_sub(gap + 2)
                .ok_or(CodecError::InvalidFrameField("ack"))?;
            start = end
                .checked_sub(range)
                .ok_or(CodecError::InvalidFrameField("ack"))?;
            blocks.push(AckBlock::new(start, end));
        }
        Ok(Frame::Ack(WriteAckFrame {
            ack_blocks: blocks,
            ack_delay: build::unscale_ack_delay(delay_scaled, self.ack_delay_exponent),
        }))
    }

    fn parse_stream(&mut self, type_byte: u64) -> Result<Frame, CodecError> {
        let stream_id = StreamId::new(self.varint()?);
        let offset = if type_byte & STREAM_FRAME_BIT_OFF != 0 {
            self.varint()?
        } else {
            0
        };
        let data = if type_byte & STREAM_FRAME_BIT_LEN != 0 {
            let len = self.varint()? as usize;
            self.take(len, "stream")?
        } else {
            // LEN absent: data runs to the end of the packet.
            self.buf.split_to(self.buf.remaining())
        };
        Ok(Frame::Stream(StreamFrame {
            stream_id,
            offset,
            data,
            fin: type_byte & STREAM_FRAME_BIT_FIN != 0,
        }))
    }

    fn parse_new_connection_id(&mut self) -> Result<Frame, CodecError> {
        let sequence_number = self.varint()?;
        let retire_prior_to = self.varint()?;
        if !self.buf.has_remaining() {
            return Err(CodecError::BufferTooShort);
        }
        let cid_len = self.buf.get_u8() as usize;
        if cid_len == 0 || cid_len > crate::types::MAX_CID_LENGTH {
            return Err(CodecError::InvalidCidLength(cid_len));
        }
        let cid_bytes = self.take(cid_len, "new_connection_id")?;
        let connection_id =
            ConnectionId::new(cid_bytes).ok_or(CodecError::InvalidCidLength(cid_len))?;
        let token_bytes = self.take(16, "new_connection_id")?;
        let mut stateless_reset_token = [0u8; 16];
        stateless_reset_token.copy_from_slice(&token_bytes);
        Ok(Frame::NewConnectionId(NewConnectionIdFrame {
            sequence_number,
            retire_prior_to,
            connection_id,
            stateless_reset_token,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_padding_run_coalesces() {
        let body = Bytes::from_static(&[0, 0, 0, 0, 0x01]);
        let frames = FrameDecoder::new(body, 3).decode_all().unwrap();
        assert_eq!(frames, vec![Frame::Padding, Frame::Ping]);
    }

    #[test]
    fn test_stream_len_absent_runs_to_end() {
        let mut body = BytesMut::new();
        // STREAM with OFF, no LEN, no FIN.
        body.put_u8((FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_OFF) as u8);
        body.put_u8(0x04); // stream id 4
        body.put_u8(0x10); // offset 16
        body.put_slice(b"tail data");
        let frames = FrameDecoder::new(body.freeze(), 3).decode_all().unwrap();
        match &frames[0] {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, StreamId::new(4));
                assert_eq!(s.offset, 16);
                assert_eq!(&s.data[..], b"tail data");
                assert!(!s.fin);
            }
            other => panic!("expected stream frame, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_with_malformed_gap_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(FRAME_TYPE_ACK as u8);
        body.put_u8(5); // largest
        body.put_u8(0); // delay
        body.put_u8(1); // one additional block
        body.put_u8(0); // first range
        body.put_u8(10); // gap larger than remaining space below zero
        body.put_u8(0);
        let err = FrameDecoder::new(body.freeze(), 3).decode_all().unwrap_err();
        assert_eq!(err, CodecError::InvalidFrameField("ack"));
    }

    #[test]
    fn test_ack_first_range_exceeding_largest_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(FRAME_TYPE_ACK as u8);
        body.put_u8(5); // largest
        body.put_u8(0); // delay
        body.put_u8(0); // no additional blocks
        body.put_u8(9); // first range > largest
        assert!(FrameDecoder::new(body.freeze(), 3).decode_all().is_err());
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut body = BytesMut::new();
        crate::types::VarIntCodec::encode(0x21, &mut body).unwrap();
        let err = FrameDecoder::new(body.freeze(), 3).decode_all().unwrap_err();
        assert_eq!(err, CodecError::UnknownFrameType(0x21));
    }

    #[test]
    fn test_truncated_crypto_frame() {
        let mut body = BytesMut::new();
        body.put_u8(FRAME_TYPE_CRYPTO as u8);
        body.put_u8(0); // offset
        body.put_u8(20); // claims 20 bytes
        body.put_slice(b"short");
        assert!(FrameDecoder::new(body.freeze(), 3).decode_all().is_err());
    }

    #[test]
    fn test_new_connection_id_zero_length_cid_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(FRAME_TYPE_NEW_CONNECTION_ID as u8);
        body.put_u8(1); // seq
        body.put_u8(0); // retire prior to
        body.put_u8(0); // zero-length cid
        body.put_slice(&[0u8; 16]);
        assert!(FrameDecoder::new(body.freeze(), 3).decode_all().is_err());
    }
}
