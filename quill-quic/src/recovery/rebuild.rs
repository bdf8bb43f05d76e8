//! Packet rebuild engine.
//!
//! A probe or a retransmission does not reserialize a lost packet byte for
//! byte; it materially resends the packet's work into a fresh packet under
//! the current state. Stale ACKs and window updates are regenerated, stream
//! and crypto data is cloned out of the retransmission buffers (skipped
//! when acknowledged, reset or expired in the meantime), path responses are
//! never cloned, and everything else is carried verbatim.
//!
//! The rebuilt packet shares the source packet's clone event, so one ACK
//! for any member of the family retires the work.

use crate::flow_control::ConnectionFlowControl;
use crate::frames::{build as frame_build, Frame, MaxDataFrame, MaxStreamDataFrame, StreamFrame};
use crate::packet::builder::PacketBuilder;
use crate::packet::outstanding::{OutstandingPacket, PacketEvent, PacketEventSet};
use crate::packet::space::PacketNumberSpaceState;
use crate::stream::{CryptoStream, StreamManager};
use crate::types::Instant;

/// Borrowed view of everything a rebuild consults.
pub struct PacketRebuilder<'a> {
    pub builder: &'a mut PacketBuilder,
    pub streams: &'a mut StreamManager,
    pub crypto_stream: &'a CryptoStream,
    pub conn_flow: &'a ConnectionFlowControl,
    pub space: &'a PacketNumberSpaceState,
    /// Path challenge currently awaiting a response, if any.
    pub outstanding_path_challenge: Option<u64>,
    pub now: Instant,
}

impl PacketRebuilder<'_> {
    /// Rebuild the writable content of `source` into the builder.
    ///
    /// Returns the clone event on success; `None` when the rebuild failed
    /// or would carry nothing but ACKs and padding (a useless probe).
    pub fn rebuild_from_packet(
        mut self,
        source: &mut OutstandingPacket,
        events: &mut PacketEventSet,
    ) -> Option<PacketEvent> {
        debug_assert!(!source.is_handshake, "handshake packets are not cloned");
        let mut not_pure_ack = false;
        for frame in source.packet.frames.clone() {
            let ok = match frame {
                Frame::Ack(_) => self.rebuild_ack(),
                Frame::Stream(ref f) => match self.rebuild_stream(f) {
                    RebuildOutcome::Written => {
                        not_pure_ack = true;
                        true
                    }
                    RebuildOutcome::Skipped => true,
                    RebuildOutcome::NoSpace => false,
                },
                Frame::Crypto(ref f) => match self.rebuild_crypto(f.offset, f.data.len() as u64) {
                    RebuildOutcome::Written => {
                        not_pure_ack = true;
                        true
                    }
                    RebuildOutcome::Skipped => true,
                    RebuildOutcome::NoSpace => false,
                },
                Frame::MaxData(_) => {
                    match self.conn_flow.recv.current_update() {
                        Some(maximum_data) => {
                            let written = self.builder.append_frame(Frame::MaxData(MaxDataFrame {
                                maximum_data,
                            }));
                            not_pure_ack |= written;
                            written
                        }
                        // Update already acknowledged: nothing to resend.
                        None => true,
                    }
                }
                Frame::MaxStreamData(ref f) => {
                    let update = self
                        .streams
                        .get(f.stream_id)
                        .and_then(|s| s.flow_control.recv.current_update());
                    match update {
                        Some(maximum_data) => {
                            let written =
                                self.builder.append_frame(Frame::MaxStreamData(MaxStreamDataFrame {
                                    stream_id: f.stream_id,
                                    maximum_data,
                                }));
                            not_pure_ack |= written;
                            written
                        }
                        None => true,
                    }
                }
                Frame::PathChallenge(ref f) => {
                    if self.outstanding_path_challenge == Some(f.path_data) {
                        let written = self.builder.append_frame(frame.clone());
                        not_pure_ack |= written;
                        written
                    } else {
                        // Validation finished or superseded.
                        true
                    }
                }
                // Cloning a PATH_RESPONSE would answer a challenge the
                // peer is no longer waiting on.
                Frame::PathResponse(_) => true,
                Frame::StopSending(ref f) => {
                    self.clone_if_stream_exists(f.stream_id.value(), &frame, &mut not_pure_ack)
                }
                Frame::MinStreamData(ref f) => {
                    self.clone_if_stream_exists(f.stream_id.value(), &frame, &mut not_pure_ack)
                }
                Frame::ExpiredStreamData(ref f) => {
                    self.clone_if_stream_exists(f.stream_id.value(), &frame, &mut not_pure_ack)
                }
                // Padding is re-added by the builder as needed for size.
                Frame::Padding | Frame::Noop => true,
                // Everything else clones verbatim.
                ref other => {
                    let written = self.builder.append_frame(other.clone());
                    not_pure_ack |= written;
                    written
                }
            };
            if !ok {
                return None;
            }
        }
        if !not_pure_ack {
            return None;
        }
        Some(clone_outstanding_packet(source, events))
    }

    fn rebuild_ack(&mut self) -> bool {
        let blocks = self.space.ack_intervals.blocks();
        if blocks.is_empty() {
            return true;
        }
        let Some(ack) = frame_build::plan_ack_frame(
            blocks,
            self.space.ack_delay(self.now),
            self.space.ack_delay_exponent,
            self.builder.remaining_space(),
        ) else {
            return false;
        };
        self.builder.append_frame(Frame::Ack(ack))
    }

    fn rebuild_stream(&mut self, f: &StreamFrame) -> RebuildOutcome {
        let Some(stream) = self.streams.get(f.stream_id) else {
            return RebuildOutcome::Skipped;
        };
        if !stream.retransmittable() {
            return RebuildOutcome::Skipped;
        }
        let Some(entry) = stream.retransmission_buffer.get(f.offset) else {
            // Acked, lost-and-resent, or expired since: nothing to clone.
            return RebuildOutcome::Skipped;
        };
        if entry.offset != f.offset || entry.len() != f.len() || entry.fin != f.fin {
            return RebuildOutcome::Skipped;
        }
        let clone = Frame::Stream(StreamFrame {
            stream_id: f.stream_id,
            offset: entry.offset,
            data: entry.data.clone(),
            fin: entry.fin,
        });
        if self.builder.append_frame(clone) {
            RebuildOutcome::Written
        } else {
            RebuildOutcome::NoSpace
        }
    }

    fn rebuild_crypto(&mut self, offset: u64, len: u64) -> RebuildOutcome {
        let Some(chunk) = self.crypto_stream.retransmission_chunk(offset) else {
            return RebuildOutcome::Skipped;
        };
        if chunk.len() != len {
            return RebuildOutcome::Skipped;
        }
        let clone = Frame::Crypto(crate::frames::CryptoFrame {
            offset,
            data: chunk.data.clone(),
        });
        if self.builder.append_frame(clone) {
            RebuildOutcome::Written
        } else {
            RebuildOutcome::NoSpace
        }
    }

    fn clone_if_stream_exists(
        &mut self,
        stream_id: u64,
        frame: &Frame,
        not_pure_ack: &mut bool,
    ) -> bool {
        if !self.streams.stream_exists(crate::types::StreamId::new(stream_id)) {
            return true;
        }
        let written = self.builder.append_frame(frame.clone());
        *not_pure_ack |= written;
        written
    }
}

enum RebuildOutcome {
    Written,
    Skipped,
    NoSpace,
}

/// Assign (or reuse) the clone event for `source`. At most one event entry
/// exists per original packet number.
fn clone_outstanding_packet(
    source: &mut OutstandingPacket,
    events: &mut PacketEventSet,
) -> PacketEvent {
    match source.associated_event {
        Some(event) => {
            debug_assert!(events.contains(event));
            event
        }
        None => {
            let event = source.packet.packet_number;
            let inserted = events.insert(event);
            debug_assert!(inserted, "event already registered for {event}");
            source.associated_event = Some(event);
            event
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransportParameters, TransportSettings};
    use crate::frames::{AckBlock, PathChallengeFrame, PathResponseFrame, WriteAckFrame};
    use crate::packet::header::{PacketHeader, ShortHeader};
    use crate::packet::outstanding::SentPacketMeta;
    use crate::stream::StreamBuffer;
    use crate::types::{ConnectionId, PacketNumberSpace, Side, StreamId};
    use bytes::Bytes;
    use core::time::Duration;
    use tinyvec::TinyVec;

    fn builder() -> PacketBuilder {
        PacketBuilder::new(
            1200,
            PacketHeader::Short(ShortHeader {
                dcid: ConnectionId::from_slice(&[1; 8]).unwrap(),
                packet_number: 50,
                key_phase: false,
            }),
            Some(10),
            16,
            3,
        )
    }

    fn streams_with_open_stream() -> (StreamManager, StreamId) {
        let mut mgr = StreamManager::new(Side::Client, &TransportSettings::default());
        let mut params = TransportParameters::default();
        params.initial_max_streams_bidi = 10;
        params.initial_max_stream_data_bidi_remote = 1 << 20;
        mgr.on_transport_parameters(&params);
        let id = mgr.open_local(true).unwrap();
        (mgr, id)
    }

    fn outstanding(frames: Vec<Frame>) -> OutstandingPacket {
        OutstandingPacket {
            packet: SentPacketMeta {
                space: PacketNumberSpace::AppData,
                packet_number: 7,
                frames,
            },
            send_time: Instant::from_millis(10),
            size: 300,
            is_handshake: false,
            ack_eliciting: true,
            associated_event: None,
        }
    }

    fn ack_frame() -> Frame {
        let mut blocks: TinyVec<[AckBlock; 8]> = TinyVec::new();
        blocks.push(AckBlock::new(0, 3));
        Frame::Ack(WriteAckFrame {
            ack_blocks: blocks,
            ack_delay: Duration::from_millis(1),
        })
    }

    struct Fixture {
        streams: StreamManager,
        stream_id: StreamId,
        crypto: CryptoStream,
        flow: ConnectionFlowControl,
        space: PacketNumberSpaceState,
        events: PacketEventSet,
    }

    impl Fixture {
        fn new() -> Self {
            let (streams, stream_id) = streams_with_open_stream();
            let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
            space.on_packet_received(3, Instant::from_millis(5), true, Duration::from_millis(25), 10);
            Self {
                streams,
                stream_id,
                crypto: CryptoStream::new(),
                flow: ConnectionFlowControl::new(1 << 20, 1 << 20),
                space,
                events: PacketEventSet::new(),
            }
        }

        fn rebuild(
            &mut self,
            builder: &mut PacketBuilder,
            source: &mut OutstandingPacket,
            challenge: Option<u64>,
        ) -> Option<PacketEvent> {
            PacketRebuilder {
                builder,
                streams: &mut self.streams,
                crypto_stream: &self.crypto,
                conn_flow: &self.flow,
                space: &self.space,
                outstanding_path_challenge: challenge,
                now: Instant::from_millis(20),
            }
            .rebuild_from_packet(source, &mut self.events)
        }
    }

    #[test]
    fn test_pure_ack_clone_suppressed() {
        let mut fixture = Fixture::new();
        let mut b = builder();
        let mut source = outstanding(vec![ack_frame()]);
        assert_eq!(fixture.rebuild(&mut b, &mut source, None), None);
        assert!(fixture.events.is_empty());
        assert!(source.associated_event.is_none());
    }

    #[test]
    fn test_stream_clone_carries_same_bytes() {
        let mut fixture = Fixture::new();
        let id = fixture.stream_id;
        {
            let stream = fixture.streams.get_mut(id).unwrap();
            stream.write(Bytes::from_static(b"payload"), true).unwrap();
            let chunk = stream.next_send_chunk(100).unwrap();
            stream.on_stream_frame_sent(chunk);
        }
        let mut b = builder();
        let mut source = outstanding(vec![
            ack_frame(),
            Frame::Stream(StreamFrame {
                stream_id: id,
                offset: 0,
                data: Bytes::from_static(b"payload"),
                fin: true,
            }),
        ]);
        let event = fixture.rebuild(&mut b, &mut source, None).unwrap();
        assert_eq!(event, 7);
        assert_eq!(source.associated_event, Some(7));
        assert!(fixture.events.contains(7));
        // Builder got a fresh ACK plus the cloned stream data.
        let has_stream = b.frames().iter().any(|f| {
            matches!(f, Frame::Stream(s) if &s.data[..] == b"payload" && s.fin && s.offset == 0)
        });
        assert!(has_stream);
    }

    #[test]
    fn test_closed_stream_clone_skipped_and_suppressed() {
        let mut fixture = Fixture::new();
        // Stream 4 never opened here: simulate "closed" by using an id the
        // manager does not know.
        let ghost = StreamId::new(8);
        let mut b = builder();
        let mut source = outstanding(vec![
            ack_frame(),
            Frame::Stream(StreamFrame {
                stream_id: ghost,
                offset: 0,
                data: Bytes::from_static(b"gone"),
                fin: false,
            }),
        ]);
        // STREAM skipped, only the regenerated ACK remains: suppressed.
        assert_eq!(fixture.rebuild(&mut b, &mut source, None), None);
    }

    #[test]
    fn test_acked_offset_not_recloned() {
        let mut fixture = Fixture::new();
        let id = fixture.stream_id;
        {
            let stream = fixture.streams.get_mut(id).unwrap();
            stream.write(Bytes::from_static(b"data"), false).unwrap();
            let chunk = stream.next_send_chunk(100).unwrap();
            stream.on_stream_frame_sent(chunk);
            stream.on_stream_frame_acked(0);
        }
        let mut b = builder();
        let mut source = outstanding(vec![Frame::Stream(StreamFrame {
            stream_id: id,
            offset: 0,
            data: Bytes::from_static(b"data"),
            fin: false,
        })]);
        assert_eq!(fixture.rebuild(&mut b, &mut source, None), None);
    }

    #[test]
    fn test_path_challenge_cloned_only_when_outstanding() {
        let mut fixture = Fixture::new();
        let challenge = Frame::PathChallenge(PathChallengeFrame { path_data: 0xabcd });
        let mut b = builder();
        let mut source = outstanding(vec![challenge.clone()]);
        let event = fixture.rebuild(&mut b, &mut source, Some(0xabcd));
        assert!(event.is_some());
        assert!(b.frames().contains(&challenge));

        // Different outstanding challenge: skip, pure-ack suppression.
        let mut fixture2 = Fixture::new();
        let mut b2 = builder();
        let mut source2 = outstanding(vec![challenge]);
        assert_eq!(fixture2.rebuild(&mut b2, &mut source2, Some(0x1111)), None);
    }

    #[test]
    fn test_path_response_never_cloned() {
        let mut fixture = Fixture::new();
        let mut b = builder();
        let mut source = outstanding(vec![
            Frame::PathResponse(PathResponseFrame { path_data: 1 }),
            Frame::Ping,
        ]);
        let event = fixture.rebuild(&mut b, &mut source, None);
        assert!(event.is_some());
        assert!(b.frames().iter().all(|f| !matches!(f, Frame::PathResponse(_))));
        assert!(b.frames().contains(&Frame::Ping));
    }

    #[test]
    fn test_window_update_regenerated_from_current_state() {
        let mut fixture = Fixture::new();
        // Consume enough to arm a pending window update.
        fixture.flow.recv.on_data_received(900_000).unwrap();
        fixture.flow.recv.on_consumed(900_000);
        let new_max = fixture.flow.recv.maybe_window_update().unwrap();
        let mut b = builder();
        let mut source = outstanding(vec![Frame::MaxData(MaxDataFrame {
            maximum_data: 123, // stale value from the lost packet
        })]);
        let event = fixture.rebuild(&mut b, &mut source, None);
        assert!(event.is_some());
        assert!(b
            .frames()
            .contains(&Frame::MaxData(MaxDataFrame { maximum_data: new_max })));
    }

    #[test]
    fn test_clone_event_unique_across_rebuilds() {
        let mut fixture = Fixture::new();
        let mut source = outstanding(vec![Frame::Ping]);
        let mut b1 = builder();
        let e1 = fixture.rebuild(&mut b1, &mut source, None).unwrap();
        let mut b2 = builder();
        let e2 = fixture.rebuild(&mut b2, &mut source, None).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(fixture.events.len(), 1);
    }

    #[test]
    fn test_crypto_clone_from_retransmission_buffer() {
        let mut fixture = Fixture::new();
        fixture.crypto.write(Bytes::from_static(b"ticket"));
        let chunk = fixture.crypto.next_send_chunk(100).unwrap();
        fixture.crypto.on_chunk_sent(chunk);
        let mut b = builder();
        let mut source = outstanding(vec![Frame::Crypto(crate::frames::CryptoFrame {
            offset: 0,
            data: Bytes::from_static(b"ticket"),
        })]);
        assert!(fixture.rebuild(&mut b, &mut source, None).is_some());

        // Once acked, the clone is skipped and the probe suppressed.
        fixture.crypto.on_chunk_acked(0);
        let mut fixture2 = Fixture::new();
        fixture2.events = PacketEventSet::new();
        let mut b2 = builder();
        let mut source2 = outstanding(vec![Frame::Crypto(crate::frames::CryptoFrame {
            offset: 0,
            data: Bytes::from_static(b"ticket"),
        })]);
        assert_eq!(fixture2.rebuild(&mut b2, &mut source2, None), None);
    }
}
