//! The connection: a single-owner, event-driven state machine tying the
//! codec, streams, flow control, recovery and path machinery together.
//!
//! All mutation happens on the worker that owns the connection; the
//! embedding layer feeds it events (`on_datagram_received`,
//! `handle_timeout`, application writes) and drains `write_packets`.
//! Nothing here blocks, and no lock is held across any callback.

pub mod cid;
pub mod cid_algo;
pub mod path;
pub mod state;


pub use cid::{ConnectionIdData, PeerConnectionIds, SelfConnectionIds};
pub use cid_algo::{
    ConnectionIdGenerator, RoutingConnectionIdGenerator, ServerConnectionIdParams,
};
pub use path::{PathState, PendingPathRateLimiter};
pub use state::{CloseCause, ConnectionLifecycle};

use std::collections::HashSet;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use core::time::Duration;

use crate::config::{TransportParameters, TransportSettings};
use crate::crypto::{AeadProvider, HeaderProtector};
use crate::error::{
    CodecError, ConnectionError, LocalError, Result, TransportErrorCode,
};
use crate::flow_control::ConnectionFlowControl;
use crate::frames::{
    build as frame_build, parse::FrameDecoder, ConnectionCloseFrame, DataBlockedFrame, Frame,
    MaxDataFrame, MaxStreamDataFrame, MaxStreamsFrame, PathChallengeFrame, PathResponseFrame,
    ResetStreamFrame, StreamDataBlockedFrame, StreamFrame, StreamsBlockedFrame,
};
use crate::packet::{
    builder::{BuiltPacket, PacketBuilder},
    header::{
        build_version_negotiation_packet, parse_header, LongHeader, LongHeaderType, PacketHeader,
        ParsedHeader, ShortHeader, LONG_RESERVED_MASK, PACKET_NUM_LEN_MASK,
    },
    number::{decode_packet_number, read_packet_number_bytes},
    outstanding::{OutstandingPacket, OutstandingPackets, PacketEventSet, SentPacketMeta},
    space::PacketNumberSpaceSet,
};
use crate::qlog::{
    space_label, PacketDropReason, QLogEmitter, QLogEventData, QLogObserver,
};
use crate::recovery::{
    is_persistent_congestion, AckEvent, CongestionController, LossDetector, LossEvent, Pacer,
    PacketRebuilder, RttEstimator,
};
use crate::runtime::{OutgoingDatagram, RoutingCallback};
use crate::stream::{CryptoStream, StreamBuffer, StreamManager};
use crate::types::{
    ConnectionId, Instant, PacketNumber, PacketNumberSpace, Side, StreamId,
    HEADER_PROTECTION_SAMPLE_SIZE, MIN_STATELESS_RESET_SIZE,
};

/// External collaborators handed to a new connection.
pub struct ConnectionDeps {
    pub aead: Box<dyn AeadProvider>,
    pub header_protector: Box<dyn HeaderProtector>,
    pub congestion: Box<dyn CongestionController>,
    pub cid_generator: Box<dyn ConnectionIdGenerator>,
    pub routing: Box<dyn RoutingCallback>,
    pub qlog: Box<dyn QLogObserver>,
}

/// Datapath counters for local-only anomalies.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub decrypt_failures: u64,
    pub dropped_unknown_dcid: u64,
    pub dropped_header_parse: u64,
    pub duplicate_packets: u64,
    pub stateless_resets_detected: u64,
}

pub struct Connection {
    side: Side,
    version: u32,
    settings: TransportSettings,
    lifecycle: ConnectionLifecycle,
    close_cause: Option<CloseCause>,

    spaces: PacketNumberSpaceSet,
    outstanding: [OutstandingPackets; 3],
    events: PacketEventSet,
    keys_available: [bool; 3],

    streams: StreamManager,
    crypto_streams: [CryptoStream; 3],
    conn_flow: ConnectionFlowControl,

    self_cids: SelfConnectionIds,
    peer_cids: PeerConnectionIds,
    local_cid_len: usize,
    cid_generator: Box<dyn ConnectionIdGenerator>,

    path: PathState,

    rtt: RttEstimator,
    loss: LossDetector,
    congestion: Box<dyn CongestionController>,
    pacer: Pacer,

    aead: Box<dyn AeadProvider>,
    header_protector: Box<dyn HeaderProtector>,
    routing: Box<dyn RoutingCallback>,
    qlog: QLogEmitter,

    peer_params: Option<TransportParameters>,
    /// Control frames awaiting a packet (the "simple frame" queue).
    pending_frames: Vec<Frame>,
    /// Connection-level window update waiting to go out.
    window_update_queued: bool,
    /// Streams with a window update waiting to go out.
    stream_window_updates: HashSet<StreamId>,
    /// Version negotiation response owed to an unknown-version client.
    pending_version_negotiation: Option<(ConnectionId, ConnectionId)>,
    /// CONNECTION_CLOSE owed to the peer.
    close_frame_pending: bool,
    /// One close echo is allowed while Closing.
    close_echo_spent: bool,

    idle_deadline: Option<Instant>,
    drain_deadline: Option<Instant>,
    pto_probes_pending: u32,
    unbound_fired: bool,

    pub stats: ConnectionStats,
}

impl Connection {
    /// `local_cid` is the id we told the peer to address us with;
    /// `peer_cid` the handshake-chosen id we address the peer with.
    pub fn new(
        side: Side,
        version: u32,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
        peer_address: SocketAddr,
        settings: TransportSettings,
        start: Instant,
        deps: ConnectionDeps,
    ) -> Self {
        let local_cid_len = local_cid.len();
        let streams = StreamManager::new(side, &settings);
        let conn_flow = ConnectionFlowControl::new(0, settings.advertised_connection_window);
        let pacer = Pacer::new(&settings);
        let rtt = RttEstimator::new(settings.initial_rtt);
        let loss = LossDetector::new(settings.packet_reorder_threshold);
        let mut routing = deps.routing;
        routing.on_connection_id_bound(&local_cid);
        let idle_deadline = start.checked_add(settings.idle_timeout);
        Self {
            side,
            version,
            lifecycle: ConnectionLifecycle::Handshaking,
            close_cause: None,
            spaces: PacketNumberSpaceSet::new(),
            outstanding: [
                OutstandingPackets::new(),
                OutstandingPackets::new(),
                OutstandingPackets::new(),
            ],
            events: PacketEventSet::new(),
            keys_available: [true, false, false],
            streams,
            crypto_streams: [
                CryptoStream::new(),
                CryptoStream::new(),
                CryptoStream::new(),
            ],
            conn_flow,
            self_cids: SelfConnectionIds::new(local_cid),
            peer_cids: PeerConnectionIds::new(
                peer_cid,
                settings.self_active_connection_id_limit,
            ),
            local_cid_len,
            cid_generator: deps.cid_generator,
            path: PathState::new(peer_address, side.is_client()),
            rtt,
            loss,
            congestion: deps.congestion,
            pacer,
            aead: deps.aead,
            header_protector: deps.header_protector,
            routing,
            qlog: QLogEmitter::new(deps.qlog, start),
            peer_params: None,
            pending_frames: Vec::new(),
            window_update_queued: false,
            stream_window_updates: HashSet::new(),
            pending_version_negotiation: None,
            close_frame_pending: false,
            close_echo_spent: false,
            idle_deadline,
            drain_deadline: None,
            pto_probes_pending: 0,
            unbound_fired: false,
            stats: ConnectionStats::default(),
            settings,
        }
    }

    // ==================================================================
    // Accessors
    // ==================================================================

    pub fn lifecycle(&self) -> ConnectionLifecycle {
        self.lifecycle
    }

    pub fn close_cause(&self) -> Option<&CloseCause> {
        self.close_cause.as_ref()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.path.peer_address
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.outstanding
            .iter()
            .map(OutstandingPackets::bytes_outstanding)
            .sum()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn pacer_mut(&mut self) -> &mut Pacer {
        &mut self.pacer
    }

    pub fn peer_connection_ids(&self) -> &PeerConnectionIds {
        &self.peer_cids
    }

    pub fn self_connection_ids(&self) -> &SelfConnectionIds {
        &self.self_cids
    }

    fn space_exponent(&self, space: PacketNumberSpace) -> u64 {
        self.spaces.get(space).ack_delay_exponent
    }

    fn max_ack_delay(&self) -> Duration {
        self.peer_params
            .as_ref()
            .map(|p| p.max_ack_delay)
            .unwrap_or(self.settings.max_ack_delay)
    }

    // ==================================================================
    // External events
    // ==================================================================

    /// Keys for `space` became available from the TLS collaborator.
    pub fn on_key_available(&mut self, space: PacketNumberSpace) {
        self.keys_available[space as usize] = true;
    }

    /// Handshake complete: the connection is Established and the
    /// handshake spaces retire.
    pub fn on_handshake_complete(&mut self, now: Instant) {
        if self.lifecycle != ConnectionLifecycle::Handshaking {
            return;
        }
        self.lifecycle = ConnectionLifecycle::Established;
        self.discard_space(PacketNumberSpace::Initial);
        self.discard_space(PacketNumberSpace::Handshake);
        // Post-handshake the server hands out routable ids.
        let frames = self.self_cids.issue_up_to_limit(self.cid_generator.as_mut());
        for frame in frames {
            if let Some(source) = self.self_cids.ids().next().map(|d| d.cid.clone()) {
                self.routing
                    .on_connection_id_available(&source, &frame.connection_id);
            }
            self.pending_frames.push(Frame::NewConnectionId(frame));
        }
        self.emit_qlog(
            now,
            QLogEventData::ConnectivityStateUpdate {
                state: self.lifecycle.label().to_string(),
            },
        );
    }

    /// Peer transport parameters arrived (authenticated by TLS).
    pub fn on_transport_parameters(&mut self, params: TransportParameters) {
        self.conn_flow.send.on_limit_update(params.initial_max_data);
        self.streams.on_transport_parameters(&params);
        self.self_cids
            .set_peer_limit(params.active_connection_id_limit);
        self.peer_params = Some(params);
    }

    /// Handshake bytes from the TLS collaborator for `space`.
    pub fn write_crypto(&mut self, space: PacketNumberSpace, data: Bytes) {
        self.crypto_streams[space as usize].write(data);
    }

    /// In-order handshake bytes for the TLS collaborator.
    pub fn read_crypto(&mut self, space: PacketNumberSpace, max_len: usize) -> Option<Bytes> {
        self.crypto_streams[space as usize].read(max_len)
    }

    // ==================================================================
    // Application surface
    // ==================================================================

    pub fn open_stream(&mut self, bidirectional: bool) -> Result<StreamId> {
        let result = self.streams.open_local(bidirectional);
        if result.is_err() {
            if let Some(limit) = self.streams.maybe_streams_blocked(bidirectional) {
                self.pending_frames
                    .push(Frame::StreamsBlocked(StreamsBlockedFrame {
                        stream_limit: limit,
                        bidirectional,
                    }));
            }
        }
        result
    }

    pub fn write_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(ConnectionError::transport(
            TransportErrorCode::StreamStateError,
            "write on unknown stream",
        ))?;
        stream.write(data, fin)
    }

    pub fn read_stream(&mut self, id: StreamId, max_len: usize) -> Option<Bytes> {
        let data = self.streams.get_mut(id)?.read(max_len)?;
        self.conn_flow.recv.on_consumed(data.len() as u64);
        if self.conn_flow.recv.maybe_window_update().is_some() {
            self.window_update_queued = true;
        }
        let stream_update = self
            .streams
            .get_mut(id)
            .and_then(|s| s.flow_control.recv.maybe_window_update())
            .is_some();
        if stream_update {
            self.stream_window_updates.insert(id);
        }
        Some(data)
    }

    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(ConnectionError::transport(
            TransportErrorCode::StreamStateError,
            "reset on unknown stream",
        ))?;
        let final_size = stream.send_offset;
        stream.reset_send();
        self.pending_frames.push(Frame::ResetStream(ResetStreamFrame {
            stream_id: id,
            error_code,
            final_size,
        }));
        Ok(())
    }

    /// Application-requested close.
    pub fn close(&mut self, now: Instant, error_code: u64) {
        self.begin_close(now, CloseCause::Local(ConnectionError::Application { code: error_code }));
    }

    // ==================================================================
    // Receive path
    // ==================================================================

    pub fn on_datagram_received(&mut self, now: Instant, src: SocketAddr, datagram: Bytes) {
        match self.lifecycle {
            ConnectionLifecycle::Closed | ConnectionLifecycle::Draining => return,
            ConnectionLifecycle::Closing => {
                // One CONNECTION_CLOSE echo, then silence.
                if !self.close_echo_spent {
                    self.close_echo_spent = true;
                    self.close_frame_pending = true;
                }
                self.emit_qlog(
                    now,
                    QLogEventData::PacketDropped {
                        reason: PacketDropReason::Closing,
                        size: datagram.len(),
                    },
                );
                return;
            }
            _ => {}
        }

        let mut cursor = datagram.clone();
        while cursor.has_remaining() {
            let packet_bytes = cursor.clone();
            let before = cursor.remaining();
            let mut parse_cursor = cursor.clone();
            let parsed = match parse_header(&mut parse_cursor, self.local_cid_len) {
                Ok(parsed) => parsed,
                Err(_) => {
                    self.stats.dropped_header_parse += 1;
                    self.emit_qlog(
                        now,
                        QLogEventData::PacketDropped {
                            reason: PacketDropReason::HeaderParseError,
                            size: before,
                        },
                    );
                    return;
                }
            };
            let header_len = before - parse_cursor.remaining();

            match parsed {
                ParsedHeader::VersionNegotiation(_) => {
                    if self.side.is_client() && self.lifecycle == ConnectionLifecycle::Handshaking {
                        self.begin_close(
                            now,
                            CloseCause::Local(ConnectionError::Local(
                                LocalError::VersionMismatch(0),
                            )),
                        );
                    }
                    return;
                }
                ParsedHeader::Retry(retry) => {
                    self.on_retry(retry.scid, retry.retry_token);
                    return;
                }
                ParsedHeader::Long(header) => {
                    if header.version != self.version {
                        if self.side.is_server() {
                            self.pending_version_negotiation =
                                Some((header.scid.clone(), header.dcid.clone()));
                        }
                        self.emit_qlog(
                            now,
                            QLogEventData::PacketDropped {
                                reason: PacketDropReason::VersionMismatch,
                                size: before,
                            },
                        );
                        return;
                    }
                    let space = match header.packet_type {
                        LongHeaderType::Initial => PacketNumberSpace::Initial,
                        LongHeaderType::Handshake => PacketNumberSpace::Handshake,
                        LongHeaderType::ZeroRtt | LongHeaderType::Retry => {
                            PacketNumberSpace::AppData
                        }
                    };
                    let payload_len = header.payload_len as usize;
                    if parse_cursor.remaining() < payload_len {
                        self.stats.dropped_header_parse += 1;
                        return;
                    }
                    let packet_total = header_len + payload_len;
                    self.process_protected(
                        now,
                        src,
                        packet_bytes.slice(..packet_total),
                        space,
                        header_len,
                        false,
                    );
                    if !self.lifecycle.is_open() {
                        return;
                    }
                    cursor.advance(packet_total);
                }
                ParsedHeader::Short(header) => {
                    if !self.self_cids.contains(&header.dcid) {
                        self.on_unknown_dcid_packet(now, &datagram);
                        return;
                    }
                    let packet_total = packet_bytes.len();
                    self.process_protected(
                        now,
                        src,
                        packet_bytes,
                        PacketNumberSpace::AppData,
                        header_len,
                        true,
                    );
                    cursor.advance(packet_total);
                }
            }
        }
    }

    /// A short-header datagram whose DCID we do not recognize: either a
    /// stateless reset from the peer, or noise to drop.
    fn on_unknown_dcid_packet(&mut self, now: Instant, datagram: &Bytes) {
        if datagram.len() >= MIN_STATELESS_RESET_SIZE {
            let tail = &datagram[datagram.len() - 16..];
            let mut token = [0u8; 16];
            token.copy_from_slice(tail);
            if self.peer_cids.matches_reset_token(&token) {
                self.stats.stateless_resets_detected += 1;
                self.enter_draining(now);
                return;
            }
        }
        self.stats.dropped_unknown_dcid += 1;
        self.emit_qlog(
            now,
            QLogEventData::PacketDropped {
                reason: PacketDropReason::UnknownDestinationConnectionId,
                size: datagram.len(),
            },
        );
    }

    fn on_retry(&mut self, new_peer_cid: ConnectionId, _retry_token: Bytes) {
        // Only a client still in its first flight honors Retry; the token
        // is surfaced to the handshake layer out of band.
        if self.side.is_client()
            && self.lifecycle == ConnectionLifecycle::Handshaking
            && self.outstanding[PacketNumberSpace::Handshake as usize].is_empty()
        {
            self.peer_cids = PeerConnectionIds::new(
                new_peer_cid,
                self.settings.self_active_connection_id_limit,
            );
        }
    }

    /// Unprotect, decrypt and dispatch one packet.
    fn process_protected(
        &mut self,
        now: Instant,
        src: SocketAddr,
        packet_bytes: Bytes,
        space: PacketNumberSpace,
        pn_offset: usize,
        is_short: bool,
    ) {
        if !self.keys_available[space as usize] || self.spaces.get(space).discarded {
            return;
        }
        let protected = &packet_bytes[pn_offset..];
        if protected.len() < 4 + HEADER_PROTECTION_SAMPLE_SIZE {
            self.stats.dropped_header_parse += 1;
            return;
        }
        let sample = &protected[4..4 + HEADER_PROTECTION_SAMPLE_SIZE];
        let mut first_byte = packet_bytes[0];
        let mut pn_bytes = [0u8; 4];
        pn_bytes.copy_from_slice(&protected[..4]);
        self.header_protector
            .unprotect(space, &mut first_byte, &mut pn_bytes, sample);
        let pn_len = (first_byte & PACKET_NUM_LEN_MASK) as usize + 1;
        let Some(truncated) = read_packet_number_bytes(&pn_bytes, pn_len) else {
            self.stats.dropped_header_parse += 1;
            return;
        };
        let pn = decode_packet_number(self.spaces.get(space).largest_received(), truncated, pn_len);

        // Associated data: the header with protection removed.
        let mut ad = packet_bytes[..pn_offset + pn_len].to_vec();
        ad[0] = first_byte;
        ad[pn_offset..pn_offset + pn_len].copy_from_slice(&pn_bytes[..pn_len]);

        let ciphertext = packet_bytes.slice(pn_offset + pn_len..);
        let body = match self.aead.open(space, &ad, pn, ciphertext) {
            Ok(body) => body,
            Err(_) => {
                self.stats.decrypt_failures += 1;
                self.emit_qlog(
                    now,
                    QLogEventData::PacketDropped {
                        reason: PacketDropReason::DecryptionFailure,
                        size: packet_bytes.len(),
                    },
                );
                return;
            }
        };

        // Reserved bits are authenticated zero.
        let reserved = if is_short {
            first_byte & crate::packet::header::SHORT_RESERVED_MASK
        } else {
            first_byte & LONG_RESERVED_MASK
        };
        if reserved != 0 {
            self.begin_close(
                now,
                CloseCause::Local(ConnectionError::transport(
                    TransportErrorCode::ProtocolViolation,
                    "reserved header bits set",
                )),
            );
            return;
        }

        if self.spaces.get(space).ack_intervals.contains(pn) {
            self.stats.duplicate_packets += 1;
            return;
        }

        let frames = match FrameDecoder::new(body, self.space_exponent(space)).decode_all() {
            Ok(frames) => frames,
            Err(err) => {
                self.on_frame_decode_error(now, err);
                return;
            }
        };

        self.emit_qlog(
            now,
            QLogEventData::PacketReceived {
                space: space_label(space),
                packet_number: pn,
                size: packet_bytes.len(),
            },
        );
        self.process_frames(now, src, space, pn, frames, is_short);
    }

    fn on_frame_decode_error(&mut self, now: Instant, _err: CodecError) {
        self.begin_close(
            now,
            CloseCause::Local(ConnectionError::transport(
                TransportErrorCode::FrameEncodingError,
                "malformed frame",
            )),
        );
    }

    fn process_frames(
        &mut self,
        now: Instant,
        src: SocketAddr,
        space: PacketNumberSpace,
        pn: PacketNumber,
        frames: Vec<Frame>,
        is_short: bool,
    ) {
        let from_changed_address = src != self.path.peer_address;
        if from_changed_address
            && is_short
            && self.lifecycle == ConnectionLifecycle::Established
        {
            if self.settings.disable_migration {
                return;
            }
            if let Err(err) = self.begin_migration(now, src) {
                self.begin_close(now, CloseCause::Local(err));
                return;
            }
        }

        let mut ack_eliciting = false;
        for frame in frames {
            ack_eliciting |= frame.is_ack_eliciting();
            if let Err(err) = self.on_frame(now, space, frame, from_changed_address) {
                self.begin_close(now, CloseCause::Local(err));
                return;
            }
            if !self.lifecycle.is_open() {
                return;
            }
        }

        let max_ack_delay = self.max_ack_delay();
        let threshold = self.settings.rx_packets_before_ack;
        self.spaces
            .get_mut(space)
            .on_packet_received(pn, now, ack_eliciting, max_ack_delay, threshold);

        if space == PacketNumberSpace::Handshake && self.side.is_server() {
            // A handshake packet proves the peer owns its address.
            self.path.peer_address_validated = true;
        }
        self.refresh_idle_deadline(now);
    }

    fn on_frame(
        &mut self,
        now: Instant,
        space: PacketNumberSpace,
        frame: Frame,
        from_changed_address: bool,
    ) -> Result<()> {
        match frame {
            Frame::Padding | Frame::Ping | Frame::Noop => Ok(()),
            Frame::Ack(ack) => self.process_ack(now, space, ack),
            Frame::Stream(f) => self.on_stream_frame(f),
            Frame::Crypto(f) => {
                self.crypto_streams[space as usize].on_data_received(f.offset, f.data)
            }
            Frame::NewToken(_) => Ok(()), // surfaced to the session cache out of band
            Frame::ResetStream(f) => {
                if let Some(stream) = self.streams.get_or_create_remote(f.stream_id)? {
                    stream.on_reset_received(f.error_code, f.final_size)?;
                }
                Ok(())
            }
            Frame::StopSending(f) => {
                if let Some(stream) = self.streams.get_or_create_remote(f.stream_id)? {
                    let final_size = stream.send_offset;
                    stream.reset_send();
                    self.pending_frames.push(Frame::ResetStream(ResetStreamFrame {
                        stream_id: f.stream_id,
                        error_code: f.error_code,
                        final_size,
                    }));
                }
                Ok(())
            }
            Frame::MaxData(f) => {
                self.conn_flow.send.on_limit_update(f.maximum_data);
                Ok(())
            }
            Frame::MaxStreamData(f) => {
                if let Some(stream) = self.streams.get_or_create_remote(f.stream_id)? {
                    stream.flow_control.send.on_limit_update(f.maximum_data);
                }
                Ok(())
            }
            Frame::MaxStreams(f) => {
                self.streams.on_max_streams(f.max_streams, f.bidirectional);
                Ok(())
            }
            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) | Frame::StreamsBlocked(_) => {
                // The peer is starving; make sure any due updates move.
                if self.conn_flow.recv.maybe_window_update().is_some() {
                    self.window_update_queued = true;
                }
                Ok(())
            }
            Frame::NewConnectionId(f) => {
                let retires = self.peer_cids.on_new_connection_id(&f)?;
                for retire in retires {
                    self.pending_frames.push(Frame::RetireConnectionId(retire));
                }
                Ok(())
            }
            Frame::RetireConnectionId(f) => {
                let retired = self.self_cids.on_retire_connection_id(&f)?;
                if retired.is_some() {
                    // Below the limit again: replace the id.
                    let frames = self
                        .self_cids
                        .issue_up_to_limit(self.cid_generator.as_mut());
                    for frame in frames {
                        if let Some(source) =
                            self.self_cids.ids().next().map(|d| d.cid.clone())
                        {
                            self.routing
                                .on_connection_id_available(&source, &frame.connection_id);
                        }
                        self.pending_frames.push(Frame::NewConnectionId(frame));
                    }
                }
                Ok(())
            }
            Frame::PathChallenge(f) => {
                self.pending_frames
                    .push(Frame::PathResponse(PathResponseFrame {
                        path_data: f.path_data,
                    }));
                Ok(())
            }
            Frame::PathResponse(f) => {
                if from_changed_address || !self.path.response_matches(f.path_data) {
                    return Ok(());
                }
                if let Some(sample) = self.path.on_validation_success(now) {
                    self.rtt.update(sample, Duration::ZERO, None);
                }
                self.emit_qlog(now, QLogEventData::PathValidation { success: true });
                Ok(())
            }
            Frame::ConnectionClose(f) => {
                self.close_cause = Some(CloseCause::Peer {
                    error_code: f.error_code,
                    application: f.application,
                    reason: f.reason,
                });
                self.enter_draining(now);
                Ok(())
            }
            Frame::MinStreamData(f) => {
                if !self.settings.partial_reliability_enabled {
                    return Ok(());
                }
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.flow_control.send.on_limit_update(f.maximum_data);
                    stream.advance_minimum_retransmittable_offset(f.minimum_stream_offset);
                }
                Ok(())
            }
            Frame::ExpiredStreamData(f) => {
                if !self.settings.partial_reliability_enabled {
                    return Ok(());
                }
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.advance_receive_offset(f.minimum_stream_offset);
                }
                Ok(())
            }
        }
    }

    fn on_stream_frame(&mut self, f: StreamFrame) -> Result<()> {
        let Some(stream) = self.streams.get_or_create_remote(f.stream_id)? else {
            return Ok(());
        };
        let growth = stream.on_stream_frame_received(f.offset, f.data, f.fin)?;
        if growth > 0 {
            let highest = self.conn_flow.recv.highest_received() + growth;
            self.conn_flow.recv.on_data_received(highest)?;
        }
        Ok(())
    }

    // ==================================================================
    // ACK processing
    // ==================================================================

    fn process_ack(
        &mut self,
        now: Instant,
        space: PacketNumberSpace,
        ack: crate::frames::WriteAckFrame,
    ) -> Result<()> {
        let largest_acked = ack.largest_acked();
        if largest_acked >= self.spaces.get(space).peek_next_packet_number() {
            return Err(ConnectionError::transport(
                TransportErrorCode::ProtocolViolation,
                "ack for unsent packet",
            ));
        }
        self.spaces.get_mut(space).on_ack_received(largest_acked);

        let acked = self.outstanding[space as usize].remove_acked(&ack.ack_blocks);
        if let Some(largest_pkt) = acked.iter().find(|p| p.packet_number() == largest_acked) {
            if largest_pkt.ack_eliciting {
                let sample = now.saturating_duration_since(largest_pkt.send_time);
                let cap = if space == PacketNumberSpace::AppData {
                    Some(self.max_ack_delay())
                } else {
                    Some(Duration::ZERO)
                };
                self.rtt.update(sample, ack.ack_delay, cap);
            }
        }

        let acked_bytes: u64 = acked.iter().map(|p| p.size as u64).sum();
        if !acked.is_empty() {
            let largest_acked_sent_time = acked
                .iter()
                .rev()
                .map(|p| p.send_time)
                .next()
                .unwrap_or(now);
            for packet in &acked {
                self.handle_acked_packet(space, packet);
            }
            let ack_event = AckEvent {
                acked_bytes,
                largest_acked,
                largest_acked_sent_time,
            };
            self.congestion.on_packet_ack_or_loss(Some(&ack_event), None);
        }

        self.loss.on_ack_received();
        let sweep = {
            let largest = self.spaces.get(space).largest_acked_by_peer;
            self.loss.detect_lost_packets(
                space,
                &mut self.outstanding[space as usize],
                largest,
                &self.rtt,
                now,
            )
        };
        self.handle_lost_packets(now, space, sweep.lost_packets);

        if self.settings.pacing_enabled {
            self.pacer
                .refresh_pacing_rate(self.congestion.congestion_window(), self.rtt.smoothed_rtt());
        }
        self.streams.remove_closed();
        self.emit_qlog(
            now,
            QLogEventData::MetricUpdate {
                congestion_window: self.congestion.congestion_window(),
                bytes_in_flight: self.congestion.bytes_in_flight(),
                smoothed_rtt_us: self.rtt.smoothed_rtt().as_micros() as u64,
                latest_rtt_us: self.rtt.latest_rtt().as_micros() as u64,
            },
        );
        Ok(())
    }

    fn handle_acked_packet(&mut self, space: PacketNumberSpace, packet: &OutstandingPacket) {
        if let Some(event) = packet.associated_event {
            if !self.events.remove(event) {
                // A sibling clone already delivered this work.
                return;
            }
        }
        for frame in &packet.packet.frames {
            match frame {
                Frame::Stream(f) => {
                    if let Some(stream) = self.streams.get_mut(f.stream_id) {
                        stream.on_stream_frame_acked(f.offset);
                    }
                }
                Frame::Crypto(f) => {
                    self.crypto_streams[space as usize].on_chunk_acked(f.offset);
                }
                Frame::Ack(inner) => {
                    self.spaces
                        .get_mut(space)
                        .ack_intervals
                        .prune_below(inner.largest_acked());
                }
                Frame::MaxData(_) => {
                    self.conn_flow.recv.on_update_acked();
                    self.window_update_queued = false;
                }
                Frame::MaxStreamData(f) => {
                    if let Some(stream) = self.streams.get_mut(f.stream_id) {
                        stream.flow_control.recv.on_update_acked();
                    }
                    self.stream_window_updates.remove(&f.stream_id);
                }
                Frame::ResetStream(f) => {
                    if let Some(stream) = self.streams.get_mut(f.stream_id) {
                        stream.on_reset_acked();
                    }
                }
                _ => {}
            }
        }
    }

    // ==================================================================
    // Loss handling
    // ==================================================================

    fn handle_lost_packets(
        &mut self,
        now: Instant,
        space: PacketNumberSpace,
        lost: Vec<OutstandingPacket>,
    ) {
        if lost.is_empty() {
            return;
        }
        let lost_bytes: u64 = lost.iter().map(|p| p.size as u64).sum();
        let largest_lost = lost.iter().map(|p| p.packet_number()).max().unwrap_or(0);
        let largest_lost_sent_time = lost
            .iter()
            .map(|p| p.send_time)
            .max()
            .unwrap_or(now);
        let persistent = is_persistent_congestion(&lost, &self.rtt, self.max_ack_delay());

        for packet in &lost {
            if let Some(event) = packet.associated_event {
                if !self.events.contains(event) {
                    // Work already delivered by an acked sibling.
                    continue;
                }
            }
            for frame in &packet.packet.frames {
                self.on_frame_lost(space, frame);
            }
        }

        let loss_event = LossEvent {
            lost_bytes,
            largest_lost_sent_time,
            persistent_congestion: persistent,
        };
        self.congestion.on_packet_ack_or_loss(None, Some(&loss_event));
        self.pacer.on_packets_loss();
        self.emit_qlog(
            now,
            QLogEventData::PacketsLost {
                largest_lost_packet_num: largest_lost,
                lost_bytes,
                lost_packets: lost.len(),
            },
        );
    }

    fn on_frame_lost(&mut self, space: PacketNumberSpace, frame: &Frame) {
        match frame {
            Frame::Stream(f) => {
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.on_stream_frame_lost(f.offset);
                }
            }
            Frame::Crypto(f) => {
                self.crypto_streams[space as usize].on_chunk_lost(f.offset);
            }
            Frame::MaxData(_) => {
                if self.conn_flow.recv.current_update().is_some() {
                    self.window_update_queued = true;
                }
            }
            Frame::MaxStreamData(f) => {
                let pending = self
                    .streams
                    .get(f.stream_id)
                    .and_then(|s| s.flow_control.recv.current_update())
                    .is_some();
                if pending {
                    self.stream_window_updates.insert(f.stream_id);
                }
            }
            Frame::ResetStream(f) => {
                if self.streams.stream_exists(f.stream_id) {
                    self.pending_frames.push(frame.clone());
                }
            }
            Frame::StopSending(f) => {
                if self.streams.stream_exists(f.stream_id) {
                    self.pending_frames.push(frame.clone());
                }
            }
            Frame::PathChallenge(f) => {
                if self.path.outstanding_path_validation == Some(f.path_data) {
                    self.path.pending_challenge = Some(f.path_data);
                    self.path.outstanding_path_validation = None;
                }
            }
            Frame::PathResponse(_) => {}
            Frame::MaxStreams(_) | Frame::NewConnectionId(_) | Frame::RetireConnectionId(_) => {
                self.pending_frames.push(frame.clone());
            }
            Frame::MinStreamData(f) => {
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.advance_receive_offset(f.minimum_stream_offset);
                }
            }
            Frame::ExpiredStreamData(f) => {
                if let Some(stream) = self.streams.get_mut(f.stream_id) {
                    stream.advance_minimum_retransmittable_offset(f.minimum_stream_offset);
                }
            }
            _ => {}
        }
    }

    // ==================================================================
    // Migration
    // ==================================================================

    fn begin_migration(&mut self, now: Instant, new_address: SocketAddr) -> Result<()> {
        if self.path.migration_in_progress() && self.path.peer_address == new_address {
            return Ok(());
        }
        let Some(retire) = self.peer_cids.retire_and_switch() else {
            return Err(ConnectionError::transport(
                TransportErrorCode::InvalidMigration,
                "no spare connection id for migration",
            ));
        };
        self.pending_frames.push(Frame::RetireConnectionId(retire));
        let mut challenge_bytes = [0u8; 8];
        if getrandom::getrandom(&mut challenge_bytes).is_err() {
            challenge_bytes = now.as_nanos().to_be_bytes();
        }
        let challenge = u64::from_be_bytes(challenge_bytes);
        tracing::debug!(%new_address, "peer address changed, probing new path");
        let deadline = now
            + path::path_validation_timeout(
                self.rtt.pto(self.max_ack_delay(), 0),
                self.settings.initial_rtt,
            );
        self.path.begin_migration(new_address, challenge, deadline);
        Ok(())
    }

    // ==================================================================
    // Close / drain
    // ==================================================================

    fn begin_close(&mut self, now: Instant, cause: CloseCause) {
        if !self.lifecycle.is_open() {
            return;
        }
        let wire_visible = match &cause {
            CloseCause::Local(err) => err.is_wire_visible(),
            CloseCause::Peer { .. } => false,
        };
        tracing::debug!(?cause, wire_visible, "closing connection");
        self.close_cause = Some(cause);
        if wire_visible {
            self.lifecycle = ConnectionLifecycle::Closing;
            self.close_frame_pending = true;
            let deadline = now + 3 * self.rtt.pto(self.max_ack_delay(), 0);
            self.drain_deadline = Some(deadline);
        } else {
            // Local-only errors tear down silently.
            self.finalize_close();
            return;
        }
        // Pending application state is dropped on close.
        self.streams.discard_all();
        self.pending_frames.clear();
        self.window_update_queued = false;
        self.stream_window_updates.clear();
        self.idle_deadline = None;
        self.emit_qlog(
            now,
            QLogEventData::ConnectivityStateUpdate {
                state: self.lifecycle.label().to_string(),
            },
        );
    }

    fn enter_draining(&mut self, now: Instant) {
        if matches!(
            self.lifecycle,
            ConnectionLifecycle::Draining | ConnectionLifecycle::Closed
        ) {
            return;
        }
        self.lifecycle = ConnectionLifecycle::Draining;
        self.idle_deadline = None;
        self.drain_deadline = Some(now + 3 * self.rtt.pto(self.max_ack_delay(), 0));
        self.emit_qlog(
            now,
            QLogEventData::ConnectivityStateUpdate {
                state: self.lifecycle.label().to_string(),
            },
        );
    }

    fn finalize_close(&mut self) {
        self.lifecycle = ConnectionLifecycle::Closed;
        self.drain_deadline = None;
        self.idle_deadline = None;
        if !self.unbound_fired {
            self.unbound_fired = true;
            let ids: Vec<ConnectionId> =
                self.self_cids.ids().map(|d| d.cid.clone()).collect();
            let source = ids.first().cloned().unwrap_or_else(ConnectionId::empty);
            self.routing.on_connection_unbound(&source, &ids);
        }
    }

    // ==================================================================
    // Timers
    // ==================================================================

    /// Earliest pending timer deadline, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                earliest = Some(match earliest {
                    Some(e) if e <= d => e,
                    _ => d,
                });
            }
        };
        consider(self.drain_deadline);
        if self.lifecycle.is_open() {
            consider(self.idle_deadline);
            consider(self.path.validation_deadline);
            consider(self.loss.earliest_loss_time().map(|(t, _)| t));
            for space in PacketNumberSpace::ALL {
                consider(self.spaces.get(space).ack_deadline());
            }
            consider(self.pto_deadline().map(|(t, _)| t));
        }
        earliest
    }

    /// Earliest PTO deadline across spaces, with the space it belongs to.
    /// Each space anchors its own alarm at its oldest ACK-eliciting packet
    /// and carries its own backoff.
    fn pto_deadline(&self) -> Option<(Instant, PacketNumberSpace)> {
        let mut earliest: Option<(Instant, PacketNumberSpace)> = None;
        for space in PacketNumberSpace::ALL {
            if self.spaces.get(space).discarded {
                continue;
            }
            let Some(anchor) =
                self.outstanding[space as usize].earliest_ack_eliciting_send_time()
            else {
                continue;
            };
            let deadline =
                self.loss
                    .pto_deadline(space, &self.rtt, self.max_ack_delay(), anchor);
            earliest = Some(match earliest {
                Some((t, s)) if t <= deadline => (t, s),
                _ => (deadline, space),
            });
        }
        earliest
    }

    /// Advance all timer-driven state to `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.drain_deadline {
            if now >= deadline {
                match self.lifecycle {
                    ConnectionLifecycle::Closing => {
                        // The closing period elapsed; fall silent first.
                        self.enter_draining(now);
                    }
                    ConnectionLifecycle::Draining => self.finalize_close(),
                    _ => {}
                }
                return;
            }
        }
        if !self.lifecycle.is_open() {
            return;
        }
        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                // Idle expiry closes silently.
                self.close_cause =
                    Some(CloseCause::Local(ConnectionError::Local(LocalError::IdleTimeout)));
                self.finalize_close();
                return;
            }
        }
        if let Some(deadline) = self.path.validation_deadline {
            if now >= deadline {
                self.path.on_validation_timeout();
                self.emit_qlog(now, QLogEventData::PathValidation { success: false });
            }
        }
        if let Some((loss_time, space)) = self.loss.earliest_loss_time() {
            if now >= loss_time {
                let sweep = {
                    let largest = self.spaces.get(space).largest_acked_by_peer;
                    self.loss.detect_lost_packets(
                        space,
                        &mut self.outstanding[space as usize],
                        largest,
                        &self.rtt,
                        now,
                    )
                };
                self.handle_lost_packets(now, space, sweep.lost_packets);
                return;
            }
        }
        if let Some((deadline, space)) = self.pto_deadline() {
            if now >= deadline {
                let probes = self.loss.on_pto_fired(space);
                match space {
                    PacketNumberSpace::AppData => self.pto_probes_pending = probes,
                    // Handshake flights are not probed by cloning: the
                    // stalled packets' crypto data goes straight back
                    // through the loss buffers and is rewritten.
                    PacketNumberSpace::Initial | PacketNumberSpace::Handshake => {
                        self.retransmit_handshake_data(now, space);
                    }
                }
                if self.loss.pto_count(space) >= self.settings.max_consecutive_ptos {
                    self.close_cause = Some(CloseCause::Local(ConnectionError::Local(
                        LocalError::IdleTimeout,
                    )));
                    self.finalize_close();
                }
            }
        }
    }

    /// An Initial/Handshake PTO fired: declare the space's ACK-eliciting
    /// packets lost so their crypto frames requeue for the next write.
    fn retransmit_handshake_data(&mut self, now: Instant, space: PacketNumberSpace) {
        let registry = &mut self.outstanding[space as usize];
        let stalled: Vec<PacketNumber> = registry
            .iter()
            .filter(|p| p.ack_eliciting)
            .map(OutstandingPacket::packet_number)
            .collect();
        let lost: Vec<OutstandingPacket> = stalled
            .into_iter()
            .filter_map(|pn| registry.remove(pn))
            .collect();
        self.handle_lost_packets(now, space, lost);
    }

    fn refresh_idle_deadline(&mut self, now: Instant) {
        if !self.lifecycle.is_open() {
            return;
        }
        let local = self.settings.idle_timeout;
        let idle = match self.peer_params.as_ref() {
            Some(p) if !p.idle_timeout.is_zero() => local.min(p.idle_timeout),
            _ => local,
        };
        self.idle_deadline = now.checked_add(idle);
    }

    // ==================================================================
    // Send path
    // ==================================================================

    /// Build everything currently sendable, paced and flow-controlled.
    pub fn write_packets(&mut self, now: Instant) -> Vec<OutgoingDatagram> {
        let mut out = Vec::new();
        if let Some((scid, dcid)) = self.pending_version_negotiation.take() {
            // Echo the client's ids reversed.
            let payload =
                build_version_negotiation_packet(&scid, &dcid, &[self.version]);
            out.push(OutgoingDatagram {
                remote: self.path.peer_address,
                payload,
            });
        }
        if !self.lifecycle.may_send() {
            return out;
        }
        if self.lifecycle == ConnectionLifecycle::Closing {
            if self.close_frame_pending {
                self.close_frame_pending = false;
                if let Some(datagram) = self.build_close_datagram(now) {
                    out.push(datagram);
                }
            }
            return out;
        }

        let mut batch = if self.settings.pacing_enabled {
            self.pacer.update_and_get_write_batch_size(now)
        } else {
            self.settings.write_connection_data_packets_limit
        };

        let mut blocked_by_window = false;
        while batch > 0 {
            match self.build_one_packet(now) {
                None => break,
                Some(None) => {
                    // Out of window or credit, not out of data.
                    blocked_by_window = true;
                    break;
                }
                Some(Some(datagram)) => {
                    out.push(datagram);
                    batch -= 1;
                }
            }
        }
        // Stopping with pacer budget left and no window pressure means the
        // application ran dry.
        let app_limited = !blocked_by_window && batch > 0;
        self.congestion.set_app_limited(app_limited);
        self.pacer.set_app_limited(app_limited);
        if !out.is_empty() {
            self.refresh_idle_deadline(now);
        }
        out
    }

    /// `Ok(None)`-style tri-state: `None` = nothing to send at all,
    /// `Some(None)` = blocked by window/credit, `Some(Some(d))` = built.
    fn build_one_packet(&mut self, now: Instant) -> Option<Option<OutgoingDatagram>> {
        let space = self.pick_send_space()?;
        let mut budget = self.settings.udp_send_packet_len;

        // Anti-amplification / unvalidated-path throttle.
        if !self.path.peer_address_validated || self.path.migration_in_progress() {
            let credit = self
                .path
                .rate_limiter
                .current_credit(now, self.rtt.smoothed_rtt());
            if (credit as usize) < 64 {
                return Some(None);
            }
            budget = budget.min(credit as usize);
        }

        let has_probe = self.pto_probes_pending > 0 && space == PacketNumberSpace::AppData;
        let congestion_blocked =
            self.congestion.writable_bytes() < budget as u64 && !has_probe;
        let ack_only_ok = self.space_has_ack_work(space);
        if congestion_blocked && !ack_only_ok {
            return Some(None);
        }

        let header = self.make_header(space);
        let mut builder = PacketBuilder::new(
            budget,
            header,
            self.spaces.get(space).largest_acked_by_peer,
            self.aead.cipher_overhead(),
            self.space_exponent(space),
        );
        if !builder.can_build() {
            return Some(None);
        }

        let mut sent_ack_largest: Option<PacketNumber> = None;
        let mut probe_event = None;

        if has_probe {
            probe_event = self.fill_probe(&mut builder, now);
            if probe_event.is_none() {
                // No clonable packet: fall through to a bare PING probe.
                builder.append_frame(Frame::Ping);
            }
            self.pto_probes_pending -= 1;
        }

        // 1. ACK for this space.
        if self.space_has_ack_work(space) {
            let state = self.spaces.get(space);
            if let Some(ack) = frame_build::plan_ack_frame(
                state.ack_intervals.blocks(),
                state.ack_delay(now),
                state.ack_delay_exponent,
                builder.remaining_space(),
            ) {
                let largest = ack.largest_acked();
                if builder.append_frame(Frame::Ack(ack)) {
                    sent_ack_largest = Some(largest);
                }
            }
        }

        if !congestion_blocked {
            match space {
                PacketNumberSpace::Initial | PacketNumberSpace::Handshake => {
                    self.fill_crypto(space, &mut builder);
                }
                PacketNumberSpace::AppData => {
                    if self.lifecycle == ConnectionLifecycle::Established
                        || self.side.is_client()
                    {
                        self.fill_control_frames(&mut builder, now);
                        self.fill_window_updates(&mut builder);
                        self.fill_crypto(space, &mut builder);
                        self.fill_stream_data(&mut builder);
                    }
                }
            }
        }

        // Client Initial datagrams pad to the minimum size.
        if self.side.is_client() && space == PacketNumberSpace::Initial && builder.has_frames() {
            while builder.append_frame(Frame::Padding) {}
        }

        // During an unverified migration only the probe travels on the new
        // path; everything else stays on the old one.
        let carries_challenge = builder
            .frames()
            .iter()
            .any(|f| matches!(f, Frame::PathChallenge(_)));
        let remote = if self.path.migration_in_progress() && !carries_challenge {
            self.path.fallback_address.unwrap_or(self.path.peer_address)
        } else {
            self.path.peer_address
        };

        let built = builder.finish()?;
        if let Some(largest) = sent_ack_largest {
            self.spaces.get_mut(space).on_ack_sent(largest);
        }
        Some(Some(self.seal_and_record(now, space, built, probe_event, remote)))
    }

    fn space_has_ack_work(&self, space: PacketNumberSpace) -> bool {
        // ACKs ride along opportunistically once ACK-eliciting data is
        // waiting; the ack-delay deadline only bounds how long it waits.
        self.spaces.get(space).ack_pending()
    }

    fn pick_send_space(&mut self) -> Option<PacketNumberSpace> {
        for space in PacketNumberSpace::ALL {
            if !self.keys_available[space as usize] || self.spaces.get(space).discarded {
                continue;
            }
            let has_crypto = self.crypto_streams[space as usize].has_writable_data();
            let has_ack = self.space_has_ack_work(space);
            let app_work = space == PacketNumberSpace::AppData
                && (!self.pending_frames.is_empty()
                    || self.window_update_queued
                    || !self.stream_window_updates.is_empty()
                    || self.path.pending_challenge.is_some()
                    || self.pto_probes_pending > 0
                    || self.has_sendable_stream_data());
            if has_crypto || has_ack || app_work {
                return Some(space);
            }
        }
        None
    }

    fn has_sendable_stream_data(&self) -> bool {
        self.streams.iter().any(|s| {
            if !s.has_writable_data() {
                return false;
            }
            if s.has_lost_data() {
                return true;
            }
            // Fresh data needs credit somewhere; blocked frames are
            // emitted from the fill path.
            s.flow_control.send.available() > 0 || self.conn_flow.send.available() > 0
        })
    }

    fn make_header(&mut self, space: PacketNumberSpace) -> PacketHeader {
        let dcid = self
            .peer_cids
            .current()
            .map(|d| d.cid.clone())
            .unwrap_or_else(ConnectionId::empty);
        let pn = self.spaces.get_mut(space).next_packet_number();
        match space {
            PacketNumberSpace::Initial | PacketNumberSpace::Handshake => {
                let scid = self
                    .self_cids
                    .ids()
                    .next()
                    .map(|d| d.cid.clone())
                    .unwrap_or_else(ConnectionId::empty);
                PacketHeader::Long(LongHeader {
                    packet_type: if space == PacketNumberSpace::Initial {
                        LongHeaderType::Initial
                    } else {
                        LongHeaderType::Handshake
                    },
                    version: self.version,
                    dcid,
                    scid,
                    token: None,
                    packet_number: pn,
                })
            }
            PacketNumberSpace::AppData => PacketHeader::Short(ShortHeader {
                dcid,
                packet_number: pn,
                key_phase: false,
            }),
        }
    }

    fn fill_probe(&mut self, builder: &mut PacketBuilder, now: Instant) -> Option<PacketNumber> {
        let source_pn = self.outstanding[PacketNumberSpace::AppData as usize]
            .iter()
            .filter(|p| p.ack_eliciting)
            .map(OutstandingPacket::packet_number)
            .next()?;
        let registry = &mut self.outstanding[PacketNumberSpace::AppData as usize];
        let source = registry.get_mut(source_pn)?;
        let rebuilder = PacketRebuilder {
            builder,
            streams: &mut self.streams,
            crypto_stream: &self.crypto_streams[PacketNumberSpace::AppData as usize],
            conn_flow: &self.conn_flow,
            space: self.spaces.get(PacketNumberSpace::AppData),
            outstanding_path_challenge: self.path.outstanding_path_validation,
            now,
        };
        rebuilder.rebuild_from_packet(source, &mut self.events)
    }

    fn fill_control_frames(&mut self, builder: &mut PacketBuilder, now: Instant) {
        if let Some(challenge) = self.path.pending_challenge {
            if builder.append_frame(Frame::PathChallenge(PathChallengeFrame {
                path_data: challenge,
            })) {
                self.path.on_challenge_sent(now);
            }
        }
        let mut kept = Vec::new();
        for frame in std::mem::take(&mut self.pending_frames) {
            if !builder.append_frame(frame.clone()) {
                kept.push(frame);
            }
        }
        self.pending_frames = kept;
    }

    fn fill_window_updates(&mut self, builder: &mut PacketBuilder) {
        if self.window_update_queued {
            if let Some(maximum_data) = self.conn_flow.recv.current_update() {
                if builder.append_frame(Frame::MaxData(MaxDataFrame { maximum_data })) {
                    self.window_update_queued = false;
                }
            } else {
                self.window_update_queued = false;
            }
        }
        let ids: Vec<StreamId> = self.stream_window_updates.iter().copied().collect();
        for id in ids {
            let update = self
                .streams
                .get(id)
                .and_then(|s| s.flow_control.recv.current_update());
            match update {
                Some(maximum_data) => {
                    if builder.append_frame(Frame::MaxStreamData(MaxStreamDataFrame {
                        stream_id: id,
                        maximum_data,
                    })) {
                        self.stream_window_updates.remove(&id);
                    }
                }
                None => {
                    self.stream_window_updates.remove(&id);
                }
            }
        }
        for bidirectional in [true, false] {
            if let Some(limit) = self.streams.maybe_max_streams_update(bidirectional) {
                builder.append_frame(Frame::MaxStreams(MaxStreamsFrame {
                    max_streams: limit,
                    bidirectional,
                }));
            }
        }
    }

    fn fill_crypto(&mut self, space: PacketNumberSpace, builder: &mut PacketBuilder) {
        let crypto = &mut self.crypto_streams[space as usize];
        while crypto.has_writable_data() {
            let overhead = 1 + 8 + 4; // type + worst-case offset + length
            let Some(max_len) = builder.remaining_space().checked_sub(overhead) else {
                break;
            };
            if max_len == 0 {
                break;
            }
            let Some(chunk) = crypto.next_send_chunk(max_len as u64) else {
                break;
            };
            let frame = Frame::Crypto(crate::frames::CryptoFrame {
                offset: chunk.offset,
                data: chunk.data.clone(),
            });
            if builder.append_frame(frame) {
                crypto.on_chunk_sent(chunk);
            } else {
                // Put it back for the next packet.
                crypto.loss_buffer.insert(0, chunk);
                break;
            }
        }
    }

    fn fill_stream_data(&mut self, builder: &mut PacketBuilder) {
        for id in self.streams.writable_streams() {
            loop {
                let overhead = 1 + 8 + 8 + 4; // type + id + offset + length, worst case
                let Some(space_left) = builder.remaining_space().checked_sub(overhead) else {
                    return;
                };
                if space_left == 0 {
                    return;
                }
                // Lost data first: no new flow-control charge.
                let lost_chunk = self
                    .streams
                    .get_mut(id)
                    .and_then(|s| s.pop_lost_chunk(space_left as u64));
                if let Some(chunk) = lost_chunk {
                    if !self.append_stream_chunk(builder, id, chunk) {
                        return;
                    }
                    continue;
                }
                // Fresh data under both credit limits.
                let conn_credit = self.conn_flow.send.available();
                let Some(stream) = self.streams.get_mut(id) else {
                    break;
                };
                let stream_credit = stream.flow_control.send.available();
                if stream.pending_fresh_bytes() > 0 {
                    if stream_credit == 0 {
                        if let Some(limit) = stream.flow_control.send.should_emit_blocked() {
                            builder.append_frame(Frame::StreamDataBlocked(
                                StreamDataBlockedFrame {
                                    stream_id: id,
                                    data_limit: limit,
                                },
                            ));
                        }
                        break;
                    }
                    if conn_credit == 0 {
                        if let Some(limit) = self.conn_flow.send.should_emit_blocked() {
                            builder.append_frame(Frame::DataBlocked(DataBlockedFrame {
                                data_limit: limit,
                            }));
                        }
                        return;
                    }
                }
                let max_len = (space_left as u64).min(stream_credit).min(conn_credit);
                let Some(chunk) = stream.pop_fresh_chunk(max_len) else {
                    break;
                };
                let fresh_bytes = chunk.len();
                if self.conn_flow.send.consume(fresh_bytes).is_err() {
                    break;
                }
                let charged = self
                    .streams
                    .get_mut(id)
                    .map(|s| s.flow_control.send.consume(fresh_bytes).is_ok())
                    .unwrap_or(false);
                if !charged {
                    break;
                }
                if !self.append_stream_chunk(builder, id, chunk) {
                    return;
                }
            }
        }
    }

    fn append_stream_chunk(
        &mut self,
        builder: &mut PacketBuilder,
        id: StreamId,
        chunk: StreamBuffer,
    ) -> bool {
        let frame = Frame::Stream(StreamFrame {
            stream_id: id,
            offset: chunk.offset,
            data: chunk.data.clone(),
            fin: chunk.fin,
        });
        if builder.append_frame(frame) {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.on_stream_frame_sent(chunk);
            }
            true
        } else {
            false
        }
    }

    fn build_close_datagram(&mut self, now: Instant) -> Option<OutgoingDatagram> {
        let space = if self.spaces.get(PacketNumberSpace::AppData).discarded {
            PacketNumberSpace::Initial
        } else {
            PacketNumberSpace::AppData
        };
        let (error_code, frame_type, application, reason) = match &self.close_cause {
            Some(CloseCause::Local(ConnectionError::Transport {
                code,
                frame_type,
                reason,
            })) => (code.to_wire(), *frame_type, false, Bytes::from_static(reason.as_bytes())),
            Some(CloseCause::Local(ConnectionError::Application { code })) => {
                (*code, None, true, Bytes::new())
            }
            _ => (TransportErrorCode::NoError.to_wire(), None, false, Bytes::new()),
        };
        let header = self.make_header(space);
        let mut builder = PacketBuilder::new(
            self.settings.udp_send_packet_len,
            header,
            self.spaces.get(space).largest_acked_by_peer,
            self.aead.cipher_overhead(),
            self.space_exponent(space),
        );
        builder.append_frame(Frame::ConnectionClose(ConnectionCloseFrame {
            error_code,
            frame_type,
            reason,
            application,
        }));
        let built = builder.finish()?;
        let remote = self.path.peer_address;
        Some(self.seal_and_record(now, space, built, None, remote))
    }

    /// Seal, protect, record bookkeeping, and wrap as a datagram.
    fn seal_and_record(
        &mut self,
        now: Instant,
        space: PacketNumberSpace,
        built: BuiltPacket,
        probe_event: Option<PacketNumber>,
        remote: SocketAddr,
    ) -> OutgoingDatagram {
        let pn = built.packet_number();
        let ack_eliciting = built.is_ack_eliciting();
        let sealed_body = self
            .aead
            .seal(space, &built.header_bytes, pn, built.body.clone());

        let mut wire = BytesMut::with_capacity(built.header_bytes.len() + sealed_body.len());
        wire.extend_from_slice(&built.header_bytes);
        wire.extend_from_slice(&sealed_body);

        // Header protection over the first byte and packet number.
        let pn_offset = built.header_bytes.len() - built.pn_len;
        if wire.len() >= pn_offset + 4 + HEADER_PROTECTION_SAMPLE_SIZE {
            let sample_start = pn_offset + 4;
            let sample: Vec<u8> =
                wire[sample_start..sample_start + HEADER_PROTECTION_SAMPLE_SIZE].to_vec();
            let mut first = wire[0];
            let mut pn_bytes = [0u8; 4];
            pn_bytes[..built.pn_len].copy_from_slice(&wire[pn_offset..pn_offset + built.pn_len]);
            self.header_protector.protect(
                space,
                &mut first,
                &mut pn_bytes[..built.pn_len],
                &sample,
            );
            wire[0] = first;
            wire[pn_offset..pn_offset + built.pn_len]
                .copy_from_slice(&pn_bytes[..built.pn_len]);
        }

        let size = wire.len();
        if ack_eliciting {
            self.outstanding[space as usize].insert(OutstandingPacket {
                packet: SentPacketMeta {
                    space,
                    packet_number: pn,
                    frames: built.frames.clone(),
                },
                send_time: now,
                size,
                is_handshake: space != PacketNumberSpace::AppData,
                ack_eliciting,
                associated_event: probe_event,
            });
            if let Some(event) = probe_event {
                debug_assert!(self.events.contains(event));
            }
            self.congestion.on_packet_sent(size as u64);
        }
        self.pacer.on_packet_sent();
        if !self.path.peer_address_validated || self.path.migration_in_progress() {
            self.path.rate_limiter.on_packet_sent(size as u64);
        }
        self.emit_qlog(
            now,
            QLogEventData::PacketSent {
                space: space_label(space),
                packet_number: pn,
                size,
                ack_eliciting,
            },
        );
        OutgoingDatagram {
            remote,
            payload: wire.freeze(),
        }
    }

    // ==================================================================
    // Space discard
    // ==================================================================

    fn discard_space(&mut self, space: PacketNumberSpace) {
        let drained = self.outstanding[space as usize].drain();
        let bytes: u64 = drained
            .iter()
            .filter(|p| p.ack_eliciting)
            .map(|p| p.size as u64)
            .sum();
        if bytes > 0 {
            self.congestion.on_bytes_neutered(bytes);
        }
        self.loss.clear_loss_time(space);
        self.spaces.get_mut(space).discard();
        self.keys_available[space as usize] = false;
    }

    fn emit_qlog(&mut self, now: Instant, data: QLogEventData) {
        self.qlog.emit(now, data);
    }
}

#[cfg(test)]
impl Connection {
    pub(crate) fn path_mut_for_tests(&mut self) -> &mut PathState {
        &mut self.path
    }

    pub(crate) fn outstanding_challenge_for_tests(&self) -> Option<u64> {
        self.path
            .outstanding_path_validation
            .or(self.path.pending_challenge)
    }

    pub(crate) fn peer_connection_ids_token_for_tests(
        &self,
    ) -> Option<crate::types::StatelessResetToken> {
        self.peer_cids.ids().find_map(|d| d.token)
    }
}
