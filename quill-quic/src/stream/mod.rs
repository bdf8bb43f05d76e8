//! Stream management (RFC 9000 Sections 2, 3).
//!
//! Streams live in a map owned by the connection and are referenced
//! everywhere else by [`StreamId`]. The manager enforces MAX_STREAMS
//! limits in both directions, assigns flow-control windows to new streams
//! from the negotiated parameters, and recycles closed streams.

pub mod buffer;
pub mod crypto;
pub mod state;

pub use buffer::{RecvBuffer, RetransmissionBuffer, StreamBuffer, WriteBuffer};
pub use crypto::CryptoStream;
pub use state::{RecvStreamState, SendStreamState, StreamState};

use std::collections::{HashMap, HashSet};

use crate::config::{TransportParameters, TransportSettings};
use crate::error::{ConnectionError, Result, TransportErrorCode};
use crate::flow_control::StreamFlowControl;
use crate::types::{Side, StreamId};

/// Initial stream windows applied to newly created streams, derived from
/// both endpoints' transport parameters.
#[derive(Debug, Clone)]
struct StreamWindows {
    peer_bidi_remote: u64,
    peer_bidi_local: u64,
    peer_uni: u64,
    local_bidi_remote: u64,
    local_bidi_local: u64,
    local_uni: u64,
}

/// Owner of all stream state for one connection.
#[derive(Debug)]
pub struct StreamManager {
    side: Side,
    streams: HashMap<StreamId, StreamState>,
    /// Streams that completed and were removed; reopening is a protocol
    /// no-op, not a new stream.
    closed: HashSet<StreamId>,

    next_local_bidi_index: u64,
    next_local_uni_index: u64,
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,
    streams_blocked_emitted_bidi: Option<u64>,
    streams_blocked_emitted_uni: Option<u64>,

    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    max_streams_window_bidi: u64,
    max_streams_window_uni: u64,
    closed_peer_bidi: u64,
    closed_peer_uni: u64,
    pending_max_streams_bidi: Option<u64>,
    pending_max_streams_uni: Option<u64>,

    windows: StreamWindows,
}

impl StreamManager {
    pub fn new(side: Side, settings: &TransportSettings) -> Self {
        Self {
            side,
            streams: HashMap::new(),
            closed: HashSet::new(),
            next_local_bidi_index: 0,
            next_local_uni_index: 0,
            // Until the peer's parameters arrive, nothing may be opened.
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            streams_blocked_emitted_bidi: None,
            streams_blocked_emitted_uni: None,
            local_max_streams_bidi: settings.advertised_max_streams_bidi,
            local_max_streams_uni: settings.advertised_max_streams_uni,
            max_streams_window_bidi: settings.advertised_max_streams_bidi,
            max_streams_window_uni: settings.advertised_max_streams_uni,
            closed_peer_bidi: 0,
            closed_peer_uni: 0,
            pending_max_streams_bidi: None,
            pending_max_streams_uni: None,
            windows: StreamWindows {
                peer_bidi_remote: 0,
                peer_bidi_local: 0,
                peer_uni: 0,
                local_bidi_remote: settings.advertised_stream_window_bidi_remote,
                local_bidi_local: settings.advertised_stream_window_bidi_local,
                local_uni: settings.advertised_stream_window_uni,
            },
        }
    }

    /// Apply the peer's handshake parameters: stream-count limits and the
    /// send windows of existing and future streams.
    pub fn on_transport_parameters(&mut self, params: &TransportParameters) {
        self.peer_max_streams_bidi = params.initial_max_streams_bidi;
        self.peer_max_streams_uni = params.initial_max_streams_uni;
        self.windows.peer_bidi_remote = params.initial_max_stream_data_bidi_remote;
        self.windows.peer_bidi_local = params.initial_max_stream_data_bidi_local;
        self.windows.peer_uni = params.initial_max_stream_data_uni;
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for id in ids {
            let send_limit = self.windows_for_send(id);
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.flow_control.send.on_limit_update(send_limit);
            }
        }
    }

    /// Peer's advertised send limit for data we send on `id`.
    fn windows_for_send(&self, id: StreamId) -> u64 {
        if id.is_unidirectional() {
            if id.initiator() == self.side {
                self.windows.peer_uni
            } else {
                0
            }
        } else if id.initiator() == self.side {
            self.windows.peer_bidi_remote
        } else {
            self.windows.peer_bidi_local
        }
    }

    /// Our receive window for data the peer sends on `id`.
    fn windows_for_recv(&self, id: StreamId) -> u64 {
        if id.is_unidirectional() {
            if id.initiator() == self.side {
                0
            } else {
                self.windows.local_uni
            }
        } else if id.initiator() == self.side {
            self.windows.local_bidi_local
        } else {
            self.windows.local_bidi_remote
        }
    }

    fn make_stream(&self, id: StreamId) -> StreamState {
        StreamState::new(
            id,
            StreamFlowControl::new(self.windows_for_send(id), self.windows_for_recv(id)),
        )
    }

    /// Open a locally-initiated stream, subject to the peer's MAX_STREAMS.
    pub fn open_local(&mut self, bidirectional: bool) -> Result<StreamId> {
        let (next, limit) = if bidirectional {
            (self.next_local_bidi_index, self.peer_max_streams_bidi)
        } else {
            (self.next_local_uni_index, self.peer_max_streams_uni)
        };
        if next >= limit {
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamLimitError,
                "peer stream limit reached",
            ));
        }
        let id = StreamId::from_parts(self.side, bidirectional, next);
        if bidirectional {
            self.next_local_bidi_index += 1;
        } else {
            self.next_local_uni_index += 1;
        }
        self.streams.insert(id, self.make_stream(id));
        Ok(id)
    }

    /// Resolve a stream id appearing in a received frame, creating
    /// peer-initiated streams on first reference.
    ///
    /// Returns `Ok(None)` for streams that already completed (frames for
    /// them are stale but legal).
    pub fn get_or_create_remote(&mut self, id: StreamId) -> Result<Option<&mut StreamState>> {
        if self.closed.contains(&id) {
            return Ok(None);
        }
        if self.streams.contains_key(&id) {
            return Ok(self.streams.get_mut(&id));
        }
        if id.initiator() == self.side {
            // The peer referenced one of our streams that we never opened.
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamStateError,
                "frame for unopened local stream",
            ));
        }
        let limit = if id.is_bidirectional() {
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni
        };
        if id.stream_index() >= limit {
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamLimitError,
                "peer exceeded stream limit",
            ));
        }
        self.streams.insert(id, self.make_stream(id));
        Ok(self.streams.get_mut(&id))
    }

    pub fn stream_exists(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamState> {
        self.streams.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StreamState> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Streams with data ready for the wire, id-ordered for fairness.
    pub fn writable_streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.has_writable_data())
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// Peer raised the number of streams we may open.
    pub fn on_max_streams(&mut self, max_streams: u64, bidirectional: bool) {
        if bidirectional {
            if max_streams > self.peer_max_streams_bidi {
                self.peer_max_streams_bidi = max_streams;
                self.streams_blocked_emitted_bidi = None;
            }
        } else if max_streams > self.peer_max_streams_uni {
            self.peer_max_streams_uni = max_streams;
            self.streams_blocked_emitted_uni = None;
        }
    }

    /// If stream opening is blocked on the peer's limit and not yet
    /// reported, return the limit for a STREAMS_BLOCKED frame.
    pub fn maybe_streams_blocked(&mut self, bidirectional: bool) -> Option<u64> {
        let (next, limit, emitted) = if bidirectional {
            (
                self.next_local_bidi_index,
                self.peer_max_streams_bidi,
                &mut self.streams_blocked_emitted_bidi,
            )
        } else {
            (
                self.next_local_uni_index,
                self.peer_max_streams_uni,
                &mut self.streams_blocked_emitted_uni,
            )
        };
        if next < limit || *emitted == Some(limit) {
            return None;
        }
        *emitted = Some(limit);
        Some(limit)
    }

    /// Drop every stream unconditionally (connection close).
    pub fn discard_all(&mut self) {
        for id in self.streams.keys().copied().collect::<Vec<StreamId>>() {
            self.closed.insert(id);
        }
        self.streams.clear();
    }

    /// Drop completed streams, crediting peer-initiated slots back.
    /// Returns the removed ids.
    pub fn remove_closed(&mut self) -> Vec<StreamId> {
        let done: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.is_closed())
            .map(|s| s.id)
            .collect();
        for id in &done {
            self.streams.remove(id);
            self.closed.insert(*id);
            if id.initiator() != self.side {
                if id.is_bidirectional() {
                    self.closed_peer_bidi += 1;
                } else {
                    self.closed_peer_uni += 1;
                }
            }
        }
        done
    }

    /// Advance the advertised MAX_STREAMS limit when enough peer streams
    /// have finished. Returns the new limit to send.
    pub fn maybe_max_streams_update(&mut self, bidirectional: bool) -> Option<u64> {
        let (closed, window, limit) = if bidirectional {
            (
                self.closed_peer_bidi,
                self.max_streams_window_bidi,
                &mut self.local_max_streams_bidi,
            )
        } else {
            (
                self.closed_peer_uni,
                self.max_streams_window_uni,
                &mut self.local_max_streams_uni,
            )
        };
        let target = closed + window;
        if target <= *limit {
            return None;
        }
        *limit = target;
        if bidirectional {
            self.pending_max_streams_bidi = Some(target);
        } else {
            self.pending_max_streams_uni = Some(target);
        }
        Some(target)
    }

    pub fn peer_max_streams(&self, bidirectional: bool) -> u64 {
        if bidirectional {
            self.peer_max_streams_bidi
        } else {
            self.peer_max_streams_uni
        }
    }

    pub fn local_max_streams(&self, bidirectional: bool) -> u64 {
        if bidirectional {
            self.local_max_streams_bidi
        } else {
            self.local_max_streams_uni
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn manager(side: Side) -> StreamManager {
        let mut mgr = StreamManager::new(side, &TransportSettings::default());
        let mut params = TransportParameters::default();
        params.initial_max_streams_bidi = 2;
        params.initial_max_streams_uni = 1;
        params.initial_max_stream_data_bidi_remote = 1000;
        params.initial_max_stream_data_bidi_local = 2000;
        params.initial_max_stream_data_uni = 500;
        mgr.on_transport_parameters(&params);
        mgr
    }

    #[test]
    fn test_open_local_respects_peer_limit() {
        let mut mgr = manager(Side::Client);
        let a = mgr.open_local(true).unwrap();
        let b = mgr.open_local(true).unwrap();
        assert_eq!(a, StreamId::new(0));
        assert_eq!(b, StreamId::new(4));
        let err = mgr.open_local(true).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                code: TransportErrorCode::StreamLimitError,
                ..
            }
        ));
    }

    #[test]
    fn test_open_before_parameters_blocked() {
        let mut mgr = StreamManager::new(Side::Client, &TransportSettings::default());
        assert!(mgr.open_local(true).is_err());
    }

    #[test]
    fn test_server_stream_id_parity() {
        let mut mgr = manager(Side::Server);
        let id = mgr.open_local(true).unwrap();
        assert!(id.is_server_initiated());
        assert_eq!(id, StreamId::new(1));
        let id = mgr.open_local(false).unwrap();
        assert_eq!(id, StreamId::new(3));
    }

    #[test]
    fn test_remote_stream_created_on_reference() {
        let mut mgr = manager(Side::Server);
        // Client bidi stream 0.
        let stream = mgr.get_or_create_remote(StreamId::new(0)).unwrap().unwrap();
        assert_eq!(stream.id, StreamId::new(0));
        assert!(mgr.stream_exists(StreamId::new(0)));
    }

    #[test]
    fn test_remote_stream_limit_enforced() {
        let mut mgr = manager(Side::Server);
        // Saturate the advertised bidi limit (default settings: 100).
        let over = StreamId::from_parts(Side::Client, true, 100);
        let err = mgr.get_or_create_remote(over).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                code: TransportErrorCode::StreamLimitError,
                ..
            }
        ));
    }

    #[test]
    fn test_frame_for_unopened_local_stream_is_error() {
        let mut mgr = manager(Side::Client);
        // Peer references client-initiated stream 0, never opened.
        let err = mgr.get_or_create_remote(StreamId::new(0)).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                code: TransportErrorCode::StreamStateError,
                ..
            }
        ));
    }

    #[test]
    fn test_streams_blocked_once_until_limit_moves() {
        let mut mgr = manager(Side::Client);
        mgr.open_local(false).unwrap();
        assert!(mgr.open_local(false).is_err());
        assert_eq!(mgr.maybe_streams_blocked(false), Some(1));
        assert_eq!(mgr.maybe_streams_blocked(false), None);
        mgr.on_max_streams(3, false);
        assert_eq!(mgr.maybe_streams_blocked(false), None);
        mgr.open_local(false).unwrap();
        mgr.open_local(false).unwrap();
        assert!(mgr.open_local(false).is_err());
        assert_eq!(mgr.maybe_streams_blocked(false), Some(3));
    }

    #[test]
    fn test_closed_stream_recycled_and_credited() {
        let mut mgr = manager(Side::Server);
        let id = StreamId::new(2); // client uni
        {
            let stream = mgr.get_or_create_remote(id).unwrap().unwrap();
            stream
                .on_stream_frame_received(0, Bytes::from_static(b"x"), true)
                .unwrap();
            stream.read(10).unwrap();
        }
        let removed = mgr.remove_closed();
        assert_eq!(removed, vec![id]);
        // Stale frame for the closed stream: no recreation, no error.
        assert!(mgr.get_or_create_remote(id).unwrap().is_none());
        // Limit advances past the default window.
        let new_limit = mgr.maybe_max_streams_update(false).unwrap();
        assert_eq!(
            new_limit,
            TransportSettings::default().advertised_max_streams_uni + 1
        );
    }

    #[test]
    fn test_send_window_assignment_by_class() {
        let mut mgr = manager(Side::Client);
        let ours_bidi = mgr.open_local(true).unwrap();
        assert_eq!(
            mgr.get(ours_bidi).unwrap().flow_control.send.peer_max(),
            1000 // peer's bidi_remote
        );
        let theirs_bidi = StreamId::new(1);
        mgr.get_or_create_remote(theirs_bidi).unwrap().unwrap();
        assert_eq!(
            mgr.get(theirs_bidi).unwrap().flow_control.send.peer_max(),
            2000 // peer's bidi_local
        );
    }

    #[test]
    fn test_writable_streams_ordering() {
        let mut mgr = manager(Side::Client);
        let a = mgr.open_local(true).unwrap();
        let b = mgr.open_local(true).unwrap();
        mgr.get_mut(b)
            .unwrap()
            .write(Bytes::from_static(b"b"), false)
            .unwrap();
        mgr.get_mut(a)
            .unwrap()
            .write(Bytes::from_static(b"a"), false)
            .unwrap();
        assert_eq!(mgr.writable_streams(), vec![a, b]);
    }
}
