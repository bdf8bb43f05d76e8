//! Connection-id issuance and retirement (RFC 9000 Section 5.1).
//!
//! Two id sets per connection: the peer's ids (what we put in our DCIDs)
//! and our own issued ids (what the peer puts in theirs). Sequence numbers
//! are strictly increasing on each side; the peer set is bounded by our
//! advertised `active_connection_id_limit` plus the handshake-chosen id.

use crate::connection::cid_algo::ConnectionIdGenerator;
use crate::error::{ConnectionError, Result, TransportErrorCode};
use crate::frames::{NewConnectionIdFrame, RetireConnectionIdFrame};
use crate::types::{ConnectionId, StatelessResetToken};

/// One id with its issuance metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdData {
    pub cid: ConnectionId,
    pub sequence_number: u64,
    pub token: Option<StatelessResetToken>,
}

// ============================================================================
// Peer Ids
// ============================================================================

/// The peer's ids available for us to route to.
#[derive(Debug)]
pub struct PeerConnectionIds {
    /// All usable ids, ascending by sequence number. Holds the
    /// handshake-chosen id at sequence 0 plus NEW_CONNECTION_ID arrivals.
    ids: Vec<ConnectionIdData>,
    /// Sequence number of the id current packets carry.
    in_use: u64,
    /// Bound we advertised: ids beyond `limit + 1` are dropped.
    active_limit: u64,
    /// Largest retire_prior_to honored so far.
    retired_below: u64,
}

impl PeerConnectionIds {
    pub fn new(handshake_cid: ConnectionId, active_limit: u64) -> Self {
        Self {
            ids: vec![ConnectionIdData {
                cid: handshake_cid,
                sequence_number: 0,
                token: None,
            }],
            in_use: 0,
            active_limit,
            retired_below: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id current packets are addressed with.
    pub fn current(&self) -> Option<&ConnectionIdData> {
        self.ids.iter().find(|d| d.sequence_number == self.in_use)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConnectionIdData> {
        self.ids.iter()
    }

    /// Reset token of any known id matching the trailing bytes of a
    /// suspect datagram (stateless reset detection).
    pub fn matches_reset_token(&self, token: &StatelessResetToken) -> bool {
        self.ids.iter().any(|d| d.token.as_ref() == Some(token))
    }

    /// Process NEW_CONNECTION_ID. Returns RETIRE_CONNECTION_ID frames to
    /// queue for ids invalidated by `retire_prior_to`.
    pub fn on_new_connection_id(
        &mut self,
        frame: &NewConnectionIdFrame,
    ) -> Result<Vec<RetireConnectionIdFrame>> {
        if frame.retire_prior_to > frame.sequence_number {
            return Err(ConnectionError::transport(
                TransportErrorCode::ProtocolViolation,
                "retire prior to greater than sequence number",
            ));
        }
        for existing in &self.ids {
            if existing.cid == frame.connection_id {
                if existing.sequence_number != frame.sequence_number {
                    return Err(ConnectionError::transport(
                        TransportErrorCode::ProtocolViolation,
                        "repeated connection id with different sequence number",
                    ));
                }
                // Duplicate delivery of the same frame.
                return Ok(Vec::new());
            }
            if existing.sequence_number == frame.sequence_number {
                return Err(ConnectionError::transport(
                    TransportErrorCode::ProtocolViolation,
                    "sequence number reused for a different id",
                ));
            }
        }
        if self.ids.first().map(|d| d.cid.is_empty()).unwrap_or(false) {
            return Err(ConnectionError::transport(
                TransportErrorCode::ProtocolViolation,
                "peer uses zero-length ids",
            ));
        }

        let mut retire_frames = Vec::new();
        if frame.retire_prior_to > self.retired_below {
            self.retired_below = frame.retire_prior_to;
            let (dead, alive): (Vec<ConnectionIdData>, Vec<ConnectionIdData>) = self
                .ids
                .drain(..)
                .partition(|d| d.sequence_number < frame.retire_prior_to);
            self.ids = alive;
            for d in dead {
                retire_frames.push(RetireConnectionIdFrame {
                    sequence_number: d.sequence_number,
                });
            }
        }

        // The +1 accounts for the handshake-chosen id.
        if (self.ids.len() as u64) < self.active_limit + 1 {
            self.ids.push(ConnectionIdData {
                cid: frame.connection_id.clone(),
                sequence_number: frame.sequence_number,
                token: Some(frame.stateless_reset_token),
            });
            self.ids.sort_by_key(|d| d.sequence_number);
        }
        // Over the limit the frame is dropped silently.

        if self.current().is_none() {
            // Our in-use id was retired out from under us: move forward.
            if let Some(next) = self.ids.first() {
                self.in_use = next.sequence_number;
            }
        }
        Ok(retire_frames)
    }

    /// Switch to an unused id for path migration, retiring the old one.
    /// Returns the RETIRE_CONNECTION_ID to queue, or `None` when no spare
    /// id exists (the migration must fail).
    pub fn retire_and_switch(&mut self) -> Option<RetireConnectionIdFrame> {
        let current_seq = self.in_use;
        let next_seq = self
            .ids
            .iter()
            .map(|d| d.sequence_number)
            .filter(|&s| s > current_seq)
            .min()?;
        self.ids.retain(|d| d.sequence_number != current_seq);
        self.in_use = next_seq;
        Some(RetireConnectionIdFrame {
            sequence_number: current_seq,
        })
    }
}

// ============================================================================
// Self Ids
// ============================================================================

/// Ids we have issued to the peer.
#[derive(Debug)]
pub struct SelfConnectionIds {
    ids: Vec<ConnectionIdData>,
    next_sequence_number: u64,
    /// Peer's `active_connection_id_limit`.
    peer_limit: u64,
}

impl SelfConnectionIds {
    pub fn new(handshake_cid: ConnectionId) -> Self {
        Self {
            ids: vec![ConnectionIdData {
                cid: handshake_cid,
                sequence_number: 0,
                token: None,
            }],
            next_sequence_number: 1,
            peer_limit: crate::config::MIN_ACTIVE_CONNECTION_ID_LIMIT,
        }
    }

    pub fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = limit;
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConnectionIdData> {
        self.ids.iter()
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.ids.iter().any(|d| &d.cid == cid)
    }

    /// Issue ids up to the peer's limit. Returns the NEW_CONNECTION_ID
    /// frames to queue.
    pub fn issue_up_to_limit(
        &mut self,
        generator: &mut dyn ConnectionIdGenerator,
    ) -> Vec<NewConnectionIdFrame> {
        let mut frames = Vec::new();
        while (self.ids.len() as u64) < self.peer_limit + 1 {
            let seq = self.next_sequence_number;
            self.next_sequence_number += 1;
            let cid = generator.generate(seq);
            let token = generator.reset_token(&cid);
            self.ids.push(ConnectionIdData {
                cid: cid.clone(),
                sequence_number: seq,
                token: Some(token),
            });
            frames.push(NewConnectionIdFrame {
                sequence_number: seq,
                retire_prior_to: 0,
                connection_id: cid,
                stateless_reset_token: token,
            });
        }
        frames
    }

    /// Process RETIRE_CONNECTION_ID. Returns the retired id so the worker
    /// can unbind its route; issuance of a replacement is the caller's
    /// next step.
    pub fn on_retire_connection_id(
        &mut self,
        frame: &RetireConnectionIdFrame,
    ) -> Result<Option<ConnectionIdData>> {
        if frame.sequence_number >= self.next_sequence_number {
            return Err(ConnectionError::transport(
                TransportErrorCode::ProtocolViolation,
                "retire of never-issued connection id",
            ));
        }
        let position = self
            .ids
            .iter()
            .position(|d| d.sequence_number == frame.sequence_number);
        Ok(position.map(|at| self.ids.remove(at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::cid_algo::{
        RoutingConnectionIdGenerator, ServerConnectionIdParams, ROUTING_CID_VERSION,
    };

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    fn new_cid_frame(seq: u64, retire_prior_to: u64, id: &[u8]) -> NewConnectionIdFrame {
        NewConnectionIdFrame {
            sequence_number: seq,
            retire_prior_to,
            connection_id: cid(id),
            stateless_reset_token: [seq as u8; 16],
        }
    }

    #[test]
    fn test_peer_ids_accumulate_in_sequence() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        peer.on_new_connection_id(&new_cid_frame(2, 0, &[2; 8])).unwrap();
        assert_eq!(peer.len(), 3);
        assert_eq!(peer.current().unwrap().sequence_number, 0);
    }

    #[test]
    fn test_repeated_cid_different_sequence_is_violation() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        let err = peer
            .on_new_connection_id(&new_cid_frame(2, 0, &[1; 8]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                code: TransportErrorCode::ProtocolViolation,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_frame_is_noop() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        let retires = peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        assert!(retires.is_empty());
        assert_eq!(peer.len(), 2);
    }

    #[test]
    fn test_retire_prior_to_above_sequence_is_violation() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        assert!(peer
            .on_new_connection_id(&new_cid_frame(1, 2, &[1; 8]))
            .is_err());
    }

    #[test]
    fn test_peer_set_bounded_by_limit_plus_one() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 2);
        for seq in 1..=5u64 {
            peer.on_new_connection_id(&new_cid_frame(seq, 0, &[seq as u8; 8]))
                .unwrap();
        }
        assert_eq!(peer.len() as u64, 2 + 1);
    }

    #[test]
    fn test_retire_prior_to_queues_retirements() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        let retires = peer
            .on_new_connection_id(&new_cid_frame(2, 2, &[2; 8]))
            .unwrap();
        let seqs: Vec<u64> = retires.iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1]);
        // In-use id was retired: rolls forward to the new one.
        assert_eq!(peer.current().unwrap().sequence_number, 2);
    }

    #[test]
    fn test_retire_and_switch_without_spare_fails() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        assert!(peer.retire_and_switch().is_none());
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        let retire = peer.retire_and_switch().unwrap();
        assert_eq!(retire.sequence_number, 0);
        assert_eq!(peer.current().unwrap().sequence_number, 1);
        assert!(peer.retire_and_switch().is_none());
    }

    #[test]
    fn test_reset_token_matching() {
        let mut peer = PeerConnectionIds::new(cid(&[0; 8]), 4);
        peer.on_new_connection_id(&new_cid_frame(1, 0, &[1; 8])).unwrap();
        assert!(peer.matches_reset_token(&[1; 16]));
        assert!(!peer.matches_reset_token(&[9; 16]));
    }

    fn generator() -> RoutingConnectionIdGenerator {
        RoutingConnectionIdGenerator::new(
            ServerConnectionIdParams {
                version: ROUTING_CID_VERSION,
                host_id: 7,
                process_id: 0,
                worker_id: 3,
            },
            [1; 32],
        )
    }

    #[test]
    fn test_self_ids_issue_up_to_peer_limit() {
        let mut own = SelfConnectionIds::new(cid(&[9; 8]));
        own.set_peer_limit(3);
        let mut generator = generator();
        let frames = own.issue_up_to_limit(&mut generator);
        assert_eq!(frames.len(), 3);
        let seqs: Vec<u64> = frames.iter().map(|f| f.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(frames.iter().all(|f| f.retire_prior_to == 0));
        // Issuing again is a no-op at the limit.
        assert!(own.issue_up_to_limit(&mut generator).is_empty());
    }

    #[test]
    fn test_self_retire_and_replace_cycle() {
        let mut own = SelfConnectionIds::new(cid(&[9; 8]));
        own.set_peer_limit(2);
        let mut generator = generator();
        let issued = own.issue_up_to_limit(&mut generator);
        let retired = own
            .on_retire_connection_id(&RetireConnectionIdFrame { sequence_number: 1 })
            .unwrap()
            .unwrap();
        assert_eq!(retired.cid, issued[0].connection_id);
        // Below the limit again: one replacement issued.
        let replacement = own.issue_up_to_limit(&mut generator);
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].sequence_number, 3);
    }

    #[test]
    fn test_self_retire_unissued_is_violation() {
        let mut own = SelfConnectionIds::new(cid(&[9; 8]));
        assert!(own
            .on_retire_connection_id(&RetireConnectionIdFrame { sequence_number: 5 })
            .is_err());
    }

    #[test]
    fn test_self_retire_unknown_but_issued_is_noop() {
        let mut own = SelfConnectionIds::new(cid(&[9; 8]));
        own.set_peer_limit(2);
        let mut generator = generator();
        own.issue_up_to_limit(&mut generator);
        own.on_retire_connection_id(&RetireConnectionIdFrame { sequence_number: 1 })
            .unwrap();
        // Retiring the same id twice: no error, nothing removed.
        assert!(own
            .on_retire_connection_id(&RetireConnectionIdFrame { sequence_number: 1 })
            .unwrap()
            .is_none());
    }
}
