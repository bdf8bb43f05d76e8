//! Flow control (RFC 9000 Section 4).
//!
//! Credit accounting at connection and stream granularity. The send side
//! tracks the peer's advertised limit against consumed offset and emits
//! DATA_BLOCKED / STREAM_DATA_BLOCKED at most once per window; the receive
//! side tracks what we advertised and regenerates window updates once half
//! the window is consumed.

use crate::error::{ConnectionError, Result, TransportErrorCode};

/// Send-direction credit against a peer-advertised limit.
///
/// Invariant: `consumed <= peer_max` at all times; a write that would
/// violate it must block instead.
#[derive(Debug, Clone)]
pub struct SendFlowControl {
    peer_max: u64,
    consumed: u64,
    /// Limit at which a blocked frame was already emitted; suppresses
    /// duplicates until the window moves.
    blocked_emitted_at: Option<u64>,
}

impl SendFlowControl {
    pub fn new(peer_max: u64) -> Self {
        Self {
            peer_max,
            consumed: 0,
            blocked_emitted_at: None,
        }
    }

    /// Bytes still sendable under the peer's limit.
    pub fn available(&self) -> u64 {
        self.peer_max - self.consumed
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn peer_max(&self) -> u64 {
        self.peer_max
    }

    /// Consume credit for bytes about to be sent.
    pub fn consume(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.available() {
            return Err(ConnectionError::transport(
                TransportErrorCode::FlowControlError,
                "send past advertised limit",
            ));
        }
        self.consumed += bytes;
        Ok(())
    }

    /// Raise the limit from a MAX_DATA / MAX_STREAM_DATA / MIN_STREAM_DATA
    /// frame. Regressions are ignored.
    pub fn on_limit_update(&mut self, new_max: u64) {
        if new_max > self.peer_max {
            self.peer_max = new_max;
            self.blocked_emitted_at = None;
        }
    }

    /// If blocked and not yet reported for this window, returns the limit
    /// to put in the blocked frame and marks it reported.
    pub fn should_emit_blocked(&mut self) -> Option<u64> {
        if self.available() > 0 {
            return None;
        }
        if self.blocked_emitted_at == Some(self.peer_max) {
            return None;
        }
        self.blocked_emitted_at = Some(self.peer_max);
        Some(self.peer_max)
    }
}

/// Receive-direction credit we advertise to the peer.
#[derive(Debug, Clone)]
pub struct RecvFlowControl {
    /// Current limit the peer may send up to.
    advertised_max: u64,
    /// Target window kept open beyond what was consumed.
    window: u64,
    /// Highest offset accepted so far (max, not sum).
    highest_received: u64,
    /// Bytes handed to the application (or discarded).
    consumed: u64,
    /// Last advertised value actually scheduled for sending.
    pending_update: Option<u64>,
}

impl RecvFlowControl {
    pub fn new(window: u64) -> Self {
        Self {
            advertised_max: window,
            window,
            highest_received: 0,
            consumed: 0,
            pending_update: None,
        }
    }

    pub fn advertised_max(&self) -> u64 {
        self.advertised_max
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    /// Account newly received data up to `offset`. `delta` new bytes are
    /// charged (connection level charges max-offset growth, not payload
    /// bytes).
    pub fn on_data_received(&mut self, new_highest: u64) -> Result<u64> {
        if new_highest > self.advertised_max {
            return Err(ConnectionError::transport(
                TransportErrorCode::FlowControlError,
                "peer exceeded advertised limit",
            ));
        }
        let delta = new_highest.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(new_highest);
        Ok(delta)
    }

    /// Bytes consumed by the application; opens window for regrant.
    pub fn on_consumed(&mut self, bytes: u64) {
        self.consumed += bytes;
    }

    /// Emit a window update when less than half the window remains.
    pub fn maybe_window_update(&mut self) -> Option<u64> {
        let in_window = self.advertised_max - self.consumed;
        if in_window >= self.window / 2 {
            return None;
        }
        let new_max = self.consumed + self.window;
        if new_max <= self.advertised_max {
            return None;
        }
        self.advertised_max = new_max;
        self.pending_update = Some(new_max);
        Some(new_max)
    }

    /// Regenerate the current limit (used when rebuilding a lost window
    /// update); `None` when no update is outstanding.
    pub fn current_update(&self) -> Option<u64> {
        self.pending_update
    }

    /// The update was acknowledged; stop regenerating it.
    pub fn on_update_acked(&mut self) {
        self.pending_update = None;
    }
}

/// Connection-level flow control pair.
#[derive(Debug, Clone)]
pub struct ConnectionFlowControl {
    pub send: SendFlowControl,
    pub recv: RecvFlowControl,
}

impl ConnectionFlowControl {
    pub fn new(peer_max_data: u64, local_window: u64) -> Self {
        Self {
            send: SendFlowControl::new(peer_max_data),
            recv: RecvFlowControl::new(local_window),
        }
    }
}

/// Stream-level flow control pair.
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    pub send: SendFlowControl,
    pub recv: RecvFlowControl,
}

impl StreamFlowControl {
    pub fn new(peer_max_stream_data: u64, local_window: u64) -> Self {
        Self {
            send: SendFlowControl::new(peer_max_stream_data),
            recv: RecvFlowControl::new(local_window),
        }
    }
}
