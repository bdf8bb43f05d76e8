//! Embedding seam: batch socket I/O, timer scheduling and connection-id
//! routing callbacks.
//!
//! The connection is a pure state machine; the worker that owns it
//! implements these traits over its UDP sockets and event loop. Nothing
//! here blocks, and the connection never holds a lock across any of these
//! calls.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::types::{ConnectionId, Instant};

/// One UDP datagram headed out.
#[derive(Debug, Clone)]
pub struct OutgoingDatagram {
    pub remote: SocketAddr,
    pub payload: Bytes,
}

/// One UDP datagram received.
#[derive(Debug, Clone)]
pub struct IncomingDatagram {
    pub remote: SocketAddr,
    pub payload: Bytes,
    pub received_at: Instant,
}

/// Batch writer over the shared UDP socket. Implementations serialize
/// concurrent callers at the socket layer.
pub trait SocketWriter: Send {
    /// Queue a batch for transmission; returns how many were accepted.
    fn send_batch(&mut self, datagrams: Vec<OutgoingDatagram>) -> usize;
}

/// Timer facility provided by the event loop.
pub trait Scheduler: Send {
    fn run_at(&mut self, deadline: Instant, token: u64);
    fn cancel(&mut self, token: u64);
}

/// Routing notifications for a connection-id-keyed dispatcher (e.g. an
/// L4 load balancer map). `on_connection_unbound` fires exactly once per
/// connection.
pub trait RoutingCallback: Send {
    /// A new self connection id exists but is not yet routable.
    fn on_connection_id_available(&mut self, source: &ConnectionId, id: &ConnectionId);

    /// The id is now bound to this connection and packets for it will
    /// arrive here.
    fn on_connection_id_bound(&mut self, id: &ConnectionId);

    /// The connection released all its ids.
    fn on_connection_unbound(&mut self, source: &ConnectionId, ids: &[ConnectionId]);
}

/// Routing callback that ignores everything.
#[derive(Debug, Default)]
pub struct NoopRouting;

impl RoutingCallback for NoopRouting {
    fn on_connection_id_available(&mut self, _source: &ConnectionId, _id: &ConnectionId) {}
    fn on_connection_id_bound(&mut self, _id: &ConnectionId) {}
    fn on_connection_unbound(&mut self, _source: &ConnectionId, _ids: &[ConnectionId]) {}
}

/// In-memory socket writer used by the tests.
#[derive(Debug, Default)]
pub struct BufferedSocketWriter {
    pub sent: Vec<OutgoingDatagram>,
}

impl SocketWriter for BufferedSocketWriter {
    fn send_batch(&mut self, mut datagrams: Vec<OutgoingDatagram>) -> usize {
        let accepted = datagrams.len();
        self.sent.append(&mut datagrams);
        accepted
    }
}

/// Routing callback that records invocations, used by the tests.
#[derive(Debug, Default)]
pub struct RecordingRouting {
    pub available: Vec<ConnectionId>,
    pub bound: Vec<ConnectionId>,
    pub unbound: Vec<Vec<ConnectionId>>,
}

impl RoutingCallback for RecordingRouting {
    fn on_connection_id_available(&mut self, _source: &ConnectionId, id: &ConnectionId) {
        self.available.push(id.clone());
    }

    fn on_connection_id_bound(&mut self, id: &ConnectionId) {
        self.bound.push(id.clone());
    }

    fn on_connection_unbound(&mut self, _source: &ConnectionId, ids: &[ConnectionId]) {
        self.unbound.push(ids.to_vec());
    }
}
