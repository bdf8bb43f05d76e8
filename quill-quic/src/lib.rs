//! # quill-quic: QUIC transport core datapath
//!
//! A deterministic, I/O-free implementation of the hard middle of a QUIC
//! transport: the wire codec, packet assembly, stream multiplexing, flow
//! control, acknowledgment bookkeeping, loss recovery with probe cloning,
//! pacing, path migration and connection-id routing.
//!
//! ## Architecture
//!
//! ```text
//! quill-quic/
//! ├── types         - varint codec, ids, packet numbers, clock
//! ├── error         - transport error codes and local error taxonomy
//! ├── config        - tunables and transport parameter codec
//! ├── frames        - write-form frame union, parser, serializer
//! ├── packet        - header codec, PN truncation, spaces, builder,
//! │                   outstanding-packet registry
//! ├── stream        - stream state machines, buffers, crypto stream
//! ├── flow_control  - connection/stream credit with blocked-once frames
//! ├── recovery      - rtt, loss + PTO, congestion seam, pacer, rebuild
//! ├── connection    - the event-driven connection state machine
//! ├── crypto        - AEAD / header-protection seam (no crypto inside)
//! ├── runtime       - socket, scheduler and routing callback seam
//! └── qlog          - structured observer event stream
//! ```
//!
//! ## Design principles
//!
//! 1. **Pure state machine.** No sockets, clocks or task spawning; the
//!    embedding worker feeds events in and drains datagrams out. One
//!    connection is owned by one worker; connections share nothing.
//! 2. **Reference-counted payloads.** Stream and crypto data move through
//!    the send buffers, the retransmission buffers and probe clones as
//!    [`bytes::Bytes`] views; cloning a packet bumps refcounts.
//! 3. **Trait seams for collaborators.** TLS, ciphers, congestion
//!    algorithms, timers and id routing plug in through traits; the
//!    defaults are enough to run the state machine in tests.
//! 4. **Deterministic time.** All timing flows through [`types::Instant`],
//!    a plain nanosecond counter the embedder (or a test) advances.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod qlog;
pub mod recovery;
pub mod runtime;
pub mod stream;
pub mod types;

pub use config::{TransportParameters, TransportSettings};
pub use connection::{
    CloseCause, Connection, ConnectionDeps, ConnectionLifecycle, RoutingConnectionIdGenerator,
    ServerConnectionIdParams,
};
pub use error::{ConnectionError, LocalError, TransportErrorCode};
pub use frames::Frame;
pub use packet::{BuiltPacket, PacketBuilder, QUIC_VERSION_1};
pub use recovery::{CongestionController, NewReno, Pacer};
pub use types::{ConnectionId, Instant, PacketNumber, PacketNumberSpace, Side, StreamId};
