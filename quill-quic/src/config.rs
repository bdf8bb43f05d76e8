//! Transport configuration.
//!
//! [`TransportSettings`] holds local tunables that never cross the wire;
//! [`TransportParameters`] holds the values exchanged during the handshake
//! (RFC 9000 Section 18) together with their codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use core::time::Duration;

use crate::error::{CodecError, ConnectionError, TransportErrorCode};
use crate::types::{ConnectionId, StatelessResetToken, VarIntCodec};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_CONNECTION_WINDOW_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_STREAM_WINDOW_SIZE: u64 = 256 * 1024;
pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;
pub const DEFAULT_MAX_STREAMS_UNI: u64 = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;
pub const MAX_ACK_DELAY_EXPONENT: u64 = 20;
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);
pub const DEFAULT_WRITE_PACKETS_LIMIT: u64 = 5;
pub const DEFAULT_MIN_BURST_PACKETS: u64 = 5;
pub const DEFAULT_PACING_TICK_INTERVAL: Duration = Duration::from_millis(1);
pub const INIT_CWND_IN_MSS: u64 = 10;
pub const MIN_CWND_IN_MSS: u64 = 2;
pub const MAX_CWND_IN_MSS: u64 = 2000;
pub const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 4;
pub const MIN_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;
pub const DEFAULT_PACKET_REORDER_THRESHOLD: u64 = 3;
pub const DEFAULT_MAX_CONSECUTIVE_PTOS: u32 = 7;

/// Local tunables for one connection. These do not cross the wire; the
/// advertised subset is turned into [`TransportParameters`] at handshake.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Connection-level receive window advertised to the peer.
    pub advertised_connection_window: u64,
    /// Stream receive windows advertised to the peer, per stream class.
    pub advertised_stream_window_bidi_local: u64,
    pub advertised_stream_window_bidi_remote: u64,
    pub advertised_stream_window_uni: u64,
    pub advertised_max_streams_bidi: u64,
    pub advertised_max_streams_uni: u64,

    /// Idle timeout advertised to the peer.
    pub idle_timeout: Duration,
    /// ACK delay exponent used in the AppData space.
    pub ack_delay_exponent: u64,
    /// Maximum time we may sit on a pending ACK.
    pub max_ack_delay: Duration,
    /// ACK-eliciting packets received before an immediate ACK is forced.
    pub rx_packets_before_ack: u16,

    /// Largest UDP payload we are willing to receive.
    pub max_recv_packet_size: u64,
    /// UDP payload budget for packets we send.
    pub udp_send_packet_len: usize,

    /// Whether pacing shapes sends; when disabled, the writer limit rules.
    pub pacing_enabled: bool,
    /// Minimum packets per pacing burst.
    pub min_burst_packets: u64,
    /// Granularity of the pacing timer; RTTs below this disable pacing.
    pub pacing_timer_tick_interval: Duration,
    /// Packets written per uninhibited write loop invocation.
    pub write_connection_data_packets_limit: u64,

    pub init_cwnd_in_mss: u64,
    pub min_cwnd_in_mss: u64,
    pub max_cwnd_in_mss: u64,

    /// Reorder threshold for loss detection (packets).
    pub packet_reorder_threshold: u64,
    /// RTT estimate used before any sample exists.
    pub initial_rtt: Duration,
    /// Consecutive PTOs before the connection is abandoned.
    pub max_consecutive_ptos: u32,

    /// Whether MIN_STREAM_DATA / EXPIRED_STREAM_DATA are honored.
    pub partial_reliability_enabled: bool,
    /// Refuse peer address migration when set.
    pub disable_migration: bool,
    /// How many connection ids beyond the handshake id we issue.
    pub self_active_connection_id_limit: u64,
    /// Secret for stateless reset token derivation.
    pub stateless_reset_token_secret: Option<[u8; 32]>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            advertised_connection_window: DEFAULT_CONNECTION_WINDOW_SIZE,
            advertised_stream_window_bidi_local: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_stream_window_bidi_remote: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_stream_window_uni: DEFAULT_STREAM_WINDOW_SIZE,
            advertised_max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            advertised_max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            rx_packets_before_ack: 2,
            max_recv_packet_size: 1500,
            udp_send_packet_len: crate::types::DEFAULT_UDP_SEND_PACKET_LEN,
            pacing_enabled: false,
            min_burst_packets: DEFAULT_MIN_BURST_PACKETS,
            pacing_timer_tick_interval: DEFAULT_PACING_TICK_INTERVAL,
            write_connection_data_packets_limit: DEFAULT_WRITE_PACKETS_LIMIT,
            init_cwnd_in_mss: INIT_CWND_IN_MSS,
            min_cwnd_in_mss: MIN_CWND_IN_MSS,
            max_cwnd_in_mss: MAX_CWND_IN_MSS,
            packet_reorder_threshold: DEFAULT_PACKET_REORDER_THRESHOLD,
            initial_rtt: DEFAULT_INITIAL_RTT,
            max_consecutive_ptos: DEFAULT_MAX_CONSECUTIVE_PTOS,
            partial_reliability_enabled: false,
            disable_migration: false,
            self_active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            stateless_reset_token_secret: None,
        }
    }
}

// ============================================================================
// Transport Parameters (RFC 9000 Section 18)
// ============================================================================

const PARAM_ORIGINAL_CONNECTION_ID: u64 = 0x00;
const PARAM_MAX_IDLE_TIMEOUT: u64 = 0x01;
const PARAM_STATELESS_RESET_TOKEN: u64 = 0x02;
const PARAM_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const PARAM_INITIAL_MAX_DATA: u64 = 0x04;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const PARAM_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const PARAM_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const PARAM_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const PARAM_ACK_DELAY_EXPONENT: u64 = 0x0a;
const PARAM_MAX_ACK_DELAY: u64 = 0x0b;
const PARAM_DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PARAM_PREFERRED_ADDRESS: u64 = 0x0d;
const PARAM_ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// The handshake-exchanged transport parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub idle_timeout: Duration,
    pub max_recv_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay: Duration,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub original_connection_id: Option<ConnectionId>,
    /// Opaque preferred-address blob; interpretation is the embedder's.
    pub preferred_address: Option<Bytes>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_recv_packet_size: 1500,
            initial_max_data: DEFAULT_CONNECTION_WINDOW_SIZE,
            initial_max_stream_data_bidi_local: DEFAULT_STREAM_WINDOW_SIZE,
            initial_max_stream_data_bidi_remote: DEFAULT_STREAM_WINDOW_SIZE,
            initial_max_stream_data_uni: DEFAULT_STREAM_WINDOW_SIZE,
            initial_max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            initial_max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            disable_active_migration: false,
            active_connection_id_limit: MIN_ACTIVE_CONNECTION_ID_LIMIT,
            stateless_reset_token: None,
            original_connection_id: None,
            preferred_address: None,
        }
    }
}

impl TransportParameters {
    /// Build the advertisement for this endpoint from its settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            idle_timeout: settings.idle_timeout,
            max_recv_packet_size: settings.max_recv_packet_size,
            initial_max_data: settings.advertised_connection_window,
            initial_max_stream_data_bidi_local: settings.advertised_stream_window_bidi_local,
            initial_max_stream_data_bidi_remote: settings.advertised_stream_window_bidi_remote,
            initial_max_stream_data_uni: settings.advertised_stream_window_uni,
            initial_max_streams_bidi: settings.advertised_max_streams_bidi,
            initial_max_streams_uni: settings.advertised_max_streams_uni,
            ack_delay_exponent: settings.ack_delay_exponent,
            max_ack_delay: settings.max_ack_delay,
            disable_active_migration: settings.disable_migration,
            active_connection_id_limit: settings
                .self_active_connection_id_limit
                .max(MIN_ACTIVE_CONNECTION_ID_LIMIT),
            stateless_reset_token: None,
            original_connection_id: None,
            preferred_address: None,
        }
    }

    /// Encode as a sequence of (id, length, value) entries.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        put_varint_param(&mut out, PARAM_MAX_IDLE_TIMEOUT, self.idle_timeout.as_millis() as u64);
        put_varint_param(&mut out, PARAM_MAX_UDP_PAYLOAD_SIZE, self.max_recv_packet_size);
        put_varint_param(&mut out, PARAM_INITIAL_MAX_DATA, self.initial_max_data);
        put_varint_param(
            &mut out,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_varint_param(
            &mut out,
            PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_varint_param(
            &mut out,
            PARAM_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        put_varint_param(&mut out, PARAM_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_varint_param(&mut out, PARAM_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_varint_param(&mut out, PARAM_ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_varint_param(&mut out, PARAM_MAX_ACK_DELAY, self.max_ack_delay.as_millis() as u64);
        if self.disable_active_migration {
            put_raw_param(&mut out, PARAM_DISABLE_ACTIVE_MIGRATION, &[]);
        }
        put_varint_param(
            &mut out,
            PARAM_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if let Some(token) = &self.stateless_reset_token {
            put_raw_param(&mut out, PARAM_STATELESS_RESET_TOKEN, token);
        }
        if let Some(cid) = &self.original_connection_id {
            put_raw_param(&mut out, PARAM_ORIGINAL_CONNECTION_ID, cid.as_bytes());
        }
        if let Some(addr) = &self.preferred_address {
            put_raw_param(&mut out, PARAM_PREFERRED_ADDRESS, addr);
        }
        out.freeze()
    }

    /// Decode a peer's parameter blob.
    ///
    /// Duplicated ids, out-of-range exponents and a connection id limit
    /// below 2 are all `TRANSPORT_PARAMETER_ERROR`. Unknown ids are
    /// skipped.
    pub fn decode(mut buf: Bytes) -> Result<Self, ConnectionError> {
        let mut params = TransportParameters::default();
        let mut seen: Vec<u64> = Vec::new();
        while buf.has_remaining() {
            let id = VarIntCodec::decode(&mut buf).map_err(param_err)?;
            let len = VarIntCodec::decode(&mut buf).map_err(param_err)? as usize;
            if buf.remaining() < len {
                return Err(param_violation("truncated transport parameter"));
            }
            let mut value = buf.split_to(len);
            if seen.contains(&id) {
                return Err(param_violation("duplicate transport parameter"));
            }
            seen.push(id);
            match id {
                PARAM_MAX_IDLE_TIMEOUT => {
                    params.idle_timeout =
                        Duration::from_millis(decode_varint_value(&mut value)?);
                }
                PARAM_MAX_UDP_PAYLOAD_SIZE => {
                    let size = decode_varint_value(&mut value)?;
                    if size < crate::types::MIN_INITIAL_PACKET_SIZE as u64 {
                        return Err(param_violation("max_udp_payload_size below 1200"));
                    }
                    params.max_recv_packet_size = size;
                }
                PARAM_INITIAL_MAX_DATA => {
                    params.initial_max_data = decode_varint_value(&mut value)?;
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = decode_varint_value(&mut value)?;
                }
                PARAM_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = decode_varint_value(&mut value)?;
                }
                PARAM_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = decode_varint_value(&mut value)?;
                }
                PARAM_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = decode_varint_value(&mut value)?;
                }
                PARAM_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = decode_varint_value(&mut value)?;
                }
                PARAM_ACK_DELAY_EXPONENT => {
                    let exp = decode_varint_value(&mut value)?;
                    if exp > MAX_ACK_DELAY_EXPONENT {
                        return Err(param_violation("ack_delay_exponent above 20"));
                    }
                    params.ack_delay_exponent = exp;
                }
                PARAM_MAX_ACK_DELAY => {
                    params.max_ack_delay =
                        Duration::from_millis(decode_varint_value(&mut value)?);
                }
                PARAM_DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(param_violation("disable_active_migration carries a value"));
                    }
                    params.disable_active_migration = true;
                }
                PARAM_ACTIVE_CONNECTION_ID_LIMIT => {
                    let limit = decode_varint_value(&mut value)?;
                    if limit < MIN_ACTIVE_CONNECTION_ID_LIMIT {
                        return Err(param_violation("active_connection_id_limit below 2"));
                    }
                    params.active_connection_id_limit = limit;
                }
                PARAM_STATELESS_RESET_TOKEN => {
                    if value.len() != 16 {
                        return Err(param_violation("stateless_reset_token length"));
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&value);
                    params.stateless_reset_token = Some(token);
                }
                PARAM_ORIGINAL_CONNECTION_ID => {
                    params.original_connection_id = ConnectionId::new(value.clone());
                    if params.original_connection_id.is_none() {
                        return Err(param_violation("original_connection_id length"));
                    }
                }
                PARAM_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(value.clone());
                }
                _ => {
                    // Unknown parameters are ignored.
                }
            }
        }
        Ok(params)
    }
}

fn put_varint_param(out: &mut BytesMut, id: u64, value: u64) {
    VarIntCodec::encode(id, out).expect("param id fits varint");
    VarIntCodec::encode(VarIntCodec::size(value) as u64, out).expect("len fits varint");
    VarIntCodec::encode(value, out).expect("param value fits varint");
}

fn put_raw_param(out: &mut BytesMut, id: u64, value: &[u8]) {
    VarIntCodec::encode(id, out).expect("param id fits varint");
    VarIntCodec::encode(value.len() as u64, out).expect("len fits varint");
    out.put_slice(value);
}

fn decode_varint_value(value: &mut Bytes) -> Result<u64, ConnectionError> {
    let v = VarIntCodec::decode(value).map_err(param_err)?;
    if value.has_remaining() {
        return Err(param_violation("trailing bytes in transport parameter"));
    }
    Ok(v)
}

fn param_err(_: CodecError) -> ConnectionError {
    param_violation("malformed transport parameter")
}

fn param_violation(reason: &'static str) -> ConnectionError {
    ConnectionError::Transport {
        code: TransportErrorCode::TransportParameterError,
        frame_type: None,
        reason,
    }
}
