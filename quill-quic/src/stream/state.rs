//! Per-stream state (RFC 9000 Sections 3, 4).
//!
//! Send side walks `Ready → Send → DataSent → DataReceived`, with the
//! `ResetSent → ResetReceived` side branch; receive side walks
//! `Recv → SizeKnown → DataRead`, with `ResetRecvd → ResetRead`.
//! Data lives in three send buffers (pending write, retransmission keyed
//! by sent offset, loss) plus the receive reassembly buffer.

use bytes::Bytes;

use crate::error::{ConnectionError, Result, TransportErrorCode};
use crate::flow_control::StreamFlowControl;
use crate::stream::buffer::{RecvBuffer, RetransmissionBuffer, StreamBuffer, WriteBuffer};
use crate::types::{StreamId, StreamOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStreamState {
    Ready,
    Send,
    DataSent,
    DataReceived,
    ResetSent,
    ResetReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStreamState {
    Recv,
    SizeKnown,
    DataRead,
    ResetRecvd,
    ResetRead,
}

/// Full state of one stream.
#[derive(Debug)]
pub struct StreamState {
    pub id: StreamId,
    pub send_state: SendStreamState,
    pub recv_state: RecvStreamState,

    /// Data the application wrote but the wire has not carried yet.
    pub write_buffer: WriteBuffer,
    /// Sent data awaiting acknowledgment, keyed by sent offset.
    pub retransmission_buffer: RetransmissionBuffer,
    /// Data declared lost, awaiting resend, offset-ascending.
    pub loss_buffer: Vec<StreamBuffer>,

    /// Next fresh offset the wire will carry.
    pub send_offset: StreamOffset,
    /// Next offset the application's writes land at.
    pub write_offset: StreamOffset,
    pub acked_bytes: u64,
    pub fin_queued: bool,
    pub fin_sent: bool,
    pub fin_acked: bool,
    /// Data below this offset will never be retransmitted (partial
    /// reliability).
    pub minimum_retransmittable_offset: StreamOffset,

    pub recv_buffer: RecvBuffer,

    pub flow_control: StreamFlowControl,

    /// Error code from a received RESET_STREAM.
    pub reset_error_code: Option<u64>,
    /// Error code from a received STOP_SENDING.
    pub stop_sending_error_code: Option<u64>,
}

impl StreamState {
    pub fn new(id: StreamId, flow_control: StreamFlowControl) -> Self {
        Self {
            id,
            send_state: SendStreamState::Ready,
            recv_state: RecvStreamState::Recv,
            write_buffer: WriteBuffer::new(),
            retransmission_buffer: RetransmissionBuffer::new(),
            loss_buffer: Vec::new(),
            send_offset: 0,
            write_offset: 0,
            acked_bytes: 0,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            minimum_retransmittable_offset: 0,
            recv_buffer: RecvBuffer::new(),
            flow_control,
            reset_error_code: None,
            stop_sending_error_code: None,
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Whether data can still be queued or sent on this stream.
    pub fn sendable(&self) -> bool {
        matches!(
            self.send_state,
            SendStreamState::Ready | SendStreamState::Send | SendStreamState::DataSent
        )
    }

    /// Whether lost data may still be resent on this stream.
    pub fn retransmittable(&self) -> bool {
        self.sendable()
    }

    /// Queue application data.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if !self.sendable() || self.fin_queued {
            return Err(ConnectionError::transport(
                TransportErrorCode::StreamStateError,
                "write on closed stream",
            ));
        }
        let len = data.len() as u64;
        if !data.is_empty() || fin {
            self.write_buffer
                .push(StreamBuffer::new(self.write_offset, data, fin));
        }
        self.write_offset += len;
        if fin {
            self.fin_queued = true;
        }
        Ok(())
    }

    /// Data pending first transmission or retransmission.
    pub fn has_writable_data(&self) -> bool {
        if !self.sendable() {
            return false;
        }
        !self.loss_buffer.is_empty()
            || !self.write_buffer.is_empty()
            || (self.fin_queued && !self.fin_sent)
    }

    /// Next chunk to put on the wire: lost data first, then fresh data
    /// bounded by `max_len` (the caller has already applied flow control
    /// to fresh data).
    pub fn next_send_chunk(&mut self, max_len: u64) -> Option<StreamBuffer> {
        if !self.sendable() {
            return None;
        }
        if let Some(chunk) = self.pop_loss_chunk(max_len) {
            return Some(chunk);
        }
        let chunk = self.write_buffer.pop_up_to(max_len)?;
        self.send_offset = self.send_offset.max(chunk.end_offset());
        Some(chunk)
    }

    /// Pop lost data only (already flow-control charged when first sent).
    pub fn pop_lost_chunk(&mut self, max_len: u64) -> Option<StreamBuffer> {
        if !self.sendable() {
            return None;
        }
        self.pop_loss_chunk(max_len)
    }

    /// Pop fresh data only; the caller charges flow control for it.
    pub fn pop_fresh_chunk(&mut self, max_len: u64) -> Option<StreamBuffer> {
        if !self.sendable() {
            return None;
        }
        let chunk = self.write_buffer.pop_up_to(max_len)?;
        self.send_offset = self.send_offset.max(chunk.end_offset());
        Some(chunk)
    }

    fn pop_loss_chunk(&mut self, max_len: u64) -> Option<StreamBuffer> {
        let (len, is_empty_fin) = {
            let first = self.loss_buffer.first()?;
            (first.len(), first.is_empty() && first.fin)
        };
        if max_len == 0 && !is_empty_fin {
            return None;
        }
        if len <= max_len {
            return Some(self.loss_buffer.remove(0));
        }
        let first = &mut self.loss_buffer[0];
        let taken = first.data.split_to(max_len as usize);
        let chunk = StreamBuffer::new(first.offset, taken, false);
        first.offset += max_len;
        Some(chunk)
    }

    /// Fresh bytes available to send (peeked for flow-control budgeting).
    pub fn pending_fresh_bytes(&self) -> u64 {
        self.write_buffer.total_bytes()
    }

    pub fn has_lost_data(&self) -> bool {
        !self.loss_buffer.is_empty()
    }

    /// Record a STREAM frame hitting the wire.
    pub fn on_stream_frame_sent(&mut self, chunk: StreamBuffer) {
        if chunk.fin {
            self.fin_sent = true;
        }
        if self.send_state == SendStreamState::Ready {
            self.send_state = SendStreamState::Send;
        }
        if self.fin_sent && self.write_buffer.is_empty() && self.send_state == SendStreamState::Send
        {
            self.send_state = SendStreamState::DataSent;
        }
        self.retransmission_buffer.insert(chunk);
    }

    /// The packet carrying the chunk sent at `offset` was acknowledged.
    pub fn on_stream_frame_acked(&mut self, offset: StreamOffset) {
        if let Some(chunk) = self.retransmission_buffer.remove(offset) {
            self.acked_bytes += chunk.len();
            if chunk.fin {
                self.fin_acked = true;
            }
        }
        if self.all_data_acked()
            && matches!(
                self.send_state,
                SendStreamState::Send | SendStreamState::DataSent
            )
        {
            self.send_state = SendStreamState::DataReceived;
        }
    }

    /// The packet carrying the chunk sent at `offset` was declared lost:
    /// move the data to the loss buffer unless partial reliability has
    /// expired it.
    pub fn on_stream_frame_lost(&mut self, offset: StreamOffset) {
        let Some(chunk) = self.retransmission_buffer.remove(offset) else {
            return;
        };
        if chunk.end_offset() <= self.minimum_retransmittable_offset && !chunk.fin {
            return;
        }
        let at = self
            .loss_buffer
            .binary_search_by_key(&chunk.offset, |c| c.offset)
            .unwrap_or_else(|i| i);
        self.loss_buffer.insert(at, chunk);
    }

    pub fn all_data_acked(&self) -> bool {
        self.fin_acked
            && self.write_buffer.is_empty()
            && self.retransmission_buffer.is_empty()
            && self.loss_buffer.is_empty()
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Locally reset the send side; pending data is dropped.
    pub fn reset_send(&mut self) {
        if !self.sendable() {
            return;
        }
        self.send_state = SendStreamState::ResetSent;
        self.write_buffer = WriteBuffer::new();
        self.retransmission_buffer.clear();
        self.loss_buffer.clear();
    }

    /// Our RESET_STREAM was acknowledged.
    pub fn on_reset_acked(&mut self) {
        if self.send_state == SendStreamState::ResetSent {
            self.send_state = SendStreamState::ResetReceived;
        }
    }

    /// Peer reset its send side (our receive side).
    pub fn on_reset_received(&mut self, error_code: u64, final_size: StreamOffset) -> Result<()> {
        if let Some(known) = self.recv_buffer.final_size() {
            if known != final_size {
                return Err(ConnectionError::transport(
                    TransportErrorCode::FinalSizeError,
                    "reset final size mismatch",
                ));
            }
        }
        if final_size < self.recv_buffer.highest_received() {
            return Err(ConnectionError::transport(
                TransportErrorCode::FinalSizeError,
                "reset below received data",
            ));
        }
        if matches!(
            self.recv_state,
            RecvStreamState::Recv | RecvStreamState::SizeKnown
        ) {
            self.recv_state = RecvStreamState::ResetRecvd;
            self.reset_error_code = Some(error_code);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Apply a received STREAM frame. Returns the growth of the highest
    /// received offset (for connection-level flow control).
    pub fn on_stream_frame_received(
        &mut self,
        offset: StreamOffset,
        data: Bytes,
        fin: bool,
    ) -> Result<u64> {
        if matches!(
            self.recv_state,
            RecvStreamState::ResetRecvd | RecvStreamState::ResetRead
        ) {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        let before = self.recv_buffer.highest_received();
        self.flow_control.recv.on_data_received(end)?;
        self.recv_buffer.insert(offset, data, fin)?;
        if fin && self.recv_state == RecvStreamState::Recv {
            self.recv_state = RecvStreamState::SizeKnown;
        }
        Ok(self.recv_buffer.highest_received().saturating_sub(before))
    }

    /// Read reassembled data for the application.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let data = self.recv_buffer.read(max_len)?;
        self.flow_control.recv.on_consumed(data.len() as u64);
        if self.recv_buffer.is_finished() && self.recv_state == RecvStreamState::SizeKnown {
            self.recv_state = RecvStreamState::DataRead;
        }
        Some(data)
    }

    pub fn has_readable_data(&self) -> bool {
        self.recv_buffer.contiguous_end() > self.recv_buffer.read_offset()
    }

    // ------------------------------------------------------------------
    // Partial reliability
    // ------------------------------------------------------------------

    /// Sender side: the receiver will not accept retransmissions below
    /// `offset`. Drops expired data from every send buffer.
    pub fn advance_minimum_retransmittable_offset(&mut self, offset: StreamOffset) {
        if offset <= self.minimum_retransmittable_offset {
            return;
        }
        self.minimum_retransmittable_offset = offset;
        self.retransmission_buffer.discard_below(offset);
        self.loss_buffer.retain_mut(|chunk| {
            if chunk.end_offset() <= offset {
                return chunk.fin && chunk.is_empty();
            }
            if chunk.offset < offset {
                let skip = (offset - chunk.offset) as usize;
                let _ = chunk.data.split_to(skip);
                chunk.offset = offset;
            }
            true
        });
        self.write_buffer.discard_below(offset);
        if self.send_offset < offset {
            self.send_offset = offset;
        }
    }

    /// Receiver side: the sender will not retransmit below `offset`; skip
    /// the gap.
    pub fn advance_receive_offset(&mut self, offset: StreamOffset) {
        self.recv_buffer.advance_read_offset(offset);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Both directions have reached a terminal state.
    pub fn is_closed(&self) -> bool {
        let send_done = matches!(
            self.send_state,
            SendStreamState::DataReceived | SendStreamState::ResetReceived
        );
        let recv_done = matches!(
            self.recv_state,
            RecvStreamState::DataRead | RecvStreamState::ResetRead
        );
        let recv_done = recv_done
            || (self.id.is_unidirectional() && self.recv_state == RecvStreamState::Recv);
        let send_done =
            send_done || (self.id.is_unidirectional() && self.send_state == SendStreamState::Ready);
        send_done && recv_done
    }
}
