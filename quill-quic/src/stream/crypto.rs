//! The crypto stream: per-space ordered byte stream for handshake
//! messages. Structured like a data stream minus flow control and stream
//! id, with a hard receive-buffer cap instead.

use bytes::Bytes;

use crate::error::{ConnectionError, Result, TransportErrorCode};
use crate::stream::buffer::{RecvBuffer, RetransmissionBuffer, StreamBuffer, WriteBuffer};
use crate::types::StreamOffset;

/// Bound on buffered out-of-order crypto data.
pub const DEFAULT_CRYPTO_BUFFER_LIMIT: u64 = 128 * 1024;

#[derive(Debug)]
pub struct CryptoStream {
    pub write_buffer: WriteBuffer,
    pub retransmission_buffer: RetransmissionBuffer,
    pub loss_buffer: Vec<StreamBuffer>,
    write_offset: StreamOffset,
    recv_buffer: RecvBuffer,
    recv_buffer_limit: u64,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self {
            write_buffer: WriteBuffer::new(),
            retransmission_buffer: RetransmissionBuffer::new(),
            loss_buffer: Vec::new(),
            write_offset: 0,
            recv_buffer: RecvBuffer::new(),
            recv_buffer_limit: DEFAULT_CRYPTO_BUFFER_LIMIT,
        }
    }

    /// Queue handshake bytes from the TLS collaborator.
    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let offset = self.write_offset;
        self.write_offset += data.len() as u64;
        self.write_buffer.push(StreamBuffer::new(offset, data, false));
    }

    pub fn has_writable_data(&self) -> bool {
        !self.loss_buffer.is_empty() || !self.write_buffer.is_empty()
    }

    /// Next chunk for the wire, lost data first.
    pub fn next_send_chunk(&mut self, max_len: u64) -> Option<StreamBuffer> {
        if max_len == 0 {
            return None;
        }
        if let Some(first) = self.loss_buffer.first() {
            if first.len() <= max_len {
                return Some(self.loss_buffer.remove(0));
            }
            let first = &mut self.loss_buffer[0];
            let taken = first.data.split_to(max_len as usize);
            let chunk = StreamBuffer::new(first.offset, taken, false);
            first.offset += max_len;
            return Some(chunk);
        }
        self.write_buffer.pop_up_to(max_len)
    }

    pub fn on_chunk_sent(&mut self, chunk: StreamBuffer) {
        self.retransmission_buffer.insert(chunk);
    }

    pub fn on_chunk_acked(&mut self, offset: StreamOffset) {
        self.retransmission_buffer.remove(offset);
    }

    pub fn on_chunk_lost(&mut self, offset: StreamOffset) {
        if let Some(chunk) = self.retransmission_buffer.remove(offset) {
            let at = self
                .loss_buffer
                .binary_search_by_key(&chunk.offset, |c| c.offset)
                .unwrap_or_else(|i| i);
            self.loss_buffer.insert(at, chunk);
        }
    }

    /// Look up a sent chunk for cloning into a probe.
    pub fn retransmission_chunk(&self, offset: StreamOffset) -> Option<&StreamBuffer> {
        self.retransmission_buffer.get(offset)
    }

    /// Buffer received handshake bytes, bounded by the crypto buffer cap.
    pub fn on_data_received(&mut self, offset: StreamOffset, data: Bytes) -> Result<()> {
        self.recv_buffer.insert(offset, data, false)?;
        if self.recv_buffer.buffered_bytes() > self.recv_buffer_limit {
            return Err(ConnectionError::transport(
                TransportErrorCode::CryptoBufferExceeded,
                "crypto reassembly buffer overflow",
            ));
        }
        Ok(())
    }

    /// In-order handshake bytes for the TLS collaborator.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        self.recv_buffer.read(max_len)
    }

    pub fn has_readable_data(&self) -> bool {
        self.recv_buffer.contiguous_end() > self.recv_buffer.read_offset()
    }
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_send_ack_cycle() {
        let mut cs = CryptoStream::new();
        cs.write(Bytes::from_static(b"client hello"));
        let chunk = cs.next_send_chunk(6).unwrap();
        assert_eq!((chunk.offset, &chunk.data[..]), (0, &b"client"[..]));
        cs.on_chunk_sent(chunk);
        assert!(cs.retransmission_chunk(0).is_some());
        cs.on_chunk_acked(0);
        assert!(cs.retransmission_chunk(0).is_none());
    }

    #[test]
    fn test_lost_chunk_resent_first() {
        let mut cs = CryptoStream::new();
        cs.write(Bytes::from_static(b"abcdef"));
        let chunk = cs.next_send_chunk(3).unwrap();
        cs.on_chunk_sent(chunk);
        cs.on_chunk_lost(0);
        let resend = cs.next_send_chunk(10).unwrap();
        assert_eq!(resend.offset, 0);
        assert_eq!(&resend.data[..], b"abc");
        let fresh = cs.next_send_chunk(10).unwrap();
        assert_eq!(fresh.offset, 3);
    }

    #[test]
    fn test_recv_reassembly_in_order() {
        let mut cs = CryptoStream::new();
        cs.on_data_received(5, Bytes::from_static(b"world")).unwrap();
        assert!(!cs.has_readable_data());
        cs.on_data_received(0, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(&cs.read(100).unwrap()[..], b"hello");
        assert_eq!(&cs.read(100).unwrap()[..], b"world");
    }

    #[test]
    fn test_crypto_buffer_cap() {
        let mut cs = CryptoStream::new();
        cs.recv_buffer_limit = 10;
        // Out-of-order data beyond the cap.
        let err = cs
            .on_data_received(100, Bytes::from(vec![0u8; 11]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                code: TransportErrorCode::CryptoBufferExceeded,
                ..
            }
        ));
    }
}
