//! Stream data buffers.
//!
//! All buffered data is held as reference-counted [`Bytes`] views; moving a
//! chunk between the write, retransmission and loss buffers, or cloning it
//! into a probe packet, never copies payload bytes.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

use crate::error::{ConnectionError, Result, TransportErrorCode};
use crate::types::StreamOffset;

/// One contiguous span of stream data at a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    pub offset: StreamOffset,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamBuffer {
    pub fn new(offset: StreamOffset, data: Bytes, fin: bool) -> Self {
        Self { offset, data, fin }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte.
    pub fn end_offset(&self) -> StreamOffset {
        self.offset + self.len()
    }
}

// ============================================================================
// Send Side
// ============================================================================

/// Unsent application data, in offset order.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    chunks: VecDeque<StreamBuffer>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: StreamBuffer) {
        self.chunks.push_back(chunk);
    }

    pub fn front(&self) -> Option<&StreamBuffer> {
        self.chunks.front()
    }

    /// Take up to `max_len` bytes off the front. The returned chunk's fin
    /// bit is set only when it carries the final byte.
    pub fn pop_up_to(&mut self, max_len: u64) -> Option<StreamBuffer> {
        let (len, is_empty_fin) = {
            let front = self.chunks.front()?;
            (front.len(), front.is_empty() && front.fin)
        };
        if max_len == 0 && !is_empty_fin {
            return None;
        }
        if len <= max_len {
            return self.chunks.pop_front();
        }
        let front = self.chunks.front_mut().expect("front checked above");
        let taken = front.data.split_to(max_len as usize);
        let chunk = StreamBuffer::new(front.offset, taken, false);
        front.offset += max_len;
        Some(chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(StreamBuffer::len).sum()
    }

    /// Skip everything below `offset` (partial reliability fast-forward).
    pub fn discard_below(&mut self, offset: StreamOffset) {
        while let Some(front) = self.chunks.front_mut() {
            if front.end_offset() <= offset {
                // A skipped FIN still has to be delivered at the new offset.
                let fin = front.fin;
                let end = front.end_offset();
                let _ = self.chunks.pop_front();
                if fin && self.chunks.is_empty() {
                    self.chunks
                        .push_back(StreamBuffer::new(end.max(offset), Bytes::new(), true));
                }
                continue;
            }
            if front.offset < offset {
                let skip = (offset - front.offset) as usize;
                let _ = front.data.split_to(skip);
                front.offset = offset;
            }
            break;
        }
    }
}

/// Sent-but-unacknowledged chunks, keyed by the offset they were sent at.
#[derive(Debug, Clone, Default)]
pub struct RetransmissionBuffer {
    entries: BTreeMap<StreamOffset, StreamBuffer>,
}

impl RetransmissionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: StreamBuffer) {
        self.entries.insert(chunk.offset, chunk);
    }

    pub fn get(&self, offset: StreamOffset) -> Option<&StreamBuffer> {
        self.entries.get(&offset)
    }

    pub fn remove(&mut self, offset: StreamOffset) -> Option<StreamBuffer> {
        self.entries.remove(&offset)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(StreamBuffer::len).sum()
    }

    /// Drop entries wholly below `offset`, trimming one straddling entry.
    pub fn discard_below(&mut self, offset: StreamOffset) {
        let to_remove: Vec<StreamOffset> = self
            .entries
            .range(..offset)
            .map(|(&o, _)| o)
            .collect();
        for old_offset in to_remove {
            let Some(entry) = self.entries.remove(&old_offset) else {
                continue;
            };
            if entry.end_offset() > offset {
                let keep = entry.data.slice((offset - entry.offset) as usize..);
                self.entries
                    .insert(offset, StreamBuffer::new(offset, keep, entry.fin));
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// Receive Side
// ============================================================================

/// Out-of-order reassembly with hole tracking.
///
/// Chunks are stored disjoint; bytes below the read offset are dropped on
/// arrival. Reads return data strictly in offset order.
#[derive(Debug, Clone)]
pub struct RecvBuffer {
    chunks: BTreeMap<StreamOffset, Bytes>,
    read_offset: StreamOffset,
    final_size: Option<StreamOffset>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            read_offset: 0,
            final_size: None,
        }
    }

    pub fn read_offset(&self) -> StreamOffset {
        self.read_offset
    }

    pub fn final_size(&self) -> Option<StreamOffset> {
        self.final_size
    }

    /// Highest contiguous offset available to read from `read_offset`.
    pub fn contiguous_end(&self) -> StreamOffset {
        let mut end = self.read_offset;
        for (&start, data) in self.chunks.range(self.read_offset..) {
            if start > end {
                break;
            }
            end = end.max(start + data.len() as u64);
        }
        end
    }

    /// Insert received data. Returns the new highest received offset.
    pub fn insert(&mut self, offset: StreamOffset, data: Bytes, fin: bool) -> Result<StreamOffset> {
        let end = offset + data.len() as u64;
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(final_size_error());
            }
        } else if fin {
            if end < self.highest_received() {
                return Err(final_size_error());
            }
            self.final_size = Some(end);
        }

        if end > self.read_offset && !data.is_empty() {
            let (offset, data) = if offset < self.read_offset {
                let skip = (self.read_offset - offset) as usize;
                (self.read_offset, data.slice(skip..))
            } else {
                (offset, data)
            };
            self.insert_disjoint(offset, data);
        }
        Ok(self.highest_received())
    }

    fn insert_disjoint(&mut self, mut offset: StreamOffset, mut data: Bytes) {
        while !data.is_empty() {
            let end = offset + data.len() as u64;
            // An existing chunk starting at or before `offset` may cover
            // the head of the incoming data.
            if let Some((&start, existing)) = self.chunks.range(..=offset).next_back() {
                let existing_end = start + existing.len() as u64;
                if existing_end > offset {
                    if existing_end >= end {
                        return;
                    }
                    data = data.slice((existing_end - offset) as usize..);
                    offset = existing_end;
                    continue;
                }
            }
            // Write up to the next stored chunk.
            match self.chunks.range(offset..).next().map(|(&s, _)| s) {
                Some(next_start) if next_start < end => {
                    let head = data.slice(..(next_start - offset) as usize);
                    data = data.slice((next_start - offset) as usize..);
                    self.chunks.insert(offset, head);
                    offset = next_start;
                }
                _ => {
                    self.chunks.insert(offset, data);
                    return;
                }
            }
        }
    }

    /// Read up to `max_len` contiguous bytes.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let chunk = self.chunks.remove(&self.read_offset)?;
        let len = chunk.len().min(max_len);
        self.read_offset += len as u64;
        if len < chunk.len() {
            self.chunks.insert(self.read_offset, chunk.slice(len..));
        }
        Some(chunk.slice(..len))
    }

    pub fn highest_received(&self) -> StreamOffset {
        let buffered_max = self
            .chunks
            .iter()
            .next_back()
            .map(|(&s, d)| s + d.len() as u64)
            .unwrap_or(0);
        buffered_max.max(self.read_offset).max(self.final_size.unwrap_or(0))
    }

    /// All bytes up to the final size have been read.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.chunks.values().map(|d| d.len() as u64).sum()
    }

    /// Jump the read offset forward (partial reliability skip). Data below
    /// the new offset is discarded. Clamped to the final size when known.
    pub fn advance_read_offset(&mut self, offset: StreamOffset) {
        let target = match self.final_size {
            Some(final_size) => offset.min(final_size),
            None => offset,
        };
        if target <= self.read_offset {
            return;
        }
        let below: Vec<StreamOffset> = self.chunks.range(..target).map(|(&s, _)| s).collect();
        for start in below {
            let Some(data) = self.chunks.remove(&start) else {
                continue;
            };
            let end = start + data.len() as u64;
            if end > target {
                self.chunks.insert(target, data.slice((target - start) as usize..));
            }
        }
        self.read_offset = target;
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn final_size_error() -> ConnectionError {
    ConnectionError::transport(TransportErrorCode::FinalSizeError, "final size changed")
}
