//! Cryptographic seam.
//!
//! The datapath never derives keys or runs a cipher; it consumes these
//! traits. The TLS collaborator hands the connection an implementation at
//! construction and signals key availability through the connection's
//! event surface. Test builds use the no-op implementations, which keep
//! packet layouts intact without protecting anything.

use bytes::{Bytes, BytesMut};

use crate::error::LocalError;
use crate::types::PacketNumber;

pub use crate::types::PacketNumberSpace;

/// AEAD seal/open for packet payloads.
pub trait AeadProvider: Send {
    /// Ciphertext expansion added by `seal`.
    fn cipher_overhead(&self) -> usize;

    /// Protect `body` for the given space; `header` is the associated
    /// data, `packet_number` the nonce input.
    fn seal(
        &self,
        space: PacketNumberSpace,
        header: &[u8],
        packet_number: PacketNumber,
        body: Bytes,
    ) -> Bytes;

    /// Open a protected body. Failure drops the datagram, never the
    /// connection.
    fn open(
        &self,
        space: PacketNumberSpace,
        header: &[u8],
        packet_number: PacketNumber,
        body: Bytes,
    ) -> Result<Bytes, LocalError>;
}

/// Header protection applied over the first byte and packet number bytes,
/// keyed by a ciphertext sample.
pub trait HeaderProtector: Send {
    fn protect(
        &self,
        space: PacketNumberSpace,
        first_byte: &mut u8,
        pn_bytes: &mut [u8],
        sample: &[u8],
    );

    fn unprotect(
        &self,
        space: PacketNumberSpace,
        first_byte: &mut u8,
        pn_bytes: &mut [u8],
        sample: &[u8],
    );
}

/// Pass-through AEAD: no expansion, no transformation. The unit-test
/// cipher.
#[derive(Debug, Default)]
pub struct NullAead;

impl AeadProvider for NullAead {
    fn cipher_overhead(&self) -> usize {
        0
    }

    fn seal(
        &self,
        _space: PacketNumberSpace,
        _header: &[u8],
        _packet_number: PacketNumber,
        body: Bytes,
    ) -> Bytes {
        body
    }

    fn open(
        &self,
        _space: PacketNumberSpace,
        _header: &[u8],
        _packet_number: PacketNumber,
        body: Bytes,
    ) -> Result<Bytes, LocalError> {
        Ok(body)
    }
}

/// AEAD that appends a fixed tag, for tests that need realistic sizes.
#[derive(Debug)]
pub struct TaggingAead {
    pub tag_len: usize,
}

impl AeadProvider for TaggingAead {
    fn cipher_overhead(&self) -> usize {
        self.tag_len
    }

    fn seal(
        &self,
        _space: PacketNumberSpace,
        _header: &[u8],
        _packet_number: PacketNumber,
        body: Bytes,
    ) -> Bytes {
        let mut out = BytesMut::with_capacity(body.len() + self.tag_len);
        out.extend_from_slice(&body);
        out.extend_from_slice(&vec![0u8; self.tag_len]);
        out.freeze()
    }

    fn open(
        &self,
        _space: PacketNumberSpace,
        _header: &[u8],
        _packet_number: PacketNumber,
        body: Bytes,
    ) -> Result<Bytes, LocalError> {
        if body.len() < self.tag_len {
            return Err(LocalError::DecryptionFailure);
        }
        Ok(body.slice(..body.len() - self.tag_len))
    }
}

/// No-op header protection.
#[derive(Debug, Default)]
pub struct NullHeaderProtector;

impl HeaderProtector for NullHeaderProtector {
    fn protect(
        &self,
        _space: PacketNumberSpace,
        _first_byte: &mut u8,
        _pn_bytes: &mut [u8],
        _sample: &[u8],
    ) {
    }

    fn unprotect(
        &self,
        _space: PacketNumberSpace,
        _first_byte: &mut u8,
        _pn_bytes: &mut [u8],
        _sample: &[u8],
    ) {
    }
}
