//! Connection lifecycle.
//!
//! `Handshaking → Established → Closing → Draining → Closed`, with
//! Closing entered on a local fatal decision (a CONNECTION_CLOSE goes
//! out) and Draining entered on a peer close or after the Closing period
//! (nothing more is sent). The terminal transition to Closed fires the
//! routing unbind exactly once.

use bytes::Bytes;

use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLifecycle {
    Handshaking,
    Established,
    Closing,
    Draining,
    Closed,
}

impl ConnectionLifecycle {
    /// Normal operation: frames are processed and emitted.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionLifecycle::Handshaking | ConnectionLifecycle::Established
        )
    }

    /// Whether any packet may still leave this connection.
    pub fn may_send(self) -> bool {
        self.is_open() || self == ConnectionLifecycle::Closing
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionLifecycle::Handshaking => "handshaking",
            ConnectionLifecycle::Established => "established",
            ConnectionLifecycle::Closing => "closing",
            ConnectionLifecycle::Draining => "draining",
            ConnectionLifecycle::Closed => "closed",
        }
    }
}

/// Why the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// We decided to close (wire-visible unless the error is local-only).
    Local(ConnectionError),
    /// The peer sent CONNECTION_CLOSE.
    Peer {
        error_code: u64,
        application: bool,
        reason: Bytes,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_predicates() {
        assert!(ConnectionLifecycle::Handshaking.is_open());
        assert!(ConnectionLifecycle::Established.is_open());
        assert!(!ConnectionLifecycle::Closing.is_open());
        assert!(ConnectionLifecycle::Closing.may_send());
        assert!(!ConnectionLifecycle::Draining.may_send());
        assert!(!ConnectionLifecycle::Closed.may_send());
    }
}
