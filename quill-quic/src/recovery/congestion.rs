//! Congestion control strategy seam (RFC 9002 Section 7).
//!
//! The core consults the controller through [`CongestionController`];
//! the algorithm behind it is pluggable. [`NewReno`] is the shipped
//! default and what the tests drive.

use core::fmt::Debug;
use core::time::Duration;

use crate::types::{Instant, PacketNumber};

/// Bytes newly acknowledged, with enough context to attribute them.
#[derive(Debug, Clone, Copy)]
pub struct AckEvent {
    pub acked_bytes: u64,
    pub largest_acked: PacketNumber,
    /// Send time of the largest newly acked packet.
    pub largest_acked_sent_time: Instant,
}

/// Bytes declared lost.
#[derive(Debug, Clone, Copy)]
pub struct LossEvent {
    pub lost_bytes: u64,
    /// Send time of the most recently sent lost packet.
    pub largest_lost_sent_time: Instant,
    /// The loss spans long enough without an ACK to collapse the window.
    pub persistent_congestion: bool,
}

/// Strategy contract consulted by the datapath.
pub trait CongestionController: Send + Debug {
    /// A packet of `size` bytes entered the network.
    fn on_packet_sent(&mut self, size: u64);

    /// ACK and/or loss outcome for previously sent packets. Either side
    /// may be absent; both together come from a single received ACK.
    fn on_packet_ack_or_loss(&mut self, ack: Option<&AckEvent>, loss: Option<&LossEvent>);

    /// Bytes leaving the registry without being acked or lost (space
    /// discard at key drop).
    fn on_bytes_neutered(&mut self, bytes: u64);

    /// Congestion-window head-room for new sends.
    fn writable_bytes(&self) -> u64;

    fn congestion_window(&self) -> u64;

    fn bytes_in_flight(&self) -> u64;

    /// Whether the sender last ran out of data rather than window.
    fn is_app_limited(&self) -> bool;

    /// Mark the sender application-limited (or not) as of the last write.
    fn set_app_limited(&mut self, limited: bool);
}

/// NewReno (RFC 9002 Appendix B style): slow start to first loss,
/// multiplicative decrease into recovery, additive increase after.
#[derive(Debug)]
pub struct NewReno {
    mss: u64,
    cwnd: u64,
    min_cwnd: u64,
    max_cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    /// Packets sent before this instant are in the current recovery
    /// episode and do not shrink the window again.
    recovery_start: Option<Instant>,
    app_limited: bool,
}

impl NewReno {
    pub fn new(mss: u64, init_cwnd_in_mss: u64, min_cwnd_in_mss: u64, max_cwnd_in_mss: u64) -> Self {
        Self {
            mss,
            cwnd: init_cwnd_in_mss * mss,
            min_cwnd: min_cwnd_in_mss * mss,
            max_cwnd: max_cwnd_in_mss * mss,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            app_limited: false,
        }
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        match self.recovery_start {
            Some(start) => sent_time <= start,
            None => false,
        }
    }

    fn on_ack(&mut self, ack: &AckEvent) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(ack.acked_bytes);
        if self.app_limited || self.in_recovery(ack.largest_acked_sent_time) {
            return;
        }
        if self.cwnd < self.ssthresh {
            self.cwnd = (self.cwnd + ack.acked_bytes).min(self.max_cwnd);
        } else {
            let increase = self.mss * ack.acked_bytes / self.cwnd;
            self.cwnd = (self.cwnd + increase).min(self.max_cwnd);
        }
    }

    fn on_loss(&mut self, loss: &LossEvent, now_hint: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(loss.lost_bytes);
        if loss.persistent_congestion {
            self.cwnd = self.min_cwnd;
            self.ssthresh = self.min_cwnd;
            self.recovery_start = Some(now_hint);
            return;
        }
        if !self.in_recovery(loss.largest_lost_sent_time) {
            self.ssthresh = (self.cwnd / 2).max(self.min_cwnd);
            self.cwnd = self.ssthresh;
            self.recovery_start = Some(loss.largest_lost_sent_time);
        }
    }
}

impl CongestionController for NewReno {
    fn on_packet_sent(&mut self, size: u64) {
        self.bytes_in_flight += size;
    }

    fn on_packet_ack_or_loss(&mut self, ack: Option<&AckEvent>, loss: Option<&LossEvent>) {
        if let Some(loss) = loss {
            let hint = ack
                .map(|a| a.largest_acked_sent_time)
                .unwrap_or(loss.largest_lost_sent_time);
            self.on_loss(loss, hint);
        }
        if let Some(ack) = ack {
            self.on_ack(ack);
        }
    }

    fn on_bytes_neutered(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn writable_bytes(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn is_app_limited(&self) -> bool {
        self.app_limited
    }

    fn set_app_limited(&mut self, limited: bool) {
        self.app_limited = limited;
    }
}

/// Duration an un-acked loss span must cover for persistent congestion:
/// `(pto) * 3` per RFC 9002 Section 7.6.1, computed by the caller.
pub fn persistent_congestion_threshold(pto: Duration) -> Duration {
    pto * 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newreno() -> NewReno {
        NewReno::new(1000, 10, 2, 2000)
    }

    #[test]
    fn test_slow_start_doubles_on_acks() {
        let mut cc = newreno();
        assert_eq!(cc.congestion_window(), 10_000);
        cc.on_packet_sent(10_000);
        cc.on_packet_ack_or_loss(
            Some(&AckEvent {
                acked_bytes: 10_000,
                largest_acked: 9,
                largest_acked_sent_time: Instant::from_millis(1),
            }),
            None,
        );
        assert_eq!(cc.congestion_window(), 20_000);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_loss_halves_window_and_enters_recovery() {
        let mut cc = newreno();
        cc.on_packet_sent(5000);
        cc.on_packet_ack_or_loss(
            None,
            Some(&LossEvent {
                lost_bytes: 1000,
                largest_lost_sent_time: Instant::from_millis(10),
                persistent_congestion: false,
            }),
        );
        assert_eq!(cc.congestion_window(), 5_000);
        // Loss of a packet sent within the same episode: no further cut.
        cc.on_packet_ack_or_loss(
            None,
            Some(&LossEvent {
                lost_bytes: 1000,
                largest_lost_sent_time: Instant::from_millis(5),
                persistent_congestion: false,
            }),
        );
        assert_eq!(cc.congestion_window(), 5_000);
        // A later-sent packet lost: new episode.
        cc.on_packet_ack_or_loss(
            None,
            Some(&LossEvent {
                lost_bytes: 1000,
                largest_lost_sent_time: Instant::from_millis(20),
                persistent_congestion: false,
            }),
        );
        assert_eq!(cc.congestion_window(), 2_500);
    }

    #[test]
    fn test_window_floor() {
        let mut cc = newreno();
        for i in 0..10 {
            cc.on_packet_ack_or_loss(
                None,
                Some(&LossEvent {
                    lost_bytes: 0,
                    largest_lost_sent_time: Instant::from_millis(100 * (i + 1)),
                    persistent_congestion: false,
                }),
            );
        }
        assert_eq!(cc.congestion_window(), 2_000);
    }

    #[test]
    fn test_persistent_congestion_collapses_window() {
        let mut cc = newreno();
        cc.on_packet_ack_or_loss(
            None,
            Some(&LossEvent {
                lost_bytes: 3000,
                largest_lost_sent_time: Instant::from_millis(50),
                persistent_congestion: true,
            }),
        );
        assert_eq!(cc.congestion_window(), 2_000);
    }

    #[test]
    fn test_congestion_avoidance_additive() {
        let mut cc = newreno();
        // Force out of slow start.
        cc.on_packet_ack_or_loss(
            None,
            Some(&LossEvent {
                lost_bytes: 0,
                largest_lost_sent_time: Instant::from_millis(1),
                persistent_congestion: false,
            }),
        );
        let cwnd = cc.congestion_window(); // 5000, ssthresh 5000
        cc.on_packet_sent(cwnd);
        cc.on_packet_ack_or_loss(
            Some(&AckEvent {
                acked_bytes: cwnd,
                largest_acked: 3,
                largest_acked_sent_time: Instant::from_millis(100),
            }),
            None,
        );
        // One MSS per cwnd of acked data.
        assert_eq!(cc.congestion_window(), cwnd + 1000);
    }

    #[test]
    fn test_app_limited_acks_do_not_grow_window() {
        let mut cc = newreno();
        cc.set_app_limited(true);
        assert!(cc.is_app_limited());
        cc.on_packet_sent(1000);
        cc.on_packet_ack_or_loss(
            Some(&AckEvent {
                acked_bytes: 1000,
                largest_acked: 0,
                largest_acked_sent_time: Instant::from_millis(1),
            }),
            None,
        );
        assert_eq!(cc.congestion_window(), 10_000);
    }

    #[test]
    fn test_writable_bytes() {
        let mut cc = newreno();
        cc.on_packet_sent(4_000);
        assert_eq!(cc.writable_bytes(), 6_000);
        cc.on_packet_sent(7_000);
        assert_eq!(cc.writable_bytes(), 0);
    }
}
