//! Per-packet-number-space receive state and ACK scheduling.
//!
//! Each of the three spaces tracks what it has received as a set of
//! disjoint, coalesced intervals (largest first), schedules ACK emission
//! against `max_ack_delay`, and allocates strictly increasing send-side
//! packet numbers.

use core::time::Duration;

use crate::config::DEFAULT_ACK_DELAY_EXPONENT;
use crate::frames::AckBlock;
use crate::types::{Instant, PacketNumber, PacketNumberSpace};

/// Upper bound on stored ACK intervals; the smallest ranges are pruned
/// first once exceeded.
const MAX_ACK_INTERVALS: usize = 64;

// ============================================================================
// ACK Interval Set
// ============================================================================

/// Disjoint received-packet intervals, sorted descending by start.
#[derive(Debug, Clone, Default)]
pub struct AckIntervalSet {
    intervals: Vec<AckBlock>,
}

impl AckIntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record receipt of `pn`, merging into adjacent intervals.
    pub fn insert(&mut self, pn: PacketNumber) {
        // Find the insertion point in the descending list.
        let mut idx = 0;
        while idx < self.intervals.len() && self.intervals[idx].start > pn {
            idx += 1;
        }
        // Already covered by the interval at idx?
        if idx < self.intervals.len() && self.intervals[idx].end >= pn {
            return;
        }
        let extends_lower = idx < self.intervals.len() && self.intervals[idx].end + 1 == pn;
        let extends_upper = idx > 0 && self.intervals[idx - 1].start == pn + 1;
        match (extends_lower, extends_upper) {
            (true, true) => {
                self.intervals[idx].end = self.intervals[idx - 1].end;
                self.intervals.remove(idx - 1);
            }
            (true, false) => self.intervals[idx].end = pn,
            (false, true) => self.intervals[idx - 1].start = pn,
            (false, false) => self.intervals.insert(idx, AckBlock::new(pn, pn)),
        }
        while self.intervals.len() > MAX_ACK_INTERVALS {
            self.intervals.pop();
        }
    }

    pub fn contains(&self, pn: PacketNumber) -> bool {
        self.intervals
            .iter()
            .any(|b| b.start <= pn && pn <= b.end)
    }

    pub fn largest(&self) -> Option<PacketNumber> {
        self.intervals.first().map(|b| b.end)
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Intervals descending by start, largest-acked first.
    pub fn blocks(&self) -> &[AckBlock] {
        &self.intervals
    }

    /// Drop all intervals entirely below `floor`; truncate one straddling it.
    pub fn prune_below(&mut self, floor: PacketNumber) {
        self.intervals.retain(|b| b.end >= floor);
        if let Some(last) = self.intervals.last_mut() {
            if last.start < floor {
                last.start = floor;
            }
        }
    }
}

// ============================================================================
// Space State
// ============================================================================

/// Send- and receive-side bookkeeping for one packet number space.
#[derive(Debug, Clone)]
pub struct PacketNumberSpaceState {
    pub space: PacketNumberSpace,

    /// Next packet number to assign on send.
    next_packet_number: PacketNumber,
    /// Largest packet number we have sent.
    pub largest_sent: Option<PacketNumber>,
    /// Largest of our packets the peer has acknowledged.
    pub largest_acked_by_peer: Option<PacketNumber>,

    /// Received-packet interval set.
    pub ack_intervals: AckIntervalSet,
    /// When the current largest received packet arrived.
    pub largest_received_time: Option<Instant>,
    /// ACK-eliciting packets received since the last ACK we sent.
    ack_eliciting_since_last_ack: u16,
    /// Deadline for sending a scheduled ACK.
    ack_deadline: Option<Instant>,
    /// Largest packet number covered by an ACK we already sent.
    largest_acked_by_us: Option<PacketNumber>,

    /// ACK delay exponent for this space. Initial/Handshake stay at the
    /// default; AppData takes the negotiated value.
    pub ack_delay_exponent: u64,

    /// Keys for this space were dropped; it no longer sends or tracks.
    pub discarded: bool,
}

impl PacketNumberSpaceState {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            next_packet_number: 0,
            largest_sent: None,
            largest_acked_by_peer: None,
            ack_intervals: AckIntervalSet::new(),
            largest_received_time: None,
            ack_eliciting_since_last_ack: 0,
            ack_deadline: None,
            largest_acked_by_us: None,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            discarded: false,
        }
    }

    /// Allocate the next send-side packet number (strictly increasing).
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_packet_number;
        self.next_packet_number += 1;
        self.largest_sent = Some(pn);
        pn
    }

    pub fn peek_next_packet_number(&self) -> PacketNumber {
        self.next_packet_number
    }

    /// Record a received packet and schedule ACK emission.
    ///
    /// An ACK goes out immediately once `ack_threshold` ACK-eliciting
    /// packets have arrived, otherwise after `max_ack_delay`.
    pub fn on_packet_received(
        &mut self,
        pn: PacketNumber,
        now: Instant,
        ack_eliciting: bool,
        max_ack_delay: Duration,
        ack_threshold: u16,
    ) {
        let prev_largest = self.ack_intervals.largest();
        self.ack_intervals.insert(pn);
        if prev_largest.map(|l| pn > l).unwrap_or(true) {
            self.largest_received_time = Some(now);
        }
        if ack_eliciting {
            self.ack_eliciting_since_last_ack += 1;
            if self.ack_eliciting_since_last_ack >= ack_threshold {
                self.ack_deadline = Some(now);
            } else if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + max_ack_delay);
            }
        }
    }

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.ack_intervals.largest()
    }

    /// Record the peer acknowledging up to `largest`.
    pub fn on_ack_received(&mut self, largest: PacketNumber) {
        if self.largest_acked_by_peer.map(|l| largest > l).unwrap_or(true) {
            self.largest_acked_by_peer = Some(largest);
        }
    }

    /// Is an ACK due at `now`?
    pub fn should_send_ack(&self, now: Instant) -> bool {
        if self.discarded {
            return false;
        }
        match self.ack_deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// An ACK is owed: ACK-eliciting data arrived since the last ACK we
    /// sent. Pure-ACK receipt never re-arms this (that would ping-pong
    /// ACKs between idle peers).
    pub fn ack_pending(&self) -> bool {
        !self.discarded && self.ack_deadline.is_some()
    }

    /// Whether any received packet is not yet covered by a sent ACK.
    pub fn has_unacked_received(&self) -> bool {
        match (self.ack_intervals.largest(), self.largest_acked_by_us) {
            (Some(received), Some(acked)) => received > acked,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        if self.discarded {
            None
        } else {
            self.ack_deadline
        }
    }

    /// Delay between receipt of the largest packet and `now`, for the
    /// ackDelay field.
    pub fn ack_delay(&self, now: Instant) -> Duration {
        self.largest_received_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    /// Reset scheduling state after an ACK covering `largest` was sent.
    pub fn on_ack_sent(&mut self, largest: PacketNumber) {
        self.ack_eliciting_since_last_ack = 0;
        self.ack_deadline = None;
        if self.largest_acked_by_us.map(|l| largest > l).unwrap_or(true) {
            self.largest_acked_by_us = Some(largest);
        }
    }

    /// Drop this space after its keys are discarded.
    pub fn discard(&mut self) {
        self.discarded = true;
        self.ack_deadline = None;
        self.ack_eliciting_since_last_ack = 0;
    }
}

/// The three packet number spaces of a connection.
#[derive(Debug, Clone)]
pub struct PacketNumberSpaceSet {
    pub initial: PacketNumberSpaceState,
    pub handshake: PacketNumberSpaceState,
    pub app_data: PacketNumberSpaceState,
}

impl PacketNumberSpaceSet {
    pub fn new() -> Self {
        Self {
            initial: PacketNumberSpaceState::new(PacketNumberSpace::Initial),
            handshake: PacketNumberSpaceState::new(PacketNumberSpace::Handshake),
            app_data: PacketNumberSpaceState::new(PacketNumberSpace::AppData),
        }
    }

    pub fn get(&self, space: PacketNumberSpace) -> &PacketNumberSpaceState {
        match space {
            PacketNumberSpace::Initial => &self.initial,
            PacketNumberSpace::Handshake => &self.handshake,
            PacketNumberSpace::AppData => &self.app_data,
        }
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> &mut PacketNumberSpaceState {
        match space {
            PacketNumberSpace::Initial => &mut self.initial,
            PacketNumberSpace::Handshake => &mut self.handshake,
            PacketNumberSpace::AppData => &mut self.app_data,
        }
    }
}

impl Default for PacketNumberSpaceSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint_descending(set: &AckIntervalSet) {
        let blocks = set.blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].start > pair[1].end + 1, "not disjoint: {pair:?}");
        }
        for b in blocks {
            assert!(b.start <= b.end);
        }
    }

    #[test]
    fn test_interval_insert_and_coalesce() {
        let mut set = AckIntervalSet::new();
        set.insert(5);
        set.insert(7);
        set.insert(6); // bridges 5..=7
        assert_eq!(set.blocks(), &[AckBlock::new(5, 7)]);
        set.insert(1);
        set.insert(10);
        assert_eq!(
            set.blocks(),
            &[
                AckBlock::new(10, 10),
                AckBlock::new(5, 7),
                AckBlock::new(1, 1)
            ]
        );
        assert_disjoint_descending(&set);
    }

    #[test]
    fn test_interval_duplicate_insert_is_noop() {
        let mut set = AckIntervalSet::new();
        set.insert(3);
        set.insert(3);
        assert_eq!(set.blocks(), &[AckBlock::new(3, 3)]);
    }

    #[test]
    fn test_interval_contains_and_largest() {
        let mut set = AckIntervalSet::new();
        for pn in [2, 3, 4, 9] {
            set.insert(pn);
        }
        assert!(set.contains(3));
        assert!(!set.contains(5));
        assert_eq!(set.largest(), Some(9));
    }

    #[test]
    fn test_interval_prune_below() {
        let mut set = AckIntervalSet::new();
        for pn in [1, 2, 3, 8, 9, 15] {
            set.insert(pn);
        }
        set.prune_below(9);
        assert_eq!(
            set.blocks(),
            &[AckBlock::new(15, 15), AckBlock::new(9, 9)]
        );
    }

    #[test]
    fn test_interval_bound() {
        let mut set = AckIntervalSet::new();
        // Isolated packet numbers: every insert is its own interval.
        for i in 0..(MAX_ACK_INTERVALS as u64 + 10) {
            set.insert(i * 2);
        }
        assert_eq!(set.blocks().len(), MAX_ACK_INTERVALS);
        // Largest ranges survive.
        assert_eq!(set.largest(), Some((MAX_ACK_INTERVALS as u64 + 9) * 2));
    }

    #[test]
    fn test_packet_numbers_strictly_increasing() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
        let a = space.next_packet_number();
        let b = space.next_packet_number();
        let c = space.next_packet_number();
        assert!(a < b && b < c);
        assert_eq!(space.largest_sent, Some(c));
    }

    #[test]
    fn test_ack_scheduling_threshold() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
        let now = Instant::from_millis(100);
        let max_delay = Duration::from_millis(25);

        space.on_packet_received(0, now, true, max_delay, 2);
        // One eliciting packet: deferred ACK.
        assert!(!space.should_send_ack(now));
        assert!(space.should_send_ack(now + max_delay));

        space.on_packet_received(1, now, true, max_delay, 2);
        // Threshold hit: immediate.
        assert!(space.should_send_ack(now));
    }

    #[test]
    fn test_ack_only_packets_do_not_schedule_ack() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
        let now = Instant::from_millis(0);
        space.on_packet_received(0, now, false, Duration::from_millis(25), 2);
        assert!(!space.should_send_ack(now + Duration::from_secs(10)));
        assert!(space.has_unacked_received());
    }

    #[test]
    fn test_ack_sent_resets_schedule() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
        let now = Instant::from_millis(0);
        space.on_packet_received(3, now, true, Duration::from_millis(25), 1);
        assert!(space.should_send_ack(now));
        space.on_ack_sent(3);
        assert!(!space.should_send_ack(now + Duration::from_secs(1)));
        assert!(!space.has_unacked_received());
    }

    #[test]
    fn test_ack_delay_measures_since_largest() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::AppData);
        let t0 = Instant::from_millis(10);
        space.on_packet_received(1, t0, true, Duration::from_millis(25), 10);
        assert_eq!(
            space.ack_delay(t0 + Duration::from_millis(7)),
            Duration::from_millis(7)
        );
        // An older (reordered) packet does not reset the timestamp.
        space.on_packet_received(0, t0 + Duration::from_millis(5), true, Duration::from_millis(25), 10);
        assert_eq!(
            space.ack_delay(t0 + Duration::from_millis(7)),
            Duration::from_millis(7)
        );
    }

    #[test]
    fn test_discarded_space_never_acks() {
        let mut space = PacketNumberSpaceState::new(PacketNumberSpace::Initial);
        let now = Instant::from_millis(0);
        space.on_packet_received(0, now, true, Duration::from_millis(25), 1);
        space.discard();
        assert!(!space.should_send_ack(now + Duration::from_secs(1)));
        assert_eq!(space.ack_deadline(), None);
    }
}
