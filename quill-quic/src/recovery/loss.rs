//! Loss detection (RFC 9002 Section 6).
//!
//! Two triggers declare a packet lost: the reorder threshold (a packet at
//! least `packet_threshold` below the largest acknowledged) and the time
//! threshold (sent a loss-delay before the acknowledgment arrived). When a
//! packet is too young for either, a loss timer is armed at the instant it
//! would cross the time threshold. When acknowledgments stop coming at
//! all, the PTO alarm takes over.
//!
//! Every packet number space owns its own loss timer and its own PTO
//! backoff counter, so a stalled Initial or Handshake flight recovers
//! independently of application data.

use core::time::Duration;

use crate::packet::outstanding::{OutstandingPacket, OutstandingPackets};
use crate::recovery::rtt::RttEstimator;
use crate::types::{Instant, PacketNumber, PacketNumberSpace};

/// Probe packets sent per PTO firing.
pub const K_PACKETS_PER_PTO: u32 = 2;

#[derive(Debug)]
pub struct LossDetector {
    packet_threshold: u64,
    pto_counts: [u32; 3],
    loss_times: [Option<Instant>; 3],
}

/// Outcome of a loss sweep over one space.
#[derive(Debug)]
pub struct LossDetectionResult {
    pub lost_packets: Vec<OutstandingPacket>,
    /// When the next too-young packet will cross the time threshold.
    pub loss_time: Option<Instant>,
}

impl LossDetector {
    pub fn new(packet_threshold: u64) -> Self {
        Self {
            packet_threshold,
            pto_counts: [0; 3],
            loss_times: [None; 3],
        }
    }

    /// Sweep `registry` for lost packets given the space's largest
    /// acknowledged packet number. Removes and returns the losses and
    /// re-arms the space's loss timer.
    pub fn detect_lost_packets(
        &mut self,
        space: PacketNumberSpace,
        registry: &mut OutstandingPackets,
        largest_acked: Option<PacketNumber>,
        rtt: &RttEstimator,
        now: Instant,
    ) -> LossDetectionResult {
        let Some(largest_acked) = largest_acked else {
            return LossDetectionResult {
                lost_packets: Vec::new(),
                loss_time: None,
            };
        };
        let loss_delay = rtt.loss_delay();
        let mut lost_pns: Vec<PacketNumber> = Vec::new();
        let mut loss_time: Option<Instant> = None;

        for packet in registry.iter() {
            let pn = packet.packet_number();
            if pn > largest_acked {
                continue;
            }
            let reorder_lost = largest_acked >= pn + self.packet_threshold;
            let deadline = packet.send_time + loss_delay;
            let time_lost = deadline <= now;
            if reorder_lost || time_lost {
                lost_pns.push(pn);
            } else {
                loss_time = Some(match loss_time {
                    Some(t) if t <= deadline => t,
                    _ => deadline,
                });
            }
        }

        let lost_packets: Vec<OutstandingPacket> = lost_pns
            .into_iter()
            .filter_map(|pn| registry.remove(pn))
            .collect();
        self.loss_times[space as usize] = loss_time;
        LossDetectionResult {
            lost_packets,
            loss_time,
        }
    }

    pub fn loss_time(&self, space: PacketNumberSpace) -> Option<Instant> {
        self.loss_times[space as usize]
    }

    /// Earliest armed loss timer across spaces.
    pub fn earliest_loss_time(&self) -> Option<(Instant, PacketNumberSpace)> {
        let mut earliest: Option<(Instant, PacketNumberSpace)> = None;
        for space in PacketNumberSpace::ALL {
            if let Some(time) = self.loss_times[space as usize] {
                earliest = Some(match earliest {
                    Some((t, s)) if t <= time => (t, s),
                    _ => (time, space),
                });
            }
        }
        earliest
    }

    pub fn clear_loss_time(&mut self, space: PacketNumberSpace) {
        self.loss_times[space as usize] = None;
    }

    // ------------------------------------------------------------------
    // PTO
    // ------------------------------------------------------------------

    pub fn pto_count(&self, space: PacketNumberSpace) -> u32 {
        self.pto_counts[space as usize]
    }

    /// Any ACK fully resets the backoff in every space.
    pub fn on_ack_received(&mut self) {
        self.pto_counts = [0; 3];
    }

    /// The PTO alarm fired for `space`; its backoff doubles. Returns how
    /// many probe packets to send.
    pub fn on_pto_fired(&mut self, space: PacketNumberSpace) -> u32 {
        self.pto_counts[space as usize] += 1;
        K_PACKETS_PER_PTO
    }

    /// Deadline for the space's PTO alarm, anchored at its oldest
    /// ACK-eliciting packet in flight.
    pub fn pto_deadline(
        &self,
        space: PacketNumberSpace,
        rtt: &RttEstimator,
        max_ack_delay: Duration,
        anchor: Instant,
    ) -> Instant {
        anchor + rtt.pto(max_ack_delay, self.pto_counts[space as usize])
    }
}

/// Whether a batch of losses qualifies as persistent congestion: the span
/// between the oldest and newest lost ACK-eliciting sends exceeds
/// `3 × PTO` with no acknowledgment in between.
pub fn is_persistent_congestion(
    lost: &[OutstandingPacket],
    rtt: &RttEstimator,
    max_ack_delay: Duration,
) -> bool {
    if !rtt.has_sample() || lost.len() < 2 {
        return false;
    }
    let eliciting: Vec<&OutstandingPacket> =
        lost.iter().filter(|p| p.ack_eliciting).collect();
    if eliciting.len() < 2 {
        return false;
    }
    let (Some(earliest), Some(latest)) = (
        eliciting.iter().map(|p| p.send_time).min(),
        eliciting.iter().map(|p| p.send_time).max(),
    ) else {
        return false;
    };
    latest.saturating_duration_since(earliest) >= rtt.pto(max_ack_delay, 0) * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Frame;
    use crate::packet::outstanding::SentPacketMeta;

    fn packet(pn: PacketNumber, sent_ms: u64) -> OutstandingPacket {
        OutstandingPacket {
            packet: SentPacketMeta {
                space: PacketNumberSpace::AppData,
                packet_number: pn,
                frames: vec![Frame::Ping],
            },
            send_time: Instant::from_millis(sent_ms),
            size: 1200,
            is_handshake: false,
            ack_eliciting: true,
            associated_event: None,
        }
    }

    fn rtt_100ms() -> RttEstimator {
        let mut rtt = RttEstimator::new(Duration::from_millis(100));
        rtt.update(Duration::from_millis(100), Duration::ZERO, None);
        rtt
    }

    #[test]
    fn test_reorder_threshold_loss() {
        let mut detector = LossDetector::new(3);
        let mut registry = OutstandingPackets::new();
        for pn in 0..6 {
            registry.insert(packet(pn, 100 + pn));
        }
        // Largest acked 5: packets 0,1,2 are >= 3 behind.
        registry.remove(5);
        let result = detector.detect_lost_packets(
            PacketNumberSpace::AppData,
            &mut registry,
            Some(5),
            &rtt_100ms(),
            Instant::from_millis(150),
        );
        let lost: Vec<_> = result.lost_packets.iter().map(|p| p.packet_number()).collect();
        assert_eq!(lost, vec![0, 1, 2]);
        // 3 and 4 stay, with a loss timer armed.
        assert_eq!(registry.len(), 2);
        assert!(result.loss_time.is_some());
    }

    #[test]
    fn test_time_threshold_loss() {
        let mut detector = LossDetector::new(100);
        let mut registry = OutstandingPackets::new();
        registry.insert(packet(0, 0));
        registry.insert(packet(1, 500));
        let rtt = rtt_100ms();
        // loss delay = 9/8 * 100ms = 112.5ms; at t=600 packet 0 (sent at 0)
        // is long past, packet 1 (sent 500) is not.
        let result = detector.detect_lost_packets(
            PacketNumberSpace::AppData,
            &mut registry,
            Some(1),
            &rtt,
            Instant::from_millis(600),
        );
        assert_eq!(result.lost_packets.len(), 1);
        assert_eq!(result.lost_packets[0].packet_number(), 0);
        assert_eq!(
            result.loss_time,
            Some(Instant::from_millis(500) + rtt.loss_delay())
        );
    }

    #[test]
    fn test_packets_above_largest_acked_untouched() {
        let mut detector = LossDetector::new(3);
        let mut registry = OutstandingPackets::new();
        registry.insert(packet(10, 0));
        let result = detector.detect_lost_packets(
            PacketNumberSpace::AppData,
            &mut registry,
            Some(5),
            &rtt_100ms(),
            Instant::from_millis(10_000),
        );
        assert!(result.lost_packets.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_ack_no_loss() {
        let mut detector = LossDetector::new(3);
        let mut registry = OutstandingPackets::new();
        registry.insert(packet(0, 0));
        let result = detector.detect_lost_packets(
            PacketNumberSpace::AppData,
            &mut registry,
            None,
            &rtt_100ms(),
            Instant::from_millis(10_000),
        );
        assert!(result.lost_packets.is_empty());
    }

    #[test]
    fn test_earliest_loss_time_across_spaces() {
        let mut detector = LossDetector::new(3);
        detector.loss_times[PacketNumberSpace::Initial as usize] =
            Some(Instant::from_millis(50));
        detector.loss_times[PacketNumberSpace::AppData as usize] =
            Some(Instant::from_millis(20));
        assert_eq!(
            detector.earliest_loss_time(),
            Some((Instant::from_millis(20), PacketNumberSpace::AppData))
        );
    }

    #[test]
    fn test_pto_backoff_and_reset() {
        let mut detector = LossDetector::new(3);
        let rtt = rtt_100ms();
        let mad = Duration::from_millis(25);
        let anchor = Instant::from_millis(1000);
        let space = PacketNumberSpace::AppData;
        let base = detector.pto_deadline(space, &rtt, mad, anchor);
        assert_eq!(detector.on_pto_fired(space), K_PACKETS_PER_PTO);
        let doubled = detector.pto_deadline(space, &rtt, mad, anchor);
        assert_eq!(
            doubled.saturating_duration_since(anchor),
            base.saturating_duration_since(anchor) * 2
        );
        detector.on_ack_received();
        assert_eq!(detector.pto_count(space), 0);
        assert_eq!(detector.pto_deadline(space, &rtt, mad, anchor), base);
    }

    #[test]
    fn test_pto_backoff_is_per_space() {
        let mut detector = LossDetector::new(3);
        let rtt = rtt_100ms();
        let mad = Duration::from_millis(25);
        let anchor = Instant::from_millis(1000);
        let base = detector.pto_deadline(PacketNumberSpace::Initial, &rtt, mad, anchor);

        detector.on_pto_fired(PacketNumberSpace::Initial);
        detector.on_pto_fired(PacketNumberSpace::Initial);
        assert_eq!(detector.pto_count(PacketNumberSpace::Initial), 2);
        // A stalled Initial flight does not inflate the other alarms.
        assert_eq!(detector.pto_count(PacketNumberSpace::Handshake), 0);
        assert_eq!(detector.pto_count(PacketNumberSpace::AppData), 0);
        assert_eq!(
            detector.pto_deadline(PacketNumberSpace::AppData, &rtt, mad, anchor),
            base
        );
    }

    #[test]
    fn test_persistent_congestion_span() {
        let rtt = rtt_100ms();
        let mad = Duration::from_millis(25);
        // PTO base = 325ms; threshold = 975ms.
        let short = vec![packet(0, 0), packet(1, 900)];
        assert!(!is_persistent_congestion(&short, &rtt, mad));
        let long = vec![packet(0, 0), packet(1, 400), packet(2, 1000)];
        assert!(is_persistent_congestion(&long, &rtt, mad));
    }

    #[test]
    fn test_persistent_congestion_needs_samples() {
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let lost = vec![packet(0, 0), packet(1, 100_000)];
        assert!(!is_persistent_congestion(&lost, &rtt, Duration::ZERO));
    }
}
