//! Outstanding-packet registry.
//!
//! Every sent packet is held here until it is acknowledged or declared
//! lost. The registry is the single owner of sent-packet records; bytes in
//! flight is derived from it and nowhere else. Clone events
//! ([`PacketEvent`]) link a packet with all of its rebuilds so one ACK
//! retires the work of the whole family.

use std::collections::{BTreeMap, HashSet};

use crate::frames::{AckBlock, Frame};
use crate::types::{Instant, PacketNumber, PacketNumberSpace};

/// Identifier linking a packet and its clones: the packet number of the
/// original transmission.
pub type PacketEvent = PacketNumber;

/// Write-form record of one sent packet.
#[derive(Debug, Clone)]
pub struct SentPacketMeta {
    pub space: PacketNumberSpace,
    pub packet_number: PacketNumber,
    pub frames: Vec<Frame>,
}

/// A sent packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet: SentPacketMeta,
    pub send_time: Instant,
    /// Wire size including header and cipher overhead.
    pub size: usize,
    /// Sent from the Initial or Handshake space.
    pub is_handshake: bool,
    pub ack_eliciting: bool,
    /// Clone family this packet belongs to, if it was ever cloned or is a
    /// clone itself.
    pub associated_event: Option<PacketEvent>,
}

impl OutstandingPacket {
    pub fn packet_number(&self) -> PacketNumber {
        self.packet.packet_number
    }
}

/// Per-space registry of outstanding packets, ordered by packet number.
#[derive(Debug, Default)]
pub struct OutstandingPackets {
    packets: BTreeMap<PacketNumber, OutstandingPacket>,
}

impl OutstandingPackets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, packet: OutstandingPacket) {
        self.packets.insert(packet.packet_number(), packet);
    }

    pub fn get(&self, pn: PacketNumber) -> Option<&OutstandingPacket> {
        self.packets.get(&pn)
    }

    pub fn get_mut(&mut self, pn: PacketNumber) -> Option<&mut OutstandingPacket> {
        self.packets.get_mut(&pn)
    }

    pub fn remove(&mut self, pn: PacketNumber) -> Option<OutstandingPacket> {
        self.packets.remove(&pn)
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutstandingPacket> {
        self.packets.values()
    }

    /// Sum of sizes of everything still outstanding in this space.
    pub fn bytes_outstanding(&self) -> u64 {
        self.packets.values().map(|p| p.size as u64).sum()
    }

    /// Whether any ACK-eliciting packet is still in flight.
    pub fn has_ack_eliciting(&self) -> bool {
        self.packets.values().any(|p| p.ack_eliciting)
    }

    /// Earliest send time among ACK-eliciting packets (PTO anchor).
    pub fn earliest_ack_eliciting_send_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .filter(|p| p.ack_eliciting)
            .map(|p| p.send_time)
            .min()
    }

    /// Remove every packet covered by `blocks`, returning them ascending
    /// by packet number.
    pub fn remove_acked(&mut self, blocks: &[AckBlock]) -> Vec<OutstandingPacket> {
        let mut acked = Vec::new();
        for block in blocks {
            let in_range: Vec<PacketNumber> = self
                .packets
                .range(block.start..=block.end)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in in_range {
                if let Some(packet) = self.packets.remove(&pn) {
                    acked.push(packet);
                }
            }
        }
        acked.sort_by_key(|p| p.packet_number());
        acked
    }

    /// Drain the whole registry (space discard).
    pub fn drain(&mut self) -> Vec<OutstandingPacket> {
        let drained: Vec<OutstandingPacket> = std::mem::take(&mut self.packets)
            .into_values()
            .collect();
        drained
    }
}

/// Connection-wide clone-event bookkeeping. At most one entry exists per
/// event id.
#[derive(Debug, Default)]
pub struct PacketEventSet {
    events: HashSet<PacketEvent>,
}

impl PacketEventSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, event: PacketEvent) -> bool {
        self.events.contains(&event)
    }

    /// Register an event; returns false when it already existed.
    pub fn insert(&mut self, event: PacketEvent) -> bool {
        self.events.insert(event)
    }

    pub fn remove(&mut self, event: PacketEvent) -> bool {
        self.events.remove(&event)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pn: PacketNumber, size: usize, ack_eliciting: bool) -> OutstandingPacket {
        OutstandingPacket {
            packet: SentPacketMeta {
                space: PacketNumberSpace::AppData,
                packet_number: pn,
                frames: vec![Frame::Ping],
            },
            send_time: Instant::from_millis(pn),
            size,
            is_handshake: false,
            ack_eliciting,
            associated_event: None,
        }
    }

    #[test]
    fn test_bytes_outstanding_tracks_registry() {
        let mut reg = OutstandingPackets::new();
        reg.insert(packet(0, 100, true));
        reg.insert(packet(1, 200, true));
        reg.insert(packet(2, 300, false));
        assert_eq!(reg.bytes_outstanding(), 600);
        reg.remove(1);
        assert_eq!(reg.bytes_outstanding(), 400);
    }

    #[test]
    fn test_remove_acked_by_blocks() {
        let mut reg = OutstandingPackets::new();
        for pn in 0..10 {
            reg.insert(packet(pn, 100, true));
        }
        let acked = reg.remove_acked(&[AckBlock::new(7, 9), AckBlock::new(2, 3)]);
        let pns: Vec<_> = acked.iter().map(|p| p.packet_number()).collect();
        assert_eq!(pns, vec![2, 3, 7, 8, 9]);
        assert_eq!(reg.len(), 5);
        // Acking again is a no-op.
        assert!(reg.remove_acked(&[AckBlock::new(7, 9)]).is_empty());
    }

    #[test]
    fn test_pto_anchor_is_earliest_ack_eliciting() {
        let mut reg = OutstandingPackets::new();
        reg.insert(packet(5, 100, false));
        reg.insert(packet(6, 100, true));
        reg.insert(packet(7, 100, true));
        assert_eq!(
            reg.earliest_ack_eliciting_send_time(),
            Some(Instant::from_millis(6))
        );
        assert!(reg.has_ack_eliciting());
    }

    #[test]
    fn test_event_set_unique_per_event() {
        let mut events = PacketEventSet::new();
        assert!(events.insert(42));
        assert!(!events.insert(42));
        assert_eq!(events.len(), 1);
        assert!(events.remove(42));
        assert!(!events.remove(42));
    }
}
