//! Structured event observer (qlog-shaped).
//!
//! The connection narrates datapath events to an [`QLogObserver`]; sinks
//! serialize them (the `serde` derives exist for that) or aggregate them
//! for telemetry. Event timestamps are relative to the connection's start
//! and monotonically non-decreasing.

use core::time::Duration;
use serde::Serialize;

use crate::types::{PacketNumber, PacketNumberSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QLogCategory {
    Transport,
    Recovery,
    MetricUpdate,
    Loss,
    Connectivity,
    Http3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketDropReason {
    UnknownDestinationConnectionId,
    DecryptionFailure,
    HeaderParseError,
    VersionMismatch,
    Closing,
}

/// Event payloads, one per narrated occurrence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QLogEventData {
    PacketSent {
        space: String,
        packet_number: PacketNumber,
        size: usize,
        ack_eliciting: bool,
    },
    PacketReceived {
        space: String,
        packet_number: PacketNumber,
        size: usize,
    },
    PacketDropped {
        reason: PacketDropReason,
        size: usize,
    },
    PacketsLost {
        largest_lost_packet_num: PacketNumber,
        lost_bytes: u64,
        lost_packets: usize,
    },
    MetricUpdate {
        congestion_window: u64,
        bytes_in_flight: u64,
        smoothed_rtt_us: u64,
        latest_rtt_us: u64,
    },
    PacingMetricUpdate {
        pacing_burst_size: u64,
        pacing_interval_us: u64,
    },
    PathValidation {
        success: bool,
    },
    ConnectivityStateUpdate {
        state: String,
    },
}

impl QLogEventData {
    pub fn category(&self) -> QLogCategory {
        match self {
            QLogEventData::PacketSent { .. } | QLogEventData::PacketReceived { .. } => {
                QLogCategory::Transport
            }
            QLogEventData::PacketDropped { .. } => QLogCategory::Transport,
            QLogEventData::PacketsLost { .. } => QLogCategory::Loss,
            QLogEventData::MetricUpdate { .. } | QLogEventData::PacingMetricUpdate { .. } => {
                QLogCategory::MetricUpdate
            }
            QLogEventData::PathValidation { .. }
            | QLogEventData::ConnectivityStateUpdate { .. } => QLogCategory::Connectivity,
        }
    }
}

/// One narrated event.
#[derive(Debug, Clone, Serialize)]
pub struct QLogEvent {
    /// Time since connection start; non-decreasing across events.
    pub relative_time_us: u64,
    pub category: QLogCategory,
    #[serde(flatten)]
    pub data: QLogEventData,
}

/// Sink for the event stream.
pub trait QLogObserver: Send {
    fn add_event(&mut self, event: QLogEvent);
}

/// Observer that discards everything.
#[derive(Debug, Default)]
pub struct NoopQLog;

impl QLogObserver for NoopQLog {
    fn add_event(&mut self, _event: QLogEvent) {}
}

/// Observer that retains events in memory (tests, debugging).
#[derive(Debug, Default)]
pub struct MemoryQLog {
    pub events: Vec<QLogEvent>,
}

impl QLogObserver for MemoryQLog {
    fn add_event(&mut self, event: QLogEvent) {
        self.events.push(event);
    }
}

/// Clonable handle over a [`MemoryQLog`], for observing a connection's
/// event stream from outside.
#[derive(Debug, Clone, Default)]
pub struct SharedQLog(pub std::sync::Arc<std::sync::Mutex<MemoryQLog>>);

impl SharedQLog {
    pub fn events(&self) -> Vec<QLogEvent> {
        self.0.lock().map(|log| log.events.clone()).unwrap_or_default()
    }
}

impl QLogObserver for SharedQLog {
    fn add_event(&mut self, event: QLogEvent) {
        if let Ok(mut log) = self.0.lock() {
            log.add_event(event);
        }
    }
}

pub fn space_label(space: PacketNumberSpace) -> String {
    match space {
        PacketNumberSpace::Initial => "initial".to_string(),
        PacketNumberSpace::Handshake => "handshake".to_string(),
        PacketNumberSpace::AppData => "app_data".to_string(),
    }
}

/// Helper wrapping an observer with the connection's reference clock so
/// timestamps come out relative and monotonic.
pub struct QLogEmitter {
    observer: Box<dyn QLogObserver>,
    reference: crate::types::Instant,
    last_relative_us: u64,
}

impl QLogEmitter {
    pub fn new(observer: Box<dyn QLogObserver>, reference: crate::types::Instant) -> Self {
        Self {
            observer,
            reference,
            last_relative_us: 0,
        }
    }

    pub fn emit(&mut self, now: crate::types::Instant, data: QLogEventData) {
        let relative = now.saturating_duration_since(self.reference);
        let relative_us = relative_micros(relative).max(self.last_relative_us);
        self.last_relative_us = relative_us;
        let category = data.category();
        self.observer.add_event(QLogEvent {
            relative_time_us: relative_us,
            category,
            data,
        });
    }
}

fn relative_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Instant;

    #[test]
    fn test_relative_timestamps_monotonic() {
        let sink = SharedQLog::default();
        let mut emitter = QLogEmitter::new(Box::new(sink.clone()), Instant::from_millis(100));
        emitter.emit(
            Instant::from_millis(150),
            QLogEventData::ConnectivityStateUpdate {
                state: "established".into(),
            },
        );
        // An out-of-order clock reading never moves time backwards.
        emitter.emit(
            Instant::from_millis(120),
            QLogEventData::PathValidation { success: true },
        );
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].relative_time_us, 50_000);
        assert_eq!(events[1].relative_time_us, 50_000);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            QLogEventData::PacketsLost {
                largest_lost_packet_num: 1,
                lost_bytes: 100,
                lost_packets: 1,
            }
            .category(),
            QLogCategory::Loss
        );
        assert_eq!(
            QLogEventData::MetricUpdate {
                congestion_window: 1,
                bytes_in_flight: 0,
                smoothed_rtt_us: 1,
                latest_rtt_us: 1,
            }
            .category(),
            QLogCategory::MetricUpdate
        );
    }
}
