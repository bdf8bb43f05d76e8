//! Token-bucket pacer.
//!
//! A [`PacingRateCalculator`] maps (cwnd, rtt) to an (interval, burst)
//! pair; the pacer meters packet emission against it. RTTs below the
//! pacing timer tick cannot be paced and fall back to the writer limit.
//! Timer drift on the write loop is compensated: a late wakeup is granted
//! proportionally more credit, with the excess banked in `tokens`.

use core::time::Duration;

use crate::config::TransportSettings;
use crate::types::Instant;

/// One pacing rate: emit `burst_size` packets every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingRate {
    pub interval: Duration,
    pub burst_size: u64,
}

/// Maps (cwnd bytes, mss, min cwnd in mss, rtt) to a pacing rate.
pub type PacingRateCalculator =
    Box<dyn Fn(u64, u64, u64, Duration) -> PacingRate + Send>;

/// Spread one congestion window over one RTT in bursts of the configured
/// minimum, never ticking faster than the pacing timer can.
pub fn default_pacing_rate(
    min_burst_packets: u64,
) -> impl Fn(u64, u64, u64, Duration) -> PacingRate {
    move |cwnd_bytes, mss, min_cwnd_in_mss, rtt| {
        let cwnd_in_mss = (cwnd_bytes / mss.max(1)).max(min_cwnd_in_mss).max(1);
        let burst = min_burst_packets.max(1).min(cwnd_in_mss);
        let interval_nanos = rtt.as_nanos() as u64 * burst / cwnd_in_mss;
        PacingRate {
            interval: Duration::from_nanos(interval_nanos),
            burst_size: burst,
        }
    }
}

pub struct Pacer {
    write_interval: Duration,
    batch_size: u64,
    tokens: u64,
    cached_batch_size: u64,
    scheduled_write_time: Option<Instant>,
    app_limited: bool,
    calculator: PacingRateCalculator,
    writer_limit: u64,
    tick_interval: Duration,
    min_cwnd_in_mss: u64,
    mss: u64,
}

impl core::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pacer")
            .field("write_interval", &self.write_interval)
            .field("batch_size", &self.batch_size)
            .field("tokens", &self.tokens)
            .field("app_limited", &self.app_limited)
            .finish()
    }
}

impl Pacer {
    pub fn new(settings: &TransportSettings) -> Self {
        let writer_limit = settings.write_connection_data_packets_limit;
        Self {
            write_interval: Duration::ZERO,
            batch_size: writer_limit,
            tokens: writer_limit,
            cached_batch_size: writer_limit,
            scheduled_write_time: None,
            app_limited: false,
            calculator: Box::new(default_pacing_rate(settings.min_burst_packets)),
            writer_limit,
            tick_interval: settings.pacing_timer_tick_interval,
            min_cwnd_in_mss: settings.min_cwnd_in_mss,
            mss: settings.udp_send_packet_len as u64,
        }
    }

    /// Re-derive the pacing rate from the congestion state.
    ///
    /// Runs even while app-limited so that leaving the app-limited state
    /// starts from a current rate. An RTT below the timer tick cannot be
    /// paced: pacing is disabled and the writer limit governs.
    pub fn refresh_pacing_rate(&mut self, cwnd_bytes: u64, rtt: Duration) {
        if rtt < self.tick_interval {
            self.write_interval = Duration::ZERO;
            self.batch_size = self.writer_limit;
        } else {
            let rate =
                (self.calculator)(cwnd_bytes, self.mss, self.min_cwnd_in_mss, rtt);
            self.write_interval = rate.interval;
            self.batch_size = rate.burst_size;
        }
        self.cached_batch_size = self.batch_size;
        tracing::trace!(
            interval_us = self.write_interval.as_micros() as u64,
            batch = self.batch_size,
            "pacing rate refreshed"
        );
    }

    /// The write loop was scheduled to run at `time`.
    pub fn on_paced_write_scheduled(&mut self, time: Instant) {
        self.scheduled_write_time = Some(time);
    }

    /// One packet went out.
    pub fn on_packet_sent(&mut self) {
        self.tokens = self.tokens.saturating_sub(1);
    }

    /// Loss detected: pause the burst.
    pub fn on_packets_loss(&mut self) {
        self.tokens = 0;
    }

    pub fn set_pacing_rate_calculator(&mut self, calculator: PacingRateCalculator) {
        self.calculator = calculator;
    }

    pub fn set_app_limited(&mut self, limited: bool) {
        self.app_limited = limited;
    }

    /// Zero when a write may go out now; otherwise the pacing interval.
    pub fn time_until_next_write(&self) -> Duration {
        if self.app_limited || self.tokens > 0 {
            Duration::ZERO
        } else {
            self.write_interval
        }
    }

    /// How many packets the imminent write loop may emit.
    ///
    /// When a scheduled write fires late, the burst grows by
    /// `ceil((now - scheduled + interval) / interval * burst)` and the
    /// excess over one burst is credited to `tokens`.
    pub fn update_and_get_write_batch_size(&mut self, now: Instant) -> u64 {
        let scheduled = self.scheduled_write_time.take();
        if self.app_limited {
            self.cached_batch_size = self.writer_limit;
            return self.cached_batch_size;
        }
        if self.write_interval.is_zero() {
            return self.batch_size;
        }
        let Some(scheduled_time) = scheduled else {
            return self.tokens;
        };
        if scheduled_time >= now {
            return self.tokens;
        }
        let interval_nanos = self.write_interval.as_nanos() as u64;
        let adjusted_nanos = now.saturating_duration_since(scheduled_time).as_nanos() as u64
            + interval_nanos;
        self.cached_batch_size =
            (adjusted_nanos * self.batch_size).div_ceil(interval_nanos);
        if self.cached_batch_size < self.batch_size {
            tracing::warn!(
                cached = self.cached_batch_size,
                batch = self.batch_size,
                "pacer batch size calculation: cached batch below batch size"
            );
        }
        self.tokens += self
            .cached_batch_size
            .saturating_sub(self.batch_size);
        self.tokens
    }

    /// Batch size computed by the most recent update.
    pub fn cached_write_batch_size(&self) -> u64 {
        self.cached_batch_size
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransportSettings {
        TransportSettings {
            pacing_timer_tick_interval: Duration::from_micros(1),
            ..TransportSettings::default()
        }
    }

    fn fixed_rate(interval: Duration, burst: u64) -> PacingRateCalculator {
        Box::new(move |_, _, _, _| PacingRate {
            interval,
            burst_size: burst,
        })
    }

    fn consume(pacer: &mut Pacer, n: u64) {
        for _ in 0..n {
            pacer.on_packet_sent();
        }
    }

    #[test]
    fn test_write_before_scheduled() {
        let mut pacer = Pacer::new(&settings());
        assert_eq!(
            pacer.update_and_get_write_batch_size(Instant::from_millis(1)),
            5
        );
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
    }

    #[test]
    fn test_pacer_basic_token_flow() {
        // interval=10ms, burst=10, writer limit 5.
        let mut pacer = Pacer::new(&settings());
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(10), 10));
        pacer.refresh_pacing_rate(100, Duration::from_millis(100));

        let t0 = Instant::from_millis(0);
        // Initial writer credit.
        assert_eq!(pacer.update_and_get_write_batch_size(t0), 5);
        consume(&mut pacer, 5);
        assert_eq!(pacer.time_until_next_write(), Duration::from_millis(10));

        pacer.on_paced_write_scheduled(t0);
        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(pacer.update_and_get_write_batch_size(t1), 10);
        consume(&mut pacer, 3);

        // No new schedule: banked tokens only.
        let t2 = t0 + Duration::from_millis(20);
        assert_eq!(pacer.update_and_get_write_batch_size(t2), 7);
    }

    #[test]
    fn test_compensate_timer_drift() {
        let mut pacer = Pacer::new(&settings());
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(1), 10));
        pacer.refresh_pacing_rate(20, Duration::from_micros(100));

        let t0 = Instant::from_millis(0);
        pacer.on_paced_write_scheduled(t0);
        // One interval late: a full extra burst is granted on top of the
        // writer credit still held.
        let granted = pacer.update_and_get_write_batch_size(t0 + Duration::from_millis(1));
        assert!(granted >= 15, "granted {granted}");

        // Querying again without a schedule keeps the compensation.
        assert_eq!(
            pacer.update_and_get_write_batch_size(t0 + Duration::from_millis(2)),
            granted
        );

        consume(&mut pacer, 3);
        assert_eq!(
            pacer.update_and_get_write_batch_size(t0 + Duration::from_millis(2)),
            granted - 3
        );
    }

    #[test]
    fn test_impossible_to_pace_falls_back_to_writer_limit() {
        let mut custom = settings();
        custom.pacing_timer_tick_interval = Duration::from_millis(1);
        let mut pacer = Pacer::new(&custom);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_micros(100), 200));
        // RTT below the tick: pacing off.
        pacer.refresh_pacing_rate(200 * 1252, Duration::from_micros(100));
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(
            pacer.update_and_get_write_batch_size(Instant::from_millis(5)),
            5
        );
    }

    #[test]
    fn test_app_limited_uses_writer_default() {
        let mut custom = settings();
        custom.write_connection_data_packets_limit = 12;
        let mut pacer = Pacer::new(&custom);
        pacer.set_app_limited(true);
        assert_eq!(pacer.time_until_next_write(), Duration::ZERO);
        assert_eq!(
            pacer.update_and_get_write_batch_size(Instant::from_millis(1)),
            12
        );
        assert_eq!(pacer.cached_write_batch_size(), 12);
    }

    #[test]
    fn test_tokens_never_negative_and_loss_drains() {
        let mut pacer = Pacer::new(&settings());
        consume(&mut pacer, 100);
        assert_eq!(pacer.tokens(), 0);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(10), 10));
        pacer.refresh_pacing_rate(100, Duration::from_millis(50));
        let t0 = Instant::from_millis(0);
        pacer.on_paced_write_scheduled(t0);
        pacer.update_and_get_write_batch_size(t0 + Duration::from_millis(10));
        assert!(pacer.tokens() > 0);
        pacer.on_packets_loss();
        assert_eq!(pacer.tokens(), 0);
    }

    #[test]
    fn test_cached_batch_size_tracks_refresh_and_drift() {
        let mut pacer = Pacer::new(&settings());
        assert_eq!(pacer.cached_write_batch_size(), 5);
        pacer.set_pacing_rate_calculator(fixed_rate(Duration::from_millis(100), 40));
        pacer.refresh_pacing_rate(20 * 1252, Duration::from_millis(100));
        assert_eq!(pacer.cached_write_batch_size(), 40);

        let t0 = Instant::from_millis(0);
        pacer.on_paced_write_scheduled(t0);
        pacer.update_and_get_write_batch_size(t0 + Duration::from_millis(100));
        assert_eq!(pacer.cached_write_batch_size(), 80);
    }

    #[test]
    fn test_default_rate_spreads_cwnd_over_rtt() {
        let calc = default_pacing_rate(5);
        let rate = calc(100 * 1000, 1000, 2, Duration::from_millis(100));
        assert_eq!(rate.burst_size, 5);
        // 100 mss over 100ms in bursts of 5: one burst every 5ms.
        assert_eq!(rate.interval, Duration::from_millis(5));
    }
}
