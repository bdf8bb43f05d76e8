//! Path validation and migration (RFC 9000 Sections 8.2, 9).
//!
//! A datagram from a new peer address triggers a challenge on the new path
//! while traffic continues on the old one. Until the new path is
//! validated, sends to it are throttled by a credit window refilled at
//! most once per RTT (the same mechanism caps server amplification toward
//! unvalidated clients).

use core::time::Duration;
use std::net::SocketAddr;

use crate::types::Instant;

/// Credits granted per refill window on an unvalidated path.
pub const DEFAULT_PATH_CREDIT_BYTES: u64 = 3 * 1252;

/// Validation timer: `3 × max(PTO, initial RTT)`.
pub fn path_validation_timeout(pto: Duration, initial_rtt: Duration) -> Duration {
    3 * pto.max(initial_rtt)
}

/// Byte-credit throttle for a not-yet-validated path.
#[derive(Debug, Clone)]
pub struct PendingPathRateLimiter {
    max_credit: u64,
    credit: u64,
    last_checked: Option<Instant>,
}

impl PendingPathRateLimiter {
    pub fn new(max_credit: u64) -> Self {
        Self {
            max_credit,
            credit: max_credit,
            last_checked: None,
        }
    }

    /// Remaining credit, refilling to the maximum at most once per RTT.
    pub fn current_credit(&mut self, check_time: Instant, rtt: Duration) -> u64 {
        let due = match self.last_checked {
            None => true,
            Some(last) => check_time > last + rtt,
        };
        if due {
            self.last_checked = Some(check_time);
            self.credit = self.max_credit;
        }
        self.credit
    }

    pub fn on_packet_sent(&mut self, sent_bytes: u64) {
        debug_assert!(self.credit >= sent_bytes);
        self.credit = self.credit.saturating_sub(sent_bytes);
    }
}

/// Per-connection path and migration state.
#[derive(Debug)]
pub struct PathState {
    /// Address current packets go to.
    pub peer_address: SocketAddr,
    /// Previous address retained while a migration validates.
    pub fallback_address: Option<SocketAddr>,
    /// Challenge data awaiting its PATH_RESPONSE.
    pub outstanding_path_validation: Option<u64>,
    /// Challenge queued but not yet sent.
    pub pending_challenge: Option<u64>,
    /// When the outstanding challenge was put on the wire.
    pub challenge_start_time: Option<Instant>,
    /// Deadline for the validation timer.
    pub validation_deadline: Option<Instant>,
    /// Throttle for the unvalidated path.
    pub rate_limiter: PendingPathRateLimiter,
    /// Server side: the peer's address is validated (no amplification
    /// cap). Clients start validated.
    pub peer_address_validated: bool,
}

impl PathState {
    pub fn new(peer_address: SocketAddr, validated: bool) -> Self {
        Self {
            peer_address,
            fallback_address: None,
            outstanding_path_validation: None,
            pending_challenge: None,
            challenge_start_time: None,
            validation_deadline: None,
            rate_limiter: PendingPathRateLimiter::new(DEFAULT_PATH_CREDIT_BYTES),
            peer_address_validated: validated,
        }
    }

    pub fn migration_in_progress(&self) -> bool {
        self.fallback_address.is_some()
    }

    /// Begin probing `new_address`. The caller has already rotated the
    /// peer connection id.
    pub fn begin_migration(&mut self, new_address: SocketAddr, challenge: u64, deadline: Instant) {
        self.fallback_address = Some(self.peer_address);
        self.peer_address = new_address;
        self.pending_challenge = Some(challenge);
        self.outstanding_path_validation = None;
        self.challenge_start_time = None;
        self.validation_deadline = Some(deadline);
        self.rate_limiter = PendingPathRateLimiter::new(DEFAULT_PATH_CREDIT_BYTES);
    }

    /// The queued challenge hit the wire; start the RTT clock.
    pub fn on_challenge_sent(&mut self, now: Instant) {
        if let Some(challenge) = self.pending_challenge.take() {
            self.outstanding_path_validation = Some(challenge);
            self.challenge_start_time = Some(now);
        }
    }

    /// Matching PATH_RESPONSE from the new path: commit the migration.
    /// Returns the challenge round-trip for an RTT sample.
    pub fn on_validation_success(&mut self, now: Instant) -> Option<Duration> {
        let started = self.challenge_start_time.take();
        self.outstanding_path_validation = None;
        self.pending_challenge = None;
        self.validation_deadline = None;
        self.fallback_address = None;
        self.peer_address_validated = true;
        started.map(|t| now.saturating_duration_since(t))
    }

    /// Validation timer fired: abandon the new path.
    pub fn on_validation_timeout(&mut self) {
        if let Some(previous) = self.fallback_address.take() {
            self.peer_address = previous;
        }
        self.outstanding_path_validation = None;
        self.pending_challenge = None;
        self.challenge_start_time = None;
        self.validation_deadline = None;
    }

    /// Does `response_data` answer the outstanding challenge?
    pub fn response_matches(&self, response_data: u64) -> bool {
        self.outstanding_path_validation == Some(response_data)
            || self.pending_challenge == Some(response_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_rate_limiter_refills_once_per_rtt() {
        let mut limiter = PendingPathRateLimiter::new(3000);
        let rtt = Duration::from_millis(100);
        let t0 = Instant::from_millis(1000);
        assert_eq!(limiter.current_credit(t0, rtt), 3000);
        limiter.on_packet_sent(1200);
        limiter.on_packet_sent(1200);
        // Within the same RTT: no refill.
        assert_eq!(
            limiter.current_credit(t0 + Duration::from_millis(50), rtt),
            600
        );
        // Past one RTT: full credit again.
        assert_eq!(
            limiter.current_credit(t0 + Duration::from_millis(150), rtt),
            3000
        );
    }

    #[test]
    fn test_migration_success_commits_new_path() {
        let mut path = PathState::new(addr(4433), true);
        path.begin_migration(addr(9999), 0x1234, Instant::from_millis(500));
        assert!(path.migration_in_progress());
        assert_eq!(path.peer_address, addr(9999));
        path.on_challenge_sent(Instant::from_millis(10));
        assert!(path.response_matches(0x1234));
        assert!(!path.response_matches(0x9999));
        let sample = path.on_validation_success(Instant::from_millis(60)).unwrap();
        assert_eq!(sample, Duration::from_millis(50));
        assert!(!path.migration_in_progress());
        assert_eq!(path.peer_address, addr(9999));
        assert!(path.outstanding_path_validation.is_none());
    }

    #[test]
    fn test_migration_timeout_retains_original_path() {
        let mut path = PathState::new(addr(4433), true);
        path.begin_migration(addr(9999), 0x1234, Instant::from_millis(500));
        path.on_challenge_sent(Instant::from_millis(10));
        path.on_validation_timeout();
        assert_eq!(path.peer_address, addr(4433));
        assert!(!path.migration_in_progress());
        assert!(path.outstanding_path_validation.is_none());
    }

    #[test]
    fn test_validation_timeout_formula() {
        assert_eq!(
            path_validation_timeout(Duration::from_millis(200), Duration::from_millis(333)),
            Duration::from_millis(999)
        );
        assert_eq!(
            path_validation_timeout(Duration::from_millis(500), Duration::from_millis(333)),
            Duration::from_millis(1500)
        );
    }
}
