//! Per-recipient send circuit breaker.
//!
//! A run of failed datagram sends opens the breaker; while open, sends to
//! that recipient are suppressed except for a probe every 25 skipped
//! attempts. Any successful send closes it again.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

use lc_control::ClientId;

/// Consecutive failures that open the breaker.
pub const FAILURE_THRESHOLD: u32 = 50;

/// One probe send is allowed per this many skipped attempts.
pub const PROBE_INTERVAL: u32 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendDecision {
    Send,
    Skip,
}

#[derive(Default)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    skips: AtomicU32,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= FAILURE_THRESHOLD
    }

    /// Consult the breaker before a send. While open, counts the skip and
    /// suppresses the send unless this attempt lands on a probe slot.
    pub fn check(&self) -> SendDecision {
        if self.failures.load(Ordering::Relaxed) < FAILURE_THRESHOLD {
            return SendDecision::Send;
        }
        let skips = self.skips.fetch_add(1, Ordering::Relaxed) + 1;
        if skips % PROBE_INTERVAL == 0 {
            SendDecision::Send
        } else {
            SendDecision::Skip
        }
    }

    pub fn on_success(&self, recipient: ClientId) {
        if self.failures.load(Ordering::Relaxed) >= FAILURE_THRESHOLD {
            info!(%recipient, "circuit breaker closed");
        }
        self.failures.store(0, Ordering::Relaxed);
        self.skips.store(0, Ordering::Relaxed);
    }

    pub fn on_failure(&self, recipient: ClientId) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == FAILURE_THRESHOLD {
            info!(%recipient, failures, "circuit breaker open");
        } else {
            debug!(%recipient, failures, "datagram send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: ClientId = ClientId(9);

    fn tripped() -> CircuitBreaker {
        let b = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            b.on_failure(PEER);
        }
        b
    }

    #[test]
    fn closed_until_threshold() {
        let b = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.on_failure(PEER);
        }
        assert_eq!(b.check(), SendDecision::Send);
        b.on_failure(PEER);
        assert!(b.is_open());
        assert_eq!(b.check(), SendDecision::Skip);
    }

    #[test]
    fn probes_every_twenty_five_skips() {
        let b = tripped();
        let mut sends = 0;
        for _ in 0..100 {
            if b.check() == SendDecision::Send {
                sends += 1;
            }
        }
        assert_eq!(sends, 100 / PROBE_INTERVAL as usize);
    }

    #[test]
    fn success_closes_and_resets() {
        let b = tripped();
        assert!(b.is_open());
        b.on_success(PEER);
        assert!(!b.is_open());
        assert_eq!(b.check(), SendDecision::Send);
        // A fresh failure run is needed to open it again.
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.on_failure(PEER);
        }
        assert!(!b.is_open());
    }
}
