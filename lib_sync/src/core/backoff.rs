//! Exponential reconnect backoff with full jitter.
//!
//! The ceiling doubles per consecutive failure (`base * 2^attempt`) up to
//! `cap`; the actual delay is drawn uniformly from `[0, ceiling]`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the delay for the current attempt.
    pub fn ceiling(&self) -> Duration {
        // 2^31 * 1s already dwarfs any sane cap; clamp the shift to avoid overflow.
        let factor = 1u32 << self.attempt.min(31);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Draws the next delay and advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling_ms = self.ceiling().as_millis() as u64;
        self.attempt = self.attempt.saturating_add(1);
        let jittered = rand::rng().random_range(0..=ceiling_ms);
        Duration::from_millis(jittered)
    }

    /// Called once a connection has delivered something usable.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
