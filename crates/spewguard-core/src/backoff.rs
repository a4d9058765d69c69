//! Capped exponential backoff shared by the reader and the forwarder.

use rand::Rng;
use std::time::Duration;

/// Delay calculator for a bounded number of retry attempts.
///
/// `delay(n)` is `initial * 2^(n-1)`, capped at `max`. With jitter enabled
/// the capped delay is scaled by a random factor in `0.8..1.2` and capped
/// again, so no delay ever exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts: max_attempts.max(1),
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `true` once `attempt` (1-indexed) has used up the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        let base = self.initial.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return base;
        }
        let scale = rand::thread_rng().gen_range(0.8..1.2);
        base.mul_f64(scale).min(self.max)
    }
}
