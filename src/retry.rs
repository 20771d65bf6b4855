use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential back-off policy for a work-item type: delay doubles each
/// attempt from `initial_delay` up to `max_delay`, with a jitter factor
/// to spread out synchronized retries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 = deterministic, 1.0 = full jitter. The delay is scaled by a
    /// random factor in `[1 - jitter/2, 1 + jitter/2]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given the number of attempts made
    /// so far (>= 1 after the first failure).
    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        let exponent = attempts_so_far.saturating_sub(1).min(32);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 - self.jitter / 2.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        base.mul_f64(factor).min(self.max_delay)
    }
}
