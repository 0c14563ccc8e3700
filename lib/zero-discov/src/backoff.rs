//! Retry backoff for background registration loops

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay for the given retry attempt, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt.min(32));
        let delay_ms = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }

    /// Delay for the given retry attempt with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base.as_millis() as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(extra)
    }
}
