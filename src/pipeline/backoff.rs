//! Reconnect delay schedule

use std::time::Duration;

use rand::Rng;

use crate::SourceConfig;

/// Exponential backoff, capped, with proportional jitter subtracted from the ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_cap(), config.backoff_jitter)
    }

    /// Upper bound for the delay before re-attempt `attempt` (0-based): `base * 2^attempt`, capped
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Randomized delay in `[ceiling * (1 - jitter), ceiling]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 {
            return ceiling;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - spread)
    }
}
