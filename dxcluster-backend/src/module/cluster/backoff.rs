use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay with jitter: `min * 2^attempt` plus up to half
/// of that again, never above `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    stable_after: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            stable_after,
            attempt: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_secs(config.stable_after_secs),
        )
    }

    /// Delay before the next attempt; each call doubles the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let max_jitter = base.as_millis() as u64 / 2;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Reset if a connection stayed up long enough to count as stable.
    pub fn connection_lasted(&mut self, uptime: Duration) {
        if uptime >= self.stable_after {
            self.reset();
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
