use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential reconnect delays with a cap and random extra delay.
///
/// For attempt `n` (1-based) the exponential part is `base * 2^(n-1)`,
/// capped at `max`. Jitter adds up to `jitter * exponential` on top and the
/// sum is clamped to `max` again. With `jitter <= 1` the next exponential
/// step is at least as large as the previous one plus its jitter, so
/// successive delays never shrink.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: config.base_delay,
            max: config.max_delay.max(config.base_delay),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before attempt `attempt`, without jitter.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before attempt `attempt` for a jitter draw `unit` in `0.0..=1.0`.
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let exponential = self.exponential(attempt);
        let extra = exponential.mul_f64(self.jitter * unit.clamp(0.0, 1.0));
        (exponential + extra).min(self.max)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay(attempt, unit)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
