//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug)]
pub struct RetryStrategy {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0) to randomize delays.
    pub jitter_factor: f32,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.base_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter: f64 = if self.jitter_factor > 0.0 {
            let mut rng = rand::rng();
            rng.random_range(0.0..self.jitter_factor as f64)
        } else {
            0.0
        };

        Duration::from_secs_f64(capped * (1.0 + jitter))
    }

    /// True while `attempts_made` leaves room for another try.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
