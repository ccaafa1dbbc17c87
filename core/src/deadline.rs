use std::time::Duration;

use tokio::time::Instant;

use crate::config::ExecutionConfig;

/// Wall-clock budget of one execution hop.
///
/// Crossing the soft deadline is the signal to checkpoint and hand off to a
/// continuation job; the hard deadline is the absolute budget.
#[derive(Clone, Copy, Debug)]
pub struct DeadlineTracker {
    started_at: Instant,
    soft: Duration,
    hard: Duration,
}

impl DeadlineTracker {
    pub fn new(wall_clock: Duration, soft_ratio: f64) -> Self {
        Self::starting_at(Instant::now(), wall_clock, soft_ratio)
    }

    pub fn starting_at(started_at: Instant, wall_clock: Duration, soft_ratio: f64) -> Self {
        Self {
            started_at,
            soft: wall_clock.mul_f64(soft_ratio.clamp(0.0, 1.0)),
            hard: wall_clock,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(config.wall_clock, config.soft_deadline_ratio)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn soft_deadline_crossed(&self) -> bool {
        self.elapsed() >= self.soft
    }

    pub fn hard_deadline_crossed(&self) -> bool {
        self.elapsed() >= self.hard
    }

    /// Time left before the hard deadline.
    pub fn remaining(&self) -> Duration {
        self.hard.saturating_sub(self.elapsed())
    }

    pub fn soft_budget(&self) -> Duration {
        self.soft
    }
}
