//! Bounded retry with exponential backoff.

use std::time::Duration;

/// How often, and how patiently, a failed apply is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every later one.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(5),
        }
    }

    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self::exponential(Duration::ZERO, 1)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// The delays to sleep between attempts, one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial_delay;
        let max = self.max_delay;
        (1..self.max_attempts.max(1)).map(move |retry| {
            let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
            initial.saturating_mul(factor).min(max)
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(50), 3)
    }
}
