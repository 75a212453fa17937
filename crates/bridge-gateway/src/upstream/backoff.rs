//! Bounded exponential backoff between upstream connection attempts

use bridge_common::ReconnectConfig;
use std::time::Duration;

/// Doubling delay capped at a maximum, reset after every successful connection
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempts: 0,
        }
    }

    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay())
    }

    /// Delay before the next attempt; counts the attempt
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Consecutive failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
