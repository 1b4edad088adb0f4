//! # Fibonacci Backoff
//!
//! Requeue delays for reconciles that failed with an unexpected error.
//! Sequence: 1s, 1s, 2s, 3s, 5s, 8s ... capped at 60s, reset on success.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff in seconds
    prev_seconds: u64,
    /// Current backoff in seconds
    current_seconds: u64,
    /// Maximum backoff in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff between `min_seconds` and `max_seconds`.
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Returns the current backoff and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;
        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);
        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(1, 60)
    }
}
