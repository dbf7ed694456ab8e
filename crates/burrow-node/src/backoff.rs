//! Linear retry backoff with wrap-around.

use std::time::Duration;

/// Starts at one step, grows by one step per failure, and falls back to one
/// step after passing the cap. Never returns more than the cap.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    step: Duration,
    cap: Duration,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        let step = step.min(cap);
        Self {
            step,
            cap,
            current: step,
        }
    }

    /// Delay for this failure; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current += self.step;
        if self.current > self.cap {
            self.current = self.step;
        }
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.step;
    }
}
