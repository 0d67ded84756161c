use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// `current()` is the delay to use now; `next()` doubles it (capped) after a
/// failure and `reset()` returns to the base after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            current: base,
            failures: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns the widened delay.
    pub fn next(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Delay before retry number `attempt` (1-based) without mutating state.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}
