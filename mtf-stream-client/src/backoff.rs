use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(30_000);
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_millis(1_000);

/// Exponential reconnect backoff: `min(base * 2^attempt + jitter, max)` with `jitter` drawn
/// uniformly from `[0, jitter)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_JITTER)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            base,
            max,
            jitter,
            attempt: 0,
        }
    }

    /// Delay for the 0-indexed `attempt` given a jitter already drawn.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponential = 1u32
            .checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max);
        exponential.saturating_add(jitter).min(self.max)
    }

    /// Delay before the next reconnect, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = match self.jitter.as_millis() as u64 {
            0 => Duration::ZERO,
            jitter_ms => Duration::from_millis(rand::rng().random_range(0..jitter_ms)),
        };
        let delay = self.delay_for(self.attempt, jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures once a connection succeeds.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
