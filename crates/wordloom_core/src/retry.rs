//! Retry and idle backoff schedules.

use std::time::Duration;

use rand::Rng;

/// Exponential retry schedule for transient projector failures.
///
/// `delay(attempts) = min(cap, base * 2^(attempts-1)) * jitter` with jitter
/// drawn from `[0.5, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Attempts after which a transient failure becomes terminal.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay for the given (1-based) attempt count.
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let factor = 1u64 << exp;
        let base_ms = self.base.as_millis() as u64;
        let ms = base_ms.saturating_mul(factor);
        Duration::from_millis(ms).min(self.cap)
    }

    /// Delay with an explicit jitter factor, clamped to `[0.5, 1.0]`.
    pub fn delay_with_jitter(&self, attempts: u32, jitter: f64) -> Duration {
        self.ceiling(attempts).mul_f64(jitter.clamp(0.5, 1.0))
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        self.delay_with_jitter(attempts, jitter)
    }

    /// Whether a row that has now failed `attempts` times should stop retrying.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Idle poll backoff: doubles from `min` to `max` while the queue is empty.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Next sleep, jittered to `[current/2, current]`; advances the schedule.
    pub fn next_sleep(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        let sleep = self.current.mul_f64(jitter);
        self.current = (self.current * 2).min(self.max);
        sleep
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
