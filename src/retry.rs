//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule between failed increment attempts.
///
/// After `n` consecutive failures the delay is drawn uniformly from
/// `[0, min(initial * 2^(n-1), max)]`. A zero `initial` disables waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
}

const MAX_DOUBLINGS: u32 = 20;

impl RetryPolicy {
    /// Retry at once, forever.
    pub const IMMEDIATE: RetryPolicy = RetryPolicy {
        initial: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            initial,
            max: max.max(initial),
        }
    }

    pub fn with_max(self, max: Duration) -> Self {
        Self::new(self.initial, max)
    }

    pub fn is_immediate(&self) -> bool {
        self.initial.is_zero()
    }

    /// Upper bound of the delay after `failures` consecutive failures.
    pub fn ceiling(&self, failures: u32) -> Duration {
        if failures == 0 || self.is_immediate() {
            return Duration::ZERO;
        }
        let doublings = (failures - 1).min(MAX_DOUBLINGS);
        self.initial
            .saturating_mul(1 << doublings)
            .min(self.max)
    }

    /// Draws the delay after `failures` consecutive failures.
    pub fn delay<R: Rng>(&self, failures: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(failures);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rng.random_range(0..=nanos))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(100))
    }
}
