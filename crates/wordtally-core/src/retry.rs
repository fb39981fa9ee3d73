use std::time::Duration;

use rand::Rng;

/// Lower and upper bound of the multiplicative backoff jitter.
pub const JITTER_RANGE: (f64, f64) = (0.8, 1.2);

/// Exponential backoff with capped delay and multiplicative jitter.
///
/// Delay before retry `k` (0-based, counted from the first failure):
/// `min(initial_backoff * 2^k, max_backoff) * U[0.8, 1.2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Total number of attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay for retry `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_backoff)
    }

    /// Delay for retry `attempt` scaled by an explicit jitter factor.
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        self.base_delay(attempt).mul_f64(factor.max(0.0))
    }

    /// Delay for retry `attempt` with a jitter factor drawn from `rng`.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = rng.gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        self.delay_with_factor(attempt, factor)
    }
}

/// Per-fetch attempt counter. Lives only inside one fetch loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0-based index of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a transient failure. Returns the retry index to back off for,
    /// or `None` once the policy's attempts are used up.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<u32> {
        if self.attempt >= policy.max_retries {
            return None;
        }
        let retry = self.attempt;
        self.attempt += 1;
        Some(retry)
    }
}
