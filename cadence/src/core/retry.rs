// =============================================================================
// NODE RETRY BEHAVIOR
// =============================================================================
//
// A node attempt either succeeds, fails transiently, or is cancelled.
//
// - Cancellation is never retried: the run is being torn down.
// - Any other failure is retried while `attempt < max_attempts`, sleeping
//   `delay_for_attempt(attempt)` between attempts.
// - The delay grows exponentially from `initial_delay`, is capped at
//   `max_delay`, and then gets `uniform(0, jitter)` added on top so a fleet of
//   retrying nodes does not hammer a dependency in lockstep.
//
// The state machine itself lives in the runner; this module only owns the
// policy and its arithmetic.
// =============================================================================

use crate::core::{Error, Result};
use rand::Rng;
use std::time::Duration;

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Configuration for node retry behavior.
///
/// # Examples
///
/// ```
/// use cadence::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::with_max_attempts(4)
///     .with_initial_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(1));
///
/// assert_eq!(policy.base_delay_for_attempt(1), Duration::from_millis(100));
/// assert_eq!(policy.base_delay_for_attempt(2), Duration::from_millis(200));
/// assert_eq!(policy.base_delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try). Must be >= 1.
    ///
    /// Default: 1 (no retries)
    pub max_attempts: u32,

    /// Delay before the first retry.
    ///
    /// Default: 1 second
    pub initial_delay: Duration,

    /// Multiplier for exponential backoff. Must be >= 1.
    ///
    /// Each retry delay is calculated as:
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    ///
    /// Default: 2.0
    pub backoff_multiplier: f64,

    /// Maximum delay between retries (caps exponential backoff).
    ///
    /// Default: 30 seconds
    pub max_delay: Duration,

    /// Upper bound of the uniformly distributed extra delay added to each
    /// retry.
    ///
    /// Default: 0
    pub jitter: Duration,
}

impl RetryPolicy {
    /// No retries - fail immediately on first error.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_secs(30),
        jitter: Duration::ZERO,
    };

    /// Standard retry policy: 3 attempts, 1s then 2s between them.
    pub const STANDARD: Self = Self::with_max_attempts(3);

    /// Default delays with a custom attempt budget.
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::NONE
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Checks the policy invariants.
    ///
    /// Durations cannot be negative by construction, so only the attempt
    /// budget and the multiplier need checking.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::invalid_argument(
                "retry policy max_attempts must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_argument(format!(
                "retry policy backoff_multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Deterministic part of the delay after `attempt` (1-indexed) failed.
    ///
    /// Zero when the policy allows a single attempt.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.max_attempts <= 1 {
            return Duration::ZERO;
        }

        // attempt=1 (first retry): multiplier^0 = 1 → initial_delay
        let exponent = attempt.saturating_sub(1) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Full delay after `attempt` failed: the base delay plus jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.max_attempts <= 1 || self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Returns true if another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}
