//! Retry policy for reissued attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How many attempts a task gets and how long a retry waits before it
/// re-enters the scheduler
///
/// The ack timeout of each attempt already grows exponentially; this delay
/// is an extra hold applied between a lost attempt and its reissue.
///
/// # Example
///
/// ```
/// use relaykit_dispatch::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(200))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Default attempt budget (including the first) for tasks that set none
    pub max_attempts: u32,

    /// Hold before the first retry
    #[serde(with = "crate::duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on the hold
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive retries
    pub backoff_coefficient: f64,

    /// Randomness applied to the hold (0.1 = ±10%)
    pub jitter: f64,

    /// Task error kinds that fail immediately
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

impl RetryPolicy {
    /// Reissue lost attempts straight away
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Exponential hold: 100ms doubling up to 10s, 10% jitter, 5 attempts
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self::immediate(1)
    }

    /// Same hold before every retry
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_errors.push(kind.into());
        self
    }

    /// Hold before issuing `attempt` (1-based); zero for the first attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_interval.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(2).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether an error of this kind may be retried
    pub fn should_retry(&self, kind: Option<&str>) -> bool {
        match kind {
            Some(kind) => !self.non_retryable_errors.iter().any(|k| k == kind),
            None => true,
        }
    }
}
