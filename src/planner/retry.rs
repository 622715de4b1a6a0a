//! Retry policy for provider calls.

use std::time::Duration;

use crate::config::RetrySettings;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: multiplier.max(1.0),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if another attempt may follow attempt number `attempt`
    /// (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max_ms = self.max_backoff.as_millis() as f64;
        let millis = (self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent)).min(max_ms);

        if millis.is_finite() {
            Duration::from_millis(millis.round().max(0.0) as u64)
        } else {
            self.max_backoff
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.multiplier,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(1000), 2.0);

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        assert!(!RetryPolicy::no_retry().should_retry(1));
        assert_eq!(RetryPolicy::no_retry().backoff(1), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_still_allows_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.5);
        assert_eq!(policy.max_attempts(), 1);
    }
}
