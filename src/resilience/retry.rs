//! Retry policy for message-level faults.
//!
//! Connectivity loss is never retried here; the service lifecycle owns
//! reconnects.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error_classifier::{ErrorCategory, StructuredError};

/// Bounded exponential retry without jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    /// Only retry errors flagged recoverable
    pub recoverable_only: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            recoverable_only: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether to retry after `attempt` failed attempts
    pub fn should_retry(&self, err: &StructuredError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if self.recoverable_only && !err.recoverable {
            return false;
        }
        !(err.category == ErrorCategory::Configuration && err.is_critical())
    }

    /// `base_delay * backoff_factor^attempt`, `base_delay` for attempt 0
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::error_classifier::ErrorSeverity;
    use proptest::prelude::*;

    #[test]
    fn test_stops_at_max_retries_regardless_of_recoverability() {
        let policy = RetryPolicy::default();
        let recoverable = StructuredError::processing("timeout talking to registry");
        assert!(policy.should_retry(&recoverable, 0));
        assert!(policy.should_retry(&recoverable, 2));
        assert!(!policy.should_retry(&recoverable, 3));
        assert!(!policy.should_retry(&recoverable, 4));

        let lenient = RetryPolicy {
            recoverable_only: false,
            ..RetryPolicy::default()
        };
        let fatal = StructuredError::validation("bad input");
        assert!(lenient.should_retry(&fatal, 1));
        assert!(!lenient.should_retry(&fatal, 3));
    }

    #[test]
    fn test_recoverable_only() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&StructuredError::validation("bad input"), 0));
        assert!(policy.should_retry(&StructuredError::network("reset"), 0));
    }

    #[test]
    fn test_critical_configuration_never_retried() {
        let policy = RetryPolicy {
            recoverable_only: false,
            ..RetryPolicy::default()
        };
        let critical = StructuredError::configuration("no credentials")
            .with_severity(ErrorSeverity::Critical);
        assert!(!policy.should_retry(&critical, 0));

        let high = StructuredError::configuration("no credentials");
        assert!(policy.should_retry(&high, 0));
    }

    #[test]
    fn test_retry_delay_examples() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_delay(0), Duration::from_secs(1));
        assert_eq!(policy.retry_delay(1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(8));
        assert_eq!(RetryPolicy::none().max_retries, 0);
    }

    #[test]
    fn test_retry_delay_saturates() {
        let policy = RetryPolicy {
            backoff_factor: 1e300,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.retry_delay(5), Duration::MAX);
    }

    proptest! {
        #[test]
        fn prop_retry_delay_is_pure_exponential(
            base_ms in 1u64..10_000,
            factor in 1.0f64..4.0,
            attempt in 1u32..12,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                backoff_factor: factor,
                ..RetryPolicy::default()
            };
            let expected = (base_ms as f64 / 1000.0) * factor.powi(attempt as i32);
            let actual = policy.retry_delay(attempt).as_secs_f64();
            prop_assert!((actual - expected).abs() <= expected * 1e-9 + 1e-9);
        }

        #[test]
        fn prop_never_retries_at_or_past_limit(max in 0u32..10, extra in 0u32..10) {
            let policy = RetryPolicy { max_retries: max, recoverable_only: false, ..RetryPolicy::default() };
            let err = StructuredError::processing("flaky");
            prop_assert!(!policy.should_retry(&err, max + extra));
        }
    }
}
