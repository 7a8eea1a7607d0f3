//! Retry strategies.
//!
//! A strategy is a pure function of the attempt number and its static
//! configuration. It never sleeps and holds no state, so a single instance can
//! be shared by every caller. The loop that actually waits and re-invokes an
//! operation lives in `tollgate-runtime`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy consulted between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `min(max, initial * multiplier^(attempt-1))`
    Exponential {
        #[serde(with = "crate::duration_serde")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "crate::duration_serde")]
        max: Duration,
    },

    /// `min(max, initial + increment * (attempt-1))`
    Linear {
        #[serde(with = "crate::duration_serde")]
        initial: Duration,
        #[serde(with = "crate::duration_serde")]
        increment: Duration,
        #[serde(with = "crate::duration_serde")]
        max: Duration,
    },

    /// Fail on the first error
    None,
}

impl RetryStrategy {
    /// Exponential backoff.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        RetryStrategy::Exponential {
            initial,
            multiplier,
            max,
        }
    }

    /// Linear backoff.
    pub fn linear(initial: Duration, increment: Duration, max: Duration) -> Self {
        RetryStrategy::Linear {
            initial,
            increment,
            max,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (starting at 1).
    ///
    /// Returns `None` when the strategy never retries.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let steps = attempt.saturating_sub(1);
        match self {
            RetryStrategy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(steps).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    Some(*max)
                } else {
                    Some(Duration::from_secs_f64(secs.max(0.0)).min(*max))
                }
            }
            RetryStrategy::Linear {
                initial,
                increment,
                max,
            } => Some(
                initial
                    .saturating_add(increment.saturating_mul(steps))
                    .min(*max),
            ),
            RetryStrategy::None => None,
        }
    }

    /// Check the static configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RetryStrategy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(format!(
                        "exponential multiplier must be a finite value >= 1.0, got {multiplier}"
                    ));
                }
                if initial > max {
                    return Err("exponential initial delay exceeds max delay".to_string());
                }
                Ok(())
            }
            RetryStrategy::Linear { initial, max, .. } => {
                if initial > max {
                    return Err("linear initial delay exceeds max delay".to_string());
                }
                Ok(())
            }
            RetryStrategy::None => Ok(()),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(2))
    }
}

/// A strategy bounded by a maximum number of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff between attempts
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(strategy: RetryStrategy, max_attempts: u32) -> Self {
        Self {
            strategy,
            max_attempts,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(RetryStrategy::None, 1)
    }

    /// Delay before the attempt following `failed_attempt`, or `None` when
    /// the attempt budget is spent or the strategy does not retry.
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }
        self.strategy.next_delay(failed_attempt)
    }

    /// Check the static configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        self.strategy.validate()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryStrategy::default(), default_max_attempts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_delays() {
        let strategy =
            RetryStrategy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(60));

        assert_eq!(strategy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(strategy.next_delay(7), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_exponential_survives_huge_attempts() {
        let strategy =
            RetryStrategy::exponential(Duration::from_secs(1), 10.0, Duration::from_secs(30));
        assert_eq!(strategy.next_delay(u32::MAX), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_linear_delays() {
        let strategy = RetryStrategy::linear(
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );

        assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(500)));
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(1500)));
        assert_eq!(strategy.next_delay(3), Some(Duration::from_millis(2500)));
        assert_eq!(strategy.next_delay(4), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_none_never_retries() {
        assert_eq!(RetryStrategy::None.next_delay(1), None);
        assert_eq!(RetryPolicy::no_retry().delay_after(1), None);
    }

    #[test]
    fn test_policy_stops_at_max_attempts() {
        let policy = RetryPolicy::new(
            RetryStrategy::linear(Duration::ZERO, Duration::from_millis(10), Duration::from_secs(1)),
            3,
        );

        assert_eq!(policy.delay_after(1), Some(Duration::ZERO));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(RetryStrategy::None, 0).validate().is_err());

        let shrinking =
            RetryStrategy::exponential(Duration::from_secs(1), 0.5, Duration::from_secs(10));
        assert!(shrinking.validate().is_err());

        let inverted = RetryStrategy::linear(
            Duration::from_secs(10),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_strategy_config_roundtrip_from_yaml_like_json() {
        let json = r#"{"type": "linear", "initial": "100ms", "increment": "200ms", "max": "1s"}"#;
        let strategy: RetryStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(strategy.next_delay(2), Some(Duration::from_millis(300)));

        let none: RetryStrategy = serde_json::from_str(r#"{"type": "none"}"#).unwrap();
        assert_eq!(none, RetryStrategy::None);
    }

    proptest! {
        #[test]
        fn prop_exponential_is_bounded_and_monotonic(
            initial_ms in 0u64..5_000,
            multiplier in 1.0f64..8.0,
            max_ms in 5_000u64..120_000,
            attempt in 1u32..200,
        ) {
            let max = Duration::from_millis(max_ms);
            let strategy = RetryStrategy::exponential(Duration::from_millis(initial_ms), multiplier, max);

            let current = strategy.next_delay(attempt).unwrap();
            let next = strategy.next_delay(attempt + 1).unwrap();

            prop_assert!(current <= max);
            prop_assert!(current <= next);
        }

        #[test]
        fn prop_linear_is_bounded_and_monotonic(
            initial_ms in 0u64..5_000,
            increment_ms in 0u64..5_000,
            max_ms in 5_000u64..120_000,
            attempt in 1u32..10_000,
        ) {
            let max = Duration::from_millis(max_ms);
            let strategy = RetryStrategy::linear(
                Duration::from_millis(initial_ms),
                Duration::from_millis(increment_ms),
                max,
            );

            let current = strategy.next_delay(attempt).unwrap();
            let next = strategy.next_delay(attempt + 1).unwrap();

            prop_assert!(current <= max);
            prop_assert!(current <= next);
        }
    }
}
