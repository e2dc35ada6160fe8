//! Circuit breaker configuration
//!
//! A [`Config`] is validated once, when a breaker is built from it, and then
//! shared read-only. Changing thresholds means handing a new `Config` to
//! [`CircuitBreaker::reconfigure`](crate::CircuitBreaker::reconfigure), which
//! also resets the breaker.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of most recent calls kept in the sliding window
    pub sliding_window_size: usize,

    /// Calls that must be buffered before any rate is evaluated
    pub minimum_number_of_calls: usize,

    /// Failure rate (percent, 0-100) at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Calls taking longer than this are classified as slow
    #[serde(with = "humantime_serde")]
    pub slow_call_duration_threshold: Duration,

    /// Slow call rate (percent, 0-100) at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Minimum time an Open circuit rejects calls before probing
    #[serde(with = "humantime_serde")]
    pub wait_duration_in_open_state: Duration,

    /// Probe calls admitted per HalfOpen episode
    pub permitted_calls_in_half_open_state: usize,

    /// Move Open -> HalfOpen on the first permission request after the wait
    /// elapses. When disabled only `force_half_open` leaves Open.
    pub automatic_transition_from_open_to_half_open: bool,

    /// Jitter factor (0.0 = none, 1.0 = up to double) applied on top of the
    /// wait duration. Uses the chrono-machines full-jitter formula, folded so
    /// the effective wait is never shorter than `wait_duration_in_open_state`.
    pub open_jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            failure_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            slow_call_rate_threshold: 100.0,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open_state: 10,
            automatic_transition_from_open_to_half_open: true,
            open_jitter_factor: 0.0,
        }
    }
}

impl Config {
    /// Check every field; nothing is clamped
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::SlidingWindowSize);
        }

        if self.minimum_number_of_calls == 0
            || self.minimum_number_of_calls > self.sliding_window_size
        {
            return Err(ConfigError::MinimumNumberOfCalls {
                minimum: self.minimum_number_of_calls,
                window: self.sliding_window_size,
            });
        }

        if !is_percentage(self.failure_rate_threshold) {
            return Err(ConfigError::FailureRateThreshold(
                self.failure_rate_threshold,
            ));
        }

        if !is_percentage(self.slow_call_rate_threshold) {
            return Err(ConfigError::SlowCallRateThreshold(
                self.slow_call_rate_threshold,
            ));
        }

        if self.permitted_calls_in_half_open_state == 0 {
            return Err(ConfigError::PermittedCallsInHalfOpenState);
        }

        if !(0.0..=1.0).contains(&self.open_jitter_factor) {
            return Err(ConfigError::OpenJitterFactor(self.open_jitter_factor));
        }

        Ok(())
    }

    /// Wait duration for one Open episode, jitter included
    pub(crate) fn open_wait(&self) -> Duration {
        let base = self.wait_duration_in_open_state;
        if self.open_jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }

        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: base_ms,
            multiplier: 1.0,
            max_delay_ms: base_ms,
        };
        // full jitter lands in [base * (1 - factor), base]; mirror it above base
        let jittered = policy.calculate_delay(1, self.open_jitter_factor) as u64;
        base + Duration::from_millis(base_ms.saturating_sub(jittered))
    }
}

fn is_percentage(value: f32) -> bool {
    (0.0..=100.0).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_window(Config { sliding_window_size: 0, ..Default::default() })]
    #[case::minimum_above_window(Config {
        sliding_window_size: 5,
        minimum_number_of_calls: 6,
        ..Default::default()
    })]
    #[case::zero_minimum(Config { minimum_number_of_calls: 0, ..Default::default() })]
    #[case::failure_rate_above_100(Config { failure_rate_threshold: 100.5, ..Default::default() })]
    #[case::negative_failure_rate(Config { failure_rate_threshold: -1.0, ..Default::default() })]
    #[case::nan_failure_rate(Config { failure_rate_threshold: f32::NAN, ..Default::default() })]
    #[case::slow_rate_above_100(Config { slow_call_rate_threshold: 101.0, ..Default::default() })]
    #[case::zero_probes(Config { permitted_calls_in_half_open_state: 0, ..Default::default() })]
    #[case::jitter_above_one(Config { open_jitter_factor: 1.5, ..Default::default() })]
    fn test_invalid_configs_are_rejected(#[case] config: Config) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimum_equal_to_window_is_valid() {
        let config = Config {
            sliding_window_size: 3,
            minimum_number_of_calls: 3,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_reports_offending_values() {
        let config = Config {
            sliding_window_size: 3,
            minimum_number_of_calls: 4,
            ..Default::default()
        };

        match config.validate() {
            Err(ConfigError::MinimumNumberOfCalls { minimum, window }) => {
                assert_eq!(minimum, 4);
                assert_eq!(window, 3);
            }
            other => panic!("Expected MinimumNumberOfCalls error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_jitter_is_exact_wait() {
        let config = Config {
            wait_duration_in_open_state: Duration::from_secs(1),
            ..Default::default()
        };

        for _ in 0..10 {
            assert_eq!(config.open_wait(), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_jitter_never_shortens_wait() {
        let config = Config {
            wait_duration_in_open_state: Duration::from_secs(1),
            open_jitter_factor: 0.25,
            ..Default::default()
        };

        for _ in 0..50 {
            let wait = config.open_wait();
            assert!(wait >= Duration::from_secs(1), "wait {:?} below base", wait);
            assert!(
                wait <= Duration::from_millis(1260),
                "wait {:?} above jitter bound",
                wait
            );
        }
    }

    #[test]
    fn test_config_serializes_durations_human_readably() {
        let config = Config {
            wait_duration_in_open_state: Duration::from_secs(15),
            ..Default::default()
        };

        let json = serde_json::to_value(&config).expect("serialize config");
        assert_eq!(json["wait_duration_in_open_state"], "15s");
        assert_eq!(json["sliding_window_size"], 100);

        let parsed: Config = serde_json::from_value(json).expect("deserialize config");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = serde_json::from_str(
            r#"{ "sliding_window_size": 3, "minimum_number_of_calls": 2, "wait_duration_in_open_state": "15s" }"#,
        )
        .expect("deserialize partial config");

        assert_eq!(parsed.sliding_window_size, 3);
        assert_eq!(parsed.minimum_number_of_calls, 2);
        assert_eq!(parsed.wait_duration_in_open_state, Duration::from_secs(15));
        assert_eq!(parsed.permitted_calls_in_half_open_state, 10);
    }
}
