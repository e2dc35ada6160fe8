//! Error types for circuit breaker operations

use crate::circuit::State;
use thiserror::Error;

/// Errors returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call)
#[derive(Debug, Error)]
pub enum CircuitError<E = Box<dyn std::error::Error + Send + Sync>> {
    /// Open, or HalfOpen with the probe budget spent
    #[error("Circuit '{circuit}' does not permit further calls (state: {state})")]
    NotPermitted { circuit: String, state: State },
    /// The wrapped operation (or its fallback) failed
    #[error("Circuit execution failed: {0}")]
    Execution(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, CircuitError::NotPermitted { .. })
    }

    /// The wrapped error, if the call was admitted
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::NotPermitted { .. } => None,
        }
    }
}

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sliding_window_size must be at least 1")]
    SlidingWindowSize,
    #[error("minimum_number_of_calls ({minimum}) must be between 1 and sliding_window_size ({window})")]
    MinimumNumberOfCalls { minimum: usize, window: usize },
    #[error("failure_rate_threshold must be within 0..=100, got {0}")]
    FailureRateThreshold(f32),
    #[error("slow_call_rate_threshold must be within 0..=100, got {0}")]
    SlowCallRateThreshold(f32),
    #[error("permitted_calls_in_half_open_state must be at least 1")]
    PermittedCallsInHalfOpenState,
    #[error("open_jitter_factor must be within 0.0..=1.0, got {0}")]
    OpenJitterFactor(f64),
}

/// Failure raised by an event subscriber
///
/// Kept per subscriber: one failing subscriber never stops delivery to the
/// rest, and never rolls back the state change that produced the event.
#[derive(Debug, Error)]
#[error("Subscriber {subscriber} failed on circuit '{circuit}': {message}")]
pub struct SubscriberError {
    pub circuit: String,
    pub subscriber: u64,
    pub message: String,
}

impl SubscriberError {
    /// Error for a subscriber to return; circuit and id are filled in on dispatch
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            circuit: String::new(),
            subscriber: 0,
            message: message.into(),
        }
    }
}
