//! Builder API for ergonomic circuit breaker configuration

use crate::{
    circuit::{CircuitBreaker, State},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    config::Config,
    errors::{ConfigError, SubscriberError},
    events::{self, Event, EventPublisher, Subscriber},
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
///
/// Setters store values as given; [`build`](Self::build) validates the
/// result and refuses out-of-range settings instead of clamping them.
pub struct CircuitBuilder {
    name: String,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    subscribers: Vec<Subscriber>,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::default(),
            clock: None,
            failure_classifier: None,
            subscribers: Vec::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Number of calls kept in the sliding window
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Calls required before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Failure rate (percent) that opens the circuit
    /// Circuit opens when (failed / buffered * 100) >= this value
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Duration above which a call counts as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Slow call rate (percent) that opens the circuit
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// How long the circuit stays Open before probing
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Probe calls admitted per HalfOpen episode
    pub fn permitted_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_calls_in_half_open_state = calls;
        self
    }

    /// Leave Open on the first permission request after the wait
    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = wait up to twice as long)
    pub fn open_jitter_factor(mut self, factor: f64) -> Self {
        self.config.open_jitter_factor = factor;
        self
    }

    /// Time source; defaults to a [`MonotonicClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors count as failures
    ///
    /// Errors the classifier declines are returned to the caller but never
    /// recorded, so "expected" errors such as validation failures or client
    /// errors (4xx) cannot open the circuit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rate_breaker::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only count errors that also took a while
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Register a subscriber for every event
    pub fn subscriber<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribers.push(Arc::new(f));
        self
    }

    /// Set callback for every state transition
    pub fn on_state_transition<F>(self, f: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.subscriber(move |name, event| {
            if let Some((from, to)) = event.transition() {
                f(name, from, to);
            }
            Ok(())
        })
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.push(events::on_enter(State::Open, f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.push(events::on_enter(State::Closed, f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribers.push(events::on_enter(State::HalfOpen, f));
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let publisher = EventPublisher::new();
        for subscriber in self.subscribers {
            publisher.subscribe_arc(subscriber);
        }

        CircuitBreaker::with_parts(
            self.name,
            self.config,
            clock,
            self.failure_classifier,
            publisher,
        )
    }
}
