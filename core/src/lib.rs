//! RateBreaker - failure-rate circuit breaker with a sliding window
//!
//! This crate provides admission control for calls to an unreliable
//! dependency:
//! - Count-based sliding window with failure and slow-call rates
//! - State machine for circuit breaker lifecycle (Closed → Open → HalfOpen)
//! - Exact half-open probe budgets under concurrent callers
//! - Lazy wait-duration expiry on a pluggable monotonic clock
//! - Synchronous, ordered event delivery and a named registry
//!
//! # Example
//!
//! ```rust
//! use rate_breaker::{CircuitBreaker, Permission, State};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .sliding_window_size(3)
//!     .minimum_number_of_calls(2)
//!     .failure_rate_threshold(50.0)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//!
//! // Execute with circuit protection
//! let result = circuit.call(|| Ok::<_, String>("success"));
//! assert!(result.is_ok());
//!
//! // Or drive it by hand around your own call
//! if circuit.acquire_permission() == Permission::Permitted {
//!     circuit.on_failure(Duration::from_millis(12));
//! }
//! circuit.on_failure(Duration::from_millis(15));
//!
//! assert_eq!(circuit.current_state(), State::Open);
//! ```

pub mod builder;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod registry;

pub use builder::CircuitBuilder;
pub use circuit::{
    CallOptions, CircuitBreaker, FallbackContext, FallbackReason, IntoCallOptions, Permission,
    State,
};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use errors::{CircuitError, ConfigError, SubscriberError};
pub use events::{Event, EventPublisher, SubscriberId};
pub use metrics::{
    CallOutcome, MetricsSnapshot, RATE_NOT_EVALUATED, RecordedCall, SlidingWindowMetrics,
    WindowCounts,
};
pub use registry::{Registry, ResetReport};
