//! Circuit breaker implementation using state machines
//!
//! The lifecycle (Closed → Open → HalfOpen → Closed/Open) is a typestate
//! machine whose guards read the shared sliding window. The public
//! [`CircuitBreaker`] wraps the machine in a reentrant lock so permission
//! checks, outcome recording and transitions are linearized across threads,
//! while the protected call itself always runs outside the lock.

use crate::{
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    config::Config,
    errors::{CircuitError, ConfigError},
    events::{Event, EventPublisher, SubscriberId},
    metrics::{CallOutcome, MetricsSnapshot, SlidingWindowMetrics},
};
use parking_lot::ReentrantMutex;
use serde::Serialize;
use state_machines::state_machine;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Calls flow and are recorded
    Closed,
    /// Calls are rejected until the wait duration elapses
    Open,
    /// A limited batch of probe calls decides between Closed and Open
    HalfOpen,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => State::Open,
            "HalfOpen" => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Permission {
    Permitted,
    Rejected,
}

impl Permission {
    pub fn is_permitted(self) -> bool {
        self == Permission::Permitted
    }
}

/// Why a fallback is running
#[derive(Debug)]
pub enum FallbackReason<E> {
    /// The circuit refused the call; the work never ran
    NotPermitted,
    /// The work ran, failed, and the failure has already been recorded
    Failed(E),
}

/// Context provided to fallback closures
#[derive(Debug)]
pub struct FallbackContext<E> {
    /// Circuit name
    pub circuit_name: String,
    /// Circuit state when the fallback was chosen
    pub state: State,
    pub reason: FallbackReason<E>,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(FallbackContext<E>) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Optional fallback, used on rejection and on failure
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FallbackContext<E>) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Type alias for callable function
pub type CallableFn<T, E> = Box<dyn FnOnce() -> Result<T, E>>;

/// Trait for converting into CallOptions - allows flexible call() API
pub trait IntoCallOptions<T, E> {
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>);
}

/// Plain closure, no fallback
impl<T, E, F> IntoCallOptions<T, E> for F
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self), CallOptions::default())
    }
}

/// (closure, CallOptions) tuple
impl<T, E, F> IntoCallOptions<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0), self.1)
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Arc<Config>,
    pub metrics: Arc<SlidingWindowMetrics>,
    pub clock: Arc<dyn Clock>,
}

impl CircuitContext {
    fn new(name: String, config: Config, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(SlidingWindowMetrics::new(
            config.sliding_window_size,
            config.minimum_number_of_calls,
        ));
        Self {
            name,
            config: Arc::new(config),
            metrics,
            clock,
        }
    }

    fn threshold_exceeded(&self) -> bool {
        self.metrics.counts().exceeds(
            self.config.failure_rate_threshold,
            self.config.slow_call_rate_threshold,
        )
    }

    fn probe_batch_complete(&self) -> bool {
        self.metrics.counts().buffered >= self.config.permitted_calls_in_half_open_state
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(
            String::new(),
            Config::default(),
            Arc::new(MonotonicClock::new()),
        )
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("metrics", &self.metrics.counts())
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Clock reading when this Open episode began
    pub opened_at: Duration,
    /// Effective wait for this episode (jitter included)
    pub wait: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub permits_remaining: usize,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        force_open {
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        force_half_open {
            transition: { from: [Closed, Open], to: HalfOpen }
        }
    }
}

impl Circuit<Closed> {
    /// Either evaluated rate is at or above its threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.threshold_exceeded()
    }
}

impl Circuit<HalfOpen> {
    /// The probe batch is in and breaches a threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.probe_batch_complete() && ctx.threshold_exceeded()
    }

    /// The probe batch is in and stays under both thresholds
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        ctx.probe_batch_complete() && !ctx.threshold_exceeded()
    }
}

impl Circuit<Open> {
    /// Automatic recovery is on and this episode's wait has passed
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        if !ctx.config.automatic_transition_from_open_to_half_open {
            return false;
        }
        let Some(data) = self.state_data_open() else {
            return false;
        };
        ctx.clock.now().saturating_sub(data.opened_at) >= data.wait
    }
}

/// A permission decision tagged with the state episode it was made in
#[derive(Debug, Clone, Copy)]
struct Grant {
    permission: Permission,
    state: State,
    episode: u64,
}

/// Mutable engine state, only touched under the breaker lock
struct Core {
    machine: DynamicCircuit,
    context: CircuitContext,
    /// Bumped on every transition
    episode: u64,
}

impl Core {
    fn new(context: CircuitContext) -> Self {
        let machine = DynamicCircuit::new(context.clone());
        Self {
            machine,
            context,
            episode: 0,
        }
    }

    fn state(&self) -> State {
        State::from_machine(self.machine.current_state())
    }

    fn now(&self) -> Duration {
        self.context.clock.now()
    }

    fn acquire(&mut self, events: &mut Vec<Event>) -> Grant {
        if self.state() == State::Open && self.machine.handle(CircuitEvent::AttemptReset).is_ok() {
            self.enter_half_open(State::Open, events);
        }

        let state = self.state();
        let permitted = match state {
            State::Closed => true,
            State::HalfOpen => match self.machine.half_open_data_mut() {
                Some(data) if data.permits_remaining > 0 => {
                    data.permits_remaining -= 1;
                    true
                }
                _ => false,
            },
            State::Open => false,
        };

        if permitted {
            return Grant {
                permission: Permission::Permitted,
                state,
                episode: self.episode,
            };
        }

        self.context.metrics.record_not_permitted();
        tracing::debug!(circuit = %self.context.name, %state, "call not permitted");
        events.push(Event::CallRejected {
            state,
            at: self.now(),
        });
        Grant {
            permission: Permission::Rejected,
            state,
            episode: self.episode,
        }
    }

    /// A HalfOpen probe must come from the current episode; untagged
    /// reports from the manual API are trusted
    fn is_current_probe(&self, admitted: Option<u64>) -> bool {
        admitted.is_none_or(|episode| episode == self.episode)
    }

    fn release(&mut self, admitted: Option<u64>) {
        if !self.is_current_probe(admitted) {
            return;
        }
        let budget = self.context.config.permitted_calls_in_half_open_state;
        if let Some(data) = self.machine.half_open_data_mut() {
            data.permits_remaining = (data.permits_remaining + 1).min(budget);
        }
    }

    fn record(
        &mut self,
        outcome: CallOutcome,
        duration: Duration,
        admitted: Option<u64>,
        events: &mut Vec<Event>,
    ) {
        let state = self.state();
        if state == State::Open {
            tracing::debug!(
                circuit = %self.context.name,
                ?outcome,
                "discarding outcome that completed while open"
            );
            return;
        }
        if state == State::HalfOpen && !self.is_current_probe(admitted) {
            tracing::debug!(
                circuit = %self.context.name,
                ?outcome,
                "discarding outcome admitted before this half-open episode"
            );
            return;
        }

        self.context.metrics.record(outcome, duration);
        events.push(Event::CallRecorded { outcome, duration });

        if self.machine.handle(CircuitEvent::Trip).is_ok() {
            self.enter_open(state, events);
        } else if state == State::HalfOpen && self.machine.handle(CircuitEvent::Close).is_ok() {
            self.enter_closed(State::HalfOpen, events);
        }
    }

    fn force_open(&mut self, events: &mut Vec<Event>) {
        let state = self.state();
        if state == State::Open {
            self.stamp_open();
        } else if self.machine.handle(CircuitEvent::ForceOpen).is_ok() {
            self.enter_open(state, events);
        }
    }

    fn force_half_open(&mut self, events: &mut Vec<Event>) {
        let state = self.state();
        if state != State::HalfOpen && self.machine.handle(CircuitEvent::ForceHalfOpen).is_ok() {
            self.enter_half_open(state, events);
        }
    }

    /// Back to a fresh Closed machine; always reports the transition
    fn reset(&mut self, events: &mut Vec<Event>) -> State {
        let previous = self.state();
        self.machine = DynamicCircuit::new(self.context.clone());
        self.enter_closed(previous, events);
        previous
    }

    fn enter_open(&mut self, from: State, events: &mut Vec<Event>) {
        self.stamp_open();
        self.reset_window();
        self.transitioned(from, State::Open, events);
    }

    fn enter_half_open(&mut self, from: State, events: &mut Vec<Event>) {
        let budget = self.context.config.permitted_calls_in_half_open_state;
        if let Some(data) = self.machine.half_open_data_mut() {
            data.permits_remaining = budget;
        }
        self.context.metrics.reset_to(budget, budget);
        self.transitioned(from, State::HalfOpen, events);
    }

    fn enter_closed(&mut self, from: State, events: &mut Vec<Event>) {
        self.reset_window();
        self.transitioned(from, State::Closed, events);
    }

    /// Apply Open-state bookkeeping: timestamp and this episode's wait
    fn stamp_open(&mut self) {
        let now = self.now();
        let wait = self.context.config.open_wait();
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = now;
            data.wait = wait;
        }
    }

    fn reset_window(&self) {
        let config = &self.context.config;
        self.context
            .metrics
            .reset_to(config.sliding_window_size, config.minimum_number_of_calls);
    }

    fn transitioned(&mut self, from: State, to: State, events: &mut Vec<Event>) {
        self.episode += 1;
        tracing::info!(circuit = %self.context.name, %from, %to, "circuit state transition");
        events.push(Event::StateTransition {
            from,
            to,
            at: self.now(),
        });
    }
}

/// Engine plus the queue of events waiting for delivery
struct Engine {
    core: RefCell<Core>,
    outbox: RefCell<VecDeque<Event>>,
    delivering: Cell<bool>,
}

/// Circuit breaker public API
///
/// Shareable across threads (`Arc<CircuitBreaker>`); every method takes
/// `&self`. Subscribers run while the breaker's reentrant lock is held, so
/// they may call back into the same breaker from their own thread but must
/// not block on another thread that uses it. Events caused from inside a
/// subscriber are queued behind the batch being delivered.
pub struct CircuitBreaker {
    name: String,
    engine: ReentrantMutex<Engine>,
    metrics: Arc<SlidingWindowMetrics>,
    clock: Arc<dyn Clock>,
    publisher: EventPublisher,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ConfigError> {
        Self::with_parts(
            name.into(),
            config,
            Arc::new(MonotonicClock::new()),
            None,
            EventPublisher::new(),
        )
    }

    /// Assemble a breaker from validated parts (used by builder and registry)
    pub(crate) fn with_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        publisher: EventPublisher,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::assemble(name, config, clock, failure_classifier, publisher))
    }

    /// Assemble a breaker from a configuration that was already validated
    pub(crate) fn assemble(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        publisher: EventPublisher,
    ) -> Self {
        let context = CircuitContext::new(name.clone(), config, clock.clone());
        let metrics = context.metrics.clone();

        Self {
            name,
            engine: ReentrantMutex::new(Engine {
                core: RefCell::new(Core::new(context)),
                outbox: RefCell::new(VecDeque::new()),
                delivering: Cell::new(false),
            }),
            metrics,
            clock,
            publisher,
            failure_classifier,
        }
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the engine, then deliver the events it produced
    ///
    /// A nested call from a subscriber only queues its events; the
    /// outermost call drains the queue in order.
    fn transact<R>(&self, f: impl FnOnce(&mut Core, &mut Vec<Event>) -> R) -> R {
        let engine = self.engine.lock();
        let mut events = Vec::new();
        let result = f(&mut *engine.core.borrow_mut(), &mut events);
        engine.outbox.borrow_mut().extend(events);

        if engine.delivering.replace(true) {
            return result;
        }
        loop {
            let next = engine.outbox.borrow_mut().pop_front();
            let Some(event) = next else { break };
            self.publisher.publish(&self.name, &event);
        }
        engine.delivering.set(false);
        result
    }

    fn inspect<R>(&self, f: impl FnOnce(&Core) -> R) -> R {
        let engine = self.engine.lock();
        let core = engine.core.borrow();
        f(&core)
    }

    /// Decide whether a call may proceed
    ///
    /// Never records an outcome. In HalfOpen a granted permission consumes
    /// one probe from the budget. An Open circuit whose wait has elapsed
    /// moves to HalfOpen here when automatic transition is enabled.
    pub fn acquire_permission(&self) -> Permission {
        self.transact(|core, events| core.acquire(events)).permission
    }

    /// Hand back a HalfOpen probe that was acquired but never used
    ///
    /// The manual API does not track which episode a permit came from;
    /// [`call`](Self::call) and [`run`](Self::run) do.
    pub fn release_permission(&self) {
        self.transact(|core, _| core.release(None));
    }

    /// Report a completed call that succeeded
    pub fn on_success(&self, duration: Duration) {
        self.record(false, duration, None);
    }

    /// Report a completed call that failed
    pub fn on_failure(&self, duration: Duration) {
        self.record(true, duration, None);
    }

    /// Record an already classified outcome
    pub fn record_outcome(&self, outcome: CallOutcome, duration: Duration) {
        self.transact(|core, events| core.record(outcome, duration, None, events));
    }

    fn record(&self, failed: bool, duration: Duration, admitted: Option<u64>) {
        self.transact(|core, events| {
            let outcome = CallOutcome::classify(
                failed,
                duration,
                core.context.config.slow_call_duration_threshold,
            );
            core.record(outcome, duration, admitted, events);
        });
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `circuit.call(|| api_request())`
    /// - A closure with options: `circuit.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    pub fn call<I, T, E: 'static>(&self, input: I) -> Result<T, CircuitError<E>>
    where
        I: IntoCallOptions<T, E>,
    {
        let (f, options) = input.into_call_options();
        self.execute(f, options.fallback)
    }

    /// Execute `work`, routing rejections and recorded failures to `fallback`
    ///
    /// Unlike [`call`](Self::call) the closures may borrow from the caller.
    pub fn run<T, E, W, F>(&self, work: W, fallback: F) -> Result<T, CircuitError<E>>
    where
        E: 'static,
        W: FnOnce() -> Result<T, E>,
        F: FnOnce(FallbackContext<E>) -> Result<T, E>,
    {
        self.execute(work, Some(fallback))
    }

    fn execute<T, E, W, F>(&self, work: W, fallback: Option<F>) -> Result<T, CircuitError<E>>
    where
        E: 'static,
        W: FnOnce() -> Result<T, E>,
        F: FnOnce(FallbackContext<E>) -> Result<T, E>,
    {
        let grant = self.transact(|core, events| core.acquire(events));

        if grant.permission == Permission::Rejected {
            return match fallback {
                Some(fallback) => fallback(self.fallback_context(grant.state, FallbackReason::NotPermitted))
                    .map_err(CircuitError::Execution),
                None => Err(CircuitError::NotPermitted {
                    circuit: self.name.clone(),
                    state: grant.state,
                }),
            };
        }

        let start = self.clock.now();
        let result = work();
        let duration = self.clock.now().saturating_sub(start);

        match result {
            Ok(val) => {
                self.record(false, duration, Some(grant.episode));
                Ok(val)
            }
            Err(e) => {
                if self.counts_as_failure(&e, duration) {
                    self.record(true, duration, Some(grant.episode));
                } else {
                    self.ignore(duration, grant.episode);
                }

                match fallback {
                    Some(fallback) => {
                        let ctx = self.fallback_context(self.current_state(), FallbackReason::Failed(e));
                        fallback(ctx).map_err(CircuitError::Execution)
                    }
                    None => Err(CircuitError::Execution(e)),
                }
            }
        }
    }

    fn counts_as_failure<E: 'static>(&self, error: &E, duration: Duration) -> bool {
        match &self.failure_classifier {
            Some(classifier) => classifier.should_record(&crate::classifier::FailureContext {
                circuit_name: &self.name,
                error: error as &dyn std::any::Any,
                duration,
            }),
            None => true,
        }
    }

    /// Drop an ignored error: nothing recorded, a probe permit from the
    /// current episode goes back
    fn ignore(&self, duration: Duration, admitted: u64) {
        self.transact(|core, events| {
            core.release(Some(admitted));
            events.push(Event::CallIgnored { duration });
        });
    }

    fn fallback_context<E>(&self, state: State, reason: FallbackReason<E>) -> FallbackContext<E> {
        FallbackContext {
            circuit_name: self.name.clone(),
            state,
            reason,
        }
    }

    /// Current state; never triggers a transition
    pub fn current_state(&self) -> State {
        self.inspect(Core::state)
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.current_state() == State::Open
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.current_state() == State::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.current_state() == State::HalfOpen
    }

    /// Consistent read-only copy of state and window counters
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inspect(|core| MetricsSnapshot::new(core.state(), core.context.metrics.counts()))
    }

    /// The sliding window backing this breaker
    pub fn metrics(&self) -> &SlidingWindowMetrics {
        &self.metrics
    }

    /// Configuration currently in force
    pub fn config(&self) -> Arc<Config> {
        self.inspect(|core| core.context.config.clone())
    }

    /// When the current Open episode began, if Open
    pub fn opened_at(&self) -> Option<Duration> {
        self.inspect(|core| core.machine.open_data().map(|d| d.opened_at))
    }

    /// Probes still available in the current HalfOpen episode
    pub fn half_open_permits_remaining(&self) -> Option<usize> {
        self.inspect(|core| core.machine.half_open_data().map(|d| d.permits_remaining))
    }

    /// Clear all counters and force Closed; returns the previous state
    ///
    /// Emits a transition to Closed even when already Closed.
    pub fn reset(&self) -> State {
        self.transact(|core, events| core.reset(events))
    }

    /// Open immediately, bypassing rate evaluation
    ///
    /// The usual wait applies from now on. Already Open: restarts the wait.
    pub fn force_open(&self) {
        self.transact(|core, events| core.force_open(events));
    }

    /// Start a probe episode immediately with a full budget
    pub fn force_half_open(&self) {
        self.transact(|core, events| core.force_half_open(events));
    }

    /// Swap in a new configuration and reset to Closed
    ///
    /// An invalid configuration is rejected and leaves the breaker untouched.
    pub fn reconfigure(&self, config: Config) -> Result<State, ConfigError> {
        config.validate()?;
        Ok(self.transact(|core, events| {
            core.context.config = Arc::new(config);
            core.reset(events)
        }))
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&str, &Event) -> Result<(), crate::errors::SubscriberError> + Send + Sync + 'static,
    {
        self.publisher.subscribe(f)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.publisher.unsubscribe(id)
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.current_state())
            .field("metrics", &self.metrics.counts())
            .field("publisher", &self.publisher)
            .finish()
    }
}
