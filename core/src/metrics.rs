//! Count-based sliding window of call outcomes
//!
//! The window keeps the last `capacity` outcomes in a ring and maintains
//! running counters alongside it, so recording and rate queries are O(1).
//! Rejected calls are counted separately and never take a slot.

use crate::circuit::State;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Rate value reported while fewer than the minimum number of calls are buffered
pub const RATE_NOT_EVALUATED: f32 = -1.0;

/// Classification of one completed call
///
/// Slowness is orthogonal to success: a slow success still counts toward the
/// slow call rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl CallOutcome {
    /// Classify a call by result and elapsed time; slow means strictly over `slow_threshold`
    pub fn classify(failed: bool, duration: Duration, slow_threshold: Duration) -> Self {
        match (failed, duration > slow_threshold) {
            (false, false) => CallOutcome::Success,
            (true, false) => CallOutcome::Failure,
            (false, true) => CallOutcome::SlowSuccess,
            (true, true) => CallOutcome::SlowFailure,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, CallOutcome::Failure | CallOutcome::SlowFailure)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, CallOutcome::SlowSuccess | CallOutcome::SlowFailure)
    }
}

/// A buffered outcome with its elapsed time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedCall {
    pub outcome: CallOutcome,
    pub duration: Duration,
}

/// Counters read together under one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowCounts {
    pub buffered: usize,
    pub failed: usize,
    pub slow: usize,
    pub slow_failed: usize,
    pub not_permitted: u64,
    pub minimum_calls: usize,
}

impl WindowCounts {
    pub fn succeeded(&self) -> usize {
        self.buffered - self.failed
    }

    /// `100 * failed / buffered`, or [`RATE_NOT_EVALUATED`] below the minimum
    pub fn failure_rate_percent(&self) -> f32 {
        self.rate_of(self.failed)
    }

    /// `100 * slow / buffered`, or [`RATE_NOT_EVALUATED`] below the minimum
    pub fn slow_call_rate_percent(&self) -> f32 {
        self.rate_of(self.slow)
    }

    /// True when either evaluated rate is at or above its threshold
    pub fn exceeds(&self, failure_threshold: f32, slow_threshold: f32) -> bool {
        let failure_rate = self.failure_rate_percent();
        let slow_rate = self.slow_call_rate_percent();

        (failure_rate != RATE_NOT_EVALUATED && failure_rate >= failure_threshold)
            || (slow_rate != RATE_NOT_EVALUATED && slow_rate >= slow_threshold)
    }

    fn rate_of(&self, count: usize) -> f32 {
        if self.buffered == 0 || self.buffered < self.minimum_calls {
            return RATE_NOT_EVALUATED;
        }
        count as f32 * 100.0 / self.buffered as f32
    }
}

#[derive(Debug)]
struct Window {
    calls: VecDeque<RecordedCall>,
    capacity: usize,
    counts: WindowCounts,
}

impl Window {
    fn new(capacity: usize, minimum_calls: usize) -> Self {
        Self {
            calls: VecDeque::with_capacity(capacity),
            capacity,
            counts: WindowCounts {
                minimum_calls,
                ..Default::default()
            },
        }
    }

    fn push(&mut self, call: RecordedCall) {
        if self.calls.len() == self.capacity
            && let Some(evicted) = self.calls.pop_front()
        {
            self.adjust(evicted.outcome, false);
        }
        self.calls.push_back(call);
        self.adjust(call.outcome, true);
    }

    fn adjust(&mut self, outcome: CallOutcome, add: bool) {
        let step = |n: &mut usize| {
            if add {
                *n += 1
            } else {
                *n -= 1
            }
        };

        step(&mut self.counts.buffered);
        if outcome.is_failure() {
            step(&mut self.counts.failed);
        }
        if outcome.is_slow() {
            step(&mut self.counts.slow);
        }
        if outcome == CallOutcome::SlowFailure {
            step(&mut self.counts.slow_failed);
        }
    }
}

/// Thread-safe ring buffer of recent call outcomes
#[derive(Debug)]
pub struct SlidingWindowMetrics {
    window: Mutex<Window>,
}

impl SlidingWindowMetrics {
    /// Window of `capacity` slots that starts evaluating rates at `minimum_calls`
    pub fn new(capacity: usize, minimum_calls: usize) -> Self {
        Self {
            window: Mutex::new(Window::new(capacity.max(1), minimum_calls)),
        }
    }

    /// Append an outcome, evicting the oldest when full; returns the new counts
    pub fn record(&self, outcome: CallOutcome, duration: Duration) -> WindowCounts {
        let mut window = self.window.lock();
        window.push(RecordedCall { outcome, duration });
        window.counts
    }

    /// Count a rejected call without touching the ring
    pub fn record_not_permitted(&self) -> WindowCounts {
        let mut window = self.window.lock();
        window.counts.not_permitted += 1;
        window.counts
    }

    pub fn failure_rate_percent(&self) -> f32 {
        self.counts().failure_rate_percent()
    }

    pub fn slow_call_rate_percent(&self) -> f32 {
        self.counts().slow_call_rate_percent()
    }

    /// Consistent copy of every counter
    pub fn counts(&self) -> WindowCounts {
        self.window.lock().counts
    }

    /// Maximum number of buffered calls
    pub fn capacity(&self) -> usize {
        self.window.lock().capacity
    }

    /// Clear the ring and all counters, keeping capacity and minimum
    pub fn reset(&self) {
        let mut window = self.window.lock();
        let (capacity, minimum) = (window.capacity, window.counts.minimum_calls);
        *window = Window::new(capacity, minimum);
    }

    /// Clear everything and resize the window
    ///
    /// HalfOpen episodes use a window sized to the probe budget.
    pub fn reset_to(&self, capacity: usize, minimum_calls: usize) {
        *self.window.lock() = Window::new(capacity.max(1), minimum_calls);
    }

    /// Most recent buffered calls, oldest first
    pub fn recent(&self, limit: usize) -> Vec<RecordedCall> {
        let window = self.window.lock();
        let start = window.calls.len().saturating_sub(limit);
        window.calls.iter().skip(start).copied().collect()
    }
}

/// Read-only view of a breaker's state and window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub state: State,
    pub failure_rate_percent: f32,
    pub slow_call_rate_percent: f32,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub slow_failed_calls: usize,
    pub succeeded_calls: usize,
    pub not_permitted_calls: u64,
}

impl MetricsSnapshot {
    pub(crate) fn new(state: State, counts: WindowCounts) -> Self {
        Self {
            state,
            failure_rate_percent: counts.failure_rate_percent(),
            slow_call_rate_percent: counts.slow_call_rate_percent(),
            buffered_calls: counts.buffered,
            failed_calls: counts.failed,
            slow_calls: counts.slow,
            slow_failed_calls: counts.slow_failed,
            succeeded_calls: counts.succeeded(),
            not_permitted_calls: counts.not_permitted,
        }
    }
}
