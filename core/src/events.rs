//! Event delivery for circuit breaker activity
//!
//! Subscribers run synchronously, in registration order, on the thread that
//! caused the event. A subscriber that returns an error or panics is reported
//! through `tracing` and skipped; the remaining subscribers still run.

use crate::circuit::State;
use crate::errors::SubscriberError;
use crate::metrics::CallOutcome;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Something that happened on a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// State changed; `at` is the breaker clock's reading
    StateTransition { from: State, to: State, at: Duration },
    /// An outcome entered the sliding window
    CallRecorded {
        outcome: CallOutcome,
        duration: Duration,
    },
    /// A permission request was denied
    CallRejected { state: State, at: Duration },
    /// An error the failure classifier chose not to count
    CallIgnored { duration: Duration },
}

impl Event {
    /// `(from, to)` for transition events
    pub fn transition(&self) -> Option<(State, State)> {
        match *self {
            Event::StateTransition { from, to, .. } => Some((from, to)),
            _ => None,
        }
    }
}

/// Handle returned by [`EventPublisher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Subscriber callback: receives the circuit name and the event
pub type Subscriber = Arc<dyn Fn(&str, &Event) -> Result<(), SubscriberError> + Send + Sync>;

/// Ordered set of subscribers for one circuit
#[derive(Default)]
pub struct EventPublisher {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriberId
    where
        F: Fn(&str, &Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(f))
    }

    pub fn subscribe_arc(&self, subscriber: Subscriber) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    /// Register `subscriber` unless this exact callback is already present
    pub fn subscribe_if_absent(&self, subscriber: Subscriber) -> Option<SubscriberId> {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|(_, s)| Arc::ptr_eq(s, &subscriber)) {
            return None;
        }
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscribers.push((id, subscriber));
        Some(id)
    }

    /// Remove a subscriber; false if it was not registered
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver `event` to every subscriber, returning the failures
    ///
    /// The subscriber list is copied before dispatch, so a subscriber may
    /// subscribe or unsubscribe from inside its callback.
    pub fn publish(&self, circuit: &str, event: &Event) -> Vec<SubscriberError> {
        let subscribers = self.subscribers.read().clone();
        let mut failures = Vec::new();

        for (id, subscriber) in subscribers {
            let message = match catch_unwind(AssertUnwindSafe(|| subscriber(circuit, event))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.message,
                Err(payload) => panic_message(payload.as_ref()),
            };

            let failure = SubscriberError {
                circuit: circuit.to_string(),
                subscriber: id.0,
                message,
            };
            tracing::warn!(
                circuit,
                subscriber = %id,
                ?event,
                error = %failure.message,
                "circuit breaker subscriber failed"
            );
            failures.push(failure);
        }

        failures
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Subscriber that only fires when the circuit enters `target`
pub(crate) fn on_enter<F>(target: State, f: F) -> Subscriber
where
    F: Fn(&str) + Send + Sync + 'static,
{
    Arc::new(move |circuit: &str, event: &Event| -> Result<(), SubscriberError> {
        if let Some((_, to)) = event.transition()
            && to == target
        {
            f(circuit);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn transition(from: State, to: State) -> Event {
        Event::StateTransition {
            from,
            to,
            at: Duration::ZERO,
        }
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let publisher = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            publisher.subscribe(move |_circuit, _event| {
                seen.lock().push(tag);
                Ok(())
            });
        }

        let failures = publisher.publish("test", &transition(State::Closed, State::Open));

        assert!(failures.is_empty());
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_stop_delivery() {
        let publisher = EventPublisher::new();
        let delivered = Arc::new(Mutex::new(0));

        publisher.subscribe(|_circuit, _event| Err(SubscriberError::msg("sink offline")));
        publisher.subscribe(|_circuit, _event| panic!("subscriber bug"));
        let delivered_clone = delivered.clone();
        publisher.subscribe(move |_circuit, _event| {
            *delivered_clone.lock() += 1;
            Ok(())
        });

        let failures = publisher.publish("test", &transition(State::Closed, State::Open));

        assert_eq!(*delivered.lock(), 1);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].message, "sink offline");
        assert_eq!(failures[0].circuit, "test");
        assert!(failures[1].message.contains("subscriber bug"));
    }

    #[test]
    fn test_subscribe_if_absent_dedupes() {
        let publisher = EventPublisher::new();
        let subscriber: Subscriber = Arc::new(|_circuit: &str, _event: &Event| -> Result<(), SubscriberError> { Ok(()) });

        assert!(publisher.subscribe_if_absent(subscriber.clone()).is_some());
        assert!(publisher.subscribe_if_absent(subscriber).is_none());
        assert_eq!(publisher.len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let publisher = EventPublisher::new();
        let id = publisher.subscribe(|_circuit, _event| Ok(()));
        publisher.subscribe(|_circuit, _event| Ok(()));
        assert_eq!(publisher.len(), 2);

        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        assert_eq!(publisher.len(), 1);
    }

    #[test]
    fn test_on_enter_filters_transitions() {
        let publisher = EventPublisher::new();
        let opened = Arc::new(Mutex::new(Vec::new()));
        let opened_clone = opened.clone();

        publisher.subscribe_arc(on_enter(State::Open, move |name| {
            opened_clone.lock().push(name.to_string());
        }));

        publisher.publish("api", &transition(State::Open, State::HalfOpen));
        publisher.publish(
            "api",
            &Event::CallRejected {
                state: State::Open,
                at: Duration::ZERO,
            },
        );
        publisher.publish("api", &transition(State::HalfOpen, State::Open));

        assert_eq!(*opened.lock(), vec!["api".to_string()]);
    }
}
