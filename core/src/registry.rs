//! Named circuit breakers sharing a default configuration
//!
//! The registry creates a breaker the first time a name is looked up and
//! hands out the same `Arc` for that name afterwards. Per-name overrides
//! replace the default configuration for a single circuit.

use crate::{
    circuit::{CircuitBreaker, State},
    clock::{Clock, MonotonicClock},
    config::Config,
    errors::{ConfigError, SubscriberError},
    events::{Event, EventPublisher, Subscriber},
};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Outcome of resetting one circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub name: String,
    pub previous: State,
    pub current: State,
}

/// Get-or-create store of circuit breakers keyed by name
pub struct Registry {
    default_config: Config,
    overrides: DashMap<String, Config>,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Registry {
    /// Registry whose breakers use `default_config` unless overridden
    pub fn new(default_config: Config) -> Result<Self, ConfigError> {
        default_config.validate()?;
        Ok(Self {
            default_config,
            overrides: DashMap::new(),
            circuits: DashMap::new(),
            clock: Arc::new(MonotonicClock::new()),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Share `clock` with every breaker created from now on
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_config(&self) -> &Config {
        &self.default_config
    }

    /// Configuration a breaker named `name` gets (or got) at creation
    pub fn config_for(&self, name: &str) -> Config {
        self.overrides
            .get(name)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Override the configuration for one name
    ///
    /// An existing breaker is reconfigured on the spot, which resets it.
    pub fn configure(&self, name: &str, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.overrides.insert(name.to_string(), config.clone());

        let existing = self.circuits.get(name).map(|c| c.value().clone());
        if let Some(circuit) = existing {
            circuit.reconfigure(config)?;
        }
        Ok(())
    }

    /// The breaker for `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(circuit) = self.circuits.get(name) {
            return circuit.value().clone();
        }

        self.circuits
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(self.create(name)))
            .value()
            .clone()
    }

    fn create(&self, name: &str) -> CircuitBreaker {
        let publisher = EventPublisher::new();
        for subscriber in self.subscribers.read().iter() {
            publisher.subscribe_arc(subscriber.clone());
        }

        tracing::debug!(circuit = name, "creating circuit breaker");
        CircuitBreaker::assemble(
            name.to_string(),
            self.config_for(name),
            self.clock.clone(),
            None,
            publisher,
        )
    }

    /// Subscribe to every breaker, existing and future
    pub fn subscribe_all<F>(&self, f: F)
    where
        F: Fn(&str, &Event) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(f);
        self.subscribers.write().push(subscriber.clone());

        // A breaker created concurrently may already carry it
        for circuit in self.circuits.iter() {
            circuit.publisher().subscribe_if_absent(subscriber.clone());
        }
    }

    /// Snapshot of every breaker, ordered by name
    pub fn get_all(&self) -> BTreeMap<String, Arc<CircuitBreaker>> {
        self.circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.get_all().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    /// Forget a breaker; the next `get` creates a fresh one
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.remove(name).map(|(_, circuit)| circuit)
    }

    /// Reset every breaker, reporting old and new state per name
    pub fn reset_all(&self) -> Vec<ResetReport> {
        self.get_all()
            .into_iter()
            .map(|(name, circuit)| {
                let previous = circuit.reset();
                ResetReport {
                    current: circuit.current_state(),
                    name,
                    previous,
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("default_config", &self.default_config)
            .field("circuits", &self.names())
            .finish()
    }
}
