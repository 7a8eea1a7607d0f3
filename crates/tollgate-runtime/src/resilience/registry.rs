//! Named breakers, one per external dependency.
//!
//! The registry is an explicit value owned by whoever wires the system
//! together. Breakers are created lazily from per-name configuration and
//! shared through `Arc`, so every caller of a dependency sees the same state.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// Registry of circuit breakers keyed by dependency name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: BTreeMap<String, CircuitBreakerConfig>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `defaults` unless overridden.
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Configure a specific dependency.
    pub fn with_config(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Configuration a breaker named `name` would be created with.
    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Add an already-built breaker, replacing any with the same name.
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        self.breakers
            .write()
            .insert(breaker.name().to_string(), breaker);
    }

    /// Look up an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Get the breaker for `name`, creating one that counts every error.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_insert_with(name, |config| CircuitBreaker::new(name, config))
    }

    /// Get the breaker for `name`, building it with `build` on first use.
    pub fn get_or_insert_with<F>(&self, name: &str, build: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce(CircuitBreakerConfig) -> CircuitBreaker,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(build(self.config_for(name)))),
        )
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
