//! Registry for managing named circuit breakers.
//!
//! Every circuit-breaker-enabled call-site registers its breaker here exactly once, under the
//! declared name or a generated unique one, when its pipeline is first built. Operational tooling
//! then queries and forces breaker state by name, independent of the invocation path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::ConfigError;
use tracing::warn;

/// Errors from breaker maintenance operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker was not found.
    #[error("circuit breaker '{name}' not found")]
    NotFound {
        /// Name that could not be located.
        name: String,
    },
}

/// Process-scoped maintenance registry. Clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerMaintenance {
    inner: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerMaintenance {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a breaker under `name`. A name can only be registered once.
    pub fn register(&self, name: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Result<(), ConfigError> {
        let name = name.into();
        let mut map = self.write();
        if map.contains_key(&name) {
            warn!(breaker = %name, "circuit breaker name already registered; registration rejected");
            return Err(ConfigError::DuplicateCircuitBreakerName(name));
        }
        map.insert(name, breaker);
        Ok(())
    }

    /// Name a breaker being built will register under: the declared one if still free,
    /// otherwise a generated unique one.
    pub(crate) fn prepare(&self, declared: Option<&str>) -> Result<String, ConfigError> {
        match declared {
            Some(name) if self.read().contains_key(name) => {
                warn!(breaker = %name, "circuit breaker name already registered; registration rejected");
                Err(ConfigError::DuplicateCircuitBreakerName(name.to_string()))
            }
            Some(name) => Ok(name.to_string()),
            None => Ok(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Look up a breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.read().get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Arc<CircuitBreaker>, CircuitBreakerRegistryError> {
        self.get(name).ok_or_else(|| CircuitBreakerRegistryError::NotFound { name: name.to_string() })
    }

    /// Current state of a breaker.
    pub fn state(&self, name: &str) -> Result<CircuitState, CircuitBreakerRegistryError> {
        Ok(self.require(name)?.state())
    }

    /// Close a breaker and clear its window.
    pub fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        self.require(name)?.reset();
        Ok(())
    }

    /// Reset every registered breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn force_open(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        self.require(name)?.force_open();
        Ok(())
    }

    pub fn force_closed(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        self.require(name)?.force_closed();
        Ok(())
    }

    /// Observe state transitions of a breaker.
    pub fn on_state_change<F>(&self, name: &str, listener: F) -> Result<(), CircuitBreakerRegistryError>
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.require(name)?.on_state_change(listener);
        Ok(())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot breaker states sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.read();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// A breaker registration that becomes visible only once its pipeline built successfully.
#[must_use = "a pending registration does nothing until committed"]
pub(crate) struct PendingRegistration {
    registry: CircuitBreakerMaintenance,
    name: String,
    breaker: Arc<CircuitBreaker>,
}

impl PendingRegistration {
    pub(crate) fn new(registry: CircuitBreakerMaintenance, name: String, breaker: Arc<CircuitBreaker>) -> Self {
        Self { registry, name, breaker }
    }

    pub(crate) fn commit(self) -> Result<(), ConfigError> {
        self.registry.register(self.name, self.breaker)
    }
}
