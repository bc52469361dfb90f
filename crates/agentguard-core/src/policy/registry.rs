//! Named store of circuit breakers.
//!
//! Every call site addressing the same dependency name gets a handle onto
//! the same breaker. Build one registry at service start and pass it
//! around; tests build a fresh one each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{default_clock, Clock};
use crate::policy::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

/// Called with `(name, old, new)` whenever a registry-created breaker
/// changes state.
pub type RegistryObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Lazily populated map from dependency name to breaker.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    clock: Arc<dyn Clock>,
    observer: Option<RegistryObserver>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock: default_clock(),
            observer: None,
        }
    }

    /// Time source handed to every breaker this registry creates.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observer attached to every breaker this registry creates.
    pub fn with_observer(mut self, observer: RegistryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Return the breaker for `name`, creating it on first use.
    ///
    /// `config` only matters on creation; later calls get the existing
    /// breaker whatever config they pass.
    pub fn get(&self, name: &str, config: Option<CircuitBreakerConfig>) -> CircuitBreaker {
        let mut breakers = self.lock();
        if let Some(existing) = breakers.get(name) {
            if let Some(config) = &config {
                if config != existing.config() {
                    tracing::debug!(
                        breaker = name,
                        "breaker already registered; ignoring differing config"
                    );
                }
            }
            return existing.clone();
        }

        let breaker = self.build(name, config.unwrap_or_default());
        breakers.insert(name.to_string(), breaker.clone());
        tracing::debug!(breaker = name, "registered circuit breaker");
        breaker
    }

    /// The breaker registered under `name`, if any. Never creates one.
    pub fn peek(&self, name: &str) -> Option<CircuitBreaker> {
        self.lock().get(name).cloned()
    }

    /// Snapshot of every registered breaker.
    pub fn get_all(&self) -> HashMap<String, CircuitBreaker> {
        self.lock().clone()
    }

    /// Forget `name`. Handles already given out keep working but are no
    /// longer shared with future `get` calls.
    pub fn remove(&self, name: &str) -> Option<CircuitBreaker> {
        self.lock().remove(name)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn build(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(name, config).with_clock(self.clock.clone());
        match &self.observer {
            Some(observer) => {
                let observer = observer.clone();
                let name = name.to_string();
                breaker.with_observer(Arc::new(move |from: CircuitState, to: CircuitState| {
                    observer(&name, from, to)
                }))
            }
            None => breaker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }

    #[test]
    fn same_name_same_instance() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get("x", None);
        let b = registry.get("x", None);
        assert!(a.ptr_eq(&b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_config_wins() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get("x", Some(config(2)));
        let second = registry.get("x", Some(config(9)));
        assert_eq!(second.config().failure_threshold, 2);
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn missing_config_uses_defaults() {
        let registry = CircuitBreakerRegistry::new();
        let b = registry.get("x", None);
        assert_eq!(b.config(), &CircuitBreakerConfig::default());
        assert_eq!(b.name(), "x");
    }

    #[test]
    fn different_names_are_independent() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get("x", None);
        let b = registry.get("y", None);
        assert!(!a.ptr_eq(&b));
        a.force_state(CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn peek_does_not_register() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.peek("x").is_none());
        assert!(registry.is_empty());

        let a = registry.get("x", None);
        let peeked = registry.peek("x").expect("x was registered");
        assert!(peeked.ptr_eq(&a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get("x", None);
        registry.get("y", None);
        assert_eq!(registry.get_all().len(), 2);

        let removed = registry.remove("x").expect("x was registered");
        assert!(removed.ptr_eq(&a));
        assert!(registry.remove("x").is_none());

        let fresh = registry.get("x", None);
        assert!(!fresh.ptr_eq(&a));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn observer_receives_breaker_name() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let registry = CircuitBreakerRegistry::new().with_observer(Arc::new(
            move |name: &str, from: CircuitState, to: CircuitState| {
                sink.lock().unwrap().push((name.to_string(), from, to));
            },
        ));

        registry.get("svc", None).force_state(CircuitState::Open);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("svc".to_string(), CircuitState::Closed, CircuitState::Open)]
        );
    }
}
