use super::breaker::{Bindings, Circuit};
use super::evaluator::StoreFailurePolicy;
use super::types::{CircuitConfig, CircuitSettings, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, SystemConfig};
use crate::error::{BreakerError, Result};
use crate::metrics_store::MetricsStore;
use crate::notify::{Notifier, TracingNotifier};
use crate::recovery::{LocalLock, RecoveryCoordinator, RecoveryLock, RedisLock};
use crate::store::{MemoryStore, RedisStore, Store};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Composition root owning the shared infrastructure of a set of circuits
///
/// A name is bound to exactly one normalized configuration for the lifetime of
/// the system. Clones share the same circuits.
#[derive(Debug, Clone)]
pub struct BreakerSystem {
    name: String,
    defaults: CircuitConfig,
    bindings: Bindings,
    circuits: Arc<DashMap<String, Arc<Circuit>>>,
}

impl BreakerSystem {
    /// Create a system with in-memory state and default settings
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> BreakerSystemBuilder {
        BreakerSystemBuilder::new(name)
    }

    /// Build a system from a loaded configuration, registering its circuits
    pub async fn from_config(config: &SystemConfig) -> Result<Self> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let builder = Self::builder(config.name.clone())
            .defaults(config.defaults.clone())
            .failure_policy(config.store_failure_policy)
            .clock(clock.clone());

        let builder = match &config.backend {
            BackendConfig::Memory => builder
                .store(Arc::new(MemoryStore::new()))
                .lock(Arc::new(LocalLock::new(clock))),
            BackendConfig::Redis { url, prefix } => {
                let client = redis::Client::open(url.as_str())?;
                let connection = ConnectionManager::new(client).await?;
                info!(url = %url, prefix = %prefix, "Connected to Redis backend");
                builder
                    .store(Arc::new(RedisStore::with_connection(
                        connection.clone(),
                        prefix.clone(),
                    )))
                    .lock(Arc::new(RedisLock::with_connection(
                        connection,
                        prefix.clone(),
                    )))
            }
        };

        let system = builder.build()?;
        for circuit in &config.circuits {
            system.get_or_create(&circuit.name, &circuit.settings)?;
        }

        info!(
            system = %system.name,
            circuits = config.circuits.len(),
            "Breaker system ready"
        );
        Ok(system)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &CircuitConfig {
        &self.defaults
    }

    /// Look up `name`, creating it on first use
    ///
    /// Empty settings accept whatever configuration the name already has.
    /// Settings that differ from the cached configuration after normalization
    /// fail with [`BreakerError::ConfigurationConflict`].
    pub fn get_or_create(&self, name: &str, settings: &CircuitSettings) -> Result<Arc<Circuit>> {
        let requested = settings.normalize(&self.defaults);
        requested.validate()?;

        // The entry holds the shard lock across check-and-create
        match self.circuits.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if settings.is_empty() || *existing.config() == requested {
                    return Ok(existing.clone());
                }
                warn!(
                    circuit = name,
                    existing = %existing.config().canonical(),
                    requested = %requested.canonical(),
                    "Conflicting circuit configuration"
                );
                Err(BreakerError::ConfigurationConflict {
                    name: name.to_string(),
                    existing: existing.config().canonical(),
                    requested: requested.canonical(),
                })
            }
            Entry::Vacant(entry) => {
                debug!(system = %self.name, circuit = name, "Registering circuit");
                let circuit = Arc::new(Circuit::new(
                    name.to_string(),
                    requested,
                    self.bindings.clone(),
                ));
                entry.insert(circuit.clone());
                Ok(circuit)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Circuit>> {
        self.circuits.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all registered circuits, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current state of every registered circuit, sorted by name
    pub async fn states(&self) -> Vec<(String, CircuitState)> {
        let mut circuits: Vec<Arc<Circuit>> =
            self.circuits.iter().map(|e| e.value().clone()).collect();
        circuits.sort_by(|a, b| a.name().cmp(b.name()));

        let mut results = Vec::with_capacity(circuits.len());
        for circuit in circuits {
            let state = circuit.current_state().await;
            results.push((circuit.name().to_string(), state));
        }
        results
    }
}

/// Builder for [`BreakerSystem`]
///
/// Unset parts default to an in-memory store, an in-process lock, the system
/// clock and a [`TracingNotifier`].
#[derive(Debug)]
pub struct BreakerSystemBuilder {
    name: String,
    defaults: CircuitConfig,
    store: Option<Arc<dyn Store>>,
    lock: Option<Arc<dyn RecoveryLock>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    failure_policy: StoreFailurePolicy,
}

impl BreakerSystemBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: CircuitConfig::default(),
            store: None,
            lock: None,
            notifier: None,
            clock: None,
            failure_policy: StoreFailurePolicy::default(),
        }
    }

    pub fn defaults(mut self, defaults: CircuitConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn RecoveryLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn build(self) -> Result<BreakerSystem> {
        self.defaults.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(LocalLock::new(clock.clone())) as Arc<dyn RecoveryLock>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);

        info!(
            system = %self.name,
            threshold = self.defaults.threshold,
            window_secs = self.defaults.window_secs,
            failure_policy = ?self.failure_policy,
            "Creating breaker system"
        );

        Ok(BreakerSystem {
            name: self.name,
            defaults: self.defaults,
            bindings: Bindings {
                metrics: MetricsStore::new(store),
                coordinator: RecoveryCoordinator::new(lock, notifier.clone()),
                notifier,
                clock,
                failure_policy: self.failure_policy,
            },
            circuits: Arc::new(DashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_settings_same_handle() {
        let system = BreakerSystem::new("test").unwrap();
        let settings = CircuitSettings::new().threshold(3);

        let a = system.get_or_create("api", &settings).unwrap();
        let b = system.get_or_create("api", &settings).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_empty_settings_accept_existing() {
        let system = BreakerSystem::new("test").unwrap();
        let configured = system
            .get_or_create("api", &CircuitSettings::new().threshold(3))
            .unwrap();
        let looked_up = system.get_or_create("api", &CircuitSettings::new()).unwrap();
        assert!(Arc::ptr_eq(&configured, &looked_up));
        assert_eq!(looked_up.config().threshold, 3);
    }

    #[test]
    fn test_explicit_defaults_match_unset_fields() {
        let system = BreakerSystem::new("test").unwrap();
        let a = system
            .get_or_create("api", &CircuitSettings::new().threshold(5))
            .unwrap();
        let b = system
            .get_or_create("api", &CircuitSettings::from(CircuitConfig::default()))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_conflict_names_both_configs() {
        let system = BreakerSystem::new("test").unwrap();
        system
            .get_or_create("api", &CircuitSettings::new().threshold(5))
            .unwrap();

        match system.get_or_create("api", &CircuitSettings::new().threshold(10)) {
            Err(BreakerError::ConfigurationConflict {
                name,
                existing,
                requested,
            }) => {
                assert_eq!(name, "api");
                assert!(existing.contains("\"threshold\":5"));
                assert!(requested.contains("\"threshold\":10"));
            }
            other => panic!("expected conflict, got {:?}", other.map(|c| c.name().to_string())),
        }
    }

    #[test]
    fn test_invalid_settings_are_not_cached() {
        let system = BreakerSystem::new("test").unwrap();
        let result = system.get_or_create("api", &CircuitSettings::new().threshold(0));
        assert!(matches!(result, Err(BreakerError::Config(_))));
        assert!(system.get("api").is_none());
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let result = BreakerSystem::builder("test")
            .defaults(CircuitConfig {
                window_secs: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_states_lists_all_circuits() {
        let system = BreakerSystem::new("test").unwrap();
        system.get_or_create("b", &CircuitSettings::new()).unwrap();
        system.get_or_create("a", &CircuitSettings::new()).unwrap();

        assert_eq!(system.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            system.states().await,
            vec![
                ("a".to_string(), CircuitState::Green),
                ("b".to_string(), CircuitState::Green),
            ]
        );
    }

    #[tokio::test]
    async fn test_from_config_registers_circuits() {
        let config = SystemConfig::from_yaml(
            r#"
name: checkout
defaults:
  threshold: 4
circuits:
  - name: payments
    settings:
      threshold: 2
  - name: inventory
"#,
        )
        .unwrap();

        let system = BreakerSystem::from_config(&config).await.unwrap();
        assert_eq!(system.name(), "checkout");
        assert_eq!(system.get("payments").unwrap().config().threshold, 2);
        assert_eq!(system.get("inventory").unwrap().config().threshold, 4);
    }
}
