use super::service::BreakerSystem;
use crate::error::Result;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

type Factory = Box<dyn Fn() -> Result<BreakerSystem> + Send + Sync>;

/// Swappable holder for an application's breaker system
///
/// The system is built by the factory on first [`Registry::get`]. Tests pass
/// their own registry (or [`Registry::install`] an isolated system) instead of
/// reaching for shared process state. [`Registry::teardown`] drops the current
/// system; the next `get` builds a fresh one.
pub struct Registry {
    factory: Factory,
    current: RwLock<Option<Arc<BreakerSystem>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Registry {
    /// Create a registry that builds its system with `factory`
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<BreakerSystem> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            current: RwLock::new(None),
        }
    }

    /// Registry whose system uses in-memory state and default settings
    pub fn in_memory(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move || BreakerSystem::new(name.clone()))
    }

    /// The current system, built on first use
    pub fn get(&self) -> Result<Arc<BreakerSystem>> {
        if let Some(system) = self.read().as_ref() {
            return Ok(system.clone());
        }

        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(system) = current.as_ref() {
            return Ok(system.clone());
        }
        let system = Arc::new((self.factory)()?);
        debug!(system = %system.name(), "Registry initialized");
        *current = Some(system.clone());
        Ok(system)
    }

    /// Replace the current system, returning the previous one
    pub fn install(&self, system: BreakerSystem) -> Option<Arc<BreakerSystem>> {
        info!(system = %system.name(), "Installing breaker system");
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.replace(Arc::new(system))
    }

    /// Drop the current system, returning it if one was built
    pub fn teardown(&self) -> Option<Arc<BreakerSystem>> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(system) = &previous {
            info!(system = %system.name(), "Breaker system torn down");
        }
        previous
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<BreakerSystem>>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::types::CircuitSettings;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_lazy_initialization() {
        let builds = Arc::new(AtomicU32::new(0));
        let counter = builds.clone();
        let registry = Registry::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            BreakerSystem::new("lazy")
        });

        assert!(!registry.is_initialized());
        let a = registry.get().unwrap();
        let b = registry.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_builds_fresh_system() {
        let registry = Registry::in_memory("test");
        let first = registry.get().unwrap();
        first
            .get_or_create("api", &CircuitSettings::new().threshold(2))
            .unwrap();

        assert!(registry.teardown().is_some());
        assert!(!registry.is_initialized());

        let second = registry.get().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.get("api").is_none());
    }

    #[test]
    fn test_install_replaces_system() {
        let registry = Registry::in_memory("default");
        registry.get().unwrap();

        let previous = registry.install(BreakerSystem::new("injected").unwrap());
        assert_eq!(previous.unwrap().name(), "default");
        assert_eq!(registry.get().unwrap().name(), "injected");
    }
}
