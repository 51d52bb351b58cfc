//! Recovery probe coordination
//!
//! While a circuit is open, at most one caller per name may run the protected
//! operation as a probe. The slot is a TTL-bound lease from a [`RecoveryLock`]:
//!
//! - [`LocalLock`]: in-process leases, judged by the injected clock
//! - [`RedisLock`]: `SET NX PX` leases shared across processes
//!
//! Acquisition never waits. A caller that does not get the lease is told so
//! immediately and takes the fallback path.

pub mod local;
pub mod redis;

pub use self::local::LocalLock;
pub use self::redis::RedisLock;

use crate::error::Result;
use crate::notify::Notifier;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of holding a recovery lease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lease-lock contract
///
/// `acquire` must not wait for a holder, and a lease that is never released
/// must expire after `ttl`.
#[async_trait]
pub trait RecoveryLock: Send + Sync + std::fmt::Debug {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release a lease; `false` if `token` no longer holds it
    async fn release(&self, name: &str, token: &LockToken) -> Result<bool>;
}

/// Hands out probe slots
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    lock: Arc<dyn RecoveryLock>,
    notifier: Arc<dyn Notifier>,
}

impl RecoveryCoordinator {
    pub fn new(lock: Arc<dyn RecoveryLock>, notifier: Arc<dyn Notifier>) -> Self {
        Self { lock, notifier }
    }

    /// Try to take the probe slot for `name`
    ///
    /// Lock backend errors are reported to the notifier and count as a denial.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Option<ProbeGuard> {
        match self.lock.acquire(name, ttl).await {
            Ok(Some(token)) => {
                debug!(circuit = name, ttl = ?ttl, "Probe slot granted");
                Some(ProbeGuard {
                    lock: self.lock.clone(),
                    notifier: self.notifier.clone(),
                    name: name.to_string(),
                    token: Some(token),
                })
            }
            Ok(None) => {
                debug!(circuit = name, "Probe slot held elsewhere");
                None
            }
            Err(e) => {
                self.notifier.on_store_error(name, &e);
                None
            }
        }
    }
}

/// Scoped probe slot
///
/// Call [`ProbeGuard::release`] on the normal path. If the guard is dropped
/// instead (panic, cancelled future), the release is spawned onto the current
/// runtime; without a runtime the lease runs out its TTL.
#[derive(Debug)]
pub struct ProbeGuard {
    lock: Arc<dyn RecoveryLock>,
    notifier: Arc<dyn Notifier>,
    name: String,
    token: Option<LockToken>,
}

impl ProbeGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release the slot; `false` if the lease had already expired
    pub async fn release(mut self) -> bool {
        let Some(token) = self.token.take() else {
            return false;
        };
        match self.lock.release(&self.name, &token).await {
            Ok(released) => {
                if !released {
                    warn!(circuit = %self.name, "Probe lease expired before release");
                }
                released
            }
            Err(e) => {
                self.notifier.on_store_error(&self.name, &e);
                false
            }
        }
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let lock = self.lock.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(circuit = %name, "Releasing abandoned probe slot");
                handle.spawn(async move {
                    let _ = lock.release(&name, &token).await;
                });
            }
            Err(_) => {
                warn!(circuit = %name, "No runtime to release probe slot, leaving it to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::TracingNotifier;

    fn coordinator() -> (RecoveryCoordinator, Arc<LocalLock>) {
        let lock = Arc::new(LocalLock::new(Arc::new(ManualClock::at_epoch())));
        (
            RecoveryCoordinator::new(lock.clone(), Arc::new(TracingNotifier)),
            lock,
        )
    }

    #[tokio::test]
    async fn test_guard_release_frees_slot() {
        let (coordinator, _) = coordinator();
        let ttl = Duration::from_secs(30);

        let guard = coordinator.try_acquire("api", ttl).await.unwrap();
        assert!(coordinator.try_acquire("api", ttl).await.is_none());

        assert!(guard.release().await);
        assert!(coordinator.try_acquire("api", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (coordinator, lock) = coordinator();
        let ttl = Duration::from_secs(30);

        {
            let _guard = coordinator.try_acquire("api", ttl).await.unwrap();
        }

        // Let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
            if !lock.is_held("api") {
                break;
            }
        }
        assert!(!lock.is_held("api"));
        assert!(coordinator.try_acquire("api", ttl).await.is_some());
    }

    #[tokio::test]
    async fn test_slots_are_per_name() {
        let (coordinator, _) = coordinator();
        let ttl = Duration::from_secs(30);

        let _a = coordinator.try_acquire("a", ttl).await.unwrap();
        assert!(coordinator.try_acquire("b", ttl).await.is_some());
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(LockToken::generate(), LockToken::generate());
    }
}
