use super::{LockToken, RecoveryLock};
use crate::clock::Clock;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct Lease {
    token: LockToken,
    expires_at: DateTime<Utc>,
}

/// In-process lease lock
#[derive(Debug)]
pub struct LocalLock {
    leases: DashMap<String, Lease>,
    clock: Arc<dyn Clock>,
}

impl LocalLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            clock,
        }
    }

    /// Whether a live lease exists for `name`
    pub fn is_held(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.leases
            .get(name)
            .map(|lease| lease.expires_at > now)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RecoveryLock for LocalLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = self.clock.now();
        let expires_at = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = LockToken::generate();
        let lease = Lease {
            token: token.clone(),
            expires_at,
        };

        // The entry holds the shard lock across check-and-set
        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    debug!(circuit = name, "Taking over expired probe lease");
                    entry.insert(lease);
                    Ok(Some(token))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
                Ok(Some(token))
            }
        }
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(name, |_, lease| lease.token == *token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_only_one_holder() {
        let lock = LocalLock::new(Arc::new(ManualClock::at_epoch()));
        let ttl = Duration::from_secs(10);

        let token = lock.acquire("api", ttl).await.unwrap();
        assert!(token.is_some());
        assert!(lock.acquire("api", ttl).await.unwrap().is_none());
        assert!(lock.is_held("api"));
    }

    #[tokio::test]
    async fn test_lease_expires_after_ttl() {
        let clock = ManualClock::at_epoch();
        let lock = LocalLock::new(Arc::new(clock.clone()));
        let ttl = Duration::from_secs(10);

        let first = lock.acquire("api", ttl).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(9));
        assert!(lock.acquire("api", ttl).await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let second = lock.acquire("api", ttl).await.unwrap();
        assert!(second.is_some());

        // The stale holder cannot release the new lease
        assert!(!lock.release("api", &first).await.unwrap());
        assert!(lock.is_held("api"));
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let lock = LocalLock::new(Arc::new(ManualClock::at_epoch()));
        let ttl = Duration::from_secs(10);

        let token = lock.acquire("api", ttl).await.unwrap().unwrap();
        assert!(!lock.release("api", &LockToken::generate()).await.unwrap());
        assert!(lock.release("api", &token).await.unwrap());
        assert!(!lock.is_held("api"));
    }
}
