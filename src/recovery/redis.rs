use super::{LockToken, RecoveryLock};
use crate::error::Result;
use crate::store::lua_scripts::RELEASE_LOCK_SCRIPT;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::time::Duration;
use tracing::{debug, error};

/// Redis lease lock shared across processes
#[derive(Clone)]
pub struct RedisLock {
    connection: ConnectionManager,
    prefix: String,
    release_script: Script,
}

impl std::fmt::Debug for RedisLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisLock {
    /// Connect to Redis
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection, prefix))
    }

    pub fn with_connection(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
        }
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:{}:probe_lock", self.prefix, name)
    }
}

#[async_trait]
impl RecoveryLock for RedisLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        let ttl_ms = ttl.as_millis().clamp(1, u64::MAX as u128) as u64;
        let mut connection = self.connection.clone();

        let reply = redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, Option<String>>(&mut connection)
            .await
            .map_err(|e| {
                error!(circuit = name, error = %e, "Redis error acquiring probe lease");
                e
            })?;

        debug!(circuit = name, acquired = reply.is_some(), "Probe lease attempt");
        Ok(reply.map(|_| token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<bool> {
        let mut connection = self.connection.clone();
        let released = self
            .release_script
            .key(self.lock_key(name))
            .arg(token.as_str())
            .invoke_async::<_, i64>(&mut connection)
            .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: these tests require a running Redis instance
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn create_test_lock() -> RedisLock {
        RedisLock::new(
            "redis://127.0.0.1:6379",
            format!("tripwire-lock-test-{}", rand::random::<u32>()),
        )
        .await
        .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lock_single_holder() {
        let lock = create_test_lock().await;
        let ttl = Duration::from_secs(5);

        let token = lock.acquire("api", ttl).await.unwrap().unwrap();
        assert!(lock.acquire("api", ttl).await.unwrap().is_none());
        assert!(lock.release("api", &token).await.unwrap());
        assert!(lock.acquire("api", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_lock_expires() {
        let lock = create_test_lock().await;
        let ttl = Duration::from_millis(200);

        let stale = lock.acquire("api", ttl).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(lock.acquire("api", ttl).await.unwrap().is_some());
        assert!(!lock.release("api", &stale).await.unwrap());
    }
}
