use super::lua_scripts::{PRUNE_AND_RANGE_SCRIPT, RECORD_SCRIPT, WRITE_SCRIPT};
use super::{OutcomeEvent, OutcomeRecord, Store};
use crate::circuit_breaker::types::ForcedState;
use crate::clock::from_micros;
use crate::error::{BreakerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Member body stored after the sequence prefix
#[derive(Debug, Serialize, Deserialize)]
struct StoredEvent {
    ts: i64,
    #[serde(flatten)]
    event: OutcomeEvent,
}

/// Redis-backed store shared across processes
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
    write_script: Script,
    record_script: Script,
    prune_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection, prefix))
    }

    /// Build on an existing connection manager
    pub fn with_connection(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            write_script: Script::new(WRITE_SCRIPT),
            record_script: Script::new(RECORD_SCRIPT),
            prune_script: Script::new(PRUNE_AND_RANGE_SCRIPT),
        }
    }

    fn failures_key(&self, name: &str) -> String {
        format!("{}:{}:failures", self.prefix, name)
    }

    fn successes_key(&self, name: &str) -> String {
        format!("{}:{}:successes", self.prefix, name)
    }

    fn forced_key(&self, name: &str) -> String {
        format!("{}:{}:forced", self.prefix, name)
    }

    fn sequence_key(&self) -> String {
        format!("{}:sequence", self.prefix)
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await?;
        Ok(())
    }

    async fn range_key(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut connection = self.connection.clone();
        let members = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(from.timestamp_micros())
            .arg(to.timestamp_micros())
            .query_async::<_, Vec<String>>(&mut connection)
            .await?;
        Ok(members)
    }
}

fn encode_payload(timestamp: DateTime<Utc>, event: &OutcomeEvent) -> Result<String> {
    Ok(serde_json::to_string(&StoredEvent {
        ts: timestamp.timestamp_micros(),
        event: event.clone(),
    })?)
}

/// Parse `<sequence>:<json>` members into ordered records
fn decode_members(members: impl IntoIterator<Item = String>) -> Vec<OutcomeRecord> {
    let mut records: Vec<OutcomeRecord> = members
        .into_iter()
        .filter_map(|member| match decode_member(&member) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(member = %member, error = %e, "Skipping undecodable outcome member");
                None
            }
        })
        .collect();
    records.sort_by_key(|record| record.order_key());
    records
}

fn decode_member(member: &str) -> Result<OutcomeRecord> {
    let (sequence, body) = member
        .split_once(':')
        .ok_or_else(|| BreakerError::Serialization(format!("Malformed member: {}", member)))?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|e| BreakerError::Serialization(format!("Bad sequence: {}", e)))?;
    let stored: StoredEvent = serde_json::from_str(body)?;
    Ok(OutcomeRecord {
        timestamp: from_micros(stored.ts),
        sequence,
        event: stored.event,
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn write(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
    ) -> Result<u64> {
        let key = if event.is_failure() {
            self.failures_key(name)
        } else {
            self.successes_key(name)
        };
        let payload = encode_payload(timestamp, event)?;

        let mut connection = self.connection.clone();
        let sequence = self
            .write_script
            .key(&key)
            .key(self.sequence_key())
            .arg(timestamp.timestamp_micros())
            .arg(payload)
            .invoke_async::<_, u64>(&mut connection)
            .await
            .map_err(|e| {
                error!(circuit = name, error = %e, "Redis error writing outcome");
                BreakerError::from(e)
            })?;

        debug!(circuit = name, sequence, "Outcome written to Redis");
        Ok(sequence)
    }

    async fn range_query(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>> {
        let mut members = self.range_key(&self.failures_key(name), from, to).await?;
        members.extend(self.range_key(&self.successes_key(name), from, to).await?);
        Ok(decode_members(members))
    }

    async fn delete_range(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let mut connection = self.connection.clone();
        let mut removed = 0;
        for key in [self.failures_key(name), self.successes_key(name)] {
            removed += redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(from.timestamp_micros())
                .arg(format!("({}", to.timestamp_micros()))
                .query_async::<_, u64>(&mut connection)
                .await?;
        }
        Ok(removed)
    }

    async fn delete_all(&self, name: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(self.failures_key(name))
            .arg(self.successes_key(name))
            .query_async::<_, u64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn trim_failures(&self, name: &str, keep: usize) -> Result<u64> {
        let mut connection = self.connection.clone();
        let stop = -(keep as i64) - 1;
        let removed = redis::cmd("ZREMRANGEBYRANK")
            .arg(self.failures_key(name))
            .arg(0)
            .arg(stop)
            .query_async::<_, u64>(&mut connection)
            .await?;
        Ok(removed)
    }

    async fn get_forced_state(&self, name: &str) -> Result<Option<ForcedState>> {
        let mut connection = self.connection.clone();
        let value = redis::cmd("GET")
            .arg(self.forced_key(name))
            .query_async::<_, Option<String>>(&mut connection)
            .await?;
        Ok(value.as_deref().and_then(ForcedState::parse))
    }

    async fn set_forced_state(&self, name: &str, state: Option<ForcedState>) -> Result<()> {
        let mut connection = self.connection.clone();
        match state {
            Some(state) => {
                redis::cmd("SET")
                    .arg(self.forced_key(name))
                    .arg(state.as_str())
                    .query_async::<_, ()>(&mut connection)
                    .await?;
            }
            None => {
                redis::cmd("DEL")
                    .arg(self.forced_key(name))
                    .query_async::<_, ()>(&mut connection)
                    .await?;
            }
        }
        Ok(())
    }

    async fn prune_and_range(
        &self,
        name: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>> {
        let mut connection = self.connection.clone();
        let (failures, successes) = self
            .prune_script
            .key(self.failures_key(name))
            .key(self.successes_key(name))
            .arg(cutoff.timestamp_micros())
            .arg(now.timestamp_micros())
            .invoke_async::<_, (Vec<String>, Vec<String>)>(&mut connection)
            .await
            .map_err(|e| {
                error!(circuit = name, error = %e, "Redis error reading outcome window");
                BreakerError::from(e)
            })?;

        Ok(decode_members(failures.into_iter().chain(successes)))
    }

    async fn prune_and_write(
        &self,
        name: &str,
        cutoff: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
        keep_failures: Option<usize>,
    ) -> Result<u64> {
        let payload = encode_payload(timestamp, event)?;

        let mut connection = self.connection.clone();
        let sequence = self
            .record_script
            .key(self.failures_key(name))
            .key(self.successes_key(name))
            .key(self.sequence_key())
            .arg(cutoff.timestamp_micros())
            .arg(timestamp.timestamp_micros())
            .arg(payload)
            .arg(if event.is_failure() { 1 } else { 0 })
            .arg(keep_failures.unwrap_or(0))
            .invoke_async::<_, u64>(&mut connection)
            .await
            .map_err(|e| {
                error!(circuit = name, error = %e, "Redis error recording outcome");
                BreakerError::from(e)
            })?;

        debug!(circuit = name, sequence, "Outcome recorded in Redis");
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    // Note: the Redis tests require a running Redis instance
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn create_test_store() -> RedisStore {
        RedisStore::new(
            "redis://127.0.0.1:6379",
            format!("tripwire-test-{}", rand::random::<u32>()),
        )
        .await
        .expect("Failed to connect to Redis")
    }

    #[test]
    fn test_decode_member() {
        let member = format!(
            "{:020}:{}",
            42,
            r#"{"ts":1704067200000000,"outcome":"failure","classification":"timeout","probe":false}"#
        );
        let record = decode_member(&member).unwrap();
        assert_eq!(record.sequence, 42);
        assert_eq!(record.timestamp.timestamp_micros(), 1_704_067_200_000_000);
        assert_eq!(record.event, OutcomeEvent::failure("timeout"));
    }

    #[test]
    fn test_decode_members_orders_and_skips_garbage() {
        let members = vec![
            format!("{:020}:{}", 2, r#"{"ts":10,"outcome":"success","probe":true}"#),
            "garbage".to_string(),
            format!("{:020}:{}", 1, r#"{"ts":10,"outcome":"failure","probe":false}"#),
        ];
        let records = decode_members(members);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].sequence, 2);
        assert!(records[1].event.probe);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_connection() {
        let store = create_test_store().await;
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_prune_and_range() {
        let store = create_test_store().await;
        let clock = ManualClock::at_epoch();
        let old = clock.now();
        clock.advance(Duration::from_secs(100));
        let cutoff = clock.now();
        clock.advance(Duration::from_secs(10));
        let now = clock.now();

        store.write("api", old, &OutcomeEvent::failure("e")).await.unwrap();
        store.write("api", cutoff, &OutcomeEvent::failure("e")).await.unwrap();
        store.write("api", now, &OutcomeEvent::success()).await.unwrap();

        let records = store.prune_and_range("api", cutoff, now).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, cutoff);
        assert!(!records[1].event.is_failure());

        store.delete_all("api").await.unwrap();
        assert!(store.range_query("api", old, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_prune_and_write() {
        let store = create_test_store().await;
        let clock = ManualClock::at_epoch();
        let old = clock.now();
        store.write("api", old, &OutcomeEvent::success()).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let cutoff = clock.now();

        for _ in 0..4 {
            store
                .prune_and_write("api", cutoff, clock.now(), &OutcomeEvent::failure("e"), Some(2))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let records = store.range_query("api", old, clock.now()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.event.is_failure()));
        store.delete_all("api").await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_trim_and_forced_state() {
        let store = create_test_store().await;
        let clock = ManualClock::at_epoch();
        for _ in 0..5 {
            store
                .write("api", clock.now(), &OutcomeEvent::failure("e"))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(store.trim_failures("api", 2).await.unwrap(), 3);

        store
            .set_forced_state("api", Some(ForcedState::Closed))
            .await
            .unwrap();
        assert_eq!(
            store.get_forced_state("api").await.unwrap(),
            Some(ForcedState::Closed)
        );
        store.set_forced_state("api", None).await.unwrap();
        assert_eq!(store.get_forced_state("api").await.unwrap(), None);
    }
}
