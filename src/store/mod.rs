//! Backing store for circuit outcomes and manual overrides
//!
//! The store is an ordered-by-time container per circuit name. Records are
//! ordered by `(timestamp, sequence)`, the sequence being assigned by the store
//! on write so that records sharing a timestamp still prune deterministically.
//! Failure and success records are kept apart so retention caps can apply to
//! failures alone.
//!
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: in-process, one mutex-guarded series per name
//! - [`RedisStore`]: sorted sets shared by every process pointing at the same
//!   Redis, pruned and read in a single Lua script

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::circuit_breaker::types::ForcedState;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// Payload written for one outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub outcome: Outcome,
    /// Error classification for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    /// Whether the call was a recovery probe
    #[serde(default)]
    pub probe: bool,
}

impl OutcomeEvent {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            classification: None,
            probe: false,
        }
    }

    pub fn failure(classification: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            classification: Some(classification.into()),
            probe: false,
        }
    }

    pub fn as_probe(mut self) -> Self {
        self.probe = true;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failure
    }
}

/// A stored outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub event: OutcomeEvent,
}

impl OutcomeRecord {
    /// Sort key shared by every backend
    pub fn order_key(&self) -> (i64, u64) {
        (self.timestamp.timestamp_micros(), self.sequence)
    }
}

/// Storage contract consumed by the metrics store
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Append an outcome, returning its sequence number
    async fn write(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
    ) -> Result<u64>;

    /// Records with `from <= timestamp <= to`, ordered by timestamp then sequence
    async fn range_query(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>>;

    /// Delete records with `from <= timestamp < to`
    async fn delete_range(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_all(&self, name: &str) -> Result<()>;

    /// Drop all but the newest `keep` failure records
    async fn trim_failures(&self, name: &str, keep: usize) -> Result<u64>;

    async fn get_forced_state(&self, name: &str) -> Result<Option<ForcedState>>;

    async fn set_forced_state(&self, name: &str, state: Option<ForcedState>) -> Result<()>;

    /// Delete everything older than `cutoff`, then read `[cutoff, now]`
    async fn prune_and_range(
        &self,
        name: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>> {
        self.delete_range(name, DateTime::<Utc>::MIN_UTC, cutoff).await?;
        self.range_query(name, cutoff, now).await
    }

    /// Delete everything older than `cutoff`, append `event`, then cap the
    /// failures of `name` to the newest `keep_failures` when one is given
    ///
    /// Returns the sequence number of the appended record.
    async fn prune_and_write(
        &self,
        name: &str,
        cutoff: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
        keep_failures: Option<usize>,
    ) -> Result<u64> {
        self.delete_range(name, DateTime::<Utc>::MIN_UTC, cutoff).await?;
        let sequence = self.write(name, timestamp, event).await?;
        if let Some(keep) = keep_failures.filter(|_| event.is_failure()) {
            self.trim_failures(name, keep).await?;
        }
        Ok(sequence)
    }
}
