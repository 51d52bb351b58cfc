//! Sliding-window outcome accounting
//!
//! Every read and write first discards records older than `now - window`; the
//! window start itself is inclusive. Reads are range-bounded as well, so a
//! reader never counts an expired record even if another writer has not pruned
//! yet.

use crate::circuit_breaker::types::{CircuitConfig, ForcedState};
use crate::clock::window_start;
use crate::error::Result;
use crate::store::{Outcome, OutcomeEvent, OutcomeRecord, Store};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything the evaluator needs from one window read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Failure records in the window
    pub failures: u64,
    /// Success records in the window
    pub successes: u64,
    /// Timestamp of the newest failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Successful probes after the newest failure
    pub probe_streak: u64,
    /// Probe records in the window
    pub probes: u64,
    /// Successful probe records in the window
    pub probe_successes: u64,
}

impl WindowSnapshot {
    /// Summarize records ordered by timestamp then sequence
    pub fn from_records(records: &[OutcomeRecord]) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            match record.event.outcome {
                Outcome::Failure => {
                    snapshot.failures += 1;
                    snapshot.last_failure_at = Some(record.timestamp);
                    snapshot.probe_streak = 0;
                    if record.event.probe {
                        snapshot.probes += 1;
                    }
                }
                Outcome::Success => {
                    snapshot.successes += 1;
                    if record.event.probe {
                        snapshot.probes += 1;
                        snapshot.probe_successes += 1;
                        snapshot.probe_streak += 1;
                    }
                }
            }
        }
        snapshot
    }

    pub fn total(&self) -> u64 {
        self.failures + self.successes
    }

    /// Failed probe records in the window
    pub fn probe_failures(&self) -> u64 {
        self.probes.saturating_sub(self.probe_successes)
    }
}

/// Per-circuit outcome history on top of a [`Store`]
#[derive(Debug, Clone)]
pub struct MetricsStore {
    store: Arc<dyn Store>,
}

impl MetricsStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Record one outcome, pruning the window in the same store operation
    ///
    /// Successes outside of probes are only kept when the policy needs them,
    /// and failures are capped to the newest `threshold` under the
    /// consecutive policy.
    pub async fn record_outcome(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        event: OutcomeEvent,
        config: &CircuitConfig,
    ) -> Result<()> {
        if !event.is_failure() && !event.probe && !config.tracks_successes() {
            return Ok(());
        }

        let cutoff = window_start(timestamp, config.window());
        let sequence = self
            .store
            .prune_and_write(name, cutoff, timestamp, &event, config.retention())
            .await?;

        debug!(
            circuit = name,
            sequence,
            outcome = ?event.outcome,
            probe = event.probe,
            "Outcome recorded"
        );
        Ok(())
    }

    /// Prune, then summarize `[now - window, now]`
    pub async fn snapshot(
        &self,
        name: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<WindowSnapshot> {
        let records = self
            .store
            .prune_and_range(name, window_start(now, window), now)
            .await?;
        Ok(WindowSnapshot::from_records(&records))
    }

    /// Failures in `[now - window, now]`
    pub async fn count_in_window(
        &self,
        name: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64> {
        Ok(self.snapshot(name, now, window).await?.failures)
    }

    /// `(failures, total)` in `[now - window, now]`
    pub async fn rate_in_window(
        &self,
        name: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<(u64, u64)> {
        let snapshot = self.snapshot(name, now, window).await?;
        Ok((snapshot.failures, snapshot.total()))
    }

    /// Clear the history of a circuit
    pub async fn reset(&self, name: &str) -> Result<()> {
        debug!(circuit = name, "Resetting outcome history");
        self.store.delete_all(name).await
    }

    pub async fn forced_state(&self, name: &str) -> Result<Option<ForcedState>> {
        self.store.get_forced_state(name).await
    }

    pub async fn set_forced_state(&self, name: &str, state: Option<ForcedState>) -> Result<()> {
        self.store.set_forced_state(name, state).await
    }
}
