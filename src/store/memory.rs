use super::{OutcomeEvent, OutcomeRecord, Store};
use crate::circuit_breaker::types::ForcedState;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Key = (i64, u64);

#[derive(Debug, Default)]
struct Series {
    failures: BTreeMap<Key, OutcomeRecord>,
    successes: BTreeMap<Key, OutcomeRecord>,
}

impl Series {
    fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<OutcomeRecord> {
        let lower = Bound::Included((from.timestamp_micros(), 0));
        let upper = Bound::Included((to.timestamp_micros(), u64::MAX));
        let mut records: Vec<OutcomeRecord> = self
            .failures
            .range((lower, upper))
            .chain(self.successes.range((lower, upper)))
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|record| record.order_key());
        records
    }

    fn delete_range(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        let from = from.timestamp_micros();
        let to = to.timestamp_micros();
        let before = self.len();
        let in_range = |key: &Key| key.0 >= from && key.0 < to;
        self.failures.retain(|key, _| !in_range(key));
        self.successes.retain(|key, _| !in_range(key));
        (before - self.len()) as u64
    }

    fn insert(&mut self, record: OutcomeRecord) {
        let key = record.order_key();
        if record.event.is_failure() {
            self.failures.insert(key, record);
        } else {
            self.successes.insert(key, record);
        }
    }

    fn trim_failures(&mut self, keep: usize) -> u64 {
        let mut removed = 0;
        while self.failures.len() > keep {
            self.failures.pop_first();
            removed += 1;
        }
        removed
    }

    fn len(&self) -> usize {
        self.failures.len() + self.successes.len()
    }
}

/// In-process store
///
/// Each circuit name owns one mutex-guarded series, so a prune and the read
/// that follows it are atomic with respect to writers on the same name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: DashMap<String, Arc<Mutex<Series>>>,
    forced: DashMap<String, ForcedState>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, name: &str) -> Arc<Mutex<Series>> {
        self.series
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = name, "Creating in-memory outcome series");
                Arc::new(Mutex::new(Series::default()))
            })
            .clone()
    }

    fn next_record(&self, timestamp: DateTime<Utc>, event: &OutcomeEvent) -> OutcomeRecord {
        OutcomeRecord {
            timestamp,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            event: event.clone(),
        }
    }

    /// Number of records currently held for `name`
    pub fn len(&self, name: &str) -> usize {
        let Some(series) = self.series.get(name) else {
            return 0;
        };
        let len = lock(&series).len();
        len
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }
}

fn lock(series: &Mutex<Series>) -> MutexGuard<'_, Series> {
    series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
    ) -> Result<u64> {
        let record = self.next_record(timestamp, event);
        let sequence = record.sequence;
        lock(&self.series(name)).insert(record);
        Ok(sequence)
    }

    async fn range_query(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OutcomeRecord>> {
        let Some(series) = self.series.get(name) else {
            return Ok(Vec::new());
        };
        let records = lock(&series).range(from, to);
        Ok(records)
    }

    async fn delete_range(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let Some(series) = self.series.get(name) else {
            return Ok(0);
        };
        let removed = lock(&series).delete_range(from, to);
        Ok(removed)
    }

    async fn delete_all(&self, name: &str) -> Result<()> {
        if let Some(series) = self.series.get(name) {
            *lock(&series) = Series::default();
        }
        Ok(())
    }

    async fn trim_failures(&self, name: &str, keep: usize) -> Result<u64> {
        let Some(series) = self.series.get(name) else {
            return Ok(0);
        };
        let removed = lock(&series).trim_failures(keep);
        Ok(removed)
    }

    async fn get_forced_state(&self, name: &str) -> Result<Option<ForcedState>> {
        Ok(self.forced.get(name).map(|state| *state))
    }

    async fn set_forced_state(&self, name: &str, state: Option<ForcedState>) -> Result<()> {
        match state {
            Some(state) => {
                self.forced.insert(name.to_string(), state);
            }
            None => {
                self.forced.remove(name);
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
        let Some(series) = self.series.get(name) else {
            return Ok(Vec::new());
        };
        let mut series = lock(&series);
        series.delete_range(DateTime::<Utc>::MIN_UTC, cutoff);
        Ok(series.range(cutoff, now))
    }

    async fn prune_and_write(
        &self,
        name: &str,
        cutoff: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        event: &OutcomeEvent,
        keep_failures: Option<usize>,
    ) -> Result<u64> {
        let record = self.next_record(timestamp, event);
        let sequence = record.sequence;
        let series = self.series(name);
        let mut series = lock(&series);
        series.delete_range(DateTime::<Utc>::MIN_UTC, cutoff);
        series.insert(record);
        if let Some(keep) = keep_failures.filter(|_| event.is_failure()) {
            series.trim_failures(keep);
        }
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    #[tokio::test]
    async fn test_range_is_ordered_with_sequence_tiebreak() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();
        let now = clock.now();

        let first = store
            .write("api", now, &OutcomeEvent::failure("timeout"))
            .await
            .unwrap();
        let second = store
            .write("api", now, &OutcomeEvent::success())
            .await
            .unwrap();
        let third = store
            .write("api", now, &OutcomeEvent::failure("refused"))
            .await
            .unwrap();

        let records = store.range_query("api", now, now).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_delete_range_is_half_open() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(10));
        let t1 = clock.now();

        store.write("api", t0, &OutcomeEvent::failure("e")).await.unwrap();
        store.write("api", t1, &OutcomeEvent::failure("e")).await.unwrap();

        let removed = store.delete_range("api", t0, t1).await.unwrap();
        assert_eq!(removed, 1);

        let records = store.range_query("api", t0, t1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, t1);
    }

    #[tokio::test]
    async fn test_prune_and_range_keeps_boundary() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();
        let before = clock.now();
        clock.advance(Duration::from_secs(1));
        let cutoff = clock.now();
        clock.advance(Duration::from_secs(1));
        let now = clock.now();

        store.write("api", before, &OutcomeEvent::failure("e")).await.unwrap();
        store.write("api", cutoff, &OutcomeEvent::failure("e")).await.unwrap();
        store.write("api", now, &OutcomeEvent::success()).await.unwrap();

        let records = store.prune_and_range("api", cutoff, now).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, cutoff);
        assert_eq!(store.len("api"), 2);
    }

    #[tokio::test]
    async fn test_trim_failures_leaves_successes() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();

        for _ in 0..5 {
            store
                .write("api", clock.now(), &OutcomeEvent::failure("e"))
                .await
                .unwrap();
            store
                .write("api", clock.now(), &OutcomeEvent::success().as_probe())
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let removed = store.trim_failures("api", 2).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len("api"), 7);
    }

    #[tokio::test]
    async fn test_prune_and_write_caps_failures() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();
        let old = clock.now();
        store.write("api", old, &OutcomeEvent::success().as_probe()).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let cutoff = clock.now();

        for _ in 0..4 {
            store
                .prune_and_write(
                    "api",
                    cutoff,
                    clock.now(),
                    &OutcomeEvent::failure("e"),
                    Some(2),
                )
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let records = store.range_query("api", old, clock.now()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.event.is_failure()));
        assert_eq!(records[0].timestamp, old + chrono::Duration::seconds(12));
    }

    #[tokio::test]
    async fn test_forced_state_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_forced_state("api").await.unwrap(), None);

        store
            .set_forced_state("api", Some(ForcedState::Open))
            .await
            .unwrap();
        assert_eq!(
            store.get_forced_state("api").await.unwrap(),
            Some(ForcedState::Open)
        );

        store.set_forced_state("api", None).await.unwrap();
        assert_eq!(store.get_forced_state("api").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_all_isolated_per_name() {
        let store = MemoryStore::new();
        let clock = ManualClock::at_epoch();
        store.write("a", clock.now(), &OutcomeEvent::failure("e")).await.unwrap();
        store.write("b", clock.now(), &OutcomeEvent::failure("e")).await.unwrap();

        store.delete_all("a").await.unwrap();
        assert!(store.is_empty("a"));
        assert_eq!(store.len("b"), 1);
    }
}
