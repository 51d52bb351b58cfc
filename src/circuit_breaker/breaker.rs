use super::evaluator::{Evaluation, ProbeGrant, StateEvaluator, StoreFailurePolicy};
use super::options::{CallOptions, ErrorClass};
use super::types::{CircuitConfig, CircuitState, ForcedState};
use crate::clock::Clock;
use crate::error::{CallError, Result};
use crate::metrics_store::{MetricsStore, WindowSnapshot};
use crate::notify::Notifier;
use crate::recovery::RecoveryCoordinator;
use crate::store::OutcomeEvent;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::future::{Future, Ready};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Shared parts every circuit of one system is bound to
#[derive(Debug, Clone)]
pub(crate) struct Bindings {
    pub metrics: MetricsStore,
    pub coordinator: RecoveryCoordinator,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub failure_policy: StoreFailurePolicy,
}

/// Handle to one named circuit
///
/// Handles are created by [`BreakerSystem`](super::BreakerSystem) and are
/// immutable: a different behavior needs a different name. All state lives in
/// the store and the recovery lock, so every handle for a name (in this process
/// or another one sharing the store) sees the same circuit.
#[derive(Debug)]
pub struct Circuit {
    name: String,
    config: CircuitConfig,
    bindings: Bindings,
    /// Last state this handle acted on, used for change notifications
    last_observed: Mutex<CircuitState>,
}

type NoFallback<T, E> = fn() -> Ready<std::result::Result<T, E>>;

impl Circuit {
    pub(crate) fn new(name: String, config: CircuitConfig, bindings: Bindings) -> Self {
        info!(
            circuit = %name,
            threshold = config.threshold,
            window_secs = config.window_secs,
            cool_off_secs = config.cool_off_secs,
            recovery_threshold = config.recovery_threshold,
            "Creating circuit"
        );

        Self {
            name,
            config,
            bindings,
            last_observed: Mutex::new(CircuitState::Green),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Run `operation` through the circuit
    ///
    /// Returns [`CallError::Open`] when the circuit rejects the call.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        options: &CallOptions<E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.run(operation, None::<NoFallback<T, E>>, options).await
    }

    /// Run `operation` through the circuit, or `fallback` when it is rejected
    ///
    /// `operation` is never invoked on the fallback path.
    pub async fn execute_or_else<T, E, F, Fut, Fb, FbFut>(
        &self,
        operation: F,
        fallback: Fb,
        options: &CallOptions<E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = std::result::Result<T, E>>,
    {
        self.run(operation, Some(fallback), options).await
    }

    async fn run<T, E, F, Fut, Fb, FbFut>(
        &self,
        operation: F,
        fallback: Option<Fb>,
        options: &CallOptions<E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = std::result::Result<T, E>>,
    {
        match self.read_forced().await {
            Some(ForcedState::Open) => {
                self.observe(CircuitState::ForcedRed);
                return self.reject(fallback).await;
            }
            Some(ForcedState::Closed) => {
                self.observe(CircuitState::ForcedGreen);
                self.count_call("forced");
                return operation().await.map_err(CallError::Operation);
            }
            None => {}
        }

        let now = self.bindings.clock.now();
        let snapshot = self.read_snapshot(now).await;
        let state = self.evaluate(snapshot.as_ref(), now, ProbeGrant::NotRequested);

        match state {
            CircuitState::Probe => {
                let Some(guard) = self
                    .bindings
                    .coordinator
                    .try_acquire(&self.name, self.config.probe_timeout())
                    .await
                else {
                    debug!(circuit = %self.name, "Probe slot denied, rejecting call");
                    return self.reject(fallback).await;
                };

                // Another holder may have recovered or re-tripped the circuit
                // between the first read and the grant
                let now = self.bindings.clock.now();
                let snapshot = self.read_snapshot(now).await;
                let result = match self.evaluate(snapshot.as_ref(), now, ProbeGrant::Granted) {
                    CircuitState::Probe => self.run_probe(operation, options).await,
                    CircuitState::Green => self.run_closed(operation, options).await,
                    _ => {
                        self.observe(CircuitState::Red);
                        self.reject(fallback).await
                    }
                };
                guard.release().await;
                result
            }
            CircuitState::Green => self.run_closed(operation, options).await,
            _ => {
                self.observe(CircuitState::Red);
                self.reject(fallback).await
            }
        }
    }

    async fn run_closed<T, E, F, Fut>(
        &self,
        operation: F,
        options: &CallOptions<E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.observe(CircuitState::Green);
        let result = operation().await;

        match classify(&result, options) {
            ErrorClass::Skipped => self.count_call("skipped"),
            ErrorClass::Untracked => {
                self.count_call("success");
                self.record(OutcomeEvent::success()).await;
            }
            ErrorClass::Tracked(classification) => {
                self.count_call("failure");
                self.record(OutcomeEvent::failure(classification)).await;

                let now = self.bindings.clock.now();
                if let Some(snapshot) = self.read_snapshot(now).await {
                    if StateEvaluator::is_tripped(&self.config, &snapshot) {
                        self.observe(CircuitState::Red);
                    }
                }
            }
        }

        result.map_err(CallError::Operation)
    }

    /// Run the sole probe; the caller holds the recovery lease
    async fn run_probe<T, E, F, Fut>(
        &self,
        operation: F,
        options: &CallOptions<E>,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.observe(CircuitState::Probe);
        let result = operation().await;

        match classify(&result, options) {
            ErrorClass::Skipped => {
                self.count_call("skipped");
                debug!(circuit = %self.name, "Probe outcome skipped");
            }
            ErrorClass::Untracked => {
                self.count_call("success");
                self.record(OutcomeEvent::success().as_probe()).await;

                let now = self.bindings.clock.now();
                let recovered = self
                    .read_snapshot(now)
                    .await
                    .is_some_and(|snapshot| StateEvaluator::is_recovered(&self.config, &snapshot));
                if recovered {
                    if let Err(e) = self.bindings.metrics.reset(&self.name).await {
                        self.store_error(&e);
                    }
                    info!(circuit = %self.name, "Circuit recovered");
                    self.observe(CircuitState::Green);
                }
            }
            ErrorClass::Tracked(classification) => {
                self.count_call("failure");
                self.record(OutcomeEvent::failure(classification).as_probe()).await;
                warn!(circuit = %self.name, "Probe failed, circuit stays open");
                self.observe(CircuitState::Red);
            }
        }

        result.map_err(CallError::Operation)
    }

    async fn reject<T, E, Fb, FbFut>(
        &self,
        fallback: Option<Fb>,
    ) -> std::result::Result<T, CallError<E>>
    where
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = std::result::Result<T, E>>,
    {
        counter!("tripwire_rejected_total", "circuit" => self.name.clone()).increment(1);
        match fallback {
            Some(fallback) => fallback().await.map_err(CallError::Fallback),
            None => Err(CallError::Open {
                name: self.name.clone(),
            }),
        }
    }

    /// State as seen by an observer that does not ask for a probe slot
    pub async fn current_state(&self) -> CircuitState {
        if let Some(forced) = self.read_forced().await {
            return forced.state();
        }
        let now = self.bindings.clock.now();
        let snapshot = self.read_snapshot(now).await;
        self.evaluate(snapshot.as_ref(), now, ProbeGrant::NotRequested)
    }

    /// Reject every call until the override is cleared
    pub async fn force_open(&self) -> Result<()> {
        self.set_forced(Some(ForcedState::Open)).await
    }

    /// Admit every call without recording outcomes until the override is cleared
    pub async fn force_closed(&self) -> Result<()> {
        self.set_forced(Some(ForcedState::Closed)).await
    }

    pub async fn clear_override(&self) -> Result<()> {
        self.set_forced(None).await
    }

    async fn set_forced(&self, forced: Option<ForcedState>) -> Result<()> {
        self.bindings
            .metrics
            .set_forced_state(&self.name, forced)
            .await?;
        info!(
            circuit = %self.name,
            forced = forced.map(|f| f.as_str()).unwrap_or("none"),
            "Manual override updated"
        );
        let state = self.current_state().await;
        self.observe(state);
        Ok(())
    }

    /// Drop the outcome history, closing the circuit
    pub async fn reset(&self) -> Result<()> {
        self.bindings.metrics.reset(&self.name).await?;
        info!(circuit = %self.name, "Circuit reset");
        let state = self.current_state().await;
        self.observe(state);
        Ok(())
    }

    /// Summary of the current window, errors included
    pub async fn window_snapshot(&self) -> Result<WindowSnapshot> {
        let now = self.bindings.clock.now();
        self.bindings
            .metrics
            .snapshot(&self.name, now, self.config.window())
            .await
    }

    fn evaluate(
        &self,
        snapshot: Option<&WindowSnapshot>,
        now: DateTime<Utc>,
        grant: ProbeGrant,
    ) -> CircuitState {
        StateEvaluator::evaluate(&Evaluation {
            config: &self.config,
            snapshot,
            now,
            forced: None,
            grant,
            failure_policy: self.bindings.failure_policy,
        })
    }

    async fn read_forced(&self) -> Option<ForcedState> {
        match self.bindings.metrics.forced_state(&self.name).await {
            Ok(forced) => forced,
            Err(e) => {
                self.store_error(&e);
                None
            }
        }
    }

    /// `None` when the store could not be read
    async fn read_snapshot(&self, now: DateTime<Utc>) -> Option<WindowSnapshot> {
        match self
            .bindings
            .metrics
            .snapshot(&self.name, now, self.config.window())
            .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                self.store_error(&e);
                None
            }
        }
    }

    async fn record(&self, event: OutcomeEvent) {
        let now = self.bindings.clock.now();
        if let Err(e) = self
            .bindings
            .metrics
            .record_outcome(&self.name, now, event, &self.config)
            .await
        {
            warn!(circuit = %self.name, error = %e, "Dropping outcome record");
            self.store_error(&e);
        }
    }

    fn store_error(&self, error: &crate::error::BreakerError) {
        self.bindings.notifier.on_store_error(&self.name, error);
    }

    fn count_call(&self, outcome: &'static str) {
        counter!("tripwire_calls_total", "circuit" => self.name.clone(), "outcome" => outcome)
            .increment(1);
    }

    fn observe(&self, state: CircuitState) {
        let previous = {
            let mut last = self
                .last_observed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *last, state)
        };
        if previous != state {
            self.bindings
                .notifier
                .on_state_change(&self.name, previous, state);
        }
    }
}

fn classify<T, E>(result: &std::result::Result<T, E>, options: &CallOptions<E>) -> ErrorClass {
    match result {
        Ok(_) => ErrorClass::Untracked,
        Err(e) => options.classify(e),
    }
}
