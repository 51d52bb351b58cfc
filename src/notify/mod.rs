//! Fire-and-forget notifications
//!
//! Circuits report state changes and absorbed store errors through a
//! [`Notifier`]. Implementations must return immediately: they are called on
//! the caller's path.

use crate::circuit_breaker::types::CircuitState;
use crate::error::BreakerError;
use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Notification side channel
pub trait Notifier: Send + Sync + std::fmt::Debug {
    fn on_state_change(&self, name: &str, old: CircuitState, new: CircuitState);

    fn on_store_error(&self, name: &str, error: &BreakerError);
}

/// Logs notifications and mirrors them into `metrics`
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_state_change(&self, name: &str, old: CircuitState, new: CircuitState) {
        info!(circuit = name, from = %old, to = %new, "Circuit state changed");
        gauge!("tripwire_circuit_state", "circuit" => name.to_string()).set(new.as_gauge());
        counter!(
            "tripwire_circuit_transitions_total",
            "circuit" => name.to_string(),
            "to" => new.to_string()
        )
        .increment(1);
    }

    fn on_store_error(&self, name: &str, error: &BreakerError) {
        warn!(circuit = name, error = %error, "Store error absorbed");
        counter!("tripwire_store_errors_total", "circuit" => name.to_string()).increment(1);
    }
}

/// Notification as delivered by [`ChannelNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChange {
        name: String,
        old: CircuitState,
        new: CircuitState,
    },
    StoreError {
        name: String,
        message: String,
    },
}

/// Forwards notifications into a bounded channel, dropping them when full
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    fn send(&self, notification: Notification) {
        if let Err(e) = self.sender.try_send(notification) {
            warn!(error = %e, "Dropping circuit notification");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn on_state_change(&self, name: &str, old: CircuitState, new: CircuitState) {
        self.send(Notification::StateChange {
            name: name.to_string(),
            old,
            new,
        });
    }

    fn on_store_error(&self, name: &str, error: &BreakerError) {
        self.send(Notification::StoreError {
            name: name.to_string(),
            message: error.to_string(),
        });
    }
}

/// Delivers every notification to each inner notifier in turn
#[derive(Debug, Clone, Default)]
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn on_state_change(&self, name: &str, old: CircuitState, new: CircuitState) {
        for notifier in &self.notifiers {
            notifier.on_state_change(name, old, new);
        }
    }

    fn on_store_error(&self, name: &str, error: &BreakerError) {
        for notifier in &self.notifiers {
            notifier.on_store_error(name, error);
        }
    }
}
