//! Logging and metrics setup for applications embedding the breakers

use crate::error::{BreakerError, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "tripwire=debug";

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Install the global tracing subscriber
///
/// The filter comes from `RUST_LOG`, falling back to `tripwire=debug`.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let installed = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .try_init(),
    };
    installed.map_err(|e| BreakerError::Config(format!("Failed to install tracing: {}", e)))?;

    info!(format = ?format, "Tracing initialized");
    Ok(())
}

/// Prometheus exposition of the breaker metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

impl MetricsService {
    /// Install a global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            BreakerError::Config(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();
        info!("Metrics service initialized");

        Ok(Self::from_handle(handle))
    }

    /// Wrap a handle whose recorder was installed elsewhere
    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Register all metrics with descriptions
    pub fn register_metrics() {
        describe_gauge!(
            "tripwire_circuit_state",
            "Circuit state (0 = green, 1 = red, 2 = probe, 3 = forced green, 4 = forced red)"
        );
        describe_counter!(
            "tripwire_circuit_transitions_total",
            "Total number of circuit state transitions"
        );
        describe_counter!(
            "tripwire_store_errors_total",
            "Store and lock errors absorbed by circuits"
        );
        describe_counter!(
            "tripwire_calls_total",
            "Protected calls that ran, by outcome"
        );
        describe_counter!(
            "tripwire_rejected_total",
            "Calls rejected while a circuit was open"
        );

        debug!("Breaker metrics registered with descriptions");
    }

    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
