use crate::circuit_breaker::evaluator::StoreFailurePolicy;
use crate::circuit_breaker::types::{CircuitConfig, CircuitSettings};
use crate::error::{BreakerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Breaker system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System name, used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Settings for circuits that do not specify their own
    #[serde(default)]
    pub defaults: CircuitConfig,
    /// Where outcome history and recovery leases live
    #[serde(default)]
    pub backend: BackendConfig,
    /// How a failed store read is treated
    #[serde(default)]
    pub store_failure_policy: StoreFailurePolicy,
    /// Circuits registered at startup
    #[serde(default)]
    pub circuits: Vec<CircuitEntry>,
}

/// Backing store selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process state, not shared with other processes
    #[default]
    Memory,
    /// Redis state shared by every process using the same prefix
    Redis {
        /// Redis connection URL
        url: String,
        /// Key prefix
        #[serde(default = "default_redis_prefix")]
        prefix: String,
    },
}

/// Circuit registered from configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitEntry {
    pub name: String,
    #[serde(default)]
    pub settings: CircuitSettings,
}

fn default_name() -> String {
    "tripwire".to_string()
}

fn default_redis_prefix() -> String {
    "tripwire".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            defaults: CircuitConfig::default(),
            backend: BackendConfig::default(),
            store_failure_policy: StoreFailurePolicy::default(),
            circuits: Vec::new(),
        }
    }
}

impl SystemConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BreakerError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BreakerError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BreakerError::Config(
                "System name cannot be empty".to_string(),
            ));
        }

        self.defaults.validate()?;

        if let BackendConfig::Redis { url, prefix } = &self.backend {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(BreakerError::Config(format!(
                    "Redis URL must start with redis:// or rediss://, got: {}",
                    url
                )));
            }
            if prefix.is_empty() {
                return Err(BreakerError::Config(
                    "Redis key prefix cannot be empty".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for circuit in &self.circuits {
            if circuit.name.is_empty() {
                return Err(BreakerError::Config(
                    "Circuit name cannot be empty".to_string(),
                ));
            }
            // Two entries for one name would conflict at startup
            if !seen.insert(circuit.name.as_str()) {
                return Err(BreakerError::Config(format!(
                    "Circuit '{}' is configured more than once",
                    circuit.name
                )));
            }
            circuit
                .settings
                .normalize(&self.defaults)
                .validate()
                .map_err(|e| BreakerError::Config(format!("Circuit '{}': {}", circuit.name, e)))?;
        }

        Ok(())
    }
}
