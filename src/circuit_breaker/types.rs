use crate::error::{BreakerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally
    Green,
    /// Circuit is open, calls get the fallback
    Red,
    /// Circuit is open but cooled off; one call at a time may probe
    Probe,
    /// Manually closed, failures are ignored
    ForcedGreen,
    /// Manually opened, every call gets the fallback
    ForcedRed,
}

impl CircuitState {
    /// Whether the protected operation runs without a probe slot
    pub fn is_permissive(&self) -> bool {
        matches!(self, CircuitState::Green | CircuitState::ForcedGreen)
    }

    /// Numeric encoding used for the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Green => 0.0,
            CircuitState::Red => 1.0,
            CircuitState::Probe => 2.0,
            CircuitState::ForcedGreen => 3.0,
            CircuitState::ForcedRed => 4.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Green => write!(f, "GREEN"),
            CircuitState::Red => write!(f, "RED"),
            CircuitState::Probe => write!(f, "PROBE"),
            CircuitState::ForcedGreen => write!(f, "FORCED_GREEN"),
            CircuitState::ForcedRed => write!(f, "FORCED_RED"),
        }
    }
}

/// Manual override persisted in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedState {
    Open,
    Closed,
}

impl ForcedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForcedState::Open => "open",
            ForcedState::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ForcedState::Open),
            "closed" => Some(ForcedState::Closed),
            _ => None,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self {
            ForcedState::Open => CircuitState::ForcedRed,
            ForcedState::Closed => CircuitState::ForcedGreen,
        }
    }
}

/// Policy deciding when a closed circuit opens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TrafficControl {
    /// Open once `threshold` failures fall inside the window
    Consecutive,
    /// Open once the failure ratio reaches `rate_threshold` over at least
    /// `minimum_sample_size` calls
    Rate {
        rate_threshold: f64,
        minimum_sample_size: u32,
    },
}

impl Default for TrafficControl {
    fn default() -> Self {
        TrafficControl::Consecutive
    }
}

/// Policy deciding when a probing circuit closes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TrafficRecovery {
    /// Close after `recovery_threshold` successful probes in a row
    Consecutive,
    /// Close once `recovery_threshold` probes are in the window and at least
    /// `success_rate` of them succeeded
    Rate { success_rate: f64 },
}

impl Default for TrafficRecovery {
    fn default() -> Self {
        TrafficRecovery::Consecutive
    }
}

/// Normalized circuit configuration
///
/// Field order is the canonical order; [`CircuitConfig::canonical`] relies on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Failures inside the window that open the circuit (consecutive policy)
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Seconds a circuit stays open after its latest failure before probing
    #[serde(default = "default_cool_off_secs")]
    pub cool_off_secs: u64,

    /// Successful probes needed to close
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    #[serde(default)]
    pub traffic_control: TrafficControl,

    #[serde(default)]
    pub traffic_recovery: TrafficRecovery,

    /// Lease length of the recovery lock, in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    300
}

fn default_cool_off_secs() -> u64 {
    60
}

fn default_recovery_threshold() -> u32 {
    1
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window_secs: default_window_secs(),
            cool_off_secs: default_cool_off_secs(),
            recovery_threshold: default_recovery_threshold(),
            traffic_control: TrafficControl::default(),
            traffic_recovery: TrafficRecovery::default(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cool_off(&self) -> Duration {
        Duration::from_secs(self.cool_off_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Whether success records are kept outside of probes
    pub fn tracks_successes(&self) -> bool {
        matches!(self.traffic_control, TrafficControl::Rate { .. })
    }

    /// Upper bound on stored records, if the policy allows one
    pub fn retention(&self) -> Option<usize> {
        match self.traffic_control {
            TrafficControl::Consecutive => Some(self.threshold.max(1) as usize),
            TrafficControl::Rate { .. } => None,
        }
    }

    /// Stable JSON rendering used for comparison and error messages
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(BreakerError::Config(
                "Circuit threshold must be > 0".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(BreakerError::Config(
                "Circuit window must be > 0".to_string(),
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(BreakerError::Config(
                "Circuit recovery threshold must be > 0".to_string(),
            ));
        }
        if self.probe_timeout_secs == 0 {
            return Err(BreakerError::Config(
                "Circuit probe timeout must be > 0".to_string(),
            ));
        }
        if let TrafficControl::Rate {
            rate_threshold,
            minimum_sample_size,
        } = self.traffic_control
        {
            if !(rate_threshold > 0.0 && rate_threshold <= 1.0) {
                return Err(BreakerError::Config(format!(
                    "Rate threshold must be in (0, 1], got {}",
                    rate_threshold
                )));
            }
            if minimum_sample_size == 0 {
                return Err(BreakerError::Config(
                    "Minimum sample size must be > 0".to_string(),
                ));
            }
        }
        if let TrafficRecovery::Rate { success_rate } = self.traffic_recovery {
            if !(success_rate > 0.0 && success_rate <= 1.0) {
                return Err(BreakerError::Config(format!(
                    "Recovery success rate must be in (0, 1], got {}",
                    success_rate
                )));
            }
        }
        Ok(())
    }
}

/// Requested circuit settings; unset fields take the root's defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default)]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub cool_off_secs: Option<u64>,
    #[serde(default)]
    pub recovery_threshold: Option<u32>,
    #[serde(default)]
    pub traffic_control: Option<TrafficControl>,
    #[serde(default)]
    pub traffic_recovery: Option<TrafficRecovery>,
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
}

impl CircuitSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(mut self, threshold: u32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn window_secs(mut self, secs: u64) -> Self {
        self.window_secs = Some(secs);
        self
    }

    pub fn cool_off_secs(mut self, secs: u64) -> Self {
        self.cool_off_secs = Some(secs);
        self
    }

    pub fn recovery_threshold(mut self, threshold: u32) -> Self {
        self.recovery_threshold = Some(threshold);
        self
    }

    pub fn traffic_control(mut self, policy: TrafficControl) -> Self {
        self.traffic_control = Some(policy);
        self
    }

    pub fn traffic_recovery(mut self, policy: TrafficRecovery) -> Self {
        self.traffic_recovery = Some(policy);
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = Some(secs);
        self
    }

    /// No field was set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill unset fields from `defaults`
    pub fn normalize(&self, defaults: &CircuitConfig) -> CircuitConfig {
        CircuitConfig {
            threshold: self.threshold.unwrap_or(defaults.threshold),
            window_secs: self.window_secs.unwrap_or(defaults.window_secs),
            cool_off_secs: self.cool_off_secs.unwrap_or(defaults.cool_off_secs),
            recovery_threshold: self
                .recovery_threshold
                .unwrap_or(defaults.recovery_threshold),
            traffic_control: self.traffic_control.unwrap_or(defaults.traffic_control),
            traffic_recovery: self.traffic_recovery.unwrap_or(defaults.traffic_recovery),
            probe_timeout_secs: self
                .probe_timeout_secs
                .unwrap_or(defaults.probe_timeout_secs),
        }
    }
}

impl From<CircuitConfig> for CircuitSettings {
    fn from(config: CircuitConfig) -> Self {
        Self {
            threshold: Some(config.threshold),
            window_secs: Some(config.window_secs),
            cool_off_secs: Some(config.cool_off_secs),
            recovery_threshold: Some(config.recovery_threshold),
            traffic_control: Some(config.traffic_control),
            traffic_recovery: Some(config.traffic_recovery),
            probe_timeout_secs: Some(config.probe_timeout_secs),
        }
    }
}
