use super::types::{CircuitConfig, CircuitState, ForcedState, TrafficControl, TrafficRecovery};
use crate::clock::elapsed_between;
use crate::metrics_store::WindowSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a failed store read is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Treat the circuit as having no recorded failures
    #[default]
    FailOpen,
    /// Treat the circuit as tripped
    FailClosed,
}

/// Outcome of asking the coordinator for a probe slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeGrant {
    /// No slot was requested; the caller is only observing
    NotRequested,
    Granted,
    Denied,
}

/// Inputs to one evaluation
#[derive(Debug, Clone)]
pub struct Evaluation<'a> {
    pub config: &'a CircuitConfig,
    /// `None` when the store could not be read
    pub snapshot: Option<&'a WindowSnapshot>,
    pub now: DateTime<Utc>,
    pub forced: Option<ForcedState>,
    pub grant: ProbeGrant,
    pub failure_policy: StoreFailurePolicy,
}

/// Pure state derivation
pub struct StateEvaluator;

impl StateEvaluator {
    pub fn evaluate(input: &Evaluation<'_>) -> CircuitState {
        if let Some(forced) = input.forced {
            return forced.state();
        }

        let Some(snapshot) = input.snapshot else {
            return match input.failure_policy {
                StoreFailurePolicy::FailOpen => CircuitState::Green,
                StoreFailurePolicy::FailClosed => CircuitState::Red,
            };
        };

        if !Self::is_open(input.config, snapshot) {
            return CircuitState::Green;
        }

        if !Self::cool_off_elapsed(input.config, snapshot, input.now) {
            return CircuitState::Red;
        }

        match input.grant {
            ProbeGrant::NotRequested | ProbeGrant::Granted => CircuitState::Probe,
            ProbeGrant::Denied => CircuitState::Red,
        }
    }

    /// Whether the circuit is open: tripped, or recovering
    ///
    /// Probe records only exist between a trip and the reset that follows
    /// recovery, so any probe in the window keeps the circuit out of `Green`.
    pub fn is_open(config: &CircuitConfig, snapshot: &WindowSnapshot) -> bool {
        snapshot.probes > 0 || Self::is_tripped(config, snapshot)
    }

    /// Whether the window holds enough failures to open the circuit
    ///
    /// The rate policy only looks at regular traffic; probe outcomes never
    /// move the ratio.
    pub fn is_tripped(config: &CircuitConfig, snapshot: &WindowSnapshot) -> bool {
        match config.traffic_control {
            TrafficControl::Consecutive => snapshot.failures >= config.threshold as u64,
            TrafficControl::Rate {
                rate_threshold,
                minimum_sample_size,
            } => {
                let failures = snapshot.failures.saturating_sub(snapshot.probe_failures());
                let total = snapshot.total().saturating_sub(snapshot.probes);
                if total == 0 || total < minimum_sample_size as u64 {
                    return false;
                }
                failures as f64 / total as f64 >= rate_threshold
            }
        }
    }

    /// Whether the newest failure is at least `cool_off` old
    pub fn cool_off_elapsed(
        config: &CircuitConfig,
        snapshot: &WindowSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        match snapshot.last_failure_at {
            Some(last_failure) => elapsed_between(last_failure, now) >= config.cool_off(),
            None => true,
        }
    }

    /// Whether the probes so far are enough to close the circuit
    pub fn is_recovered(config: &CircuitConfig, snapshot: &WindowSnapshot) -> bool {
        let required = config.recovery_threshold.max(1) as u64;
        match config.traffic_recovery {
            TrafficRecovery::Consecutive => snapshot.probe_streak >= required,
            TrafficRecovery::Rate { success_rate } => {
                snapshot.probes >= required
                    && snapshot.probe_successes as f64 / snapshot.probes as f64 >= success_rate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    fn evaluate(
        config: &CircuitConfig,
        snapshot: Option<&WindowSnapshot>,
        now: DateTime<Utc>,
        grant: ProbeGrant,
    ) -> CircuitState {
        StateEvaluator::evaluate(&Evaluation {
            config,
            snapshot,
            now,
            forced: None,
            grant,
            failure_policy: StoreFailurePolicy::FailOpen,
        })
    }

    #[test]
    fn test_green_below_threshold() {
        let config = CircuitConfig {
            threshold: 2,
            ..Default::default()
        };
        let clock = ManualClock::at_epoch();
        let snapshot = WindowSnapshot {
            failures: 1,
            last_failure_at: Some(clock.now()),
            ..Default::default()
        };
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::NotRequested),
            CircuitState::Green
        );
    }

    #[test]
    fn test_red_until_cool_off_then_probe() {
        let config = CircuitConfig {
            threshold: 2,
            cool_off_secs: 60,
            ..Default::default()
        };
        let clock = ManualClock::at_epoch();
        let snapshot = WindowSnapshot {
            failures: 2,
            last_failure_at: Some(clock.now()),
            ..Default::default()
        };

        clock.advance(Duration::from_secs(59));
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::Granted),
            CircuitState::Red
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::NotRequested),
            CircuitState::Probe
        );
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::Granted),
            CircuitState::Probe
        );
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::Denied),
            CircuitState::Red
        );
    }

    #[test]
    fn test_rate_policy_needs_minimum_sample() {
        let config = CircuitConfig {
            traffic_control: TrafficControl::Rate {
                rate_threshold: 0.3,
                minimum_sample_size: 10,
            },
            ..Default::default()
        };

        let tripped = WindowSnapshot {
            failures: 3,
            successes: 7,
            ..Default::default()
        };
        assert!(StateEvaluator::is_tripped(&config, &tripped));

        let healthy = WindowSnapshot {
            failures: 2,
            successes: 8,
            ..Default::default()
        };
        assert!(!StateEvaluator::is_tripped(&config, &healthy));

        let too_few = WindowSnapshot {
            failures: 3,
            successes: 0,
            ..Default::default()
        };
        assert!(!StateEvaluator::is_tripped(&config, &too_few));
    }

    #[test]
    fn test_rate_trip_ignores_recovery_attempts() {
        let config = CircuitConfig {
            cool_off_secs: 60,
            recovery_threshold: 3,
            traffic_control: TrafficControl::Rate {
                rate_threshold: 0.3,
                minimum_sample_size: 10,
            },
            ..Default::default()
        };
        let clock = ManualClock::at_epoch();
        let mut snapshot = WindowSnapshot {
            failures: 3,
            successes: 8,
            last_failure_at: Some(clock.now()),
            probe_streak: 1,
            probes: 1,
            probe_successes: 1,
        };
        assert!(StateEvaluator::is_tripped(&config, &snapshot));

        clock.advance(Duration::from_secs(60));
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::NotRequested),
            CircuitState::Probe
        );

        // Regular traffic alone would no longer trip, but recovery is unfinished
        snapshot.successes = 20;
        assert!(!StateEvaluator::is_tripped(&config, &snapshot));
        assert!(StateEvaluator::is_open(&config, &snapshot));
        assert_eq!(
            evaluate(&config, Some(&snapshot), clock.now(), ProbeGrant::Granted),
            CircuitState::Probe
        );
    }

    #[test]
    fn test_forced_overrides_everything() {
        let config = CircuitConfig::default();
        let clock = ManualClock::at_epoch();
        let state = StateEvaluator::evaluate(&Evaluation {
            config: &config,
            snapshot: None,
            now: clock.now(),
            forced: Some(ForcedState::Open),
            grant: ProbeGrant::Granted,
            failure_policy: StoreFailurePolicy::FailOpen,
        });
        assert_eq!(state, CircuitState::ForcedRed);
    }

    #[test]
    fn test_store_failure_policy() {
        let config = CircuitConfig::default();
        let clock = ManualClock::at_epoch();
        let mut input = Evaluation {
            config: &config,
            snapshot: None,
            now: clock.now(),
            forced: None,
            grant: ProbeGrant::NotRequested,
            failure_policy: StoreFailurePolicy::FailOpen,
        };
        assert_eq!(StateEvaluator::evaluate(&input), CircuitState::Green);

        input.failure_policy = StoreFailurePolicy::FailClosed;
        assert_eq!(StateEvaluator::evaluate(&input), CircuitState::Red);
    }

    #[test]
    fn test_recovery_policies() {
        let consecutive = CircuitConfig {
            recovery_threshold: 2,
            ..Default::default()
        };
        let snapshot = WindowSnapshot {
            probe_streak: 1,
            probes: 3,
            probe_successes: 2,
            ..Default::default()
        };
        assert!(!StateEvaluator::is_recovered(&consecutive, &snapshot));

        let rate = CircuitConfig {
            recovery_threshold: 3,
            traffic_recovery: TrafficRecovery::Rate { success_rate: 0.6 },
            ..Default::default()
        };
        assert!(StateEvaluator::is_recovered(&rate, &snapshot));
    }
}
