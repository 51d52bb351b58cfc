pub mod breaker;
pub mod evaluator;
pub mod layer;
pub mod options;
pub mod registry;
pub mod service;
pub mod types;

pub use breaker::Circuit;
pub use evaluator::{Evaluation, ProbeGrant, StateEvaluator, StoreFailurePolicy};
pub use layer::{CircuitLayer, CircuitService};
pub use options::{CallOptions, ErrorClass};
pub use registry::Registry;
pub use service::{BreakerSystem, BreakerSystemBuilder};
pub use types::{
    CircuitConfig, CircuitSettings, CircuitState, ForcedState, TrafficControl, TrafficRecovery,
};
