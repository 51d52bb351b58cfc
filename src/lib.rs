//! Named circuit breakers over a sliding failure window
//!
//! A [`BreakerSystem`] binds each circuit name to one configuration and one set
//! of shared infrastructure: a [`store::Store`] holding outcome history, a
//! [`recovery::RecoveryLock`] serializing recovery probes, a
//! [`notify::Notifier`] and a [`clock::Clock`]. Callers run their operations
//! through the [`Circuit`] handles it hands out.
//!
//! ```no_run
//! use tripwire::{BreakerSystem, CallOptions, CircuitSettings};
//!
//! # async fn run() -> tripwire::Result<()> {
//! let system = BreakerSystem::new("checkout")?;
//! let payments = system.get_or_create("payments", &CircuitSettings::new().threshold(3))?;
//!
//! let receipt = payments
//!     .execute_or_else(
//!         || async { Ok::<_, std::io::Error>("charged") },
//!         || async { Ok("queued for retry") },
//!         &CallOptions::default(),
//!     )
//!     .await;
//! # let _ = receipt;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics_store;
pub mod notify;
pub mod recovery;
pub mod store;
pub mod telemetry;

pub use circuit_breaker::{
    BreakerSystem, CallOptions, Circuit, CircuitConfig, CircuitLayer, CircuitSettings,
    CircuitState, Registry, StoreFailurePolicy,
};
pub use config::SystemConfig;
pub use error::{BreakerError, CallError, Result};
