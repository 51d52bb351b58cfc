use thiserror::Error;

/// Result type for breaker operations
pub type Result<T> = std::result::Result<T, BreakerError>;

/// Breaker error types
#[derive(Error, Debug)]
pub enum BreakerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Configuration conflict for circuit '{name}': existing {existing}, requested {requested}"
    )]
    ConfigurationConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BreakerError {
    /// Whether the error is reported to callers synchronously, as opposed to
    /// being absorbed and routed to the notifier
    pub fn is_caller_visible(&self) -> bool {
        !matches!(self, BreakerError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for BreakerError {
    fn from(err: redis::RedisError) -> Self {
        BreakerError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for BreakerError {
    fn from(err: serde_json::Error) -> Self {
        BreakerError::Serialization(err.to_string())
    }
}

/// Error returned from a protected call
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The circuit rejected the call and no fallback was supplied
    #[error("Circuit '{name}' is open")]
    Open { name: String },

    /// The protected operation ran and failed
    #[error("Operation failed: {0}")]
    Operation(E),

    /// The circuit rejected the call and the fallback failed
    #[error("Fallback failed: {0}")]
    Fallback(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    /// The inner error of the operation or fallback, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Open { .. } => None,
            CallError::Operation(e) | CallError::Fallback(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BreakerError::CircuitOpen {
            name: "payments".to_string(),
        };
        assert_eq!(err.to_string(), "Circuit 'payments' is open");

        let err = BreakerError::ConfigurationConflict {
            name: "api".to_string(),
            existing: "{\"threshold\":5}".to_string(),
            requested: "{\"threshold\":10}".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("'api'"));
        assert!(message.contains("\"threshold\":5"));
        assert!(message.contains("\"threshold\":10"));
    }

    #[test]
    fn test_store_errors_are_absorbed() {
        assert!(!BreakerError::StoreUnavailable("down".to_string()).is_caller_visible());
        assert!(BreakerError::CircuitOpen {
            name: "x".to_string()
        }
        .is_caller_visible());
    }

    #[test]
    fn test_call_error_inner() {
        let err: CallError<String> = CallError::Operation("boom".to_string());
        assert!(!err.is_open());
        assert_eq!(err.into_inner(), Some("boom".to_string()));

        let err: CallError<String> = CallError::Open {
            name: "api".to_string(),
        };
        assert!(err.is_open());
        assert_eq!(err.into_inner(), None);
    }
}
