use super::breaker::Circuit;
use super::options::CallOptions;
use crate::error::CallError;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer that routes every request of the wrapped service through a circuit
pub struct CircuitLayer<E> {
    circuit: Arc<Circuit>,
    options: Arc<CallOptions<E>>,
}

impl<E> CircuitLayer<E> {
    pub fn new(circuit: Arc<Circuit>) -> Self {
        Self::with_options(circuit, CallOptions::default())
    }

    pub fn with_options(circuit: Arc<Circuit>, options: CallOptions<E>) -> Self {
        Self {
            circuit,
            options: Arc::new(options),
        }
    }
}

impl<E> Clone for CircuitLayer<E> {
    fn clone(&self) -> Self {
        Self {
            circuit: self.circuit.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S, E> Layer<S> for CircuitLayer<E> {
    type Service = CircuitService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitService {
            inner,
            circuit: self.circuit.clone(),
            options: self.options.clone(),
        }
    }
}

/// Service produced by [`CircuitLayer`]
///
/// A rejected request never reaches the inner service.
pub struct CircuitService<S, E> {
    inner: S,
    circuit: Arc<Circuit>,
    options: Arc<CallOptions<E>>,
}

impl<S, E> CircuitService<S, E> {
    pub fn new(inner: S, circuit: Arc<Circuit>, options: CallOptions<E>) -> Self {
        Self {
            inner,
            circuit,
            options: Arc::new(options),
        }
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }
}

impl<S: Clone, E> Clone for CircuitService<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            circuit: self.circuit.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S, Req> Service<Req> for CircuitService<S, S::Error>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = CallError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(CallError::Operation)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let circuit = self.circuit.clone();
        let options = self.options.clone();

        Box::pin(async move { circuit.execute(move || inner.call(req), &options).await })
    }
}
