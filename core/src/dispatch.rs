//! In-process dispatcher: fan-out of envelopes to registered handlers.
//!
//! The dispatcher looks up every handler registered for an envelope's event
//! type and invokes them under one of two strategies:
//!
//! - [`DispatchStrategy::WhenAll`] (default): all matching handlers run
//!   concurrently; the call completes when every handler has finished, and
//!   all failures are collected. One failing handler never prevents the
//!   others from running to completion.
//! - [`DispatchStrategy::Sequential`]: handlers run one at a time in
//!   registration order; the first failure short-circuits the rest.
//!
//! Zero registered handlers is not an error — dispatch returns success with
//! `invoked == 0`. Handler panics are caught at the dispatch boundary (each
//! handler runs in its own task, and a panicked join becomes
//! [`HandlerError::Panicked`]); they never take down the calling loop.
//!
//! # Example
//!
//! ```
//! use carrier_core::dispatch::{Dispatcher, DispatchStrategy, Handler, HandlerError};
//! use carrier_core::envelope::{Envelope, Headers};
//! use std::future::Future;
//! use std::pin::Pin;
//! use std::sync::Arc;
//!
//! struct LogHandler;
//!
//! impl Handler for LogHandler {
//!     fn name(&self) -> &str {
//!         "log"
//!     }
//!
//!     fn handle(
//!         &self,
//!         envelope: Envelope,
//!     ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>> {
//!         Box::pin(async move {
//!             println!("got {}", envelope.event_type);
//!             Ok(())
//!         })
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::new(DispatchStrategy::WhenAll);
//! dispatcher.register("OrderPlaced", Arc::new(LogHandler));
//!
//! let envelope = Envelope::new("OrderPlaced", vec![], Headers::new());
//! let result = dispatcher.dispatch(&envelope).await;
//! assert!(result.is_success());
//! assert_eq!(result.invoked, 1);
//! # }
//! ```

use crate::envelope::Envelope;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors produced by a single handler invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the panic was contained at the dispatch
    /// boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// A capability that consumes one envelope and reports success or failure.
///
/// The envelope is passed by value: handler futures are `'static` so the
/// dispatcher can run them as independent tasks (which is also how panics
/// are contained).
pub trait Handler: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str {
        "handler"
    }

    /// Consume one envelope.
    fn handle(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;
}

/// Execution strategy for multi-handler fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// All matching handlers run concurrently; failures are aggregated.
    #[default]
    WhenAll,
    /// Handlers run in registration order; the first failure short-circuits.
    Sequential,
}

/// One handler's failure within a dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Name of the failing handler.
    pub handler: String,
    /// The error it produced.
    pub error: HandlerError,
}

/// Outcome of a dispatch call.
///
/// Handler failures are captured here rather than propagated: a dispatch
/// call itself never fails, so receive loops cannot be crashed by a bad
/// handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    /// Number of handlers that were invoked.
    pub invoked: usize,
    /// Failures collected during the call (at most one under
    /// [`DispatchStrategy::Sequential`]).
    pub failures: Vec<HandlerFailure>,
}

impl DispatchResult {
    /// Whether every invoked handler succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry plus fan-out engine for local event handlers.
///
/// Registration is additive: multiple handlers may register for the same
/// event type and are never replaced. Registration order is preserved, which
/// makes sequential fan-out deterministic.
pub struct Dispatcher {
    strategy: DispatchStrategy,
    registry: RwLock<HashMap<String, Vec<Arc<dyn Handler>>>>,
}

impl Dispatcher {
    /// Create a dispatcher with the given strategy.
    #[must_use]
    pub fn new(strategy: DispatchStrategy) -> Self {
        Self {
            strategy,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// The configured strategy.
    #[must_use]
    pub const fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// Register a handler for an event type. Additive, never replacing.
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let event_type = event_type.into();
        let mut registry = match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.entry(event_type).or_default().push(handler);
    }

    /// Number of handlers registered for an event type.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        let registry = match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.get(event_type).map_or(0, Vec::len)
    }

    /// Fan an envelope out to every handler registered for its event type.
    ///
    /// Returns a [`DispatchResult`]; this call never fails and never
    /// panics, regardless of handler behavior.
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchResult {
        let handlers: Vec<Arc<dyn Handler>> = {
            let registry = match self.registry.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            registry
                .get(&envelope.event_type)
                .cloned()
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            tracing::trace!(
                event_type = %envelope.event_type,
                envelope_id = %envelope.id,
                "No handlers registered, dispatch is a no-op"
            );
            return DispatchResult::default();
        }

        match self.strategy {
            DispatchStrategy::WhenAll => Self::dispatch_when_all(&handlers, envelope).await,
            DispatchStrategy::Sequential => Self::dispatch_sequential(&handlers, envelope).await,
        }
    }

    async fn dispatch_when_all(handlers: &[Arc<dyn Handler>], envelope: &Envelope) -> DispatchResult {
        // Spawn every handler, then join all of them: the aggregate result
        // and the completion point are both deterministic, and a panicked
        // task is contained at its join.
        let tasks: Vec<(String, tokio::task::JoinHandle<Result<(), HandlerError>>)> = handlers
            .iter()
            .map(|handler| {
                let name = handler.name().to_string();
                let future = handler.handle(envelope.clone());
                (name, tokio::spawn(future))
            })
            .collect();

        let mut result = DispatchResult {
            invoked: tasks.len(),
            failures: Vec::new(),
        };

        for (name, task) in tasks {
            if let Some(failure) = Self::join_outcome(name, task.await) {
                result.failures.push(failure);
            }
        }

        if !result.is_success() {
            tracing::warn!(
                event_type = %envelope.event_type,
                envelope_id = %envelope.id,
                invoked = result.invoked,
                failed = result.failures.len(),
                "Dispatch completed with handler failures"
            );
        }

        result
    }

    async fn dispatch_sequential(
        handlers: &[Arc<dyn Handler>],
        envelope: &Envelope,
    ) -> DispatchResult {
        let mut result = DispatchResult::default();

        for handler in handlers {
            let name = handler.name().to_string();
            let task = tokio::spawn(handler.handle(envelope.clone()));
            result.invoked += 1;

            if let Some(failure) = Self::join_outcome(name, task.await) {
                tracing::warn!(
                    event_type = %envelope.event_type,
                    envelope_id = %envelope.id,
                    handler = %failure.handler,
                    error = %failure.error,
                    "Sequential dispatch short-circuited"
                );
                result.failures.push(failure);
                break;
            }
        }

        result
    }

    fn join_outcome(
        name: String,
        joined: Result<Result<(), HandlerError>, tokio::task::JoinError>,
    ) -> Option<HandlerFailure> {
        match joined {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(HandlerFailure {
                handler: name,
                error,
            }),
            Err(join_error) => Some(HandlerFailure {
                handler: name,
                error: HandlerError::Panicked(join_error.to_string()),
            }),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchStrategy::default())
    }
}
