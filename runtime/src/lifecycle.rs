//! Lifecycle coordinator: starts and stops delivery components with the
//! host process.
//!
//! Components (subscribers, then the outbox processor) are registered in
//! start order. `start_all` runs when the host becomes ready and fails fast
//! on the first start error — configuration problems surface before
//! anything begins consuming. `shutdown` stops components in reverse order,
//! each bounded by its own timeout; a component that will not stop in time
//! is logged and force-released without blocking the others.
//!
//! The coordinator also exposes a status surface: repeated subscriber
//! connection failures show up as [`ComponentStatus::Failed`] here rather
//! than crashing the host.

use carrier_core::transport::{ComponentStatus, Subscriber};
use crate::processor::OutboxProcessor;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors from lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A component failed to start; startup is aborted.
    #[error("component '{component}' failed to start: {reason}")]
    StartFailed {
        /// The component.
        component: String,
        /// Why it failed.
        reason: String,
    },

    /// A component did not stop within its timeout and was force-released.
    #[error("component '{component}' did not stop within its timeout")]
    StopTimeout {
        /// The component.
        component: String,
    },

    /// A component reported an error while stopping.
    #[error("component '{component}' failed to stop: {reason}")]
    StopFailed {
        /// The component.
        component: String,
        /// Why it failed.
        reason: String,
    },
}

/// Boxed future alias used by the component contract.
pub type LifecycleFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + 'a>>;

/// A start/stoppable delivery component managed by the coordinator.
pub trait Component: Send + Sync {
    /// Name used in logs and status reports.
    fn name(&self) -> &str;

    /// Current observable state.
    fn status(&self) -> ComponentStatus;

    /// Start the component.
    fn start(&self) -> LifecycleFuture<'_>;

    /// Stop the component, draining in-flight work up to `grace`.
    fn stop(&self, grace: Duration) -> LifecycleFuture<'_>;
}

/// Adapter presenting any [`Subscriber`] as a [`Component`].
pub struct SubscriberComponent {
    inner: Arc<dyn Subscriber>,
}

impl SubscriberComponent {
    /// Wrap a subscriber.
    #[must_use]
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self { inner: subscriber }
    }
}

impl Component for SubscriberComponent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn status(&self) -> ComponentStatus {
        self.inner.status()
    }

    fn start(&self) -> LifecycleFuture<'_> {
        Box::pin(async move {
            self.inner.start().await.map_err(|e| LifecycleError::StartFailed {
                component: self.inner.name().to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn stop(&self, grace: Duration) -> LifecycleFuture<'_> {
        Box::pin(async move {
            self.inner.stop(grace).await.map_err(|e| LifecycleError::StopFailed {
                component: self.inner.name().to_string(),
                reason: e.to_string(),
            })
        })
    }
}

/// Adapter presenting the [`OutboxProcessor`] as a [`Component`].
///
/// `start` spawns the processor loop; `stop` signals shutdown and waits for
/// the loop to finish, aborting the task if the grace period elapses.
pub struct ProcessorComponent {
    name: String,
    processor: Mutex<Option<OutboxProcessor>>,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
    status: Mutex<ComponentStatus>,
}

impl ProcessorComponent {
    /// Wrap a processor and its shutdown sender (as returned by
    /// [`OutboxProcessor::new`]).
    #[must_use]
    pub fn new(processor: OutboxProcessor, shutdown: watch::Sender<bool>) -> Self {
        Self {
            name: "outbox-processor".to_string(),
            processor: Mutex::new(Some(processor)),
            shutdown,
            join: Mutex::new(None),
            status: Mutex::new(ComponentStatus::Idle),
        }
    }

    fn set_status(&self, status: ComponentStatus) {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = status;
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Component for ProcessorComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ComponentStatus {
        Self::lock(&self.status).clone()
    }

    fn start(&self) -> LifecycleFuture<'_> {
        Box::pin(async move {
            let processor = Self::lock(&self.processor).take();
            let Some(processor) = processor else {
                return Err(LifecycleError::StartFailed {
                    component: self.name.clone(),
                    reason: "already started".to_string(),
                });
            };

            let handle = tokio::spawn(processor.run());
            *Self::lock(&self.join) = Some(handle);
            self.set_status(ComponentStatus::Running);
            Ok(())
        })
    }

    fn stop(&self, grace: Duration) -> LifecycleFuture<'_> {
        Box::pin(async move {
            self.shutdown.send(true).ok();

            let handle = Self::lock(&self.join).take();
            let Some(handle) = handle else {
                self.set_status(ComponentStatus::Stopped);
                return Ok(());
            };

            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => {
                    self.set_status(ComponentStatus::Stopped);
                    Ok(())
                }
                Err(_) => {
                    abort.abort();
                    self.set_status(ComponentStatus::Failed(
                        "did not stop within the grace period".to_string(),
                    ));
                    Err(LifecycleError::StopTimeout {
                        component: self.name.clone(),
                    })
                }
            }
        })
    }
}

/// Starts and stops registered components in step with the host lifetime.
pub struct LifecycleCoordinator {
    components: Vec<Arc<dyn Component>>,
    stop_timeout: Duration,
}

impl LifecycleCoordinator {
    /// Default per-component stop timeout.
    pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Extra time the outer watchdog allows beyond the grace period passed
    /// to `stop`, so a component that drains right at its deadline is not
    /// misreported as timed out.
    const STOP_HEADROOM: Duration = Duration::from_millis(250);

    /// Create an empty coordinator with the default stop timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            components: Vec::new(),
            stop_timeout: Self::DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Set the per-component stop timeout.
    #[must_use]
    pub const fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Register a component. Start order is registration order; stop order
    /// is the reverse.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        self.components.push(component);
    }

    /// Register a subscriber, wrapped as a component.
    pub fn register_subscriber(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.register(Arc::new(SubscriberComponent::new(subscriber)));
    }

    /// Start every component in registration order.
    ///
    /// # Errors
    ///
    /// Fails fast with the first [`LifecycleError::StartFailed`];
    /// already-started components are left running for the caller to shut
    /// down.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        for component in &self.components {
            tracing::info!(component = component.name(), "Starting component");
            if let Err(e) = component.start().await {
                tracing::error!(component = component.name(), error = %e, "Component failed to start");
                return Err(e);
            }
        }
        tracing::info!(count = self.components.len(), "All components started");
        Ok(())
    }

    /// Stop every component in reverse registration order.
    ///
    /// Each stop gets the coordinator's stop timeout as its grace period;
    /// an outer watchdog with a little headroom catches components that
    /// ignore it. A timeout or stop failure is logged and recorded in the
    /// returned summary, and never blocks stopping the rest.
    pub async fn shutdown(&self) -> Vec<(String, Result<(), LifecycleError>)> {
        let mut outcomes = Vec::with_capacity(self.components.len());
        let watchdog = self.stop_timeout + Self::STOP_HEADROOM;

        for component in self.components.iter().rev() {
            let name = component.name().to_string();
            tracing::info!(component = %name, "Stopping component");

            let outcome =
                match tokio::time::timeout(watchdog, component.stop(self.stop_timeout)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        tracing::error!(component = %name, error = %e, "Component failed to stop");
                        Err(e)
                    }
                    Err(_) => {
                        tracing::error!(component = %name, "Component stop timed out");
                        Err(LifecycleError::StopTimeout {
                            component: name.clone(),
                        })
                    }
                };

            outcomes.push((name, outcome));
        }

        tracing::info!("Shutdown complete");
        outcomes
    }

    /// Status of every registered component, in registration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, ComponentStatus)> {
        self.components
            .iter()
            .map(|c| (c.name().to_string(), c.status()))
            .collect()
    }
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
