//! # Carrier Runtime
//!
//! Long-running delivery machinery for the Carrier event engine:
//!
//! - [`processor`] — the outbox processor: polls an
//!   [`OutboxStore`](carrier_core::OutboxStore), publishes claimed records
//!   through a [`Publisher`](carrier_core::Publisher), and applies the
//!   retry/backoff policy on failure
//! - [`lifecycle`] — the coordinator that starts subscribers and the
//!   processor with the host process and stops them in reverse order on
//!   shutdown, with per-component timeouts
//!
//! Both are built around `tokio::sync::watch` shutdown channels and
//! `tokio::select!` loops, so stopping is cooperative and bounded.

pub mod lifecycle;
pub mod processor;

pub use lifecycle::{
    Component, LifecycleCoordinator, LifecycleError, ProcessorComponent, SubscriberComponent,
};
pub use processor::{BackoffPolicy, OutboxProcessor, ProcessorConfig};
