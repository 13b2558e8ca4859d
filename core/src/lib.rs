//! # Carrier Core
//!
//! Core types and capability traits for the Carrier event delivery engine:
//! a transactional outbox, an in-process dispatcher, and a uniform
//! publish/subscribe abstraction over interchangeable broker backends.
//!
//! ## Components
//!
//! - [`envelope`] — the immutable [`Envelope`](envelope::Envelope) carried
//!   through the system, plus the typed [`Event`](envelope::Event) trait
//! - [`codec`] — serialization adapter between envelopes and
//!   transport-neutral bytes (JSON by default, bincode optionally)
//! - [`dispatch`] — handler registry and fan-out under `WhenAll` or
//!   `Sequential` strategies
//! - [`outbox`] — outbox record/status model, the
//!   [`OutboxStore`](outbox::OutboxStore) contract with its claim/lease
//!   discipline, and an in-memory reference store
//! - [`transport`] — [`Publisher`](transport::Publisher) /
//!   [`Subscriber`](transport::Subscriber) capability traits, per-topic
//!   configuration, and the transient/permanent error taxonomy
//! - [`clock`] — injectable time, so retry behavior is testable without
//!   real delays
//!
//! ## Delivery model
//!
//! ```text
//! business tx ──► OutboxStore.append          (same unit of work)
//!                      │
//!                      ▼
//!              Outbox Processor ──► Publisher ──► broker
//!              (carrier-runtime)                    │
//!                                                   ▼
//!                              Subscriber ──► Dispatcher ──► handlers
//! ```
//!
//! At-least-once delivery is the contract throughout: consumers must be
//! idempotent. Exactly-once is explicitly not attempted.

pub mod clock;
pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod outbox;
pub mod transport;

pub use clock::{Clock, SystemClock};
pub use codec::{CodecError, EnvelopeCodec, SerializerKind};
pub use dispatch::{DispatchResult, DispatchStrategy, Dispatcher, Handler, HandlerError};
pub use envelope::{Envelope, Event, Headers};
pub use outbox::{InMemoryOutboxStore, OutboxError, OutboxRecord, OutboxStatus, OutboxStore};
pub use transport::{
    ComponentStatus, ConfigurationError, PublishError, Publisher, SubscribeError, Subscriber,
    TopicConfig,
};
