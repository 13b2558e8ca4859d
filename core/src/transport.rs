//! Publisher/Subscriber capability traits and per-topic configuration.
//!
//! One adapter crate per backend kind implements these traits
//! (`carrier-kafka` for log brokers and Kafka-compatible managed cloud
//! services, the in-memory queue broker in `carrier-testing` for tests and
//! single-process deployments). The core never sees backend-specific
//! semantics: it hands a [`Publisher`] an envelope plus a [`TopicConfig`]
//! and gets back a success or a classified failure.
//!
//! # Ownership
//!
//! Publishers and subscribers are single-owner resources: each owns its
//! connection and is not shared across threads without its own internal
//! synchronization. Retry is never an adapter concern — a publish is one
//! attempt, and the outbox processor owns the backoff policy.

use crate::codec::{CodecError, SerializerKind};
use crate::envelope::Envelope;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Per-topic delivery configuration, common to every backend kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    /// Topic or queue name.
    pub topic: String,
    /// Whether the logical event type name is attached as wire metadata.
    pub include_event_type: bool,
    /// Wire serializer for envelopes on this topic.
    pub serializer: SerializerKind,
}

impl TopicConfig {
    /// Create a topic configuration with defaults: event type metadata
    /// included, JSON serializer.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            include_event_type: true,
            serializer: SerializerKind::default(),
        }
    }

    /// Toggle event type wire metadata.
    #[must_use]
    pub fn include_event_type(mut self, include: bool) -> Self {
        self.include_event_type = include;
        self
    }

    /// Select the wire serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }
}

/// A missing or invalid backend setting, fatal at startup.
///
/// Adapters surface these from their builders, before any subscriber or
/// publisher is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A required setting was not provided.
    #[error("missing required setting: {field}")]
    Missing {
        /// The absent field.
        field: &'static str,
    },

    /// A setting was provided but rejected.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors from a single publish attempt.
///
/// The taxonomy matters to the outbox processor: transient failures are
/// retried under its backoff policy, permanent ones terminate the record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The envelope could not be encoded. Permanent.
    #[error(transparent)]
    Serialization(#[from] CodecError),

    /// The transport failed (connection, broker unavailable). Transient.
    #[error("transport error on topic '{topic}': {reason}")]
    Transport {
        /// The topic being published to.
        topic: String,
        /// The transport-level failure.
        reason: String,
    },

    /// The send did not complete within the configured timeout. Transient.
    #[error("publish to topic '{topic}' timed out")]
    Timeout {
        /// The topic being published to.
        topic: String,
    },

    /// The broker rejected the message (validation, policy). Permanent.
    #[error("broker rejected message on topic '{topic}': {reason}")]
    Rejected {
        /// The topic being published to.
        topic: String,
        /// The broker's rejection reason.
        reason: String,
    },
}

impl PublishError {
    /// Whether the failure is worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Errors from subscriber lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// Could not establish the backend connection.
    #[error("subscriber '{name}' failed to connect: {reason}")]
    Connection {
        /// The subscriber.
        name: String,
        /// The connection failure.
        reason: String,
    },

    /// `start` was called while the receive loop is already running.
    #[error("subscriber '{name}' is already running")]
    AlreadyRunning {
        /// The subscriber.
        name: String,
    },

    /// The receive loop did not drain within the grace period and the
    /// connection was force-released.
    #[error("subscriber '{name}' did not stop within the grace period")]
    ShutdownTimeout {
        /// The subscriber.
        name: String,
    },
}

/// Observable state of a long-lived component (subscriber or processor).
///
/// Shared with the lifecycle coordinator's status surface so connection
/// trouble is reported instead of crashing the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComponentStatus {
    /// Constructed but not started.
    #[default]
    Idle,
    /// Receive loop (or poll loop) is running.
    Running,
    /// Stopped cleanly.
    Stopped,
    /// Unhealthy; the reason is kept for operators.
    Failed(String),
}

/// Boxed future alias used by the transport traits.
pub type TransportFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Sends one envelope to one topic. A single attempt, no internal retry.
///
/// Explicit boxed-future returns keep the trait dyn-compatible
/// (`Arc<dyn Publisher>`), which the outbox processor relies on.
pub trait Publisher: Send + Sync {
    /// Publish `envelope` to the topic described by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] classified as transient or permanent; the
    /// caller (the outbox processor) applies its backoff policy uniformly
    /// based on that classification.
    fn publish(
        &self,
        envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError>;
}

/// Receives envelopes from a topic and routes them to the dispatcher.
///
/// A subscriber is a long-lived resource with an explicit lifecycle:
/// `start` connects and begins the receive loop; `stop` signals the loop to
/// stop pulling, lets the in-flight dispatch complete (graceful drain), and
/// releases the connection within the grace period. Messages not yet
/// acknowledged when shutdown begins are left unacknowledged so the backend
/// redelivers them later — at-least-once is preserved across restarts.
pub trait Subscriber: Send + Sync {
    /// Name used in logs and the coordinator's status surface.
    fn name(&self) -> &str;

    /// Current observable state.
    fn status(&self) -> ComponentStatus;

    /// Establish the backend connection and begin receiving.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::Connection`] if the connection cannot be
    /// established, or [`SubscribeError::AlreadyRunning`] if called twice.
    fn start(&self) -> TransportFuture<'_, (), SubscribeError>;

    /// Stop receiving, drain the in-flight dispatch, release the connection.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::ShutdownTimeout`] if the loop had to be
    /// force-released after `grace`.
    fn stop(&self, grace: Duration) -> TransportFuture<'_, (), SubscribeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_config_defaults() {
        let config = TopicConfig::new("order-events");
        assert_eq!(config.topic, "order-events");
        assert!(config.include_event_type);
        assert_eq!(config.serializer, SerializerKind::Json);
    }

    #[test]
    fn publish_error_classification() {
        let transient = PublishError::Transport {
            topic: "t".to_string(),
            reason: "connection refused".to_string(),
        };
        let timeout = PublishError::Timeout {
            topic: "t".to_string(),
        };
        let permanent = PublishError::Serialization(CodecError::Encode("bad".to_string()));
        let rejected = PublishError::Rejected {
            topic: "t".to_string(),
            reason: "too large".to_string(),
        };

        assert!(transient.is_transient());
        assert!(timeout.is_transient());
        assert!(!permanent.is_transient());
        assert!(!rejected.is_transient());
    }
}
