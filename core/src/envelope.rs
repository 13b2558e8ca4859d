//! Event envelope and the typed [`Event`] abstraction.
//!
//! An [`Envelope`] is the immutable unit of data carried through the delivery
//! engine: a unique id, a logical event type name, an opaque serialized
//! payload, a creation timestamp, and ordered string headers for
//! tracing/correlation propagation.
//!
//! Envelopes are never mutated after creation. Publication progress is
//! tracked on the outbox record that wraps the envelope, not on the envelope
//! itself.
//!
//! # Example
//!
//! ```
//! use carrier_core::envelope::{Envelope, Event, Headers};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//!     total: u64,
//! }
//!
//! impl Event for OrderPlaced {
//!     fn event_type(&self) -> &'static str {
//!         "OrderPlaced"
//!     }
//! }
//!
//! let event = OrderPlaced { order_id: "order-1".into(), total: 4200 };
//! let envelope = Envelope::from_event(&event, Headers::new()).unwrap();
//! assert_eq!(envelope.event_type, "OrderPlaced");
//!
//! let decoded: OrderPlaced = envelope.payload_as().unwrap();
//! assert_eq!(decoded.order_id, "order-1");
//! ```

use crate::codec::CodecError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use uuid::Uuid;

/// A typed event that can travel through the delivery engine.
///
/// The trait captures the in-process representation of an event: a stable
/// logical type name plus a serde-serializable body. The payload body is
/// encoded as JSON, which keeps stored outbox rows inspectable by operators.
///
/// # Naming Convention
///
/// `event_type()` should return a stable identifier, optionally versioned:
/// `"OrderPlaced"` or `"OrderPlaced.v2"`. The name is used for handler
/// routing and, when `include_event_type` is enabled on a topic, as wire
/// metadata.
pub trait Event: Send + Sync + 'static {
    /// Returns the logical event type name for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event body to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the body cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError>
    where
        Self: Serialize,
    {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize an event body from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes do not represent this
    /// event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError>
    where
        Self: DeserializeOwned + Sized,
    {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// An ordered mapping of string keys to string values.
///
/// Insertion order is preserved, which matters for trace/correlation headers
/// that downstream systems replay verbatim. Keys are unique: inserting an
/// existing key updates the value in place without moving it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header map.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a key/value pair.
    ///
    /// If the key already exists its value is updated in place, keeping the
    /// original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// The immutable unit of event data moving through the system.
///
/// Envelope ids are UUIDv7, so they sort by creation time. That property
/// gives the outbox store a deterministic, creation-ordered tie-break when
/// two records share the same `available_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique identifier, assigned at creation.
    pub id: Uuid,

    /// Logical event type name, used for handler routing and wire metadata.
    pub event_type: String,

    /// Opaque serialized event body.
    pub payload: Vec<u8>,

    /// When the event was created.
    pub occurred_at: DateTime<Utc>,

    /// Ordered headers for tracing/correlation propagation.
    pub headers: Headers,
}

impl Envelope {
    /// Create an envelope from raw parts.
    ///
    /// Assigns a fresh UUIDv7 id and stamps the current time. Prefer
    /// [`Envelope::from_event`] when a typed event is at hand.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>, headers: Headers) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            headers,
        }
    }

    /// Create an envelope by serializing a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the event body cannot be serialized.
    pub fn from_event<E: Event + Serialize>(event: &E, headers: Headers) -> Result<Self, CodecError> {
        Ok(Self::new(event.event_type(), event.to_bytes()?, headers))
    }

    /// Decode the payload back into its typed representation.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the payload does not deserialize
    /// into `E`.
    pub fn payload_as<E: Event + DeserializeOwned>(&self) -> Result<E, CodecError> {
        E::from_bytes(&self.payload)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ id: {}, type: {}, size: {} bytes }}",
            self.id,
            self.event_type,
            self.payload.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TestPlaced {
        id: String,
        value: i32,
    }

    impl Event for TestPlaced {
        fn event_type(&self) -> &'static str {
            "TestPlaced"
        }
    }

    #[test]
    fn from_event_captures_type_and_payload() {
        let event = TestPlaced {
            id: "t-1".to_string(),
            value: 42,
        };
        let envelope = Envelope::from_event(&event, Headers::new()).unwrap();

        assert_eq!(envelope.event_type, "TestPlaced");
        assert_eq!(envelope.payload_as::<TestPlaced>().unwrap(), event);
    }

    #[test]
    fn envelope_ids_are_unique_and_creation_ordered() {
        let a = Envelope::new("A", vec![], Headers::new());
        let b = Envelope::new("A", vec![], Headers::new());

        assert_ne!(a.id, b.id);
        // UUIDv7 sorts by creation time
        assert!(a.id < b.id);
    }

    #[test]
    fn headers_preserve_insertion_order() {
        let mut headers = Headers::new();
        headers.insert("trace-id", "abc");
        headers.insert("span-id", "def");
        headers.insert("tenant", "acme");

        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["trace-id", "span-id", "tenant"]);
    }

    #[test]
    fn headers_insert_existing_key_updates_in_place() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("b", "2");
        headers.insert("a", "3");

        assert_eq!(headers.get("a"), Some("3"));
        assert_eq!(headers.len(), 2);
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn payload_decode_failure_is_a_codec_error() {
        let envelope = Envelope::new("TestPlaced", b"not json".to_vec(), Headers::new());
        assert!(envelope.payload_as::<TestPlaced>().is_err());
    }
}
