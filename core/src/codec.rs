//! Serialization adapter between envelopes and transport-neutral bytes.
//!
//! The wire format carries the whole [`Envelope`] (id, type, payload,
//! timestamp, headers), so a subscriber on another node reconstructs exactly
//! what the producer appended. Two codecs are supported, selected per topic:
//!
//! - [`SerializerKind::Json`] (default) — human-readable, interoperable
//! - [`SerializerKind::Bincode`] — compact binary for all-Rust deployments
//!
//! Codec failures are permanent: a payload that does not encode today will
//! not encode tomorrow, so the outbox processor never retries them.

use crate::envelope::Envelope;
use thiserror::Error;

/// Errors produced by envelope encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The envelope (or an event body) could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The bytes could not be deserialized into an envelope (or event body).
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Wire serializer selection for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerKind {
    /// JSON wire format (default).
    #[default]
    Json,
    /// Bincode wire format.
    Bincode,
}

impl SerializerKind {
    /// MIME content type advertised alongside encoded payloads.
    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Bincode => "application/octet-stream",
        }
    }
}

/// Encodes and decodes envelopes for a given [`SerializerKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    kind: SerializerKind,
}

impl EnvelopeCodec {
    /// Create a codec for the given serializer kind.
    #[must_use]
    pub const fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    /// The serializer kind this codec uses.
    #[must_use]
    pub const fn kind(&self) -> SerializerKind {
        self.kind
    }

    /// Encode an envelope to transport-neutral bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        match self.kind {
            SerializerKind::Json => {
                serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
            }
            SerializerKind::Bincode => {
                bincode::serialize(envelope).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    /// Decode an envelope from transport-neutral bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid envelope
    /// for this codec.
    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        match self.kind {
            SerializerKind::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            SerializerKind::Bincode => {
                bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::envelope::Headers;

    fn sample_envelope() -> Envelope {
        let mut headers = Headers::new();
        headers.insert("trace-id", "trace-1");
        headers.insert("tenant", "acme");
        Envelope::new("OrderPlaced", br#"{"order_id":"o-1"}"#.to_vec(), headers)
    }

    #[test]
    fn json_round_trip_preserves_type_headers_and_payload() {
        let codec = EnvelopeCodec::new(SerializerKind::Json);
        let original = sample_envelope();

        let bytes = codec.encode(&original).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.event_type, original.event_type);
        assert_eq!(decoded.headers, original.headers);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn bincode_round_trip_preserves_type_headers_and_payload() {
        let codec = EnvelopeCodec::new(SerializerKind::Bincode);
        let original = sample_envelope();

        let bytes = codec.encode(&original).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_garbage_fails() {
        let codec = EnvelopeCodec::new(SerializerKind::Json);
        assert!(matches!(
            codec.decode(b"definitely not an envelope"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn content_types() {
        assert_eq!(SerializerKind::Json.content_type(), "application/json");
        assert_eq!(
            SerializerKind::Bincode.content_type(),
            "application/octet-stream"
        );
    }
}
