//! Shared test event types.

use carrier_core::envelope::Event;
use serde::{Deserialize, Serialize};

/// Minimal event for pipeline tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Sequence number, for ordering assertions.
    pub seq: u64,
}

impl Event for Ping {
    fn event_type(&self) -> &'static str {
        "Ping"
    }
}

/// A richer event for payload round-trip assertions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Order identifier.
    pub order_id: String,
    /// Total in minor currency units.
    pub total: u64,
}

impl Event for OrderPlaced {
    fn event_type(&self) -> &'static str {
        "OrderPlaced"
    }
}
