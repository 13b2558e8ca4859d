//! # Carrier Testing
//!
//! Test doubles and a process-local broker for exercising the Carrier
//! delivery pipeline without external infrastructure:
//!
//! - [`clock`] — [`FixedClock`](clock::FixedClock) and
//!   [`ManualClock`](clock::ManualClock), so backoff and lease behavior are
//!   asserted without real sleeping
//! - [`publishers`] — scripted [`Publisher`](carrier_core::Publisher)
//!   doubles: recording, flaky (transient-then-success), and permanently
//!   failing
//! - [`broker`] — the in-memory queue broker, a complete
//!   publish/subscribe backend with per-group offsets and
//!   commit-after-dispatch acknowledgement
//! - [`events`] — small event types shared across integration tests

pub mod broker;
pub mod clock;
pub mod events;
pub mod publishers;

pub use broker::{InMemoryBroker, MemoryPublisher, MemorySubscriber};
pub use clock::{FixedClock, ManualClock};
pub use events::{OrderPlaced, Ping};
pub use publishers::{FailingMode, FailingPublisher, FlakyPublisher, RecordingPublisher};

/// Install a compact tracing subscriber for a test binary.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .compact()
        .try_init();
}
