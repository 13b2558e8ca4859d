//! Scripted [`Publisher`] doubles for exercising the outbox processor.

use carrier_core::codec::CodecError;
use carrier_core::envelope::Envelope;
use carrier_core::transport::{PublishError, Publisher, TopicConfig, TransportFuture};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Records every publish and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Envelope)>>,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Everything published so far, as `(topic, envelope)` pairs in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Envelope)> {
        lock(&self.sent).clone()
    }

    /// Number of successful publishes.
    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.sent).len()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(
        &self,
        envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError> {
        lock(&self.sent).push((config.topic.clone(), envelope.clone()));
        Box::pin(async { Ok(()) })
    }
}

/// Fails transiently a fixed number of times, then records and succeeds.
///
/// The standard double for retry tests: `FlakyPublisher::failing(2)` makes
/// a record take exactly three attempts.
#[derive(Debug, Default)]
pub struct FlakyPublisher {
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
    sent: Mutex<Vec<(String, Envelope)>>,
}

impl FlakyPublisher {
    /// Create a publisher whose first `failures` attempts fail transiently.
    #[must_use]
    pub const fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Total publish attempts seen, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Everything successfully published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Envelope)> {
        lock(&self.sent).clone()
    }
}

impl Publisher for FlakyPublisher {
    fn publish(
        &self,
        envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            let topic = config.topic.clone();
            return Box::pin(async move {
                Err(PublishError::Transport {
                    topic,
                    reason: "scripted transient failure".to_string(),
                })
            });
        }

        lock(&self.sent).push((config.topic.clone(), envelope.clone()));
        Box::pin(async { Ok(()) })
    }
}

/// Always fails with a permanent, non-retryable error.
#[derive(Debug, Clone, Copy)]
pub enum FailingMode {
    /// The broker rejects every message.
    Rejected,
    /// Every envelope fails to encode.
    Serialization,
}

/// A publisher that never succeeds.
#[derive(Debug)]
pub struct FailingPublisher {
    mode: FailingMode,
    attempts: AtomicU32,
}

impl FailingPublisher {
    /// Create a publisher that fails permanently in the given mode.
    #[must_use]
    pub const fn new(mode: FailingMode) -> Self {
        Self {
            mode,
            attempts: AtomicU32::new(0),
        }
    }

    /// Total publish attempts seen.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Publisher for FailingPublisher {
    fn publish(
        &self,
        _envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let error = match self.mode {
            FailingMode::Rejected => PublishError::Rejected {
                topic: config.topic.clone(),
                reason: "scripted permanent rejection".to_string(),
            },
            FailingMode::Serialization => {
                PublishError::Serialization(CodecError::Encode("scripted encode failure".to_string()))
            }
        };
        Box::pin(async move { Err(error) })
    }
}
