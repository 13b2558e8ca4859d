//! Outbox processor: background delivery loop with retry and backoff.
//!
//! The processor is one independent background task, decoupled from the
//! request path that appended the records. Each cycle it claims a batch of
//! due records, hands each envelope to the publisher (one attempt per
//! record per cycle), and finalizes the record:
//!
//! - publish succeeded → `mark_dispatched`
//! - transient failure, attempts below the cap → `mark_failed` with the
//!   next `available_at` computed from exponential backoff plus jitter
//! - permanent failure, or the attempt cap reached → terminal `Failed`,
//!   surfaced for operator attention
//!
//! One record's failure never stalls the rest of the batch, and publisher
//! unavailability is tolerated indefinitely up to the attempt cap. The loop
//! sleeps for the poll interval when nothing is due and shuts down
//! cooperatively through a `watch` channel.
//!
//! # Example
//!
//! ```ignore
//! let (processor, shutdown) = OutboxProcessor::new(
//!     store,
//!     publisher,
//!     Arc::new(SystemClock),
//!     ProcessorConfig::new(TopicConfig::new("order-events")),
//! );
//!
//! let task = tokio::spawn(processor.run());
//! // ... later
//! shutdown.send(true).ok();
//! task.await?;
//! ```

use carrier_core::clock::Clock;
use carrier_core::outbox::{OutboxRecord, OutboxStore};
use carrier_core::transport::{Publisher, TopicConfig};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Exponential backoff with jitter for outbox retries.
///
/// The deterministic delay for a record that has already failed `attempts`
/// times is `base * 2^attempts`, capped at `cap`. A random jitter of up to
/// `jitter_ratio * delay` is added on top to avoid synchronized retry
/// storms, and the jittered total is clamped to `cap` as well. With
/// `jitter_ratio <= 1` the jittered delay is monotonically non-decreasing
/// in `attempts`: each step at least doubles the deterministic part, and
/// the cap bounds both sides once reached.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the delay, jitter included.
    pub cap: Duration,
    /// Fraction of the delay added as random jitter, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            base: None,
            cap: None,
            jitter_ratio: None,
        }
    }

    /// Deterministic delay for a record with `attempts` prior failures.
    #[must_use]
    pub fn delay_for_attempts(&self, attempts: u32) -> Duration {
        // 2^attempts saturates well past any sensible cap
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.cap)
    }

    /// Deterministic delay plus random jitter, clamped to the cap.
    #[must_use]
    pub fn jittered_delay_for_attempts(&self, attempts: u32) -> Duration {
        let delay = self.delay_for_attempts(attempts);
        let jitter_max = delay.mul_f64(self.jitter_ratio);
        if jitter_max.is_zero() {
            return delay;
        }
        // Clamped so a jittered delay just below the cap cannot overshoot
        // the (capped) delay of the next attempt
        (delay + jitter_max.mul_f64(rand::random::<f64>())).min(self.cap)
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    base: Option<Duration>,
    cap: Option<Duration>,
    jitter_ratio: Option<f64>,
}

impl BackoffPolicyBuilder {
    /// Set the delay before the first retry.
    #[must_use]
    pub const fn base(mut self, base: Duration) -> Self {
        self.base = Some(base);
        self
    }

    /// Set the upper bound on the deterministic delay.
    #[must_use]
    pub const fn cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Set the jitter fraction; clamped to `[0, 1]` at build time.
    #[must_use]
    pub const fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = Some(ratio);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            base: self.base.unwrap_or(defaults.base),
            cap: self.cap.unwrap_or(defaults.cap),
            jitter_ratio: self
                .jitter_ratio
                .unwrap_or(defaults.jitter_ratio)
                .clamp(0.0, 1.0),
        }
    }
}

/// Configuration for the [`OutboxProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Topic the processor publishes to.
    pub topic: TopicConfig,
    /// Maximum records claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles when nothing is due.
    pub poll_interval: Duration,
    /// Total delivery attempts before a record goes terminally `Failed`.
    pub max_attempts: u32,
    /// Retry backoff policy.
    pub backoff: BackoffPolicy,
}

impl ProcessorConfig {
    /// Create a configuration for a topic with conventional defaults:
    /// batches of 50, a 500ms poll interval, 5 attempts.
    #[must_use]
    pub fn new(topic: TopicConfig) -> Self {
        Self {
            topic,
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Set the per-cycle batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the attempt cap.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Background loop that drains the outbox through a publisher.
///
/// The processor is the only writer of record status, attempts, and
/// `available_at` once records exist; business code only appends. Multiple
/// processor replicas may share one store — the store's claim/lease
/// discipline keeps them from double-delivering within a lease window.
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxProcessor {
    /// Create a processor and the sender half of its shutdown signal.
    ///
    /// Send `true` through the returned sender to stop the loop after the
    /// current batch.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Self {
            store,
            publisher,
            clock,
            config,
            shutdown: shutdown_rx,
        };
        (processor, shutdown_tx)
    }

    /// Run the delivery loop until the shutdown signal is received.
    ///
    /// Claims due records each cycle and delivers them one publish attempt
    /// each. Store errors are logged and the loop continues — a broken
    /// store read this cycle does not kill the processor.
    pub async fn run(mut self) {
        tracing::info!(
            topic = %self.config.topic.topic,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_attempts = self.config.max_attempts,
            "Outbox processor started"
        );

        while !*self.shutdown.borrow() {
            let now = self.clock.now();
            let batch = match self.store.claim_batch(self.config.batch_size, now).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim outbox batch");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.shutdown.changed() => {}
                }
                continue;
            }

            tracing::debug!(claimed = batch.len(), "Outbox batch claimed");
            for record in batch {
                // Records are independent; a failure here never stalls the rest
                self.deliver(record).await;
            }
        }

        tracing::info!(topic = %self.config.topic.topic, "Outbox processor stopped");
    }

    /// One delivery attempt for one claimed record, plus finalization.
    async fn deliver(&self, record: OutboxRecord) {
        let id = record.id();
        let event_type = record.envelope.event_type.clone();

        match self
            .publisher
            .publish(&record.envelope, &self.config.topic)
            .await
        {
            Ok(()) => {
                if let Err(e) = self.store.mark_dispatched(id).await {
                    tracing::error!(record_id = %id, error = %e, "Failed to mark record dispatched");
                    return;
                }
                metrics::counter!("outbox.dispatched").increment(1);
                tracing::debug!(
                    record_id = %id,
                    event_type = %event_type,
                    attempts = record.attempts + 1,
                    "Outbox record dispatched"
                );
            }
            Err(publish_error) => {
                let attempts_after = record.attempts + 1;
                let retryable =
                    publish_error.is_transient() && attempts_after < self.config.max_attempts;

                let retry_at = if retryable {
                    let delay = self
                        .config
                        .backoff
                        .jittered_delay_for_attempts(record.attempts);
                    #[allow(clippy::cast_possible_truncation)] // Delays are capped far below i64::MAX millis
                    let delay = ChronoDuration::milliseconds(delay.as_millis() as i64);
                    Some(self.clock.now() + delay)
                } else {
                    None
                };

                if let Err(e) = self
                    .store
                    .mark_failed(id, publish_error.to_string(), retry_at)
                    .await
                {
                    tracing::error!(record_id = %id, error = %e, "Failed to mark record failed");
                    return;
                }

                if let Some(at) = retry_at {
                    metrics::counter!("outbox.retried").increment(1);
                    tracing::warn!(
                        record_id = %id,
                        event_type = %event_type,
                        attempts = attempts_after,
                        retry_at = %at,
                        error = %publish_error,
                        "Publish failed, will retry"
                    );
                } else {
                    metrics::counter!("outbox.failed").increment(1);
                    tracing::error!(
                        record_id = %id,
                        event_type = %event_type,
                        attempts = attempts_after,
                        error = %publish_error,
                        "Outbox record terminally failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy::builder()
            .base(Duration::from_millis(100))
            .cap(Duration::from_secs(10))
            .jitter_ratio(0.0)
            .build();

        assert_eq!(policy.delay_for_attempts(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempts(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempts(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempts(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_large_attempt_counts() {
        let policy = BackoffPolicy::builder()
            .base(Duration::from_secs(1))
            .cap(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_attempts(20), Duration::from_secs(2));
        // Shift overflow saturates rather than wrapping
        assert_eq!(policy.delay_for_attempts(200), Duration::from_secs(2));
    }

    #[test]
    fn jitter_is_bounded_by_the_ratio() {
        let policy = BackoffPolicy::builder()
            .base(Duration::from_millis(100))
            .cap(Duration::from_secs(30))
            .jitter_ratio(0.5)
            .build();

        for attempts in 0..8 {
            let plain = policy.delay_for_attempts(attempts);
            for _ in 0..50 {
                let jittered = policy.jittered_delay_for_attempts(attempts);
                assert!(jittered >= plain);
                assert!(jittered <= plain + plain.mul_f64(0.5));
            }
        }
    }

    #[test]
    fn jitter_never_decreases_delay_across_the_cap_boundary() {
        // delay(0) = 100ms sits just under the cap; delay(1) is clamped
        // to it. Every jittered delay for attempt 1 is then exactly the
        // cap, and attempt 0 must never exceed it.
        let policy = BackoffPolicy::builder()
            .base(Duration::from_millis(100))
            .cap(Duration::from_millis(110))
            .jitter_ratio(0.2)
            .build();

        for _ in 0..200 {
            assert!(policy.jittered_delay_for_attempts(0) <= policy.cap);
            assert_eq!(policy.jittered_delay_for_attempts(1), policy.cap);
        }
    }

    #[test]
    fn builder_clamps_jitter_ratio() {
        let policy = BackoffPolicy::builder().jitter_ratio(7.0).build();
        assert!((policy.jitter_ratio - 1.0).abs() < f64::EPSILON);
    }

    proptest! {
        /// Deterministic backoff is monotonically non-decreasing in attempts.
        #[test]
        fn backoff_monotone_in_attempts(
            base_ms in 1u64..5_000,
            cap_ms in 1_000u64..600_000,
            attempts in 0u32..40,
        ) {
            let policy = BackoffPolicy::builder()
                .base(Duration::from_millis(base_ms))
                .cap(Duration::from_millis(cap_ms))
                .jitter_ratio(0.0)
                .build();

            prop_assert!(
                policy.delay_for_attempts(attempts + 1) >= policy.delay_for_attempts(attempts)
            );
        }

        /// With jitter bounded by the delay itself and the total clamped
        /// to the cap, jittered delays never decrease across successive
        /// attempts — including attempts that land on the cap boundary.
        #[test]
        fn jittered_backoff_monotone_including_cap(
            base_ms in 1u64..1_000,
            cap_ms in 1u64..50_000,
            attempts in 0u32..12,
            ratio in 0.0f64..1.0,
        ) {
            let policy = BackoffPolicy::builder()
                .base(Duration::from_millis(base_ms))
                .cap(Duration::from_millis(cap_ms))
                .jitter_ratio(ratio)
                .build();

            let this = policy.delay_for_attempts(attempts);
            let worst_this = (this + this.mul_f64(ratio)).min(policy.cap);
            let best_next = policy.delay_for_attempts(attempts + 1);
            // Doubling outruns a jitter ratio <= 1 below the cap, and the
            // cap bounds both sides once reached
            prop_assert!(best_next >= worst_this);
        }
    }
}
