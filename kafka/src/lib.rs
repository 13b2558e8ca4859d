//! Kafka-compatible broker adapter.
//!
//! Implements the [`Publisher`] and [`Subscriber`] contracts over the Kafka
//! wire protocol via rdkafka. Because the protocol is the interface, the
//! backend is vendor swappable: Apache Kafka, Redpanda, AWS MSK, Azure
//! Event Hubs and other Kafka-compatible managed services all work with the
//! same adapter — managed services usually just need the SASL settings on
//! [`KafkaConfig`].
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the dispatcher has run for a message
//! - If the process stops before commit, the message is redelivered
//! - Handlers MUST be idempotent (envelope ids detect duplicates)
//! - Ordering is guaranteed within a partition; the event type is used as
//!   the message key, so events of one type stay ordered
//!
//! # Example
//!
//! ```no_run
//! use carrier_kafka::{KafkaConfig, KafkaPublisher};
//! use carrier_core::envelope::{Envelope, Headers};
//! use carrier_core::transport::{Publisher, TopicConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = KafkaConfig::builder()
//!     .brokers("localhost:9092")
//!     .producer_acks("all")
//!     .compression("lz4")
//!     .build()?;
//!
//! let publisher = KafkaPublisher::new(&config)?;
//! let envelope = Envelope::new("OrderPlaced", vec![1, 2, 3], Headers::new());
//! publisher.publish(&envelope, &TopicConfig::new("order-events")).await?;
//! # Ok(())
//! # }
//! ```

use carrier_core::codec::EnvelopeCodec;
use carrier_core::dispatch::Dispatcher;
use carrier_core::envelope::Envelope;
use carrier_core::transport::{
    ComponentStatus, ConfigurationError, PublishError, Publisher, SubscribeError, Subscriber,
    TopicConfig, TransportFuture,
};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consecutive receive errors before the subscriber reports itself failed.
const FAILURE_THRESHOLD: u32 = 5;

/// Sleep between receive attempts after an error.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// SASL credentials for authenticated (usually managed) clusters.
#[derive(Debug, Clone)]
pub struct SaslConfig {
    /// Security protocol, e.g. "SASL_SSL".
    pub security_protocol: String,
    /// SASL mechanism, e.g. "PLAIN" or "SCRAM-SHA-256".
    pub mechanism: String,
    /// SASL username.
    pub username: String,
    /// SASL password.
    pub password: String,
}

/// Validated connection settings shared by publisher and subscribers.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    brokers: String,
    producer_acks: String,
    compression: String,
    timeout: Duration,
    consumer_group: Option<String>,
    auto_offset_reset: String,
    sasl: Option<SaslConfig>,
}

impl KafkaConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> KafkaConfigBuilder {
        KafkaConfigBuilder::default()
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn base_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        if let Some(sasl) = &self.sasl {
            config
                .set("security.protocol", &sasl.security_protocol)
                .set("sasl.mechanism", &sasl.mechanism)
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
        config
    }

    fn producer_client_config(&self) -> ClientConfig {
        let mut config = self.base_client_config();
        config
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression);
        config
    }

    fn consumer_client_config(&self, group: &str) -> ClientConfig {
        let mut config = self.base_client_config();
        config
            .set("group.id", group)
            // Manual commit for at-least-once
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        config
    }
}

/// Builder for [`KafkaConfig`].
#[derive(Default)]
pub struct KafkaConfigBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    sasl: Option<SaslConfig>,
}

impl KafkaConfigBuilder {
    /// Comma-separated broker addresses (e.g. "localhost:9092"). Required.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: "0", "1", or "all". Default: "1".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    /// Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Default consumer group for subscribers that do not set their own.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where new consumer groups start reading: "earliest", "latest", or
    /// "error". Default: "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// SASL credentials, for authenticated clusters.
    #[must_use]
    pub fn sasl(mut self, sasl: SaslConfig) -> Self {
        self.sasl = Some(sasl);
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Missing`] if brokers were not set, or
    /// [`ConfigurationError::Invalid`] for rejected settings.
    pub fn build(self) -> Result<KafkaConfig, ConfigurationError> {
        let brokers = self
            .brokers
            .ok_or(ConfigurationError::Missing { field: "brokers" })?;
        if brokers.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                field: "brokers",
                reason: "must not be empty".to_string(),
            });
        }

        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "latest".to_string());
        if !matches!(auto_offset_reset.as_str(), "earliest" | "latest" | "error") {
            return Err(ConfigurationError::Invalid {
                field: "auto_offset_reset",
                reason: format!("unknown policy '{auto_offset_reset}'"),
            });
        }

        Ok(KafkaConfig {
            brokers,
            producer_acks: self.producer_acks.unwrap_or_else(|| "1".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            auto_offset_reset,
            sasl: self.sasl,
        })
    }
}

/// Publishes envelopes to Kafka-compatible brokers.
///
/// One attempt per call, no internal retry: the outbox processor owns the
/// retry policy.
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create a publisher from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] if the underlying producer
    /// cannot be created from the settings.
    pub fn new(config: &KafkaConfig) -> Result<Self, ConfigurationError> {
        let producer: FutureProducer =
            config
                .producer_client_config()
                .create()
                .map_err(|e| ConfigurationError::Invalid {
                    field: "producer",
                    reason: e.to_string(),
                })?;

        tracing::info!(
            brokers = %config.brokers,
            acks = %config.producer_acks,
            compression = %config.compression,
            "Kafka publisher created"
        );

        Ok(Self {
            producer,
            timeout: config.timeout,
        })
    }

    fn classify(topic: &str, error: &KafkaError) -> PublishError {
        match error {
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
                PublishError::Timeout {
                    topic: topic.to_string(),
                }
            }
            KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageSizeTooLarge | RDKafkaErrorCode::InvalidMessage,
            ) => PublishError::Rejected {
                topic: topic.to_string(),
                reason: error.to_string(),
            },
            other => PublishError::Transport {
                topic: topic.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl Publisher for KafkaPublisher {
    fn publish(
        &self,
        envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError> {
        let topic = config.topic.clone();
        let timeout = self.timeout;
        let encoded = EnvelopeCodec::new(config.serializer)
            .encode(envelope)
            .map_err(PublishError::from);

        // Event type as the message key keeps one type in one partition.
        let key = config
            .include_event_type
            .then(|| envelope.event_type.clone());
        let headers = config.include_event_type.then(|| {
            OwnedHeaders::new().insert(Header {
                key: "event-type",
                value: Some(envelope.event_type.as_str()),
            })
        });
        let envelope_id = envelope.id;
        let event_type = envelope.event_type.clone();

        Box::pin(async move {
            let payload = encoded?;

            let mut record: FutureRecord<'_, [u8], Vec<u8>> =
                FutureRecord::to(&topic).payload(&payload);
            if let Some(key) = &key {
                record = record.key(key.as_bytes());
            }
            if let Some(headers) = headers {
                record = record.headers(headers);
            }

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        envelope_id = %envelope_id,
                        event_type = %event_type,
                        "Envelope published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        envelope_id = %envelope_id,
                        error = %kafka_error,
                        "Publish failed"
                    );
                    Err(Self::classify(&topic, &kafka_error))
                }
            }
        })
    }
}

/// Consumes one topic and routes each envelope through a [`Dispatcher`].
///
/// The receive loop commits offsets only after dispatch returns; `stop`
/// signals the loop, which finishes the in-flight dispatch before exiting,
/// so at-least-once survives restarts.
pub struct KafkaSubscriber {
    name: String,
    config: KafkaConfig,
    topic: TopicConfig,
    group: String,
    dispatcher: Arc<Dispatcher>,
    status: Arc<Mutex<ComponentStatus>>,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaSubscriber {
    /// Create a subscriber on `topic`.
    ///
    /// The consumer group is `group` if given, else the configuration's
    /// default group, else one derived from the topic name.
    #[must_use]
    pub fn new(
        config: &KafkaConfig,
        topic: TopicConfig,
        group: Option<String>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let group = group
            .or_else(|| config.consumer_group.clone())
            .unwrap_or_else(|| format!("carrier-{}", topic.topic));
        let (shutdown, _) = watch::channel(false);

        Self {
            name: format!("kafka-subscriber:{}:{group}", topic.topic),
            config: config.clone(),
            topic,
            group,
            dispatcher,
            status: Arc::new(Mutex::new(ComponentStatus::Idle)),
            shutdown,
            join: Mutex::new(None),
        }
    }

    async fn receive_loop(
        consumer: StreamConsumer,
        topic: TopicConfig,
        dispatcher: Arc<Dispatcher>,
        status: Arc<Mutex<ComponentStatus>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let codec = EnvelopeCodec::new(topic.serializer);
        let mut stream = consumer.stream();
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(message)) => {
                            consecutive_errors = 0;
                            Self::note_receive_recovered(&status);

                            match message.payload().map(|p| codec.decode(p)) {
                                Some(Ok(envelope)) => {
                                    // Awaited here so shutdown drains the
                                    // in-flight dispatch before the loop exits.
                                    let result = dispatcher.dispatch(&envelope).await;
                                    if !result.is_success() {
                                        tracing::warn!(
                                            topic = %topic.topic,
                                            envelope_id = %envelope.id,
                                            failed = result.failures.len(),
                                            "Dispatch completed with handler failures"
                                        );
                                    }
                                }
                                Some(Err(e)) => {
                                    // Undecodable bytes never decode; skip past them.
                                    tracing::error!(
                                        topic = message.topic(),
                                        partition = message.partition(),
                                        offset = message.offset(),
                                        error = %e,
                                        "Skipping undecodable message"
                                    );
                                }
                                None => {
                                    tracing::error!(
                                        topic = message.topic(),
                                        offset = message.offset(),
                                        "Skipping message with no payload"
                                    );
                                }
                            }

                            // Commit AFTER dispatch: crash before this point
                            // means redelivery, never loss.
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(
                                    topic = message.topic(),
                                    partition = message.partition(),
                                    offset = message.offset(),
                                    error = %e,
                                    "Offset commit failed, message may be redelivered"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            consecutive_errors += 1;
                            tracing::warn!(
                                topic = %topic.topic,
                                error = %e,
                                consecutive_errors,
                                "Receive error"
                            );
                            Self::note_receive_errors(&status, consecutive_errors, &e.to_string());
                            tokio::select! {
                                () = tokio::time::sleep(ERROR_BACKOFF) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }
        }

        tracing::debug!(topic = %topic.topic, "Receive loop exiting");
    }

    fn set_status(&self, status: ComponentStatus) {
        *lock(&self.status) = status;
    }

    /// A successful receive after a `Failed` status means the broker is
    /// reachable again; report `Running` so the lifecycle surface agrees.
    fn note_receive_recovered(status: &Mutex<ComponentStatus>) {
        let mut guard = lock(status);
        if matches!(*guard, ComponentStatus::Failed(_)) {
            tracing::info!("Receive stream recovered, subscriber running again");
            *guard = ComponentStatus::Running;
        }
    }

    fn note_receive_errors(status: &Mutex<ComponentStatus>, consecutive: u32, reason: &str) {
        if consecutive >= FAILURE_THRESHOLD {
            *lock(status) = ComponentStatus::Failed(format!(
                "{consecutive} consecutive receive errors: {reason}"
            ));
        }
    }
}

impl Subscriber for KafkaSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ComponentStatus {
        lock(&self.status).clone()
    }

    fn start(&self) -> TransportFuture<'_, (), SubscribeError> {
        Box::pin(async move {
            if lock(&self.join).is_some() {
                return Err(SubscribeError::AlreadyRunning {
                    name: self.name.clone(),
                });
            }

            let consumer: StreamConsumer = self
                .config
                .consumer_client_config(&self.group)
                .create()
                .map_err(|e| SubscribeError::Connection {
                    name: self.name.clone(),
                    reason: format!("failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[self.topic.topic.as_str()])
                .map_err(|e| SubscribeError::Connection {
                    name: self.name.clone(),
                    reason: format!("failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %self.topic.topic,
                consumer_group = %self.group,
                manual_commit = true,
                "Subscriber started"
            );

            self.shutdown.send_replace(false);
            let handle = tokio::spawn(Self::receive_loop(
                consumer,
                self.topic.clone(),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.status),
                self.shutdown.subscribe(),
            ));
            *lock(&self.join) = Some(handle);
            self.set_status(ComponentStatus::Running);
            Ok(())
        })
    }

    fn stop(&self, grace: Duration) -> TransportFuture<'_, (), SubscribeError> {
        Box::pin(async move {
            self.shutdown.send(true).ok();

            let handle = lock(&self.join).take();
            let Some(handle) = handle else {
                self.set_status(ComponentStatus::Stopped);
                return Ok(());
            };

            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => {
                    self.set_status(ComponentStatus::Stopped);
                    tracing::info!(subscriber = %self.name, "Subscriber stopped");
                    Ok(())
                }
                Err(_) => {
                    abort.abort();
                    self.set_status(ComponentStatus::Failed(
                        "did not stop within the grace period".to_string(),
                    ));
                    Err(SubscribeError::ShutdownTimeout {
                        name: self.name.clone(),
                    })
                }
            }
        })
    }
}
