//! In-memory queue broker.
//!
//! A process-local backend implementing the full [`Publisher`] /
//! [`Subscriber`] contract: per-topic append-only queues, per-group
//! committed offsets, and commit-after-dispatch acknowledgement. Messages
//! not yet committed when a subscriber stops are redelivered when a
//! subscriber for the same group starts again, so at-least-once holds here
//! exactly as it does against a real broker.
//!
//! Intended for tests and single-process deployments that want the delivery
//! pipeline without broker infrastructure.

use carrier_core::codec::EnvelopeCodec;
use carrier_core::dispatch::Dispatcher;
use carrier_core::envelope::Envelope;
use carrier_core::transport::{
    ComponentStatus, PublishError, Publisher, SubscribeError, Subscriber, TopicConfig,
    TransportFuture,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct BrokerState {
    /// Append-only message log per topic.
    topics: HashMap<String, Vec<Vec<u8>>>,
    /// Next-uncommitted offset per `(topic, group)`.
    offsets: HashMap<(String, String), usize>,
}

/// Shared broker state; cheap to clone, all clones see the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes to a topic queue.
    pub fn publish_raw(&self, topic: &str, bytes: Vec<u8>) {
        let mut state = lock(&self.state);
        state.topics.entry(topic.to_string()).or_default().push(bytes);
    }

    /// Peek the next uncommitted message for a group, without advancing.
    fn fetch(&self, topic: &str, group: &str) -> Option<(usize, Vec<u8>)> {
        let state = lock(&self.state);
        let offset = state
            .offsets
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0);
        state
            .topics
            .get(topic)
            .and_then(|messages| messages.get(offset))
            .map(|bytes| (offset, bytes.clone()))
    }

    /// Commit a message: the group's offset moves past it.
    fn commit(&self, topic: &str, group: &str, offset: usize) {
        let mut state = lock(&self.state);
        state
            .offsets
            .insert((topic.to_string(), group.to_string()), offset + 1);
    }

    /// Total messages ever appended to a topic.
    #[must_use]
    pub fn message_count(&self, topic: &str) -> usize {
        lock(&self.state).topics.get(topic).map_or(0, Vec::len)
    }

    /// Messages a group has committed on a topic.
    #[must_use]
    pub fn committed(&self, topic: &str, group: &str) -> usize {
        lock(&self.state)
            .offsets
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// A publisher backed by this broker.
    #[must_use]
    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.clone(),
        }
    }

    /// A subscriber on `topic` for consumer `group`, routing into
    /// `dispatcher`.
    #[must_use]
    pub fn subscriber(
        &self,
        topic: TopicConfig,
        group: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
    ) -> MemorySubscriber {
        let group = group.into();
        let (shutdown, _) = watch::channel(false);
        MemorySubscriber {
            name: format!("memory-subscriber:{}:{group}", topic.topic),
            topic,
            group,
            broker: self.clone(),
            dispatcher,
            status: Mutex::new(ComponentStatus::Idle),
            shutdown,
            join: Mutex::new(None),
        }
    }
}

/// Publishes envelopes onto an [`InMemoryBroker`] topic queue.
#[derive(Clone)]
pub struct MemoryPublisher {
    broker: InMemoryBroker,
}

impl Publisher for MemoryPublisher {
    fn publish(
        &self,
        envelope: &Envelope,
        config: &TopicConfig,
    ) -> TransportFuture<'_, (), PublishError> {
        let encoded = EnvelopeCodec::new(config.serializer)
            .encode(envelope)
            .map_err(PublishError::from);

        let topic = config.topic.clone();
        let broker = self.broker.clone();
        Box::pin(async move {
            let bytes = encoded?;
            broker.publish_raw(&topic, bytes);
            Ok(())
        })
    }
}

/// Receives from an [`InMemoryBroker`] topic and dispatches each envelope.
///
/// Commit happens after dispatch returns, never before: a message in flight
/// when `stop` is called finishes dispatching and is committed; anything
/// behind it stays uncommitted and is redelivered to the next subscriber on
/// the same group.
pub struct MemorySubscriber {
    name: String,
    topic: TopicConfig,
    group: String,
    broker: InMemoryBroker,
    dispatcher: Arc<Dispatcher>,
    status: Mutex<ComponentStatus>,
    shutdown: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySubscriber {
    fn set_status(&self, status: ComponentStatus) {
        *lock(&self.status) = status;
    }

    async fn receive_loop(
        broker: InMemoryBroker,
        topic: TopicConfig,
        group: String,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let codec = EnvelopeCodec::new(topic.serializer);

        while !*shutdown.borrow() {
            let Some((offset, bytes)) = broker.fetch(&topic.topic, &group) else {
                tokio::select! {
                    () = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            match codec.decode(&bytes) {
                Ok(envelope) => {
                    // Awaited here so shutdown drains the in-flight dispatch.
                    let result = dispatcher.dispatch(&envelope).await;
                    if !result.is_success() {
                        tracing::warn!(
                            topic = %topic.topic,
                            group = %group,
                            envelope_id = %envelope.id,
                            failed = result.failures.len(),
                            "Dispatch completed with handler failures"
                        );
                    }
                }
                Err(e) => {
                    // Undecodable bytes will never decode; skip past them.
                    tracing::error!(
                        topic = %topic.topic,
                        group = %group,
                        offset,
                        error = %e,
                        "Skipping undecodable message"
                    );
                }
            }

            broker.commit(&topic.topic, &group, offset);
        }
    }
}

impl Subscriber for MemorySubscriber {
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

            self.shutdown.send_replace(false);
            let handle = tokio::spawn(Self::receive_loop(
                self.broker.clone(),
                self.topic.clone(),
                self.group.clone(),
                Arc::clone(&self.dispatcher),
                self.shutdown.subscribe(),
            ));
            *lock(&self.join) = Some(handle);
            self.set_status(ComponentStatus::Running);

            tracing::info!(subscriber = %self.name, "Subscriber started");
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use carrier_core::dispatch::{DispatchStrategy, Handler, HandlerError};
    use carrier_core::envelope::Headers;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn name(&self) -> &str {
            "counter"
        }

        fn handle(
            &self,
            _envelope: Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_to_handlers() {
        let broker = InMemoryBroker::new();
        let config = TopicConfig::new("orders");
        let publisher = broker.publisher();

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::new(DispatchStrategy::WhenAll));
        dispatcher.register(
            "OrderPlaced",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        let envelope = Envelope::new("OrderPlaced", vec![1], Headers::new());
        publisher.publish(&envelope, &config).await.unwrap();

        let subscriber = broker.subscriber(config, "billing", dispatcher);
        subscriber.start().await.unwrap();

        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        subscriber.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(subscriber.status(), ComponentStatus::Stopped);
        assert_eq!(broker.committed("orders", "billing"), 1);
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_a_new_subscriber() {
        let broker = InMemoryBroker::new();
        let config = TopicConfig::new("orders");
        let publisher = broker.publisher();

        for _ in 0..3 {
            let envelope = Envelope::new("OrderPlaced", vec![], Headers::new());
            publisher.publish(&envelope, &config).await.unwrap();
        }

        // Nothing consumed yet: a fresh subscriber on the same group sees
        // all three messages.
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::default());
        dispatcher.register(
            "OrderPlaced",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        let subscriber = broker.subscriber(config, "billing", dispatcher);
        subscriber.start().await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 3).await;
        subscriber.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn independent_groups_each_see_every_message() {
        let broker = InMemoryBroker::new();
        let config = TopicConfig::new("orders");
        broker
            .publisher()
            .publish(
                &Envelope::new("OrderPlaced", vec![], Headers::new()),
                &config,
            )
            .await
            .unwrap();

        let billing_calls = Arc::new(AtomicUsize::new(0));
        let billing = Arc::new(Dispatcher::default());
        billing.register(
            "OrderPlaced",
            Arc::new(CountingHandler {
                calls: Arc::clone(&billing_calls),
            }),
        );

        let shipping_calls = Arc::new(AtomicUsize::new(0));
        let shipping = Arc::new(Dispatcher::default());
        shipping.register(
            "OrderPlaced",
            Arc::new(CountingHandler {
                calls: Arc::clone(&shipping_calls),
            }),
        );

        let sub_a = broker.subscriber(config.clone(), "billing", billing);
        let sub_b = broker.subscriber(config, "shipping", shipping);
        sub_a.start().await.unwrap();
        sub_b.start().await.unwrap();

        wait_until(|| {
            billing_calls.load(Ordering::SeqCst) == 1 && shipping_calls.load(Ordering::SeqCst) == 1
        })
        .await;

        sub_a.stop(Duration::from_secs(1)).await.unwrap();
        sub_b.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let broker = InMemoryBroker::new();
        let subscriber = broker.subscriber(
            TopicConfig::new("orders"),
            "billing",
            Arc::new(Dispatcher::default()),
        );

        subscriber.start().await.unwrap();
        assert!(matches!(
            subscriber.start().await,
            Err(SubscribeError::AlreadyRunning { .. })
        ));
        subscriber.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_message_is_skipped_not_fatal() {
        let broker = InMemoryBroker::new();
        let config = TopicConfig::new("orders");

        broker.publish_raw("orders", b"garbage".to_vec());
        broker
            .publisher()
            .publish(
                &Envelope::new("OrderPlaced", vec![], Headers::new()),
                &config,
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(Dispatcher::default());
        dispatcher.register(
            "OrderPlaced",
            Arc::new(CountingHandler {
                calls: Arc::clone(&calls),
            }),
        );

        let subscriber = broker.subscriber(config, "billing", dispatcher);
        subscriber.start().await.unwrap();

        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        subscriber.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(broker.committed("orders", "billing"), 2);
    }
}
