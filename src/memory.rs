//! In-process transport implementing the publisher and consumer ports.
//!
//! [`MemoryBroker`] stands in for the real broker: per-topic FIFO queues
//! shared by a [`MemoryPublisher`] and any number of [`MemoryConsumer`]s.
//! Dispatch, retry and dead-letter behavior are identical to the Redis
//! transport because both feed the same [`Dispatcher`]; swapping transports
//! touches neither dispatch nor domain code.
//!
//! Used by the test suite and for running both service sides in one process
//! during local development.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::info;
use uuid::Uuid;

use crate::consumer::{
    ConsumerError, Dispatcher, EventConsumer, EventHandler, HandlerRegistry, RegistryState,
};
use crate::dlq::DeadLetterSink;
use crate::envelope::EventEnvelope;
use crate::publisher::{EventPublisher, PublishError};
use crate::retry::RetryPolicy;

struct BrokerInner {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    in_flight: AtomicUsize,
}

/// Shared in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            broker: self.inner.clone(),
            started: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self, retry: RetryPolicy, dlq: Arc<dyn DeadLetterSink>) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.inner.clone(),
            retry,
            dlq,
            registry: std::sync::Mutex::new(RegistryState::Building(HandlerRegistry::new())),
            task: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Enqueue raw bytes on a topic, bypassing the envelope codec. Lets
    /// tests exercise the malformed-payload path.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) {
        self.inner
            .queues
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Wait until every queue is drained and no message is mid-dispatch.
    pub async fn settled(&self) {
        loop {
            let queued: usize = {
                let queues = self.inner.queues.lock().await;
                queues.values().map(|q| q.len()).sum()
            };
            if queued == 0 && self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Publisher port over the in-process broker.
pub struct MemoryPublisher {
    broker: Arc<BrokerInner>,
    started: AtomicBool,
    offline: AtomicBool,
}

impl MemoryPublisher {
    /// Simulate the broker rejecting writes, so callers can exercise the
    /// publish-error contract.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn start(&self) -> Result<(), PublishError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PublishError::AlreadyStarted);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), PublishError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        data: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Result<Uuid, PublishError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(PublishError::NotStarted);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(PublishError::Delivery("broker offline".to_string()));
        }

        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let envelope = EventEnvelope::new(topic, data, Some(correlation_id));
        let bytes = envelope.encode()?;

        self.broker
            .queues
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push_back(bytes);

        Ok(envelope.event_id)
    }
}

/// Consumer port over the in-process broker.
///
/// Popping a message off its queue marks it delivered; it is driven to a
/// terminal state before the next pop, mirroring the one-at-a-time,
/// ack-after-terminal discipline of the Redis consumer.
pub struct MemoryConsumer {
    broker: Arc<BrokerInner>,
    retry: RetryPolicy,
    dlq: Arc<dyn DeadLetterSink>,
    registry: std::sync::Mutex<RegistryState>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

#[async_trait]
impl EventConsumer for MemoryConsumer {
    fn register_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        let mut state = self.registry.lock().expect("registry lock poisoned");
        match &mut *state {
            RegistryState::Building(registry) => {
                registry.register(event_type, handler);
                Ok(())
            }
            RegistryState::Running(_) => Err(ConsumerError::AlreadyStarted),
        }
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        let mut task_slot = self.task.lock().await;
        if task_slot.is_some() {
            return Err(ConsumerError::AlreadyStarted);
        }

        let dispatcher = {
            let mut state = self.registry.lock().expect("registry lock poisoned");
            match &mut *state {
                RegistryState::Building(registry) if registry.is_empty() => {
                    return Err(ConsumerError::NoHandlers)
                }
                RegistryState::Building(registry) => {
                    let frozen = std::mem::take(registry);
                    let dispatcher = Arc::new(Dispatcher::new(
                        frozen,
                        self.retry.clone(),
                        self.dlq.clone(),
                    ));
                    *state = RegistryState::Running(dispatcher.clone());
                    dispatcher
                }
                RegistryState::Running(dispatcher) => dispatcher.clone(),
            }
        };

        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(tx);

        let broker = self.broker.clone();
        *task_slot = Some(tokio::spawn(consume_loop(broker, dispatcher, rx)));

        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
            info!("Memory consumer stopped");
        }
        Ok(())
    }
}

async fn consume_loop(
    broker: Arc<BrokerInner>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let topics = dispatcher.event_types();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // The in-flight count is bumped under the queue lock so `settled`
        // never sees a popped message as already done.
        let next = {
            let mut queues = broker.queues.lock().await;
            let next = topics.iter().find_map(|topic| {
                queues
                    .get_mut(topic)
                    .and_then(|queue| queue.pop_front())
                    .map(|payload| (topic.clone(), payload))
            });
            if next.is_some() {
                broker.in_flight.fetch_add(1, Ordering::SeqCst);
            }
            next
        };

        match next {
            Some((topic, payload)) => {
                dispatcher.dispatch(&topic, &payload).await;
                broker.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(Duration::from_millis(2)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::HandlerError;
    use crate::dlq::MemoryDeadLetterQueue;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct RecordingHandler {
        calls: AtomicU32,
        last: Mutex<Option<Map<String, Value>>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().await = Some(data.clone());
            Ok(())
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_publisher_lifecycle_rules() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();

        assert!(matches!(
            publisher.publish("author.created", Map::new(), None).await,
            Err(PublishError::NotStarted)
        ));

        publisher.start().await.unwrap();
        assert!(matches!(
            publisher.start().await,
            Err(PublishError::AlreadyStarted)
        ));

        publisher.stop().await.unwrap();
        publisher.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_error_surfaces_to_caller() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        publisher.start().await.unwrap();
        publisher.set_offline(true);

        let result = publisher
            .publish("author.created", object(json!({"author_id": 1})), None)
            .await;
        assert!(matches!(result, Err(PublishError::Delivery(_))));

        publisher.set_offline(false);
        publisher
            .publish("author.created", object(json!({"author_id": 1})), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_published_message_reaches_registered_handler() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        publisher.start().await.unwrap();

        let handler = RecordingHandler::new();
        let consumer = broker.consumer(
            RetryPolicy::fast(),
            Arc::new(MemoryDeadLetterQueue::new()),
        );
        consumer
            .register_handler("author.created", handler.clone())
            .unwrap();
        consumer.start().await.unwrap();

        publisher
            .publish(
                "author.created",
                object(json!({"author_id": 1, "name": "X"})),
                Some("corr-9".to_string()),
            )
            .await
            .unwrap();

        broker.settled().await;
        consumer.stop().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let data = handler.last.lock().await.clone().unwrap();
        assert_eq!(data["name"], "X");
    }

    #[tokio::test]
    async fn test_registration_rejected_after_start() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(
            RetryPolicy::fast(),
            Arc::new(MemoryDeadLetterQueue::new()),
        );
        consumer
            .register_handler("author.created", RecordingHandler::new())
            .unwrap();
        consumer.start().await.unwrap();

        let result = consumer.register_handler("author.updated", RecordingHandler::new());
        assert!(matches!(result, Err(ConsumerError::AlreadyStarted)));

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_handlers_is_rejected() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(
            RetryPolicy::fast(),
            Arc::new(MemoryDeadLetterQueue::new()),
        );
        assert!(matches!(
            consumer.start().await,
            Err(ConsumerError::NoHandlers)
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters_and_later_messages_flow() {
        let broker = MemoryBroker::new();
        let publisher = broker.publisher();
        publisher.start().await.unwrap();

        let handler = RecordingHandler::new();
        let dlq = Arc::new(MemoryDeadLetterQueue::new());
        let consumer = broker.consumer(RetryPolicy::fast(), dlq.clone());
        consumer
            .register_handler("author.created", handler.clone())
            .unwrap();
        consumer.start().await.unwrap();

        broker
            .publish_raw("author.created", b"{definitely not an envelope".to_vec())
            .await;
        publisher
            .publish(
                "author.created",
                object(json!({"author_id": 2, "name": "Y"})),
                None,
            )
            .await
            .unwrap();

        broker.settled().await;
        consumer.stop().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dlq.count().await, 1);
        assert_eq!(dlq.records().await[0].attempts, 0);
    }
}
