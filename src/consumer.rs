//! Consume path: handler registry, dispatch, retry and acknowledgement.
//!
//! Every in-flight message moves through the states
//! `received -> decoded -> dispatched -> {acknowledged | retrying | dead-lettered}`.
//! The [`Dispatcher`] owns that state machine; [`RedisStreamConsumer`] feeds
//! it from Redis Streams consumer groups. Messages on one stream are
//! processed strictly in delivery order, one at a time: message N+1 is not
//! begun until message N has reached a terminal state, because downstream
//! upserts are order-sensitive for the same key.
//!
//! Failure policy:
//! - decode failure: dead-letter immediately, acknowledge, never retry
//! - no handler for the event type: acknowledged no-op, so producers can
//!   introduce new event types without breaking older consumers
//! - handler failure: retry the same message on the bounded backoff
//!   schedule, then dead-letter and acknowledge

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::cache::CacheError;
use crate::dlq::{DeadLetterSink, FailedEvent};
use crate::envelope::EventEnvelope;
use crate::retry::RetryPolicy;

/// Transient failure inside an event handler. Retried up to the bound, then
/// dead-lettered; never escalates to process-level failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload is missing or mistypes a field the handler needs
    #[error("invalid payload: {0}")]
    Payload(String),

    /// The cache repository failed (e.g. temporary storage unavailability)
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Other(String),
}

/// Errors from the consumer lifecycle.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// `register_handler` after `start`, or `start` while running. The
    /// registry is frozen once the consume loop begins.
    #[error("consumer is already started")]
    AlreadyStarted,

    /// `start` with an empty registry: nothing to subscribe to
    #[error("no handlers registered")]
    NoHandlers,

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Broker(String),
}

/// One event handler. Receives the envelope's `data` and applies it to the
/// local cache through a publisher-less domain service.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: &Map<String, Value>) -> Result<(), HandlerError>;
}

/// Maps an event type to its single dispatch target.
///
/// Registering the same type twice replaces the previous handler (last
/// registration wins). The registry is built before the consumer starts and
/// never mutated afterwards, so dispatch needs no synchronization.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        debug!(event_type = %event_type, "Registering event handler");
        self.handlers.insert(event_type.to_string(), handler);
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    /// Registered event types, which double as the topics to subscribe to.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Terminal state of one dispatched message. Every variant is acknowledged
/// on the broker; the distinction is what happened on the way there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler applied the event
    Applied,

    /// No handler registered for the event type; skipped as a no-op
    Skipped,

    /// Decode failure or retry exhaustion; recorded to the dead-letter sink
    DeadLettered,
}

/// Drives one message from raw bytes to a terminal state.
///
/// Transport-blind: both the Redis consumer and the in-memory consumer feed
/// it. Decode and unknown-type conditions are fully absorbed here; handler
/// errors are retried locally and at worst become a dead-letter record.
pub struct Dispatcher {
    registry: HandlerRegistry,
    retry: RetryPolicy,
    dlq: Arc<dyn DeadLetterSink>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, retry: RetryPolicy, dlq: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            registry,
            retry,
            dlq,
        }
    }

    pub fn event_types(&self) -> Vec<String> {
        self.registry.event_types()
    }

    /// Process one received message through to a terminal state.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let envelope = match EventEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %topic, error = %err, "Undecodable message, dead-lettering");
                self.dead_letter(FailedEvent::malformed(topic, payload, err.to_string()))
                    .await;
                return DispatchOutcome::DeadLettered;
            }
        };

        let correlation_id = envelope.correlation_id.clone().unwrap_or_default();
        debug!(
            topic = %topic,
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            correlation_id = %correlation_id,
            "Message decoded"
        );

        let handler = match self.registry.get(&envelope.event_type) {
            Some(handler) => handler,
            None => {
                warn!(
                    topic = %topic,
                    event_type = %envelope.event_type,
                    "Unknown event type, acknowledging as no-op"
                );
                return DispatchOutcome::Skipped;
            }
        };

        let mut failed = 0u32;
        loop {
            match handler.handle(&envelope.data).await {
                Ok(()) => {
                    info!(
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        correlation_id = %correlation_id,
                        "Event applied"
                    );
                    return DispatchOutcome::Applied;
                }
                Err(err) => {
                    failed += 1;
                    error!(
                        event_type = %envelope.event_type,
                        event_id = %envelope.event_id,
                        correlation_id = %correlation_id,
                        attempt = failed,
                        max_attempts = self.retry.attempts(),
                        error = %err,
                        "Handler failed"
                    );

                    match self.retry.delay_after(failed) {
                        Some(delay) => sleep(delay).await,
                        None => {
                            self.dead_letter(FailedEvent::poisoned(
                                topic,
                                envelope,
                                err.to_string(),
                                failed,
                            ))
                            .await;
                            return DispatchOutcome::DeadLettered;
                        }
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, failed: FailedEvent) {
        // A failed dead-letter write must not block the stream either; the
        // record is lost but the topic keeps moving.
        if let Err(err) = self.dlq.record(failed).await {
            error!(error = %err, "Failed to write dead-letter record");
        }
    }
}

/// Port for the consume side of the sync engine.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Register the dispatch target for an event type. Rejected once the
    /// consumer has started.
    fn register_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConsumerError>;

    async fn start(&self) -> Result<(), ConsumerError>;

    /// Halt intake, let the in-flight message reach a terminal state, then
    /// release the broker connection.
    async fn stop(&self) -> Result<(), ConsumerError>;
}

pub(crate) enum RegistryState {
    Building(HandlerRegistry),
    Running(Arc<Dispatcher>),
}

/// Production consumer on Redis Streams consumer groups.
///
/// Subscribes to one stream per registered event type. Reads with
/// `XREADGROUP COUNT 1`, replays its own pending entries after a restart,
/// and acknowledges each message only after it reaches a terminal state, so
/// a restart resumes from the durable read position and redelivers anything
/// that was in flight.
pub struct RedisStreamConsumer {
    url: String,
    group: String,
    name: String,
    retry: RetryPolicy,
    dlq: Arc<dyn DeadLetterSink>,
    registry: std::sync::Mutex<RegistryState>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl RedisStreamConsumer {
    pub fn new(
        url: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        retry: RetryPolicy,
        dlq: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            url: url.into(),
            group: group.into(),
            name: name.into(),
            retry,
            dlq,
            registry: std::sync::Mutex::new(RegistryState::Building(HandlerRegistry::new())),
            task: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventConsumer for RedisStreamConsumer {
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

        let topics = {
            let state = self.registry.lock().expect("registry lock poisoned");
            match &*state {
                RegistryState::Building(registry) if registry.is_empty() => {
                    return Err(ConsumerError::NoHandlers)
                }
                RegistryState::Building(registry) => registry.event_types(),
                RegistryState::Running(dispatcher) => dispatcher.event_types(),
            }
        };

        let pool = Config::from_url(self.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;
        for topic in &topics {
            ensure_group(&mut conn, topic, &self.group).await?;
        }
        drop(conn);

        // Freeze the registry only after the broker side is in place, so a
        // failed start leaves the consumer usable.
        let dispatcher = {
            let mut state = self.registry.lock().expect("registry lock poisoned");
            match &mut *state {
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

        info!(
            group = %self.group,
            consumer = %self.name,
            topics = ?topics,
            "Consumer starting"
        );

        let group = self.group.clone();
        let name = self.name.clone();
        *task_slot = Some(tokio::spawn(consume_loop(
            pool, dispatcher, topics, group, name, rx,
        )));

        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsumerError> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }

        if let Some(handle) = self.task.lock().await.take() {
            if handle.await.is_err() {
                error!("Consumer task panicked during shutdown");
            }
            info!("Consumer stopped");
        }

        Ok(())
    }
}

/// Create the consumer group for a topic, tolerating concurrent creation.
///
/// Starts the group at id 0 so a fresh deployment replays the full retained
/// history and rebuilds its cache from empty state.
async fn ensure_group(
    conn: &mut deadpool_redis::Connection,
    topic: &str,
    group: &str,
) -> Result<(), ConsumerError> {
    let result: Result<(), _> = cmd("XGROUP")
        .arg("CREATE")
        .arg(topic)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(_) => {
            info!(topic = %topic, group = %group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(ConsumerError::Broker(e.to_string())),
    }
}

async fn consume_loop(
    pool: Pool,
    dispatcher: Arc<Dispatcher>,
    topics: Vec<String>,
    group: String,
    name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut applied: u64 = 0;
    let mut dead_lettered: u64 = 0;

    // Replay entries delivered to this consumer but never acknowledged
    // before the last shutdown or crash.
    replay_pending(
        &pool,
        &dispatcher,
        &topics,
        &group,
        &name,
        &mut shutdown,
        &mut applied,
        &mut dead_lettered,
    )
    .await;

    let new_ids: Vec<String> = topics.iter().map(|_| ">".to_string()).collect();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to get broker connection");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        let opts = StreamReadOptions::default()
            .group(&group, &name)
            .block(2000)
            .count(1);

        // Intake halts on shutdown; an already-received message below is
        // always driven to a terminal state before the loop re-checks.
        let result: Result<StreamReadReply, _> = tokio::select! {
            _ = shutdown.changed() => break,
            result = conn.xread_options(topics.as_slice(), new_ids.as_slice(), &opts) => result,
        };

        match result {
            Ok(reply) => {
                process_reply(
                    &mut conn,
                    &dispatcher,
                    &group,
                    reply,
                    &mut applied,
                    &mut dead_lettered,
                )
                .await;
            }
            Err(e) => {
                let message = e.to_string();
                // Timeouts and empty reads are the idle case, not failures
                if !message.contains("timed out") && !message.contains("response was nil") {
                    warn!(error = %e, "Stream read error");
                }
            }
        }

        if applied > 0 && applied % 100 == 0 {
            info!(applied, dead_lettered, "Consumer statistics");
        }
    }

    info!(applied, dead_lettered, "Consumer loop exited");
}

/// Drain this consumer's pending entries list before taking new deliveries.
#[allow(clippy::too_many_arguments)]
async fn replay_pending(
    pool: &Pool,
    dispatcher: &Arc<Dispatcher>,
    topics: &[String],
    group: &str,
    name: &str,
    shutdown: &mut watch::Receiver<bool>,
    applied: &mut u64,
    dead_lettered: &mut u64,
) {
    let pending_ids: Vec<String> = topics.iter().map(|_| "0".to_string()).collect();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to get broker connection for pending replay");
                return;
            }
        };

        let opts = StreamReadOptions::default().group(group, name).count(1);
        let reply: StreamReadReply =
            match conn.xread_options(topics, pending_ids.as_slice(), &opts).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "Pending replay read failed, continuing with new messages");
                    return;
                }
            };

        let replayed =
            process_reply(&mut conn, dispatcher, group, reply, applied, dead_lettered).await;
        if replayed == 0 {
            return;
        }
        info!(count = replayed, "Replayed pending messages");
    }
}

/// Dispatch every entry in a read reply in delivery order, acknowledging
/// each after its terminal state. Returns the number of entries handled.
async fn process_reply(
    conn: &mut deadpool_redis::Connection,
    dispatcher: &Arc<Dispatcher>,
    group: &str,
    reply: StreamReadReply,
    applied: &mut u64,
    dead_lettered: &mut u64,
) -> usize {
    let mut handled = 0;

    for stream_key in reply.keys {
        let topic = stream_key.key;
        for element in stream_key.ids {
            handled += 1;
            debug!(id = %element.id, topic = %topic, "Message received");

            let payload = envelope_field(&element.map).unwrap_or_default();
            match dispatcher.dispatch(&topic, &payload).await {
                DispatchOutcome::Applied => *applied += 1,
                DispatchOutcome::Skipped => {}
                DispatchOutcome::DeadLettered => *dead_lettered += 1,
            }

            let ack: Result<(), _> = conn.xack(&topic, group, &[&element.id]).await;
            if let Err(e) = ack {
                error!(id = %element.id, topic = %topic, error = %e, "Failed to acknowledge message");
            }
        }
    }

    handled
}

/// Pull the encoded envelope bytes out of a stream entry.
fn envelope_field(map: &HashMap<String, RedisValue>) -> Option<Vec<u8>> {
    match map.get("envelope") {
        Some(RedisValue::BulkString(bytes)) => Some(bytes.clone()),
        Some(RedisValue::SimpleString(s)) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MemoryDeadLetterQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handler that fails its first `fail_times` invocations.
    struct FlakyHandler {
        calls: AtomicU32,
        fail_times: u32,
    }

    impl FlakyHandler {
        fn new(fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_times,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _data: &Map<String, Value>) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                Err(HandlerError::Other(format!("transient failure {call}")))
            } else {
                Ok(())
            }
        }
    }

    fn envelope_bytes(event_type: &str, data: Value) -> Vec<u8> {
        let map = match data {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        EventEnvelope::new(event_type, map, Some("corr".to_string()))
            .encode()
            .unwrap()
    }

    fn dispatcher_with(
        handlers: Vec<(&str, Arc<dyn EventHandler>)>,
    ) -> (Dispatcher, Arc<MemoryDeadLetterQueue>) {
        let mut registry = HandlerRegistry::new();
        for (event_type, handler) in handlers {
            registry.register(event_type, handler);
        }
        let dlq = Arc::new(MemoryDeadLetterQueue::new());
        (
            Dispatcher::new(registry, RetryPolicy::fast(), dlq.clone()),
            dlq,
        )
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let first = FlakyHandler::new(0);
        let second = FlakyHandler::new(0);

        let mut registry = HandlerRegistry::new();
        registry.register("book.created", first.clone());
        registry.register("book.created", second.clone());

        assert_eq!(registry.len(), 1);
        assert!(registry.get("book.created").is_some());
    }

    #[test]
    fn test_registry_event_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register("book.updated", FlakyHandler::new(0));
        registry.register("book.created", FlakyHandler::new(0));

        assert_eq!(registry.event_types(), vec!["book.created", "book.updated"]);
    }

    #[tokio::test]
    async fn test_dispatch_success_is_applied() {
        let handler = FlakyHandler::new(0);
        let (dispatcher, dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let payload = envelope_bytes("book.created", json!({"book_id": 1}));
        let outcome = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(handler.calls(), 1);
        assert_eq!(dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged_no_op() {
        let handler = FlakyHandler::new(0);
        let (dispatcher, dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let payload = envelope_bytes("book.renamed", json!({"book_id": 1}));
        let outcome = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(handler.calls(), 0);
        assert_eq!(dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_dead_letters_without_retry() {
        let handler = FlakyHandler::new(0);
        let (dispatcher, dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let outcome = dispatcher.dispatch("book.created", b"{not json").await;

        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(handler.calls(), 0);

        let records = dlq.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 0);
        assert!(records[0].envelope.is_none());
        assert_eq!(records[0].raw.as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_block_next_valid_one() {
        let handler = FlakyHandler::new(0);
        let (dispatcher, _dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let bad = dispatcher.dispatch("book.created", b"garbage").await;
        assert_eq!(bad, DispatchOutcome::DeadLettered);

        let payload = envelope_bytes("book.created", json!({"book_id": 2}));
        let good = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(good, DispatchOutcome::Applied);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_invokes_handler_exactly_three_times() {
        let handler = FlakyHandler::new(u32::MAX);
        let (dispatcher, dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let payload = envelope_bytes("book.created", json!({"book_id": 3}));
        let outcome = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(outcome, DispatchOutcome::DeadLettered);
        assert_eq!(handler.calls(), 3);

        let records = dlq.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 3);
        let recorded = records[0].envelope.as_ref().unwrap();
        assert_eq!(recorded.event_type, "book.created");
        assert_eq!(recorded.data["book_id"], 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_retry_bound() {
        let handler = FlakyHandler::new(2);
        let (dispatcher, dlq) = dispatcher_with(vec![("book.created", handler.clone())]);

        let payload = envelope_bytes("book.created", json!({"book_id": 4}));
        let outcome = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(handler.calls(), 3);
        assert_eq!(dlq.count().await, 0);
    }

    #[tokio::test]
    async fn test_last_registered_handler_receives_dispatch() {
        let first = FlakyHandler::new(u32::MAX);
        let second = FlakyHandler::new(0);
        let (dispatcher, _dlq) = dispatcher_with(vec![
            ("book.created", first.clone() as Arc<dyn EventHandler>),
            ("book.created", second.clone() as Arc<dyn EventHandler>),
        ]);

        let payload = envelope_bytes("book.created", json!({"book_id": 5}));
        let outcome = dispatcher.dispatch("book.created", &payload).await;

        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(first.calls(), 0);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let consumer = RedisStreamConsumer::new(
            "redis://localhost:6379",
            "books-service-group",
            "worker-test",
            RetryPolicy::fast(),
            Arc::new(MemoryDeadLetterQueue::new()),
        );
        consumer.stop().await.unwrap();
    }
}
