//! Publish path: envelope construction and delivery to the broker.
//!
//! [`EventPublisher`] is the port the domain write path talks to. The
//! production implementation targets Redis Streams; swapping brokers means
//! implementing this trait again, never touching domain code.
//!
//! `publish` returns only after the broker has acknowledged the write.
//! Failures are surfaced to the caller: the originating domain operation
//! decides whether to roll back its primary write or proceed degraded, so
//! nothing is swallowed here.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::retry::{retry, RetryPolicy};

/// Errors surfaced to the caller of [`EventPublisher::publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// `publish` was called before `start`
    #[error("publisher has not been started")]
    NotStarted,

    /// `start` was called twice without an intervening `stop`
    #[error("publisher is already started")]
    AlreadyStarted,

    /// The broker connection could not be established or acquired
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or timed out the write
    #[error("broker delivery error: {0}")]
    Delivery(String),

    /// The envelope could not be encoded
    #[error("envelope encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Port for emitting domain change events.
///
/// Lifecycle is scoped: `start` acquires the broker connection exactly once,
/// `stop` releases it. Calling `start` again before `stop` is a usage error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn start(&self) -> Result<(), PublishError>;

    async fn stop(&self) -> Result<(), PublishError>;

    /// Build an envelope for `topic` (stamping `event_id` and `timestamp`),
    /// encode it, and deliver it. Returns the generated event id after the
    /// broker has acknowledged the write.
    ///
    /// A missing correlation id is replaced with a fresh one so every
    /// published event stays traceable end to end.
    async fn publish(
        &self,
        topic: &str,
        data: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Result<Uuid, PublishError>;
}

/// Production publisher writing envelopes to Redis Streams.
///
/// One stream per topic; the envelope travels as a single `envelope` field
/// holding the encoded JSON. Delivery is retried on a short bounded schedule
/// before the error is surfaced.
pub struct RedisStreamPublisher {
    url: String,
    pool: Mutex<Option<Pool>>,
    retry_policy: RetryPolicy,
}

impl RedisStreamPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: Mutex::new(None),
            retry_policy: RetryPolicy::publish(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn start(&self) -> Result<(), PublishError> {
        let mut slot = self.pool.lock().await;
        if slot.is_some() {
            return Err(PublishError::AlreadyStarted);
        }

        let pool = Config::from_url(self.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| PublishError::Connection(e.to_string()))?;
        *slot = Some(pool);

        info!("Publisher started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PublishError> {
        let mut slot = self.pool.lock().await;
        if slot.take().is_some() {
            info!("Publisher stopped");
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        data: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Result<Uuid, PublishError> {
        let pool = self
            .pool
            .lock()
            .await
            .clone()
            .ok_or(PublishError::NotStarted)?;

        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let envelope = EventEnvelope::new(topic, data, Some(correlation_id.clone()));
        let bytes = envelope.encode()?;

        let id: String = retry("publish", &self.retry_policy, || {
            let pool = pool.clone();
            let bytes = bytes.clone();
            async move {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| PublishError::Connection(e.to_string()))?;

                let id: String = cmd("XADD")
                    .arg(topic)
                    .arg("*")
                    .arg("envelope")
                    .arg(bytes.as_slice())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| PublishError::Delivery(e.to_string()))?;
                Ok::<String, PublishError>(id)
            }
        })
        .await?;

        debug!(stream_id = %id, topic = %topic, "Broker acknowledged write");
        info!(
            topic = %topic,
            event_id = %envelope.event_id,
            correlation_id = %correlation_id,
            "Event published"
        );

        Ok(envelope.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pool creation is lazy, so lifecycle rules are testable without a
    // running broker.

    #[tokio::test]
    async fn test_publish_before_start_is_an_error() {
        let publisher = RedisStreamPublisher::new("redis://localhost:6379");
        let result = publisher
            .publish("author.created", Map::new(), None)
            .await;

        assert!(matches!(result, Err(PublishError::NotStarted)));
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let publisher = RedisStreamPublisher::new("redis://localhost:6379");
        publisher.start().await.unwrap();

        assert!(matches!(
            publisher.start().await,
            Err(PublishError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_then_start_again_is_allowed() {
        let publisher = RedisStreamPublisher::new("redis://localhost:6379");
        publisher.start().await.unwrap();
        publisher.stop().await.unwrap();
        publisher.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let publisher = RedisStreamPublisher::new("redis://localhost:6379");
        publisher.stop().await.unwrap();
    }
}
