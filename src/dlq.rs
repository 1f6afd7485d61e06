//! Dead-letter handling for events that cannot be applied.
//!
//! Two classes of message end up here: envelopes whose handler kept failing
//! after the retry bound, and payloads that could not be decoded at all.
//! Both are recorded and then acknowledged on the source stream, so one
//! poisoned message never blocks the topic's progress. A dead-lettered event
//! is observable only as a delayed or missing cache update, never as a
//! client-facing error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::envelope::EventEnvelope;

/// Default Redis stream holding dead-lettered events
pub const DEFAULT_DLQ_STREAM: &str = "shelfstream:dlq";

/// Default bound on DLQ length (older entries are trimmed)
pub const DEFAULT_DLQ_MAX_LEN: usize = 10_000;

/// Errors from the dead-letter store.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter connection error: {0}")]
    Connection(String),

    #[error("dead-letter command error: {0}")]
    Command(String),

    #[error("dead-letter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Terminal record of a message that exhausted its handling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    /// Topic the message arrived on
    pub topic: String,

    /// The decoded envelope, when decoding succeeded
    pub envelope: Option<EventEnvelope>,

    /// Raw payload (lossy UTF-8) when the envelope could not be decoded
    pub raw: Option<String>,

    /// Last error observed before giving up
    pub error: String,

    /// Handler attempts made; zero for decode failures, which are never
    /// retried
    pub attempts: u32,

    /// Instant the message was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl FailedEvent {
    /// Record for an envelope whose handler failed every attempt.
    pub fn poisoned(topic: &str, envelope: EventEnvelope, error: String, attempts: u32) -> Self {
        Self {
            topic: topic.to_string(),
            envelope: Some(envelope),
            raw: None,
            error,
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Record for a payload that could not be decoded.
    pub fn malformed(topic: &str, payload: &[u8], error: String) -> Self {
        Self {
            topic: topic.to_string(),
            envelope: None,
            raw: Some(String::from_utf8_lossy(payload).into_owned()),
            error,
            attempts: 0,
            failed_at: Utc::now(),
        }
    }
}

/// Sink the dispatcher writes terminal failures to.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, failed: FailedEvent) -> Result<(), DlqError>;
}

/// Redis Streams implementation of the dead-letter store.
///
/// Entries carry the full record as JSON plus the event type and failure
/// instant as flat fields for quick browsing with `XRANGE`.
#[derive(Clone)]
pub struct RedisDeadLetterQueue {
    pool: Pool,
    stream: String,
    max_len: usize,
}

impl RedisDeadLetterQueue {
    pub fn new(pool: Pool) -> Self {
        Self::with_stream(pool, DEFAULT_DLQ_STREAM, DEFAULT_DLQ_MAX_LEN)
    }

    pub fn with_stream(pool: Pool, stream: impl Into<String>, max_len: usize) -> Self {
        Self {
            pool,
            stream: stream.into(),
            max_len,
        }
    }

    /// Number of dead-lettered events currently retained.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))
    }

    /// List retained records oldest-first, as (stream id, record) pairs.
    pub async fn list(&self, count: usize) -> Result<Vec<(String, FailedEvent)>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        let mut records = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            if let Some((_, json)) = fields.iter().find(|(key, _)| key == "record") {
                records.push((id, serde_json::from_str(json)?));
            }
        }

        debug!(count = records.len(), "Retrieved dead-letter entries");
        Ok(records)
    }

    /// Drop a record after manual review. Returns false when the id is gone.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let removed: u64 = cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        Ok(removed > 0)
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterQueue {
    async fn record(&self, failed: FailedEvent) -> Result<(), DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let json = serde_json::to_string(&failed)?;
        let event_type = failed
            .envelope
            .as_ref()
            .map(|e| e.event_type.as_str())
            .unwrap_or("unknown");

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("record")
            .arg(&json)
            .arg("eventType")
            .arg(event_type)
            .arg("failedAt")
            .arg(failed.failed_at.to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Command(e.to_string()))?;

        info!(
            dlq_id = %id,
            topic = %failed.topic,
            event_type = %event_type,
            attempts = failed.attempts,
            error = %failed.error,
            "Event dead-lettered"
        );

        Ok(())
    }
}

/// In-process sink used by tests and the in-memory transport.
#[derive(Default)]
pub struct MemoryDeadLetterQueue {
    records: Mutex<Vec<FailedEvent>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<FailedEvent> {
        self.records.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn record(&self, failed: FailedEvent) -> Result<(), DlqError> {
        info!(
            topic = %failed.topic,
            attempts = failed.attempts,
            error = %failed.error,
            "Event dead-lettered"
        );
        self.records.lock().await.push(failed);
        Ok(())
    }
}
