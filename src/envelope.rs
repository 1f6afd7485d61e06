//! Wire envelope shared by every event.
//!
//! The [`EventEnvelope`] is the unit of transport between the services.
//! It is built once at publish time, encoded to JSON bytes for the broker,
//! and decoded (never mutated) on the consuming side.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "event_type": "author.created",
//!   "event_id": "5d2c2f6e-9d6a-4c39-8f0e-0f6a9f9d2b11",
//!   "timestamp": "2025-12-11T10:00:00Z",
//!   "correlation_id": "abc123",
//!   "data": { "author_id": 1, "name": "X" }
//! }
//! ```
//!
//! Decoding is forward-compatible: unknown top-level fields are ignored and
//! extra keys inside `data` are preserved as-is, so a newer producer never
//! breaks an older consumer. A payload that cannot be decoded at all is a
//! [`DecodeError`] and is routed to dead-letter handling, not retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when broker bytes cannot be turned into an envelope.
///
/// Malformed wire data never becomes valid by retrying, so this error class
/// bypasses the retry loop entirely.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes were not a JSON object with the required envelope fields.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One domain change event, wrapped for transport.
///
/// `event_type` follows the `<entity>.<verb>` convention with verb one of
/// `created`, `updated`, `deleted`, `linked`, `unlinked`. `data` carries the
/// post-change state of the entity; for `deleted`/`unlinked` events only the
/// identifying key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Semantic change identifier used for handler dispatch
    pub event_type: String,

    /// Globally unique id, generated at publish time. Traceability only;
    /// deduplication is state-based (idempotent upserts), not id-based.
    pub event_id: Uuid,

    /// Publish-time UTC instant (RFC 3339 on the wire)
    pub timestamp: DateTime<Utc>,

    /// Identifier threading the originating request through every
    /// downstream log line and side effect
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Post-change entity state as free-form fields
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventEnvelope {
    /// Build a new envelope, stamping `event_id` and `timestamp`.
    pub fn new(
        event_type: impl Into<String>,
        data: Map<String, Value>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id,
            data,
        }
    }

    /// Encode the envelope to JSON bytes for the broker.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode an envelope from broker bytes.
    ///
    /// `correlation_id` and `data` may be absent (older producers); the
    /// remaining fields are required.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
