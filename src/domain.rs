//! Shared pieces of the two domain-service modules.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::CacheError;
use crate::consumer::HandlerError;
use crate::publisher::PublishError;

/// Failure of a primary-record repository behind its port. The concrete
/// store lives outside this crate; its errors arrive stringly.
#[derive(Debug, Error)]
#[error("repository error: {0}")]
pub struct RepositoryError(pub String);

/// Errors surfaced by the owning-side domain services.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The broker rejected the event for a committed primary write. The
    /// caller decides: fail the user-facing request or proceed degraded.
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Unwrap a `json!` object literal into the envelope `data` map.
pub(crate) fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Pull a required integer id out of an event payload.
pub(crate) fn require_i64(data: &Map<String, Value>, key: &str) -> Result<i64, HandlerError> {
    data.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| HandlerError::Payload(format!("missing or non-integer field '{key}'")))
}

/// Deserialize an event payload into a typed row, tolerating extra fields.
pub(crate) fn decode_fields<E: serde::de::DeserializeOwned>(
    data: &Map<String, Value>,
) -> Result<E, HandlerError> {
    serde_json::from_value(Value::Object(data.clone()))
        .map_err(|e| HandlerError::Payload(e.to_string()))
}
