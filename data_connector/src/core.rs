//! Core types for the Response Store.

use openai_protocol::responses::{ResponseItem, ResponseObject, ResponseStatus, ResponsesRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for Response Store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Response not found: {0}")]
    NotFound(String),

    #[error("Response expired: {0}")]
    Expired(String),

    #[error("Response stream already closed: {0}")]
    AlreadyClosed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One streamed event of a response.
///
/// `payload` is the full JSON event as sent to clients; its
/// `sequence_number` field always equals `sequence_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub sequence_number: u64,
    pub event_type: String,
    pub payload: Value,
}

/// Snapshot of a stored response, cloned out of the store.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub request: ResponsesRequest,
    pub response: ResponseObject,
    pub status: ResponseStatus,
    /// Seconds since the epoch
    pub stored_at: i64,
    pub event_count: u64,
    /// No further events will be appended
    pub closed: bool,
    pub background: bool,
}

impl StoredResponse {
    /// Items of `response.output` that carry an id.
    pub fn items(&self) -> impl Iterator<Item = &ResponseItem> {
        self.response.output.iter().filter(|item| item.id().is_some_and(|id| !id.is_empty()))
    }
}
