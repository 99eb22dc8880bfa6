//! Responses stream events and where they go.
//!
//! Every event passes through [`EventEmitter`], which numbers it (through
//! the store when the response is persisted) and then hands it to the
//! client transport, if any.

use std::sync::Arc;

use async_trait::async_trait;
use data_connector::ResponseStore;
use openai_protocol::{
    event_types::{
        ContentPartEvent, FunctionCallEvent, OutputItemEvent, OutputTextEvent, ReasoningTextEvent,
        ERROR_EVENT,
    },
    responses::{ResponseContentPart, ResponseItem, ResponseObject, ResponseStatus},
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::GatewayError,
    routers::{
        error::stream_error,
        sse::{self, SseSender},
    },
};

/// A client transport for stream events.
#[async_trait]
pub(crate) trait EventSink: Send {
    /// Deliver one event; `false` means the client is gone.
    async fn send(&mut self, event: &Value) -> bool;
}

/// Server-sent events, `event: <type>` framed.
pub(crate) struct SseSink(pub SseSender);

#[async_trait]
impl EventSink for SseSink {
    async fn send(&mut self, event: &Value) -> bool {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        sse::send_event(&self.0, event_type, event).await
    }
}

/// Why emission stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Halt {
    /// The client transport went away
    Disconnected,
    /// The stored stream no longer accepts events (cancelled or deleted)
    Closed,
    /// The run's cancel token fired
    Cancelled,
}

pub(crate) struct EventEmitter {
    response_id: String,
    store: Option<Arc<ResponseStore>>,
    sink: Option<Box<dyn EventSink>>,
    next_sequence: u64,
}

impl EventEmitter {
    pub fn new(
        response_id: String,
        store: Option<Arc<ResponseStore>>,
        sink: Option<Box<dyn EventSink>>,
    ) -> Self {
        Self {
            response_id,
            store,
            sink,
            next_sequence: 0,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.response_id
    }

    pub fn store(&self) -> Option<&Arc<ResponseStore>> {
        self.store.as_ref()
    }

    /// Number the event, persist it and send it to the client.
    pub async fn emit(&mut self, mut payload: Value) -> Result<(), Halt> {
        if let Some(store) = &self.store {
            match store.append_event(&self.response_id, payload) {
                Ok(stored) => payload = stored.payload,
                Err(e) => {
                    debug!(response_id = %self.response_id, error = %e, "Stream closed to new events");
                    return Err(Halt::Closed);
                }
            }
        } else if let Value::Object(map) = &mut payload {
            map.insert("sequence_number".to_string(), Value::from(self.next_sequence));
        }
        self.next_sequence += 1;

        if let Some(sink) = &mut self.sink {
            if !sink.send(&payload).await {
                return Err(Halt::Disconnected);
            }
        }
        Ok(())
    }

    /// Persist the final resource before the terminal event goes out, so a
    /// client reacting to it reads the finished response.
    pub fn save(&self, resource: &ResponseObject) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_response(&self.response_id, resource.clone()) {
                debug!(response_id = %self.response_id, error = %e, "Response vanished before completion");
            }
        }
    }

    /// The run stopped early: a persisted response becomes `cancelled`
    /// and its stream is closed behind one `response.failed` event.
    pub fn abandon(&self, reason: &'static str) {
        let Some(store) = &self.store else {
            debug!(response_id = %self.response_id, reason, "Run stopped");
            return;
        };
        match store.cancel(&self.response_id) {
            Ok(response) if response.status == ResponseStatus::Cancelled => {
                info!(response_id = %self.response_id, reason, "Response cancelled")
            }
            Ok(response) => debug!(
                response_id = %self.response_id,
                status = ?response.status,
                "Response already finished"
            ),
            Err(e) => debug!(response_id = %self.response_id, error = %e, "Response gone before cancellation"),
        }
    }
}

pub(crate) fn response_event(event_type: &str, response: &ResponseObject) -> Value {
    json!({"type": event_type, "response": response})
}

pub(crate) fn output_item_added(output_index: usize, item: &ResponseItem) -> Value {
    json!({"type": OutputItemEvent::ADDED, "output_index": output_index, "item": item})
}

pub(crate) fn output_item_done(output_index: usize, item: &ResponseItem) -> Value {
    json!({"type": OutputItemEvent::DONE, "output_index": output_index, "item": item})
}

pub(crate) fn content_part_added(item_id: &str, output_index: usize, part: &ResponseContentPart) -> Value {
    json!({
        "type": ContentPartEvent::ADDED,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "part": part,
    })
}

pub(crate) fn content_part_done(item_id: &str, output_index: usize, part: &ResponseContentPart) -> Value {
    json!({
        "type": ContentPartEvent::DONE,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "part": part,
    })
}

pub(crate) fn output_text_delta(item_id: &str, output_index: usize, delta: &str) -> Value {
    json!({
        "type": OutputTextEvent::DELTA,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "delta": delta,
        "logprobs": [],
    })
}

pub(crate) fn output_text_done(item_id: &str, output_index: usize, text: &str) -> Value {
    json!({
        "type": OutputTextEvent::DONE,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "text": text,
        "logprobs": [],
    })
}

pub(crate) fn reasoning_text_delta(item_id: &str, output_index: usize, delta: &str) -> Value {
    json!({
        "type": ReasoningTextEvent::DELTA,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "delta": delta,
    })
}

pub(crate) fn reasoning_text_done(item_id: &str, output_index: usize, text: &str) -> Value {
    json!({
        "type": ReasoningTextEvent::DONE,
        "item_id": item_id,
        "output_index": output_index,
        "content_index": 0,
        "text": text,
    })
}

pub(crate) fn arguments_delta(item_id: &str, output_index: usize, delta: &str) -> Value {
    json!({
        "type": FunctionCallEvent::ARGUMENTS_DELTA,
        "item_id": item_id,
        "output_index": output_index,
        "delta": delta,
    })
}

pub(crate) fn arguments_done(item_id: &str, output_index: usize, arguments: &str) -> Value {
    json!({
        "type": FunctionCallEvent::ARGUMENTS_DONE,
        "item_id": item_id,
        "output_index": output_index,
        "arguments": arguments,
    })
}

/// `{"type":"error","error":{...}}`, used in streams and on WebSockets.
pub(crate) fn error_event(err: &GatewayError) -> Value {
    let mut event = stream_error(err);
    if let Value::Object(map) = &mut event {
        map.insert("type".to_string(), Value::from(ERROR_EVENT));
    }
    event
}
