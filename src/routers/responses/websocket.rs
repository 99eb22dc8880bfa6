//! Open Responses over WebSocket (`GET /v1/responses` with an upgrade).
//!
//! Clients send `{"type":"response.create", ...request}` frames and receive
//! the same events a streaming HTTP request would, one JSON text frame per
//! event. One create may be in flight per connection; the connection is
//! closed once it has been open for `websocket_connection_limit` (an hour
//! by default).

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    Extension,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use openai_protocol::{
    responses::ResponsesRequest,
    validated::Normalizable,
};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{
    emitter::{error_event, EventEmitter, EventSink},
    start,
};
use crate::{
    error::{GatewayError, TransportError},
    middleware::{request_id, ModelOverride},
    server::AppContext,
};

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const CREATE_FRAME: &str = "response.create";

type Writer = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Serialises writes so events and error frames never interleave.
struct WsSink(Writer);

#[async_trait]
impl EventSink for WsSink {
    async fn send(&mut self, event: &Value) -> bool {
        send_json(&self.0, event).await
    }
}

async fn send_json(writer: &Writer, value: &Value) -> bool {
    writer
        .lock()
        .await
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

fn request_error(code: &str, message: impl Into<String>, param: Option<&str>) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": "invalid_request_error",
            "code": code,
            "message": message.into(),
            "param": param,
        }
    })
}

pub async fn responses_websocket(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    let connection_id = request_id(&headers);
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(ctx, socket, model_override, connection_id))
}

async fn serve_socket(
    ctx: Arc<AppContext>,
    socket: WebSocket,
    model_override: Option<ModelOverride>,
    connection_id: String,
) {
    let (sink, mut incoming) = socket.split();
    let writer: Writer = Arc::new(Mutex::new(sink));
    let inflight = Arc::new(Mutex::new(()));
    let closing = CancellationToken::new();
    let deadline = tokio::time::sleep(ctx.config.websocket_connection_limit);
    tokio::pin!(deadline);
    debug!(connection_id = %connection_id, "Responses WebSocket connected");

    loop {
        let frame = tokio::select! {
            _ = &mut deadline => {
                info!(connection_id = %connection_id, "Responses WebSocket reached its connection limit");
                let err = GatewayError::Transport(TransportError::WebsocketDeadline);
                send_json(&writer, &error_event(&err)).await;
                break;
            }
            frame = incoming.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "Responses WebSocket read failed");
                break;
            }
        };

        let request = match parse_create(text.as_str()) {
            Ok(request) => request,
            Err(error) => {
                send_json(&writer, &error).await;
                continue;
            }
        };
        let Ok(guard) = inflight.clone().try_lock_owned() else {
            let error = request_error(
                "response_in_progress",
                "a response is already in progress on this connection",
                None,
            );
            send_json(&writer, &error).await;
            continue;
        };

        let ctx = ctx.clone();
        let writer = writer.clone();
        let model_override = model_override.clone();
        let cancel = closing.child_token();
        let correlation_id = connection_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match start(&ctx, model_override.as_ref(), correlation_id, &request).await {
                Ok(started) => {
                    let store = request.should_store().then(|| ctx.store.clone());
                    if let Some(store) = &store {
                        store.store(&started.id, request.clone(), started.resource.clone());
                    }
                    let emitter = EventEmitter::new(
                        started.id.clone(),
                        store,
                        Some(Box::new(WsSink(writer))),
                    );
                    started.run.stream(started.resource, emitter, cancel).await;
                }
                Err(e) => {
                    send_json(&writer, &error_event(&e)).await;
                }
            }
        });
    }

    closing.cancel();
    if let Err(e) = writer.lock().await.close().await {
        debug!(connection_id = %connection_id, error = %e, "Responses WebSocket close failed");
    }
    debug!(connection_id = %connection_id, "Responses WebSocket closed");
}

/// Validate a client frame, returning the error frame to send back on failure.
fn parse_create(text: &str) -> Result<ResponsesRequest, Value> {
    let mut frame: Value = serde_json::from_str(text)
        .map_err(|_| request_error("invalid_json", "invalid JSON message", None))?;
    let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or_default();
    if frame_type != CREATE_FRAME {
        return Err(request_error(
            "unsupported_message_type",
            format!("unsupported message type: {frame_type}"),
            Some("type"),
        ));
    }
    if let Value::Object(map) = &mut frame {
        map.remove("type");
    }
    let mut request: ResponsesRequest = serde_json::from_value(frame).map_err(|e| {
        request_error("invalid_request", format!("failed to parse request: {e}"), None)
    })?;
    request.normalize();
    if request.model.is_empty() {
        return Err(request_error("invalid_request", "model is required", Some("model")));
    }
    if let Err(e) = request.validate() {
        warn!(error = %e, "Rejected WebSocket response.create");
        return Err(request_error("invalid_request", e.to_string(), None));
    }
    Ok(request)
}
