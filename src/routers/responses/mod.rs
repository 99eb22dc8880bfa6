//! Open Responses API (`/v1/responses`).
//!
//! Responses are persisted in the [`ResponseStore`] unless the request sets
//! `store: false`. Streamed events are appended to the store as they are
//! sent, which is what makes background runs, resume and cancel work.

mod conversation;
mod emitter;
mod engine;
mod websocket;

use std::{collections::HashMap, io, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use data_connector::{follow_events, CancellationToken, ResponseStore};
use futures::{stream, StreamExt};
use openai_protocol::{
    common::{generate_id, SamplingOverrides},
    responses::{ResponseInputItemList, ResponseObject, ResponseStatus, ResponsesRequest},
    validated::ValidatedJson,
};
use serde_json::json;
use tracing::debug;

pub use self::websocket::{responses_websocket, MAX_MESSAGE_SIZE};
use self::{
    emitter::{EventEmitter, SseSink},
    engine::ResponseRun,
};
use super::{error::create_error_with_param, resolve_model, sse};
use crate::{
    error::{GatewayError, GatewayResult},
    middleware::{request_id, ModelOverride},
    server::AppContext,
};

/// Header carrying the last event a reconnecting SSE client saw.
const LAST_EVENT_ID: &str = "last-event-id";

/// A validated request ready to generate.
pub(crate) struct Started {
    pub id: String,
    pub resource: ResponseObject,
    pub run: ResponseRun,
}

/// Resolve the model and build the conversation for `request`.
pub(crate) async fn start(
    ctx: &Arc<AppContext>,
    model_override: Option<&ModelOverride>,
    correlation_id: String,
    request: &ResponsesRequest,
) -> GatewayResult<Started> {
    let mut config = resolve_model(ctx, &request.model, model_override)?;
    config.overlay(&SamplingOverrides {
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_output_tokens,
        presence_penalty: request.presence_penalty,
        frequency_penalty: request.frequency_penalty,
        ..Default::default()
    });
    let toolset = ctx.mcp.toolset_for(&config).await;
    let input = conversation::build_input(&ctx.store, request, &toolset)?;

    let id = generate_id("resp_");
    let resource = ResponseObject::from_request(id.clone(), request, ResponseStatus::InProgress);
    debug!(response_id = %id, model = %config.name, tools = input.tools.len(), "Response started");
    Ok(Started {
        id,
        resource,
        run: ResponseRun {
            ctx: ctx.clone(),
            config,
            input,
            toolset,
            correlation_id,
        },
    })
}

pub async fn create_response(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<ResponsesRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle(ctx, model_override, request_id(&headers), request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    correlation_id: String,
    request: ResponsesRequest,
) -> GatewayResult<Response> {
    if request.model.is_empty() && model_override.is_none() {
        return Err(GatewayError::validation("model is required"));
    }
    let started = start(&ctx, model_override.as_ref(), correlation_id, &request).await?;
    let Started { id, resource, run } = started;

    if request.is_background() {
        let cancel = CancellationToken::new();
        let mut queued = resource.clone();
        queued.status = ResponseStatus::Queued;
        ctx.store
            .store_background(&id, request.clone(), queued.clone(), cancel.clone());
        let store = ctx.store.clone();
        let run_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_status(&run_id, ResponseStatus::InProgress, None) {
                debug!(response_id = %run_id, error = %e, "Background response cancelled or deleted before start");
                return;
            }
            let emitter = EventEmitter::new(run_id, Some(store), None);
            run.stream(resource, emitter, cancel).await;
        });
        if request.is_stream() {
            return replay(ctx.store.clone(), id, None);
        }
        return Ok(Json(queued).into_response());
    }

    let store = request.should_store().then(|| ctx.store.clone());
    if request.is_stream() {
        if let Some(store) = &store {
            store.store(&id, request.clone(), resource.clone());
        }
        let (tx, response) = sse::channel();
        tokio::spawn(async move {
            let emitter = EventEmitter::new(id, store, Some(Box::new(SseSink(tx.clone()))));
            run.stream(resource, emitter, CancellationToken::new()).await;
            sse::send_done(&tx).await;
        });
        return Ok(response);
    }

    let resource = run.execute(resource).await?;
    if let Some(store) = &store {
        store.store(&id, request, resource.clone());
    }
    Ok(Json(resource).into_response())
}

/// Stored events after `after` as SSE, following live ones until the
/// stream closes, then `[DONE]`.
fn replay(store: Arc<ResponseStore>, id: String, after: Option<u64>) -> GatewayResult<Response> {
    let events = follow_events(store, id, after)?;
    let frames = events
        .map(|event| sse::format_event(&event.event_type, None, &event.payload))
        .chain(stream::once(async { Bytes::from_static(b"data: [DONE]\n\n") }))
        .map(Ok::<_, io::Error>);
    Ok(sse::build_sse_response(Body::from_stream(frames)))
}

/// `GET /v1/responses/{id}`; `?stream=true` resumes the event stream after
/// `starting_after` (alias `last_sequence_number`, or the `Last-Event-ID`
/// header).
pub async fn get_response(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let stored = match ctx.store.get(&id) {
        Ok(stored) => stored,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    if params.get("stream").map(String::as_str) != Some("true") {
        return Json(stored.response).into_response();
    }
    if !stored.request.is_stream() {
        return create_error_with_param(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "cannot stream a response that was not created with stream=true",
            Some("stream"),
        );
    }

    let cursor = params
        .get("starting_after")
        .or_else(|| params.get("last_sequence_number"))
        .map(String::as_str)
        .or_else(|| headers.get(LAST_EVENT_ID).and_then(|v| v.to_str().ok()));
    let after = match cursor.map(str::parse::<u64>) {
        None => None,
        Some(Ok(n)) if n < stored.event_count => Some(n),
        Some(Ok(n)) => {
            return create_error_with_param(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!(
                    "starting_after {n} is past the last event ({} recorded)",
                    stored.event_count
                ),
                Some("starting_after"),
            )
        }
        Some(Err(_)) => {
            return create_error_with_param(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "starting_after must be a non-negative integer",
                Some("starting_after"),
            )
        }
    };
    replay(ctx.store.clone(), id, after).unwrap_or_else(IntoResponse::into_response)
}

pub async fn cancel_response(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    match ctx.store.cancel(&id) {
        Ok(response) => Json(response).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub async fn delete_response(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    if let Ok(Some(token)) = ctx.store.cancel_handle(&id) {
        token.cancel();
    }
    match ctx.store.delete(&id) {
        Ok(()) => Json(json!({"id": id, "object": "response", "deleted": true})).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}

pub async fn list_input_items(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Response {
    let stored = match ctx.store.get(&id) {
        Ok(stored) => stored,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    let data = conversation::input_items(&stored.request);
    let first_id = data.first().and_then(|i| i.id()).map(str::to_string);
    let last_id = data.last().and_then(|i| i.id()).map(str::to_string);
    Json(ResponseInputItemList {
        object: "list".to_string(),
        data,
        first_id,
        last_id,
        has_more: false,
    })
    .into_response()
}
