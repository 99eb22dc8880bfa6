//! Server-sent event plumbing shared by every streaming endpoint.
//!
//! Producers run in a spawned task and write frames into a bounded channel
//! that backs the response body. A failed send means the client went away,
//! and the producer should stop.

use std::io;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use super::error::internal_error;

pub const SSE_CHANNEL_SIZE: usize = 128;

pub type SseSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Channel whose receiving half is already wrapped as an SSE response.
pub fn channel() -> (SseSender, Response) {
    let (tx, rx) = mpsc::channel(SSE_CHANNEL_SIZE);
    let body = Body::from_stream(ReceiverStream::new(rx));
    (tx, build_sse_response(body))
}

pub fn build_sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|e| {
            error!("Failed to build streaming response: {}", e);
            internal_error("response_build_failed", "Failed to build response")
        })
}

fn to_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string())
}

/// `data: <json>\n\n`
pub fn format_data<T: Serialize>(data: &T) -> Bytes {
    Bytes::from(format!("data: {}\n\n", to_json(data)))
}

/// `event: <type>\n[id: <n>\n]data: <json>\n\n`
pub fn format_event<T: Serialize>(event_type: &str, id: Option<u64>, data: &T) -> Bytes {
    let json = to_json(data);
    match id {
        Some(id) => Bytes::from(format!("event: {event_type}\nid: {id}\ndata: {json}\n\n")),
        None => Bytes::from(format!("event: {event_type}\ndata: {json}\n\n")),
    }
}

/// Returns `false` once the receiver is gone.
pub async fn send_data<T: Serialize>(tx: &SseSender, data: &T) -> bool {
    tx.send(Ok(format_data(data))).await.is_ok()
}

pub async fn send_event<T: Serialize>(tx: &SseSender, event_type: &str, data: &T) -> bool {
    tx.send(Ok(format_event(event_type, None, data))).await.is_ok()
}

pub async fn send_done(tx: &SseSender) -> bool {
    tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await.is_ok()
}
