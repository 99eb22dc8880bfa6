//! Gateway wired to an in-process fake backend.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, Method, Request, Response},
    Router,
};
use gateway::{build_app, config::GatewayConfig, AppContext};
use grpc_client::testing::FakeBackend;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const MODEL: &str = "fake-model";

/// Model config the fake backend serves. Reasoning extraction is off so
/// streamed chunks reach clients exactly as the backend produced them.
const MODEL_YAML: &str = "\
name: fake-model
backend: fake
parameters:
  model: fake.bin
reasoning:
  disable: true
";

pub struct TestGateway {
    pub ctx: Arc<AppContext>,
    pub app: Router,
    pub fake: FakeBackend,
    _models: TempDir,
    _server: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(fake: FakeBackend) -> Self {
        Self::with_config(fake, |_| {}).await
    }

    pub async fn with_config(fake: FakeBackend, customize: impl FnOnce(&mut GatewayConfig)) -> Self {
        Self::with_model(fake, "", customize).await
    }

    /// Like [`TestGateway::with_config`], appending `extra_yaml` to the model config.
    pub async fn with_model(
        fake: FakeBackend,
        extra_yaml: &str,
        customize: impl FnOnce(&mut GatewayConfig),
    ) -> Self {
        let (addr, server) = fake.clone().serve().await.expect("fake backend binds");
        let models = tempfile::tempdir().expect("temp models dir");
        std::fs::write(
            models.path().join("fake-model.yaml"),
            format!("{MODEL_YAML}{extra_yaml}"),
        )
        .expect("write model yaml");

        let mut config = GatewayConfig {
            models_path: models.path().to_path_buf(),
            templates_path: models.path().to_path_buf(),
            backends_path: models.path().join("backends"),
            generated_content_path: models.path().join("generated"),
            ..Default::default()
        };
        config.backend.load_attempts = 5;
        config.backend.load_delay = Duration::from_millis(20);
        config
            .backend
            .external_backends
            .insert("fake".to_string(), addr.to_string());
        customize(&mut config);

        let ctx = Arc::new(AppContext::new(config).expect("gateway context"));
        let app = build_app(ctx.clone());
        Self {
            ctx,
            app,
            fake,
            _models: models,
            _server: server,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("router is infallible")
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response<Body> {
        self.send(post_json(uri, body)).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap()
    }

    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    text.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event: ") {
                    event = Some(name.to_string());
                } else if let Some(payload) = line.strip_prefix("data: ") {
                    data.push(payload);
                }
            }
            SseEvent {
                event,
                data: data.join("\n"),
            }
        })
        .collect()
}

pub async fn sse_body(response: Response<Body>) -> Vec<SseEvent> {
    parse_sse(&body_text(response).await)
}

/// Read whole events off a streaming body until `count` have arrived.
pub async fn read_events(body: &mut Body, count: usize) -> Vec<SseEvent> {
    let mut buffer = String::new();
    loop {
        let complete = buffer.matches("\n\n").count();
        if complete >= count {
            let end = buffer
                .match_indices("\n\n")
                .nth(count - 1)
                .map(|(i, _)| i + 2)
                .unwrap();
            return parse_sse(&buffer[..end]);
        }
        let frame = tokio::time::timeout(Duration::from_secs(10), body.frame())
            .await
            .expect("stream stalled")
            .expect("stream ended early")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            buffer.push_str(std::str::from_utf8(&data).unwrap());
        }
    }
}

/// Poll until `check` holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
