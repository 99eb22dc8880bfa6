//! Application state, router assembly and the serve loop.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderName, Request},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use data_connector::ResponseStore;
use llm_templates::{Evaluator, TemplateCache};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, info_span, warn};

use crate::{
    backend::{BackendLoader, Watchdog},
    config::{GatewayConfig, ModelConfigLoader},
    error::ConfigError,
    inference::Dispatcher,
    mcp::McpRegistry,
    middleware::{auth, REQUEST_ID_HEADER},
    routers::{
        audio, chat, completion, embeddings, extras, health, images, messages, rerank, responses,
    },
};

/// Shared state behind every handler.
pub struct AppContext {
    pub config: GatewayConfig,
    pub models: Arc<ModelConfigLoader>,
    pub loader: Arc<BackendLoader>,
    pub dispatcher: Arc<Dispatcher>,
    pub evaluator: Arc<Evaluator>,
    pub store: Arc<ResponseStore>,
    pub mcp: Arc<McpRegistry>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("models_path", &self.config.models_path)
            .field("loaded", &self.loader.loaded().len())
            .field("stored_responses", &self.store.count())
            .finish()
    }
}

impl AppContext {
    /// Load model configs and wire every component. Must run inside a tokio
    /// runtime so the store sweeper and watchdog can start.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        let models = Arc::new(ModelConfigLoader::from_gateway_config(&config)?);
        let loader = Arc::new(BackendLoader::from_gateway_config(&config));
        let dispatcher = Arc::new(Dispatcher::new(
            loader.clone(),
            &config.models_path,
            config.trim_trailing_zero_embeddings,
        ));
        let evaluator = Arc::new(Evaluator::new(TemplateCache::new(&config.templates_path)));
        let store = ResponseStore::new(config.responses_store_ttl);
        let watchdog = Watchdog::spawn(loader.clone(), config.watchdog.clone());
        if !config.galleries.is_empty() {
            info!(galleries = ?config.galleries, "Model galleries configured; installing is not supported");
        }
        Ok(Self {
            config,
            models,
            loader,
            dispatcher,
            evaluator,
            store,
            mcp: Arc::new(McpRegistry::new()),
            watchdog: Mutex::new(watchdog),
        })
    }

    /// Stop the watchdog and every backend this gateway started.
    pub async fn shutdown(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown().await;
        }
        self.loader.shutdown_all().await;
    }
}

pub fn build_app(ctx: Arc<AppContext>) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let openai = Router::new()
        .route("/v1/models", get(health::list_models))
        .route("/models", get(health::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/chat/completions", post(chat::chat_completions))
        .route("/v1/completions", post(completion::completions))
        .route("/completions", post(completion::completions))
        .route("/v1/edits", post(completion::edits))
        .route("/v1/embeddings", post(embeddings::embeddings))
        .route("/embeddings", post(embeddings::embeddings))
        .route("/v1/images/generations", post(images::generate_images))
        .route("/video", post(images::generate_video))
        .route("/generated/{kind}/{file}", get(images::serve_generated))
        .route("/v1/audio/transcriptions", post(audio::transcriptions))
        .route("/v1/audio/speech", post(audio::speech))
        .route("/v1/sound-generation", post(audio::sound_generation))
        .route("/v1/rerank", post(rerank::rerank))
        .route("/v1/messages", post(messages::create_message));

    let responses = Router::new()
        .route(
            "/v1/responses",
            post(responses::create_response).get(responses::responses_websocket),
        )
        .route(
            "/v1/responses/{id}",
            get(responses::get_response).delete(responses::delete_response),
        )
        .route("/v1/responses/{id}/cancel", post(responses::cancel_response))
        .route("/v1/responses/{id}/input_items", get(responses::list_input_items));

    let auxiliary = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/v1/tokenize", post(extras::tokenize))
        .route("/v1/vad", post(extras::vad))
        .route("/v1/detection", post(extras::detection))
        .route("/backend/monitor", post(extras::backend_monitor))
        .route("/backend/shutdown", post(extras::backend_shutdown))
        .route("/stores/set", post(extras::stores_set))
        .route("/stores/delete", post(extras::stores_delete))
        .route("/stores/get", post(extras::stores_get))
        .route("/stores/find", post(extras::stores_find));

    Router::new()
        .merge(openai)
        .merge(responses)
        .merge(auxiliary)
        .layer(from_fn_with_state(ctx.clone(), auth))
        .layer(DefaultBodyLimit::max(ctx.config.upload_limit_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                    let id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    info_span!("request", method = %req.method(), uri = %req.uri(), request_id = %id)
                }))
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .with_state(ctx)
}

/// Bind and serve until `shutdown` resolves, then stop every backend.
pub async fn serve(
    ctx: Arc<AppContext>,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_app(ctx.clone());
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    info!("Stopping backends");
    if tokio::time::timeout(Duration::from_secs(30), ctx.shutdown()).await.is_err() {
        warn!("Backends did not stop within 30s");
    }
    result
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
