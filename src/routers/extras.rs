//! Auxiliary endpoints: tokenization, VAD, detection, vector stores and
//! backend supervision.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use grpc_client::proto;
use openai_protocol::{
    extras::{
        BackendMonitorRequest, BackendMonitorResponse, Detection, DetectionRequest,
        DetectionResponse, StoresDeleteRequest, StoresFindRequest, StoresFindResponse,
        StoresGetRequest, StoresGetResponse, StoresSetRequest, TokenizeRequest, TokenizeResponse,
        VadRequest, VadResponse, VadSegment,
    },
    validated::ValidatedJson,
};
use serde_json::json;
use tracing::info;

use super::resolve_model;
use crate::{
    config::model::ModelConfig,
    error::{BackendError, GatewayError, GatewayResult},
    inference::prompt::load_media,
    middleware::ModelOverride,
    server::AppContext,
};

const DEFAULT_STORE: &str = "default";
const STORE_BACKEND: &str = "local-store";

fn respond<T: serde::Serialize>(result: GatewayResult<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn tokenize(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<TokenizeRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    respond(
        async {
            let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
            let tokens = ctx.dispatcher.tokenize(&config, &request.content).await?;
            Ok::<_, GatewayError>(TokenizeResponse { tokens })
        }
        .await,
    )
}

pub async fn vad(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<VadRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    respond(
        async {
            let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
            let result = ctx.dispatcher.vad(&config, request.audio).await?;
            Ok::<_, GatewayError>(VadResponse {
                segments: result
                    .segments
                    .into_iter()
                    .map(|s| VadSegment {
                        start: s.start,
                        end: s.end,
                    })
                    .collect(),
            })
        }
        .await,
    )
}

pub async fn detection(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<DetectionRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    respond(
        async {
            let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
            let image = load_media(&request.image).await?;
            let result = ctx.dispatcher.detect(&config, image).await?;
            Ok::<_, GatewayError>(DetectionResponse {
                detections: result
                    .detections
                    .into_iter()
                    .map(|d| Detection {
                        x: d.x,
                        y: d.y,
                        width: d.width,
                        height: d.height,
                        confidence: d.confidence,
                        class_name: d.class_name,
                    })
                    .collect(),
            })
        }
        .await,
    )
}

/// Vector stores are models served by the store backend; the store name
/// selects the model.
fn store_config(ctx: &AppContext, store: &str) -> GatewayResult<ModelConfig> {
    let name = if store.is_empty() { DEFAULT_STORE } else { store };
    let mut config = resolve_model(ctx, name, None)?;
    if config.backend.is_empty() {
        config.backend = STORE_BACKEND.to_string();
    }
    Ok(config)
}

fn to_keys(keys: Vec<Vec<f32>>) -> Vec<proto::StoresKey> {
    keys.into_iter().map(|floats| proto::StoresKey { floats }).collect()
}

fn from_keys(keys: Vec<proto::StoresKey>) -> Vec<Vec<f32>> {
    keys.into_iter().map(|k| k.floats).collect()
}

fn from_values(values: Vec<proto::StoresValue>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| String::from_utf8_lossy(&v.bytes).into_owned())
        .collect()
}

pub async fn stores_set(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<StoresSetRequest>,
) -> Response {
    respond(
        async {
            if request.keys.len() != request.values.len() {
                return Err(GatewayError::validation("keys and values must have the same length"));
            }
            let config = store_config(&ctx, &request.store)?;
            let options = proto::StoresSetOptions {
                keys: to_keys(request.keys),
                values: request
                    .values
                    .into_iter()
                    .map(|v| proto::StoresValue { bytes: v.into_bytes() })
                    .collect(),
            };
            ctx.dispatcher.stores_set(&config, options).await?;
            Ok::<_, GatewayError>(json!({}))
        }
        .await,
    )
}

pub async fn stores_delete(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<StoresDeleteRequest>,
) -> Response {
    respond(
        async {
            let config = store_config(&ctx, &request.store)?;
            let options = proto::StoresDeleteOptions {
                keys: to_keys(request.keys),
            };
            ctx.dispatcher.stores_delete(&config, options).await?;
            Ok::<_, GatewayError>(json!({}))
        }
        .await,
    )
}

pub async fn stores_get(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<StoresGetRequest>,
) -> Response {
    respond(
        async {
            let config = store_config(&ctx, &request.store)?;
            let options = proto::StoresGetOptions {
                keys: to_keys(request.keys),
            };
            let result = ctx.dispatcher.stores_get(&config, options).await?;
            Ok::<_, GatewayError>(StoresGetResponse {
                keys: from_keys(result.keys),
                values: from_values(result.values),
            })
        }
        .await,
    )
}

pub async fn stores_find(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<StoresFindRequest>,
) -> Response {
    respond(
        async {
            let config = store_config(&ctx, &request.store)?;
            let options = proto::StoresFindOptions {
                key: Some(proto::StoresKey { floats: request.key }),
                top_k: request.topk,
            };
            let result = ctx.dispatcher.stores_find(&config, options).await?;
            Ok::<_, GatewayError>(StoresFindResponse {
                keys: from_keys(result.keys),
                values: from_values(result.values),
                similarities: result.similarities,
            })
        }
        .await,
    )
}

/// Status, memory and metrics of a loaded backend. Never loads a model.
pub async fn backend_monitor(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<BackendMonitorRequest>,
) -> Response {
    respond(
        async {
            let instance = ctx.loader.lookup(&request.model).ok_or_else(|| {
                BackendError::NotFound(format!("model {} is not loaded", request.model))
            })?;
            let status = ctx.dispatcher.status(&request.model).await?;
            let mut memory = HashMap::new();
            if let Some(usage) = &status.memory {
                memory.extend(usage.breakdown.clone());
                memory.insert("total".to_string(), usage.total);
            }
            // Not every backend reports metrics
            let metrics = ctx.dispatcher.metrics(&request.model).await.ok().map(|m| {
                json!({
                    "slot_id": m.slot_id,
                    "prompt_json_for_slot": m.prompt_json_for_slot,
                    "tokens_per_second": m.tokens_per_second,
                    "tokens_generated": m.tokens_generated,
                    "prompt_tokens_processed": m.prompt_tokens_processed,
                })
            });
            Ok::<_, GatewayError>(BackendMonitorResponse {
                model: request.model.clone(),
                backend: instance.backend().to_string(),
                state: status.state().as_str_name().to_ascii_lowercase(),
                pid: instance.pid(),
                uptime_seconds: instance.loaded_for().as_secs(),
                memory,
                metrics,
            })
        }
        .await,
    )
}

pub async fn backend_shutdown(
    State(ctx): State<Arc<AppContext>>,
    ValidatedJson(request): ValidatedJson<BackendMonitorRequest>,
) -> Response {
    match ctx.loader.evict(&request.model).await {
        Ok(()) => {
            info!(model = %request.model, "Backend shut down on request");
            (StatusCode::OK, Json(json!({}))).into_response()
        }
        Err(e) => e.into_response(),
    }
}
