use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Extension, Json,
};
use openai_protocol::{
    common::{SamplingOverrides, Usage},
    embedding::{EmbeddingData, EmbeddingRequest, EmbeddingResponse},
    validated::ValidatedJson,
};

use super::resolve_model;
use crate::{error::GatewayResult, middleware::ModelOverride, server::AppContext};

pub async fn embeddings(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<EmbeddingRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle(ctx, model_override, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    request: EmbeddingRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&SamplingOverrides {
        backend: request.backend.clone(),
        ..Default::default()
    });

    let mut data = Vec::new();
    for (index, input) in request.input.values().iter().enumerate() {
        let embedding = ctx.dispatcher.embeddings(&config, input).await?;
        data.push(EmbeddingData {
            object: "embedding".to_string(),
            embedding,
            index: index as u32,
        });
    }

    Ok(Json(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: if request.model.is_empty() {
            config.name
        } else {
            request.model
        },
        usage: Usage::default(),
    })
    .into_response())
}
