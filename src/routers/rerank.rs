use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Extension, Json,
};
use grpc_client::proto;
use openai_protocol::{
    common::SamplingOverrides,
    rerank::{RerankDocument, RerankRequest, RerankResponse, RerankResult, RerankUsage},
    validated::ValidatedJson,
};

use super::resolve_model;
use crate::{error::GatewayResult, middleware::ModelOverride, server::AppContext};

pub async fn rerank(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<RerankRequest>,
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
    request: RerankRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&SamplingOverrides {
        backend: request.backend.clone(),
        ..Default::default()
    });
    let top_n = request
        .top_n
        .filter(|n| *n > 0)
        .unwrap_or(request.documents.len() as i32);
    let result = ctx
        .dispatcher
        .rerank(
            &config,
            proto::RerankRequest {
                query: request.query.clone(),
                documents: request.documents.clone(),
                top_n,
            },
        )
        .await?;

    Ok(Json(RerankResponse {
        model: if request.model.is_empty() {
            config.name
        } else {
            request.model
        },
        usage: result
            .usage
            .map(|u| RerankUsage {
                total_tokens: u.total_tokens,
                prompt_tokens: u.prompt_tokens,
            })
            .unwrap_or_default(),
        results: rank(result.results, top_n),
    })
    .into_response())
}

/// Highest score first, at most `top_n`.
fn rank(results: Vec<proto::DocumentResult>, top_n: i32) -> Vec<RerankResult> {
    let mut results: Vec<RerankResult> = results
        .into_iter()
        .map(|d| RerankResult {
            index: d.index,
            document: RerankDocument { text: d.text },
            relevance_score: d.relevance_score,
        })
        .collect();
    results.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    results.truncate(top_n.max(0) as usize);
    results
}
