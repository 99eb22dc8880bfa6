//! Liveness, readiness and the model list.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use openai_protocol::models::{ListModelsResponse, ModelObject};

use crate::server::AppContext;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the server accepts requests; backends load lazily.
pub async fn readyz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn list_models(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let data = ctx.models.list_models().into_iter().map(ModelObject::new).collect();
    Json(ListModelsResponse {
        object: "list".to_string(),
        data,
    })
}
