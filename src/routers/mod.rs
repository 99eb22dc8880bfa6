//! HTTP handlers, one module per API surface.

pub mod audio;
pub mod chat;
pub mod completion;
pub mod embeddings;
pub mod error;
pub mod extras;
pub mod health;
pub mod images;
pub mod messages;
pub mod rerank;
pub mod responses;
pub mod sse;

use std::path::PathBuf;

use uuid::Uuid;

use crate::{
    config::model::ModelConfig,
    error::GatewayResult,
    middleware::ModelOverride,
    server::AppContext,
};

/// Owned config for the request's model. A bearer-token override wins over
/// the name in the body.
pub(crate) fn resolve_model(
    ctx: &AppContext,
    requested: &str,
    model_override: Option<&ModelOverride>,
) -> GatewayResult<ModelConfig> {
    let name = model_override.map(|m| m.0.as_str()).unwrap_or(requested);
    let (config, _) = ctx.models.resolve(name)?;
    Ok((*config).clone())
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh output path under `<generated>/<kind>/` and the URL serving it.
pub(crate) async fn generated_path(
    ctx: &AppContext,
    kind: &str,
    extension: &str,
) -> GatewayResult<(PathBuf, String)> {
    let dir = ctx.config.generated_content_path.join(kind);
    tokio::fs::create_dir_all(&dir).await?;
    let file = format!("{}.{extension}", Uuid::new_v4().simple());
    Ok((dir.join(&file), format!("/generated/{kind}/{file}")))
}
