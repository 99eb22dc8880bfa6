//! Request middleware: API key checks and bearer-token model selection.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::{routers::error::unauthorized, server::AppContext};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Paths that never require a key.
const PUBLIC_PATHS: &[&str] = &["/healthz", "/readyz"];

/// Model selected by the bearer token; wins over the body's `model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOverride(pub String);

fn authorization_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}


/// The request id set by the request-id layer, used as correlation id.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}

pub async fn auth(State(ctx): State<Arc<AppContext>>, mut req: Request<Body>, next: Next) -> Response {
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    // Either header may carry the key; the bearer may instead name a model.
    let keys = &ctx.config.api_keys;
    let headers = req.headers();
    let authorized = keys.is_empty()
        || [authorization_bearer(headers), api_key_header(headers)]
            .into_iter()
            .flatten()
            .any(|t| keys.iter().any(|k| k == t));
    if !authorized {
        return unauthorized("invalid_api_key", "A valid API key is required");
    }

    if let Some(token) = authorization_bearer(req.headers()).map(str::to_string) {
        if names_model_file(&ctx, &token) {
            debug!(model = %token, "Bearer token selects the model");
            req.extensions_mut().insert(ModelOverride(token));
        }
    }
    next.run(req).await
}

fn names_model_file(ctx: &AppContext, token: &str) -> bool {
    if token.contains("..") || token.contains('/') || token.contains('\\') {
        return false;
    }
    ctx.config.models_path.join(token).is_file()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn tokens_are_read_from_both_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(authorization_bearer(&headers), None);
        headers.insert("x-api-key", HeaderValue::from_static(" k2 "));
        assert_eq!(api_key_header(&headers), Some("k2"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic k1"));
        assert_eq!(authorization_bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k1"));
        assert_eq!(authorization_bearer(&headers), Some("k1"));
    }
}
