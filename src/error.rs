//! Gateway error taxonomy and its HTTP mapping.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_connector::StoreError;
use grpc_client::ClientError;
use llm_templates::TemplateError;
use openai_protocol::messages;
use thiserror::Error;
use tool_parser::GrammarError;

use crate::routers::error::create_error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("path escapes its base directory: {0}")]
    PathTraversal(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to start backend {backend}: {reason}")]
    SpawnFailed { backend: String, reason: String },

    #[error("backend {backend} for model {model} did not become ready")]
    NotReady { backend: String, model: String },

    #[error(transparent)]
    RpcFailed(#[from] ClientError),

    #[error("{0}")]
    Unsupported(String),

    /// Every candidate backend failed; the message lists each failure
    #[error("could not load model {model}: {reasons}")]
    LoadFailed { model: String, reasons: String },

    #[error("{0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("request timed out")]
    Timeout,

    #[error("websocket connection deadline reached")]
    WebsocketDeadline,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0}")]
    Validation(String),
}

impl RequestError {
    pub fn validation(message: impl Into<String>) -> Self {
        RequestError::Validation(message.into())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        GatewayError::Backend(BackendError::RpcFailed(err))
    }
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Request(RequestError::validation(message))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) | GatewayError::Request(_) | GatewayError::Grammar(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::Backend(err) => match err {
                BackendError::SpawnFailed { .. }
                | BackendError::NotReady { .. }
                | BackendError::LoadFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                BackendError::RpcFailed(e) if e.is_transport() => StatusCode::BAD_GATEWAY,
                BackendError::RpcFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                BackendError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                BackendError::NotFound(_) => StatusCode::NOT_FOUND,
            },
            GatewayError::Transport(err) => match err {
                TransportError::ClientDisconnected => StatusCode::BAD_REQUEST,
                TransportError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                TransportError::WebsocketDeadline => StatusCode::REQUEST_TIMEOUT,
            },
            GatewayError::Template(TemplateError::PathTraversal(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Store(StoreError::AlreadyClosed(_)) => StatusCode::CONFLICT,
            GatewayError::Store(_) => StatusCode::NOT_FOUND,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code sent in the error body and the error-code header.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(ConfigError::PathTraversal(_)) => "path_traversal",
            GatewayError::Config(_) => "invalid_config",
            GatewayError::Backend(err) => match err {
                BackendError::SpawnFailed { .. } => "backend_spawn_failed",
                BackendError::NotReady { .. } => "backend_not_ready",
                BackendError::RpcFailed(e) if e.is_transport() => "backend_unavailable",
                BackendError::RpcFailed(_) => "backend_error",
                BackendError::Unsupported(_) => "unsupported",
                BackendError::LoadFailed { .. } => "model_load_failed",
                BackendError::NotFound(_) => "not_found",
            },
            GatewayError::Transport(err) => match err {
                TransportError::ClientDisconnected => "client_disconnected",
                TransportError::Timeout => "timeout",
                TransportError::WebsocketDeadline => "websocket_connection_limit_reached",
            },
            GatewayError::Request(_) => "validation_error",
            GatewayError::Template(TemplateError::PathTraversal(_)) => "path_traversal",
            GatewayError::Template(_) => "template_error",
            GatewayError::Grammar(_) => "invalid_grammar",
            GatewayError::Store(StoreError::NotFound(_)) => "response_not_found",
            GatewayError::Store(StoreError::Expired(_)) => "response_expired",
            GatewayError::Store(StoreError::AlreadyClosed(_)) => "response_closed",
            GatewayError::Io(_) => "io_error",
        }
    }

    /// Error body in the Anthropic Messages shape.
    pub fn anthropic_error(&self) -> messages::ErrorResponse {
        let error_type = match self.status() {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::SERVICE_UNAVAILABLE => "overloaded_error",
            _ => "api_error",
        };
        messages::ErrorResponse {
            error_type: error_type.to_string(),
            message: self.to_string(),
        }
    }

    pub fn into_anthropic_response(self) -> Response {
        let body = serde_json::json!({
            "type": "error",
            "error": self.anthropic_error(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        create_error(status, self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use openai_protocol::validated::ERROR_CODE_HEADER;

    use super::*;

    #[test]
    fn status_mapping() {
        let cases: Vec<(GatewayError, StatusCode)> = vec![
            (GatewayError::validation("bad"), StatusCode::BAD_REQUEST),
            (ConfigError::Invalid("x".into()).into(), StatusCode::BAD_REQUEST),
            (StoreError::NotFound("r".into()).into(), StatusCode::NOT_FOUND),
            (StoreError::Expired("r".into()).into(), StatusCode::NOT_FOUND),
            (
                BackendError::SpawnFailed {
                    backend: "llama-cpp".into(),
                    reason: "no such file".into(),
                }
                .into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ClientError::Rpc {
                    code: tonic::Code::Internal,
                    message: "boom".into(),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ClientError::Unavailable("refused".into()).into(), StatusCode::BAD_GATEWAY),
            (
                TemplateError::ParseFailed {
                    name: "chat".into(),
                    reason: "unexpected end".into(),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[tokio::test]
    async fn openai_body_and_header() {
        let response = GatewayError::from(TemplateError::ParseFailed {
            name: "chat".into(),
            reason: "unexpected end".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[ERROR_CODE_HEADER], "template_error");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "template_error");
        assert!(json["error"]["param"].is_null());
    }

    #[tokio::test]
    async fn anthropic_body() {
        let response = GatewayError::validation("max_tokens must be greater than 0")
            .into_anthropic_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "invalid_request_error");
    }
}
