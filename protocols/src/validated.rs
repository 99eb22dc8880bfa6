//! JSON extractor that normalizes and validates request bodies.

/// Post-deserialization fix-ups (legacy field aliases, derived defaults).
pub trait Normalizable {
    fn normalize(&mut self) {}
}

#[cfg(feature = "axum")]
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
#[cfg(feature = "axum")]
use serde::de::DeserializeOwned;
#[cfg(feature = "axum")]
use validator::Validate;

#[cfg(feature = "axum")]
use crate::common::{ErrorDetail, ErrorResponse};

/// Header carrying the machine-readable error code on every error response.
pub const ERROR_CODE_HEADER: &str = "x-gateway-error-code";

/// Deserializes the body, runs [`Normalizable::normalize`], then `validate()`.
///
/// Both failure modes answer 400 with an OpenAI-shaped error body.
///
/// ```rust,ignore
/// async fn chat(ValidatedJson(request): ValidatedJson<ChatCompletionRequest>) -> Response {
///     handle(request).await
/// }
/// ```
#[cfg(feature = "axum")]
pub struct ValidatedJson<T>(pub T);

#[cfg(feature = "axum")]
fn bad_request(code: &str, message: String) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            message,
            error_type: "invalid_request_error".to_string(),
            param: None,
            code: Some(code.to_string()),
        },
    };
    let mut response = (StatusCode::BAD_REQUEST, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(code) {
        response.headers_mut().insert(ERROR_CODE_HEADER, value);
    }
    response
}

#[cfg(feature = "axum")]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + Normalizable + Send,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(mut data) =
            Json::<T>::from_request(req, state)
                .await
                .map_err(|err: JsonRejection| {
                    let message = match err {
                        JsonRejection::JsonDataError(e) => format!("Invalid JSON data: {e}"),
                        JsonRejection::JsonSyntaxError(e) => format!("JSON syntax error: {e}"),
                        JsonRejection::MissingJsonContentType(_) => {
                            "Missing Content-Type: application/json header".to_string()
                        }
                        _ => format!("Failed to parse JSON: {err}"),
                    };
                    bad_request("json_parse_error", message)
                })?;

        data.normalize();

        data.validate()
            .map_err(|errors| bad_request("validation_error", errors.to_string()))?;

        Ok(ValidatedJson(data))
    }
}

#[cfg(feature = "axum")]
impl<T> std::ops::Deref for ValidatedJson<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(feature = "axum")]
impl<T> std::ops::DerefMut for ValidatedJson<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
