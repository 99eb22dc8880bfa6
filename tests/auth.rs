mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{body_json, TestGateway};
use grpc_client::testing::FakeBackend;

async fn gateway_with_key() -> TestGateway {
    TestGateway::with_config(FakeBackend::with_tokens(["ok"]), |config| {
        config.api_keys = vec!["secret".to_string()];
    })
    .await
}

#[tokio::test]
async fn health_probes_need_no_key() {
    let gateway = gateway_with_key().await;
    for path in ["/healthz", "/readyz"] {
        assert_eq!(gateway.get(path).await.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn missing_or_wrong_key_is_rejected() {
    let gateway = gateway_with_key().await;
    let response = gateway.get("/v1/models").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_api_key");
    assert_eq!(body["error"]["type"], "authentication_error");

    let request = Request::get("/v1/models")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(gateway.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bearer_and_api_key_headers_are_accepted() {
    let gateway = gateway_with_key().await;
    let bearer = Request::get("/v1/models")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(gateway.send(bearer).await.status(), StatusCode::OK);

    let api_key = Request::get("/v1/models")
        .header("x-api-key", "secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(gateway.send(api_key).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn model_file_bearer_does_not_replace_the_key() {
    let gateway = gateway_with_key().await;
    let model_only = Request::get("/v1/models")
        .header(header::AUTHORIZATION, "Bearer fake-model.yaml")
        .body(Body::empty())
        .unwrap();
    let response = gateway.send(model_only).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], "invalid_api_key");

    let with_key = Request::get("/v1/models")
        .header(header::AUTHORIZATION, "Bearer fake-model.yaml")
        .header("x-api-key", "secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(gateway.send(with_key).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn request_id_is_propagated() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["ok"])).await;
    let request = Request::get("/healthz")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = gateway.send(request).await;
    assert_eq!(response.headers()["x-request-id"], "req-123");

    let generated = gateway.get("/healthz").await;
    assert!(!generated.headers()["x-request-id"].is_empty());
}
