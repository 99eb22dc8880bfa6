mod common;

use std::time::Duration;

use axum::{body::Body, http::StatusCode};
use common::{body_json, eventually, read_events, sse_body, SseEvent, TestGateway, MODEL};
use grpc_client::testing::FakeBackend;
use openai_protocol::responses::ResponseStatus;
use serde_json::{json, Value};

fn slow_backend(tokens: &[&str]) -> FakeBackend {
    FakeBackend {
        token_delay: Duration::from_millis(50),
        ..FakeBackend::with_tokens(tokens.iter().copied())
    }
}

fn sequence_numbers(events: &[SseEvent]) -> Vec<u64> {
    events
        .iter()
        .filter(|e| !e.is_done())
        .map(|e| e.json()["sequence_number"].as_u64().unwrap())
        .collect()
}

fn event_types(events: &[SseEvent]) -> Vec<String> {
    events
        .iter()
        .filter(|e| !e.is_done())
        .map(|e| e.event.clone().unwrap())
        .collect()
}

#[tokio::test]
async fn non_streaming_response_is_stored() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["he", "llo"])).await;
    let response = gateway
        .post("/v1/responses", json!({"model": MODEL, "input": "hi"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"][0]["type"], "message");
    assert_eq!(body["output"][0]["content"][0]["text"], "hello");
    assert!(body["usage"]["output_tokens"].as_u64().unwrap() > 0);

    let id = body["id"].as_str().unwrap();
    let stored = body_json(gateway.get(&format!("/v1/responses/{id}")).await).await;
    assert_eq!(stored["id"], id);
    assert_eq!(stored["status"], "completed");

    let items = body_json(gateway.get(&format!("/v1/responses/{id}/input_items")).await).await;
    assert_eq!(items["object"], "list");
    assert_eq!(items["data"][0]["type"], "message");
}

#[tokio::test]
async fn store_false_is_not_retrievable() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["ok"])).await;
    let body = body_json(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "hi", "store": false}))
            .await,
    )
    .await;
    let id = body["id"].as_str().unwrap();
    let response = gateway.get(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "response_not_found");
}

#[tokio::test]
async fn stream_events_arrive_in_order() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["he", "llo"])).await;
    let response = gateway
        .post("/v1/responses", json!({"model": MODEL, "input": "hi", "stream": true}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_body(response).await;

    assert!(events.last().unwrap().is_done());
    assert_eq!(
        event_types(&events),
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.content_part.added",
            "response.output_text.delta",
            "response.output_text.delta",
            "response.output_text.done",
            "response.content_part.done",
            "response.output_item.done",
            "response.completed",
        ]
    );
    let seqs = sequence_numbers(&events);
    assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());

    let completed = events[events.len() - 2].json();
    assert_eq!(completed["response"]["status"], "completed");
    assert_eq!(completed["response"]["output"][0]["content"][0]["text"], "hello");
}

#[tokio::test]
async fn function_call_streams_arguments() {
    let output = r#"{"name":"get_weather","arguments":{"location":"Paris"}}"#;
    let gateway = TestGateway::start(FakeBackend::with_tokens([output])).await;
    let response = gateway
        .post(
            "/v1/responses",
            json!({
                "model": MODEL,
                "input": "weather?",
                "stream": true,
                "tools": [{"type": "function", "name": "get_weather", "parameters": {"type": "object"}}]
            }),
        )
        .await;
    let events = sse_body(response).await;
    let types = event_types(&events);
    assert!(types.contains(&"response.function_call_arguments.done".to_string()));

    let completed = events[events.len() - 2].json();
    let item = &completed["response"]["output"][0];
    assert_eq!(item["type"], "function_call");
    assert_eq!(item["name"], "get_weather");
    let arguments: Value = serde_json::from_str(item["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments, json!({"location": "Paris"}));
}

#[tokio::test]
async fn background_stream_resumes_without_duplicates() {
    let gateway = TestGateway::start(slow_backend(&["a", "b", "c", "d", "e"])).await;
    let response = gateway
        .post(
            "/v1/responses",
            json!({"model": MODEL, "input": "hi", "stream": true, "background": true}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body: Body = response.into_body();
    let first = read_events(&mut body, 4).await;
    drop(body);
    assert_eq!(sequence_numbers(&first), vec![0, 1, 2, 3]);
    let id = first[0].json()["response"]["id"].as_str().unwrap().to_string();

    let resumed = sse_body(
        gateway
            .get(&format!("/v1/responses/{id}?stream=true&starting_after=3"))
            .await,
    )
    .await;
    assert!(resumed.last().unwrap().is_done());
    let rest = sequence_numbers(&resumed);
    assert_eq!(rest.first(), Some(&4));

    let mut all = sequence_numbers(&first);
    all.extend(rest);
    assert_eq!(all, (0..all.len() as u64).collect::<Vec<_>>());
    assert_eq!(event_types(&resumed).last().unwrap(), "response.completed");

    let stored = body_json(gateway.get(&format!("/v1/responses/{id}")).await).await;
    assert_eq!(stored["status"], "completed");
}

#[tokio::test]
async fn last_sequence_number_is_an_alias() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["x"])).await;
    let events = sse_body(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "hi", "stream": true}))
            .await,
    )
    .await;
    let id = events[0].json()["response"]["id"].as_str().unwrap().to_string();
    let total = sequence_numbers(&events).len() as u64;

    let resumed = sse_body(
        gateway
            .get(&format!("/v1/responses/{id}?stream=true&last_sequence_number=1"))
            .await,
    )
    .await;
    assert_eq!(sequence_numbers(&resumed), (2..total).collect::<Vec<_>>());

    let bad = gateway
        .get(&format!("/v1/responses/{id}?stream=true&starting_after=abc"))
        .await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(bad).await["error"]["param"], "starting_after");

    let past_end = gateway
        .get(&format!("/v1/responses/{id}?stream=true&starting_after={total}"))
        .await;
    assert_eq!(past_end.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(past_end).await["error"]["param"], "starting_after");

    let last = total - 1;
    let tail = sse_body(
        gateway
            .get(&format!("/v1/responses/{id}?stream=true&starting_after={last}"))
            .await,
    )
    .await;
    assert_eq!(tail.len(), 1);
    assert!(tail[0].is_done());
}

#[tokio::test]
async fn resume_requires_a_streamed_response() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["ok"])).await;
    let body = body_json(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "hi"}))
            .await,
    )
    .await;
    let id = body["id"].as_str().unwrap();
    let response = gateway.get(&format!("/v1/responses/{id}?stream=true")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["param"], "stream");
}

#[tokio::test]
async fn background_response_can_be_cancelled() {
    let gateway = TestGateway::start(slow_backend(&["a", "b", "c", "d", "e", "f", "g", "h"])).await;
    let queued = body_json(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "hi", "background": true}))
            .await,
    )
    .await;
    assert_eq!(queued["status"], "queued");
    let id = queued["id"].as_str().unwrap().to_string();

    let cancelled = body_json(
        gateway
            .post(&format!("/v1/responses/{id}/cancel"), json!({}))
            .await,
    )
    .await;
    assert_eq!(cancelled["status"], "cancelled");

    // cancelling a finished response changes nothing
    let again = gateway.post(&format!("/v1/responses/{id}/cancel"), json!({})).await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(body_json(again).await["status"], "cancelled");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = gateway.ctx.store.get(&id).unwrap();
    assert_eq!(stored.status, ResponseStatus::Cancelled);
    assert!(stored.closed);
}

#[tokio::test]
async fn background_requires_store() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["ok"])).await;
    let response = gateway
        .post(
            "/v1/responses",
            json!({"model": MODEL, "input": "hi", "background": true, "store": false}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn client_disconnect_cancels_stored_stream() {
    let fake = slow_backend(&["a", "b", "c", "d", "e", "f", "g", "h"]);
    let stream_cancelled = fake.stream_cancelled.clone();
    let gateway = TestGateway::start(fake).await;
    let response = gateway
        .post("/v1/responses", json!({"model": MODEL, "input": "hi", "stream": true}))
        .await;
    let mut body: Body = response.into_body();
    let first = read_events(&mut body, 1).await;
    let id = first[0].json()["response"]["id"].as_str().unwrap().to_string();
    drop(body);

    let store = gateway.ctx.store.clone();
    assert!(
        eventually(|| store
            .get(&id)
            .is_ok_and(|stored| stored.status == ResponseStatus::Cancelled))
        .await
    );
    assert!(
        eventually(|| stream_cancelled.load(std::sync::atomic::Ordering::SeqCst)).await,
        "backend stream should be dropped"
    );
}

#[tokio::test]
async fn previous_response_continues_the_conversation() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["Nice to meet you"])).await;
    let first = body_json(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "my name is Ada"}))
            .await,
    )
    .await;
    let id = first["id"].as_str().unwrap();

    let second = gateway
        .post(
            "/v1/responses",
            json!({"model": MODEL, "input": "what is my name?", "previous_response_id": id}),
        )
        .await;
    assert_eq!(second.status(), StatusCode::OK);
    let predictions = gateway.fake.predictions.lock();
    let prompt = &predictions.last().unwrap().prompt;
    assert!(prompt.contains("my name is Ada"));
    assert!(prompt.contains("Nice to meet you"));
    assert!(prompt.contains("what is my name?"));
}

#[tokio::test]
async fn delete_removes_the_response() {
    let gateway = TestGateway::start(FakeBackend::with_tokens(["ok"])).await;
    let body = body_json(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "hi"}))
            .await,
    )
    .await;
    let id = body["id"].as_str().unwrap();

    let request = axum::http::Request::delete(format!("/v1/responses/{id}"))
        .body(Body::empty())
        .unwrap();
    let deleted = body_json(gateway.send(request).await).await;
    assert_eq!(deleted["deleted"], true);
    assert_eq!(
        gateway.get(&format!("/v1/responses/{id}")).await.status(),
        StatusCode::NOT_FOUND
    );
}
