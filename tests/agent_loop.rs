mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{body_json, sse_body, TestGateway, MODEL};
use gateway::mcp::{McpResult, ToolExecutor, ToolInfo};
use grpc_client::testing::FakeBackend;
use parking_lot::Mutex;
use serde_json::{json, Value};

const AGENT_YAML: &str = "\
mcp:
  servers: [local]
agent:
  max_iterations: 2
";

#[derive(Default)]
struct Echo {
    calls: Mutex<Vec<Value>>,
}

#[async_trait]
impl ToolExecutor for Echo {
    async fn list_tools(&self) -> McpResult<Vec<ToolInfo>> {
        Ok(vec![ToolInfo {
            name: "echo".into(),
            description: None,
            input_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        }])
    }

    async fn call_tool(&self, _name: &str, arguments: Value) -> McpResult<String> {
        self.calls.lock().push(arguments.clone());
        Ok(format!("echoed {}", arguments["text"].as_str().unwrap_or_default()))
    }
}

async fn agent_gateway() -> (TestGateway, Arc<Echo>) {
    let call = r#"{"name":"echo","arguments":{"text":"pong"}}"#;
    let gateway = TestGateway::with_model(FakeBackend::with_tokens([call]), AGENT_YAML, |_| {}).await;
    let echo = Arc::new(Echo::default());
    gateway.ctx.mcp.register("local", echo.clone());
    (gateway, echo)
}

#[tokio::test]
async fn executor_tools_run_until_the_iteration_limit() {
    let (gateway, echo) = agent_gateway().await;
    let response = gateway
        .post("/v1/responses", json!({"model": MODEL, "input": "say pong"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let types: Vec<&str> = body["output"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["function_call", "function_call_output", "function_call"]);
    assert_eq!(body["output"][1]["output"], "echoed pong");
    assert_eq!(body["output"][1]["call_id"], body["output"][0]["call_id"]);

    assert_eq!(echo.calls.lock().len(), 1);
    let predictions = gateway.fake.predictions.lock();
    assert_eq!(predictions.len(), 2);
    assert!(predictions[1].prompt.contains("echoed pong"));
}

#[tokio::test]
async fn streamed_loop_emits_tool_output_items() {
    let (gateway, echo) = agent_gateway().await;
    let events = sse_body(
        gateway
            .post("/v1/responses", json!({"model": MODEL, "input": "say pong", "stream": true}))
            .await,
    )
    .await;
    let completed = events[events.len() - 2].json();
    assert_eq!(completed["type"], "response.completed");
    assert_eq!(completed["response"]["output"][1]["type"], "function_call_output");

    let added: Vec<String> = events
        .iter()
        .filter(|e| e.event.as_deref() == Some("response.output_item.added"))
        .map(|e| e.json()["item"]["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(added, vec!["function_call", "function_call_output", "function_call"]);
    assert_eq!(echo.calls.lock().len(), 1);
}
