//! JSON tool call extraction, complete and streamed

mod common;

use common::{assemble_calls, create_test_tools, run_stream, streaming_helpers::*};
use serde_json::{json, Value};
use tool_parser::{ConfiguredParser, FunctionsConfig, ToolParser};

const WEATHER: &str = r#"{"name":"get_weather","arguments":{"location":"San Francisco"}}"#;

#[tokio::test]
async fn test_complete_single_call() {
    let parser = ConfiguredParser::new(FunctionsConfig::default());
    let (text, calls) = parser.parse_complete(WEATHER).await.unwrap();
    assert!(text.is_empty());
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "get_weather");
    assert_eq!(calls[0].function.arguments, r#"{"location":"San Francisco"}"#);
}

#[tokio::test]
async fn test_plain_text_is_kept() {
    let parser = ConfiguredParser::new(FunctionsConfig::default());
    let (text, calls) = parser.parse_complete("The weather is fine.").await.unwrap();
    assert!(calls.is_empty());
    assert_eq!(text, "The weather is fine.");
}

#[tokio::test]
async fn test_parallel_calls_array() {
    let parser = ConfiguredParser::new(FunctionsConfig::default());
    let input = r#"[{"name":"search","arguments":{"query":"rust"}},{"name":"calculate","arguments":{"x":1,"y":2}}]"#;
    let (_, calls) = parser.parse_complete(input).await.unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].function.name, "calculate");
    let args: Value = serde_json::from_str(&calls[1].function.arguments).unwrap();
    assert_eq!(args, json!({"x": 1, "y": 2}));
}

#[tokio::test]
async fn test_mixed_mode_captures_text() {
    let config = FunctionsConfig {
        capture_llm_results: vec![r"(?s)^(.*?)\{".into()],
        ..Default::default()
    };
    let parser = ConfiguredParser::new(config);
    let input = format!("Let me check the weather. {WEATHER}");
    let (text, calls) = parser.parse_complete(&input).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(text, "Let me check the weather.");
}

#[tokio::test]
async fn test_streaming_realistic_chunks() {
    let mut parser = ConfiguredParser::new(FunctionsConfig::default());
    let chunks = create_realistic_chunks(WEATHER);
    let (text, items) = run_stream(&mut parser, &chunks, &create_test_tools()).await;
    assert!(text.is_empty());

    let calls = assemble_calls(&items);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "get_weather");
    assert_eq!(calls[0].1, r#"{"location":"San Francisco"}"#);
}

#[tokio::test]
async fn test_streaming_strategic_chunks_with_prose() {
    let mut parser = ConfiguredParser::new(FunctionsConfig::default());
    let input = format!(r#"Calling now: [{WEATHER}, {{"name": "search", "arguments": {{"query": "a, b"}}}}]"#);
    let chunks = create_strategic_chunks(&input);
    let (text, items) = run_stream(&mut parser, &chunks, &create_test_tools()).await;
    assert_eq!(text, "Calling now: ");

    let calls = assemble_calls(&items);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, "search");
    let args: Value = serde_json::from_str(&calls[1].1).unwrap();
    assert_eq!(args, json!({"query": "a, b"}));
}

#[tokio::test]
async fn test_streaming_name_emitted_once() {
    let mut parser = ConfiguredParser::new(FunctionsConfig::default());
    let chunks = create_strategic_chunks(WEATHER);
    let (_, items) = run_stream(&mut parser, &chunks, &[]).await;
    let names: Vec<_> = items.iter().filter_map(|i| i.name.as_deref()).collect();
    assert_eq!(names, ["get_weather"]);
}

#[tokio::test]
async fn test_has_tool_markers() {
    let parser = ConfiguredParser::new(FunctionsConfig::default());
    assert!(parser.has_tool_markers(WEATHER));
    assert!(parser.has_tool_markers("<tool_call>\n<function=x>"));
    assert!(!parser.has_tool_markers("plain text"));
}
