//! Common test utilities for tool-parser tests

use openai_protocol::common::{Function, Tool};
use serde_json::json;
use tool_parser::{ToolCallItem, ToolParser};

pub mod streaming_helpers {
    //! Chunkers simulating how tokens arrive from a backend.

    /// Split input into 2-3 character chunks (deterministic)
    #[allow(dead_code)]
    pub fn create_realistic_chunks(input: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let chunk_size = if i + 3 <= chars.len() && chars[i].is_ascii_alphanumeric() {
                3
            } else {
                2
            };

            let end = (i + chunk_size).min(chars.len());
            chunks.push(chars[i..end].iter().collect());
            i = end;
        }

        chunks
    }

    /// Split right after characters that tend to break naive parsers:
    /// quotes, colons, commas, braces, brackets and angle brackets.
    #[allow(dead_code)]
    pub fn create_strategic_chunks(input: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for ch in input.chars() {
            current.push(ch);
            let should_break = matches!(ch, '"' | ':' | ',' | '{' | '}' | '[' | ']' | '<' | '>')
                || current.len() >= 5;
            if should_break {
                chunks.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Streamed output of a parser: the normal text and every call fragment,
/// including the unstreamed remainder collected at the end.
#[allow(dead_code)]
pub async fn run_stream<P: ToolParser>(
    parser: &mut P,
    chunks: &[String],
    tools: &[Tool],
) -> (String, Vec<ToolCallItem>) {
    let mut text = String::new();
    let mut items = Vec::new();
    for chunk in chunks {
        let result = parser.parse_incremental(chunk, tools).await.unwrap();
        text.push_str(&result.normal_text);
        items.extend(result.calls);
    }
    items.extend(parser.get_unstreamed_tool_args().unwrap_or_default());
    (text, items)
}

/// Names and concatenated arguments per tool index
#[allow(dead_code)]
pub fn assemble_calls(items: &[ToolCallItem]) -> Vec<(String, String)> {
    let mut calls: Vec<(String, String)> = Vec::new();
    for item in items {
        if item.tool_index >= calls.len() {
            calls.resize(item.tool_index + 1, Default::default());
        }
        if let Some(name) = &item.name {
            calls[item.tool_index].0 = name.clone();
        }
        calls[item.tool_index].1.push_str(&item.parameters);
    }
    calls
}

#[allow(dead_code)]
pub fn create_test_tools() -> Vec<Tool> {
    let tool = |name: &str, description: &str, properties: serde_json::Value| Tool {
        tool_type: "function".to_string(),
        function: Function {
            name: name.to_string(),
            description: Some(description.to_string()),
            parameters: json!({"type": "object", "properties": properties}),
            strict: None,
        },
    };
    vec![
        tool("search", "Search for information", json!({"query": {"type": "string"}})),
        tool(
            "get_weather",
            "Get weather information",
            json!({"location": {"type": "string"}, "days": {"type": "integer"}}),
        ),
        tool(
            "calculate",
            "Perform calculations",
            json!({"x": {"type": "number"}, "y": {"type": "number"}}),
        ),
    ]
}
