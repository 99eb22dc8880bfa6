//! Lowering Open Responses input items to chat messages.

use data_connector::ResponseStore;
use openai_protocol::{
    chat::{ChatMessage, ChatRole, ContentPart, MediaUrl, MessageContent},
    common::{
        Function, FunctionCallResponse, JsonSchemaFormat, ResponseFormat, Tool, ToolCall,
        ToolChoice,
    },
    responses::{
        ResponseContentPart, ResponseInputItem, ResponseItem, ResponsesRequest, TextFormat,
    },
};
use tracing::debug;

use crate::{
    error::{GatewayError, GatewayResult},
    inference::ChatInput,
    mcp::Toolset,
};

/// Build the chat input for a request.
///
/// The conversation is `instructions`, then the stored input and output of
/// `previous_response_id`, then the new input. Item references resolve
/// against every stored response.
pub(crate) fn build_input(
    store: &ResponseStore,
    request: &ResponsesRequest,
    toolset: &Toolset,
) -> GatewayResult<ChatInput> {
    let mut messages = Vec::new();
    if let Some(instructions) = request.instructions.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::new(ChatRole::System, instructions));
    }

    if let Some(previous) = request.previous_response_id.as_deref() {
        let stored = store.get(previous)?;
        for item in stored.request.input_items() {
            push_item(store, &mut messages, item.into_item())?;
        }
        for item in stored.response.output {
            push_item(store, &mut messages, item)?;
        }
    }
    for item in request.input_items() {
        push_item(store, &mut messages, item.into_item())?;
    }

    let mut tools: Vec<Tool> = request
        .function_tools()
        .into_iter()
        .map(|f| Tool {
            tool_type: "function".to_string(),
            function: Function {
                name: f.name.clone(),
                description: f.description.clone(),
                parameters: f.parameters.clone(),
                strict: f.strict.then_some(true),
            },
        })
        .collect();
    for tool in toolset.as_tools() {
        if tools.iter().all(|t| t.function.name != tool.function.name) {
            tools.push(tool);
        }
    }

    Ok(ChatInput {
        messages,
        tools,
        tool_choice: request.tool_choice.as_ref().map(ToolChoice::resolve),
        response_format: request
            .text
            .as_ref()
            .and_then(|t| t.format.as_ref())
            .and_then(to_response_format),
        reasoning_effort: request.reasoning.as_ref().and_then(|r| r.effort.clone()),
        ..Default::default()
    })
}

fn to_response_format(format: &TextFormat) -> Option<ResponseFormat> {
    match format {
        TextFormat::Text => None,
        TextFormat::JsonObject => Some(ResponseFormat::JsonObject),
        TextFormat::JsonSchema {
            name,
            schema,
            strict,
        } => Some(ResponseFormat::JsonSchema {
            json_schema: JsonSchemaFormat {
                name: name.clone(),
                schema: schema.clone(),
                strict: *strict,
            },
        }),
    }
}

fn push_item(
    store: &ResponseStore,
    messages: &mut Vec<ChatMessage>,
    item: ResponseItem,
) -> GatewayResult<()> {
    let item = match item {
        ResponseItem::ItemReference { id } => store
            .find_item(&id)
            .map_err(|_| GatewayError::validation(format!("item not found: {id}")))?,
        item => item,
    };

    match item {
        ResponseItem::Message { role, content, .. } => {
            messages.push(ChatMessage {
                content: Some(to_content(content)),
                ..ChatMessage::new(parse_role(&role), "")
            });
        }
        ResponseItem::FunctionCall {
            call_id,
            name,
            arguments,
            ..
        } => {
            let call = ToolCall {
                id: call_id,
                index: 0,
                tool_type: "function".to_string(),
                function: FunctionCallResponse { name, arguments },
            };
            // consecutive calls belong to one assistant turn
            match messages.last_mut() {
                Some(ChatMessage {
                    role: ChatRole::Assistant,
                    tool_calls: Some(calls),
                    ..
                }) => calls.push(ToolCall {
                    index: calls.len() as u32,
                    ..call
                }),
                _ => messages.push(ChatMessage {
                    content: None,
                    tool_calls: Some(vec![call]),
                    ..ChatMessage::new(ChatRole::Assistant, "")
                }),
            }
        }
        ResponseItem::FunctionCallOutput {
            call_id, output, ..
        } => {
            let mut message = ChatMessage::new(ChatRole::Tool, output.text());
            message.tool_call_id = Some(call_id);
            messages.push(message);
        }
        ResponseItem::McpCall {
            name,
            output,
            error,
            ..
        } => {
            let text = output.or(error).unwrap_or_default();
            let mut message = ChatMessage::new(ChatRole::Tool, text);
            message.name = Some(name);
            messages.push(message);
        }
        ResponseItem::Reasoning { .. } => {}
        ResponseItem::ItemReference { id } => {
            debug!(item_id = %id, "Item reference resolved to another reference, skipping");
        }
    }
    Ok(())
}

fn parse_role(role: &str) -> ChatRole {
    match role {
        "system" => ChatRole::System,
        "developer" => ChatRole::Developer,
        "assistant" => ChatRole::Assistant,
        "tool" => ChatRole::Tool,
        _ => ChatRole::User,
    }
}

fn to_content(parts: Vec<ResponseContentPart>) -> MessageContent {
    let has_media = parts
        .iter()
        .any(|p| matches!(p, ResponseContentPart::InputImage { image_url: Some(_), .. }));
    if !has_media {
        let text: String = parts.iter().filter_map(ResponseContentPart::text).collect();
        return MessageContent::Text(text);
    }
    let parts = parts
        .into_iter()
        .filter_map(|part| match part {
            ResponseContentPart::InputImage {
                image_url: Some(url),
                detail,
                ..
            } => Some(ContentPart::ImageUrl {
                image_url: MediaUrl { url, detail },
            }),
            other => other.text().map(|text| ContentPart::Text {
                text: text.to_string(),
            }),
        })
        .collect();
    MessageContent::Parts(parts)
}

/// Input items of a stored request, as returned by `input_items`.
pub(crate) fn input_items(request: &ResponsesRequest) -> Vec<ResponseItem> {
    request
        .input_items()
        .into_iter()
        .map(ResponseInputItem::into_item)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use openai_protocol::responses::{ResponseObject, ResponseStatus};
    use serde_json::json;

    use super::*;

    fn request(value: serde_json::Value) -> ResponsesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn instructions_and_tool_round_trip() {
        let store = ResponseStore::new(Duration::ZERO);
        let req = request(json!({
            "model": "m",
            "instructions": "be brief",
            "tools": [{"type": "function", "name": "get_weather", "parameters": {"type": "object"}}],
            "tool_choice": "required",
            "input": [
                {"role": "user", "content": "weather?"},
                {"type": "function_call", "call_id": "c1", "name": "get_weather", "arguments": "{}"},
                {"type": "function_call", "call_id": "c2", "name": "get_weather", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "c1", "output": "sunny"}
            ]
        }));
        let input = build_input(&store, &req, &Toolset::default()).unwrap();
        let roles: Vec<ChatRole> = input.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::Tool]
        );
        assert_eq!(input.messages[2].tool_calls.as_ref().unwrap().len(), 2);
        assert_eq!(input.messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(input.tools[0].function.name, "get_weather");
        assert_eq!(
            input.tool_choice,
            Some(openai_protocol::common::ToolChoiceMode::Required)
        );
    }

    #[test]
    fn previous_response_and_item_reference() {
        let store = ResponseStore::new(Duration::ZERO);
        let first = request(json!({"model": "m", "input": "my name is Ada"}));
        let mut resource =
            ResponseObject::from_request("resp_1".into(), &first, ResponseStatus::Completed);
        resource.output = vec![ResponseItem::Message {
            id: Some("msg_1".into()),
            role: "assistant".into(),
            content: vec![ResponseContentPart::output_text("hello Ada")],
            status: Some("completed".into()),
        }];
        store.store("resp_1", first, resource);

        let follow_up = request(json!({
            "model": "m",
            "previous_response_id": "resp_1",
            "input": [{"type": "item_reference", "id": "msg_1"}]
        }));
        let input = build_input(&store, &follow_up, &Toolset::default()).unwrap();
        let texts: Vec<String> = input.messages.iter().map(ChatMessage::text).collect();
        assert_eq!(texts, vec!["my name is Ada", "hello Ada", "hello Ada"]);

        let missing = request(json!({
            "model": "m",
            "input": [{"type": "item_reference", "id": "msg_404"}]
        }));
        assert!(build_input(&store, &missing, &Toolset::default()).is_err());
    }

    #[test]
    fn json_schema_text_format() {
        let store = ResponseStore::new(Duration::ZERO);
        let req = request(json!({
            "model": "m",
            "input": "x",
            "text": {"format": {"type": "json_schema", "name": "out", "schema": {"type": "object"}}}
        }));
        let input = build_input(&store, &req, &Toolset::default()).unwrap();
        assert!(matches!(
            input.response_format,
            Some(ResponseFormat::JsonSchema { ref json_schema }) if json_schema.name == "out"
        ));
    }
}
