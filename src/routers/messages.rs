//! Anthropic Messages API (`/v1/messages`).
//!
//! Requests are lowered to the same [`ChatInput`] the chat endpoint uses;
//! only the request and response shapes differ. Errors are reported in the
//! Anthropic error shape, including body parse failures.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use openai_protocol::{
    chat::{ChatMessage, ChatRole, ContentPart, MediaUrl, MessageContent},
    common::{
        generate_id, Function, FunctionCallResponse, SamplingOverrides, StringOrArray, Tool,
        ToolCall, ToolChoiceMode,
    },
    messages::{
        ContentBlock, ContentBlockDelta, CreateMessageRequest, InputContent, InputContentBlock,
        Message, MessageDelta, MessageDeltaUsage, MessageStreamEvent, Role, StopReason,
        ThinkingConfig, ToolChoice, Usage,
    },
};
use serde_json::Value;
use tracing::{debug, warn};
use validator::Validate;

use super::{
    resolve_model,
    sse::{self, SseSender},
};
use crate::{
    error::{GatewayError, GatewayResult},
    inference::{
        prompt::{parse_output, prepare_chat},
        ChatInput, StreamDelta, StreamProcessor, TokenStream, TokenUsage,
    },
    middleware::{request_id, ModelOverride},
    server::AppContext,
};

pub async fn create_message(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(e) => return e.into_anthropic_response(),
    };
    let model_override = model_override.map(|Extension(m)| m);
    match handle(ctx, model_override, request_id(&headers), request).await {
        Ok(response) => response,
        Err(e) => e.into_anthropic_response(),
    }
}

fn parse_request(body: &[u8]) -> GatewayResult<CreateMessageRequest> {
    let request: CreateMessageRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation(format!("Invalid JSON data: {e}")))?;
    request
        .validate()
        .map_err(|e| GatewayError::validation(e.to_string()))?;
    Ok(request)
}

async fn handle(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    correlation_id: String,
    request: CreateMessageRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&SamplingOverrides {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k.map(|k| k as i32),
        max_tokens: Some(request.max_tokens as i32),
        ..Default::default()
    });
    if let Some(stop) = &request.stop_sequences {
        config.add_stop_words(Some(&StringOrArray::Array(stop.clone())));
    }
    if matches!(request.thinking, Some(ThinkingConfig::Disabled)) {
        config.reasoning.disable = true;
    }

    let input = to_chat_input(&request);
    let prepared = prepare_chat(&ctx.evaluator, &mut config, &input).await?;
    let mut options = ctx.dispatcher.predict_options(&config);
    prepared.apply(&mut options);
    options.correlation_id = correlation_id;
    let message_id = generate_id("msg_");
    let max_tokens = request.max_tokens;

    if request.is_stream() {
        let tokens = ctx.dispatcher.predict_stream(&config, options).await?;
        let (tx, response) = sse::channel();
        let processor = StreamProcessor::new(&prepared.parsing);
        tokio::spawn(stream_message(
            tx,
            tokens,
            processor,
            Message::new(message_id, request.model.clone(), Vec::new()),
            max_tokens,
        ));
        return Ok(response);
    }

    let prediction = ctx.dispatcher.predict(&config, options).await?;
    let parsed = parse_output(&config, &prepared.parsing, &prepared.prompt, &prediction.text).await;

    let mut content = Vec::new();
    if let Some(thinking) = parsed.reasoning {
        content.push(ContentBlock::Thinking {
            thinking,
            signature: String::new(),
        });
    }
    if !parsed.content.is_empty() || parsed.tool_calls.is_empty() {
        content.push(ContentBlock::Text {
            text: parsed.content,
        });
    }
    let has_calls = !parsed.tool_calls.is_empty();
    for call in parsed.tool_calls {
        content.push(ContentBlock::ToolUse {
            id: generate_id("toolu_"),
            name: call.name,
            input: serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| Value::Object(Default::default())),
        });
    }

    let mut message = Message::new(message_id, request.model, content);
    message.stop_reason = Some(stop_reason(has_calls, &prediction.usage, max_tokens));
    message.usage = Usage {
        input_tokens: prediction.usage.prompt_tokens,
        output_tokens: prediction.usage.completion_tokens,
    };
    debug!(model = %config.name, "Message created");
    Ok(Json(message).into_response())
}

fn stop_reason(has_calls: bool, usage: &TokenUsage, max_tokens: u32) -> StopReason {
    if has_calls {
        StopReason::ToolUse
    } else if max_tokens > 0 && usage.completion_tokens >= max_tokens {
        StopReason::MaxTokens
    } else {
        StopReason::EndTurn
    }
}

/// Lower an Anthropic request to chat messages and tools.
fn to_chat_input(request: &CreateMessageRequest) -> ChatInput {
    let mut messages = Vec::new();
    if let Some(system) = request.system_text().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::new(ChatRole::System, system));
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        let blocks = match &message.content {
            InputContent::String(text) => {
                messages.push(ChatMessage::new(role, text.clone()));
                continue;
            }
            InputContent::Blocks(blocks) => blocks,
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut reasoning = String::new();
        let mut tool_results = Vec::new();
        for block in blocks {
            match block {
                InputContentBlock::Text(t) => parts.push(ContentPart::Text {
                    text: t.text.clone(),
                }),
                InputContentBlock::Image(image) => parts.push(ContentPart::ImageUrl {
                    image_url: MediaUrl {
                        url: image.source.to_url(),
                        detail: None,
                    },
                }),
                InputContentBlock::ToolUse(tool_use) => tool_calls.push(ToolCall {
                    id: tool_use.id.clone(),
                    index: tool_calls.len() as u32,
                    tool_type: "function".to_string(),
                    function: FunctionCallResponse {
                        name: tool_use.name.clone(),
                        arguments: tool_use.input.to_string(),
                    },
                }),
                InputContentBlock::ToolResult(result) => {
                    let mut tool = ChatMessage::new(
                        ChatRole::Tool,
                        result.content.as_ref().map(|c| c.to_text()).unwrap_or_default(),
                    );
                    tool.tool_call_id = Some(result.tool_use_id.clone());
                    tool_results.push(tool);
                }
                InputContentBlock::Thinking(thinking) => reasoning.push_str(&thinking.thinking),
            }
        }

        if !parts.is_empty() || !tool_calls.is_empty() || !reasoning.is_empty() {
            let only_text = parts.iter().all(|p| matches!(p, ContentPart::Text { .. }));
            let content = if parts.is_empty() {
                None
            } else if only_text {
                Some(MessageContent::Text(MessageContent::Parts(parts).text()))
            } else {
                Some(MessageContent::Parts(parts))
            };
            messages.push(ChatMessage {
                role,
                content,
                name: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                function_call: None,
                tool_call_id: None,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            });
        }
        messages.extend(tool_results);
    }

    let tools = request
        .tools
        .iter()
        .flatten()
        .map(|t| Tool {
            tool_type: "function".to_string(),
            function: Function {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: serde_json::to_value(&t.input_schema).unwrap_or_default(),
                strict: None,
            },
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Auto { .. } => ToolChoiceMode::Auto,
        ToolChoice::Any { .. } => ToolChoiceMode::Required,
        ToolChoice::Tool { name, .. } => ToolChoiceMode::Function(name.clone()),
        ToolChoice::None => ToolChoiceMode::None,
    });

    ChatInput {
        messages,
        tools,
        tool_choice,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Tracks the open content block while streaming.
struct BlockWriter<'a> {
    tx: &'a SseSender,
    index: u32,
    kind: BlockKind,
}

impl BlockWriter<'_> {
    async fn emit(&self, event: MessageStreamEvent) -> bool {
        sse::send_event(self.tx, event.event_type(), &event).await
    }

    /// Close the current block and open `block` at the next index.
    async fn open(&mut self, kind: BlockKind, block: ContentBlock) -> bool {
        if !self.emit(MessageStreamEvent::ContentBlockStop { index: self.index }).await {
            return false;
        }
        self.index += 1;
        self.kind = kind;
        self.emit(MessageStreamEvent::ContentBlockStart {
            index: self.index,
            content_block: block,
        })
        .await
    }

    async fn delta(&self, delta: ContentBlockDelta) -> bool {
        self.emit(MessageStreamEvent::ContentBlockDelta {
            index: self.index,
            delta,
        })
        .await
    }

    async fn write(&mut self, delta: StreamDelta) -> bool {
        match delta {
            StreamDelta::Content(text) => {
                if self.kind != BlockKind::Text
                    && !self.open(BlockKind::Text, ContentBlock::Text { text: String::new() }).await
                {
                    return false;
                }
                self.delta(ContentBlockDelta::TextDelta { text }).await
            }
            StreamDelta::Reasoning(thinking) => {
                if self.kind != BlockKind::Thinking
                    && !self
                        .open(
                            BlockKind::Thinking,
                            ContentBlock::Thinking {
                                thinking: String::new(),
                                signature: String::new(),
                            },
                        )
                        .await
                {
                    return false;
                }
                self.delta(ContentBlockDelta::ThinkingDelta { thinking }).await
            }
            StreamDelta::ToolCall(item) => {
                if let Some(name) = item.name {
                    let block = ContentBlock::ToolUse {
                        id: generate_id("toolu_"),
                        name,
                        input: Value::Object(Default::default()),
                    };
                    if !self.open(BlockKind::ToolUse, block).await {
                        return false;
                    }
                }
                if item.parameters.is_empty() {
                    return true;
                }
                self.delta(ContentBlockDelta::InputJsonDelta {
                    partial_json: item.parameters,
                })
                .await
            }
        }
    }
}

async fn stream_message(
    tx: SseSender,
    mut tokens: TokenStream,
    mut processor: StreamProcessor,
    message: Message,
    max_tokens: u32,
) {
    let mut writer = BlockWriter {
        tx: &tx,
        index: 0,
        kind: BlockKind::Text,
    };
    let start = MessageStreamEvent::MessageStart { message };
    if !writer.emit(start).await {
        return;
    }
    let first = MessageStreamEvent::ContentBlockStart {
        index: 0,
        content_block: ContentBlock::Text { text: String::new() },
    };
    if !writer.emit(first).await {
        return;
    }

    let mut saw_tool_call = false;
    while let Some(token) = tokens.next().await {
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Message stream failed mid-way");
                writer
                    .emit(MessageStreamEvent::Error {
                        error: e.anthropic_error(),
                    })
                    .await;
                return;
            }
        };
        for delta in processor.push(&token.text).await {
            saw_tool_call |= matches!(delta, StreamDelta::ToolCall(_));
            if !writer.write(delta).await {
                return;
            }
        }
    }
    for delta in processor.finish().await {
        saw_tool_call |= matches!(delta, StreamDelta::ToolCall(_));
        if !writer.write(delta).await {
            return;
        }
    }

    let usage = tokens.usage();
    let index = writer.index;
    let closing = [
        MessageStreamEvent::ContentBlockStop { index },
        MessageStreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason(saw_tool_call, &usage, max_tokens)),
                stop_sequence: None,
            },
            usage: MessageDeltaUsage {
                output_tokens: usage.completion_tokens,
                input_tokens: Some(usage.prompt_tokens),
            },
        },
        MessageStreamEvent::MessageStop,
    ];
    for event in closing {
        if !writer.emit(event).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(value: Value) -> CreateMessageRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn lowers_system_tools_and_results() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 64,
            "system": "be brief",
            "tool_choice": {"type": "any"},
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "messages": [
                {"role": "user", "content": "weather in Paris?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"}
                ]}
            ]
        }));
        let input = to_chat_input(&req);
        let roles: Vec<ChatRole> = input.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::Tool]
        );
        let call = &input.messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.arguments, r#"{"city":"Paris"}"#);
        assert_eq!(input.messages[3].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(input.tool_choice, Some(ToolChoiceMode::Required));
        assert_eq!(input.tools[0].function.name, "get_weather");
    }

    #[test]
    fn images_become_data_urls() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}]
        }));
        let input = to_chat_input(&req);
        let Some(MessageContent::Parts(parts)) = &input.messages[0].content else {
            panic!("expected parts");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,AAAA"
        ));
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let err = parse_request(br#"{"model":"m","max_tokens":0,"messages":[{"role":"user","content":"hi"}]}"#)
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
