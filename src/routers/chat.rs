//! `/v1/chat/completions`

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use openai_protocol::{
    chat::{
        ChatChoice, ChatCompletionMessage, ChatCompletionRequest, ChatCompletionResponse,
        ChatCompletionStreamResponse, ChatMessageDelta, ChatStreamChoice,
    },
    common::{
        generate_id, FunctionCallDelta, FunctionCallResponse, ToolCall, ToolCallDelta, Usage,
    },
    validated::ValidatedJson,
};
use tool_parser::FunctionCall;
use tracing::{debug, warn};

use super::{
    error::stream_error,
    resolve_model,
    sse::{self, SseSender},
    unix_now,
};
use crate::{
    config::model::ModelConfig,
    error::GatewayResult,
    inference::{
        prompt::{parse_output, prepare_chat},
        ChatInput, OutputParsing, PreparedPrompt, StreamDelta, StreamProcessor, TokenStream,
        TokenUsage,
    },
    middleware::{request_id, ModelOverride},
    server::AppContext,
};

pub async fn chat_completions(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<ChatCompletionRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle(ctx, model_override, request_id(&headers), request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    correlation_id: String,
    request: ChatCompletionRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&request.sampling);
    config.add_stop_words(request.stop.as_ref());

    let input = ChatInput {
        messages: request.messages.clone(),
        tools: request.tools.clone().unwrap_or_default(),
        tool_choice: request.resolved_tool_choice(),
        response_format: request.response_format.clone(),
        reasoning_effort: request.reasoning_effort.clone(),
        ..Default::default()
    };
    let prepared = prepare_chat(&ctx.evaluator, &mut config, &input).await?;
    let mut options = ctx.dispatcher.predict_options(&config);
    prepared.apply(&mut options);
    options.correlation_id = correlation_id;

    let meta = ChunkMeta {
        id: generate_id("chatcmpl-"),
        created: unix_now(),
        model: if request.model.is_empty() {
            config.name.clone()
        } else {
            request.model.clone()
        },
    };
    debug!(model = %config.name, stream = request.stream, "Chat completion");

    if request.stream {
        // Open the backend stream first so load failures surface as HTTP errors
        let tokens = ctx.dispatcher.predict_stream(&config, options).await?;
        let (tx, response) = sse::channel();
        let max_tokens = config.parameters.max_tokens.unwrap_or(0);
        tokio::spawn(stream_chat(tx, tokens, meta, prepared.parsing, max_tokens));
        return Ok(response);
    }

    let n = request.n.unwrap_or(1).max(1);
    let mut choices = Vec::with_capacity(n as usize);
    let mut usage = TokenUsage::default();
    for index in 0..n {
        let prediction = ctx.dispatcher.predict(&config, options.clone()).await?;
        usage.prompt_tokens = prediction.usage.prompt_tokens;
        usage.completion_tokens += prediction.usage.completion_tokens;
        usage.timing_prompt_processing += prediction.usage.timing_prompt_processing;
        usage.timing_token_generation += prediction.usage.timing_token_generation;
        choices.push(
            build_choice(&config, &prepared, &prediction.text, &prediction.usage, index).await,
        );
    }

    Ok(Json(ChatCompletionResponse {
        id: meta.id,
        object: "chat.completion".to_string(),
        created: meta.created,
        model: meta.model,
        choices,
        usage: Some(usage.to_usage()),
    })
    .into_response())
}

async fn build_choice(
    config: &ModelConfig,
    prepared: &PreparedPrompt,
    raw: &str,
    usage: &TokenUsage,
    index: u32,
) -> ChatChoice {
    let parsed = parse_output(config, &prepared.parsing, &prepared.prompt, raw).await;
    let has_calls = !parsed.tool_calls.is_empty();
    let finish_reason = finish_reason(has_calls, usage, config.parameters.max_tokens.unwrap_or(0));
    let content = if has_calls && parsed.content.trim().is_empty() {
        None
    } else {
        Some(parsed.content)
    };
    ChatChoice {
        index,
        message: ChatCompletionMessage {
            role: "assistant".to_string(),
            content,
            reasoning_content: parsed.reasoning,
            tool_calls: has_calls.then(|| to_tool_calls(parsed.tool_calls)),
        },
        finish_reason: Some(finish_reason.to_string()),
    }
}

pub(crate) fn to_tool_calls(calls: Vec<FunctionCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(i, call)| ToolCall {
            id: generate_id("call_"),
            index: i as u32,
            tool_type: "function".to_string(),
            function: FunctionCallResponse {
                name: call.name,
                arguments: call.arguments,
            },
        })
        .collect()
}

pub(crate) fn finish_reason(has_calls: bool, usage: &TokenUsage, max_tokens: i32) -> &'static str {
    if has_calls {
        "tool_calls"
    } else if max_tokens > 0 && usage.completion_tokens >= max_tokens as u32 {
        "length"
    } else {
        "stop"
    }
}

struct ChunkMeta {
    id: String,
    created: i64,
    model: String,
}

impl ChunkMeta {
    fn chunk(
        &self,
        delta: ChatMessageDelta,
        finish_reason: Option<&str>,
        usage: Option<Usage>,
    ) -> ChatCompletionStreamResponse {
        ChatCompletionStreamResponse {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage,
        }
    }
}

fn delta_for(delta: StreamDelta) -> ChatMessageDelta {
    match delta {
        StreamDelta::Content(text) => ChatMessageDelta {
            content: Some(text),
            ..Default::default()
        },
        StreamDelta::Reasoning(text) => ChatMessageDelta {
            reasoning_content: Some(text),
            ..Default::default()
        },
        StreamDelta::ToolCall(item) => {
            let starts_call = item.name.is_some();
            ChatMessageDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: item.tool_index as u32,
                    id: starts_call.then(|| generate_id("call_")),
                    tool_type: starts_call.then(|| "function".to_string()),
                    function: Some(FunctionCallDelta {
                        name: item.name,
                        arguments: Some(item.parameters),
                    }),
                }]),
                ..Default::default()
            }
        }
    }
}

async fn stream_chat(
    tx: SseSender,
    mut tokens: TokenStream,
    meta: ChunkMeta,
    parsing: OutputParsing,
    max_tokens: i32,
) {
    let role = ChatMessageDelta {
        role: Some("assistant".to_string()),
        content: Some(String::new()),
        ..Default::default()
    };
    if !sse::send_data(&tx, &meta.chunk(role, None, None)).await {
        return;
    }

    let mut processor = StreamProcessor::new(&parsing);
    let mut saw_tool_call = false;
    while let Some(token) = tokens.next().await {
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Chat stream failed mid-way");
                sse::send_data(&tx, &stream_error(&e)).await;
                sse::send_done(&tx).await;
                return;
            }
        };
        for delta in processor.push(&token.text).await {
            saw_tool_call |= matches!(delta, StreamDelta::ToolCall(_));
            if !sse::send_data(&tx, &meta.chunk(delta_for(delta), None, None)).await {
                debug!("Client went away, cancelling the prediction");
                return;
            }
        }
    }
    for delta in processor.finish().await {
        saw_tool_call |= matches!(delta, StreamDelta::ToolCall(_));
        if !sse::send_data(&tx, &meta.chunk(delta_for(delta), None, None)).await {
            return;
        }
    }

    let usage = tokens.usage();
    let reason = finish_reason(saw_tool_call, &usage, max_tokens);
    let last = meta.chunk(ChatMessageDelta::default(), Some(reason), Some(usage.to_usage()));
    if sse::send_data(&tx, &last).await {
        sse::send_done(&tx).await;
    }
}
