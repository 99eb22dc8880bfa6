//! `/v1/completions` and `/v1/edits`

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use openai_protocol::{
    common::{generate_id, Usage},
    completion::{CompletionChoice, CompletionRequest, CompletionResponse, EditRequest},
    validated::ValidatedJson,
};
use tracing::{debug, warn};

use super::{
    chat::finish_reason,
    error::stream_error,
    resolve_model,
    sse::{self, SseSender},
    unix_now,
};
use crate::{
    error::{GatewayError, GatewayResult},
    inference::{
        prompt::{parse_output, prepare_completion, prepare_edit},
        TokenStream, TokenUsage,
    },
    middleware::{request_id, ModelOverride},
    server::AppContext,
};

pub async fn completions(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<CompletionRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_completion(ctx, model_override, request_id(&headers), request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_completion(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    correlation_id: String,
    request: CompletionRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&request.sampling);
    config.add_stop_words(request.stop.as_ref());
    if request.echo {
        config.parameters.echo = true;
    }

    let prompts = request.prompts();
    if prompts.is_empty() {
        return Err(GatewayError::validation("prompt is required"));
    }
    let model = if request.model.is_empty() {
        config.name.clone()
    } else {
        request.model.clone()
    };
    let id = generate_id("cmpl-");
    let created = unix_now();
    let max_tokens = config.parameters.max_tokens.unwrap_or(0);

    if request.stream {
        if prompts.len() > 1 {
            return Err(GatewayError::validation(
                "streaming is only supported for a single prompt",
            ));
        }
        let prepared =
            prepare_completion(&ctx.evaluator, &mut config, &prompts[0], request.response_format.as_ref())?;
        let mut options = ctx.dispatcher.predict_options(&config);
        prepared.apply(&mut options);
        options.correlation_id = correlation_id;
        let tokens = ctx.dispatcher.predict_stream(&config, options).await?;
        let (tx, response) = sse::channel();
        let meta = CompletionMeta {
            id,
            created,
            model,
            object: "text_completion",
        };
        tokio::spawn(stream_completion(tx, tokens, meta, max_tokens));
        return Ok(response);
    }

    let n = request.n.unwrap_or(1).max(1);
    let mut choices = Vec::new();
    let mut usage = TokenUsage::default();
    for prompt in &prompts {
        let prepared =
            prepare_completion(&ctx.evaluator, &mut config, prompt, request.response_format.as_ref())?;
        let mut options = ctx.dispatcher.predict_options(&config);
        prepared.apply(&mut options);
        options.correlation_id = correlation_id.clone();
        for _ in 0..n {
            let prediction = ctx.dispatcher.predict(&config, options.clone()).await?;
            usage.prompt_tokens += prediction.usage.prompt_tokens;
            usage.completion_tokens += prediction.usage.completion_tokens;
            let parsed = parse_output(&config, &prepared.parsing, &prepared.prompt, &prediction.text).await;
            choices.push(CompletionChoice {
                text: parsed.content,
                index: choices.len() as u32,
                finish_reason: Some(finish_reason(false, &prediction.usage, max_tokens).to_string()),
            });
        }
    }

    debug!(model = %config.name, choices = choices.len(), "Completion done");
    Ok(Json(CompletionResponse {
        id,
        object: "text_completion".to_string(),
        created,
        model,
        choices,
        usage: Some(usage.to_usage()),
    })
    .into_response())
}

pub async fn edits(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<EditRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_edit(ctx, model_override, request_id(&headers), request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_edit(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    correlation_id: String,
    request: EditRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&request.sampling);
    let max_tokens = config.parameters.max_tokens.unwrap_or(0);

    let inputs = request
        .input
        .as_ref()
        .map(|i| i.to_vec())
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| vec![String::new()]);

    let mut choices = Vec::new();
    let mut usage = TokenUsage::default();
    for input in &inputs {
        let prepared = prepare_edit(&ctx.evaluator, &config, input, &request.instruction)?;
        let mut options = ctx.dispatcher.predict_options(&config);
        prepared.apply(&mut options);
        options.correlation_id = correlation_id.clone();
        let prediction = ctx.dispatcher.predict(&config, options).await?;
        usage.prompt_tokens += prediction.usage.prompt_tokens;
        usage.completion_tokens += prediction.usage.completion_tokens;
        let parsed = parse_output(&config, &prepared.parsing, &prepared.prompt, &prediction.text).await;
        choices.push(CompletionChoice {
            text: parsed.content,
            index: choices.len() as u32,
            finish_reason: Some(finish_reason(false, &prediction.usage, max_tokens).to_string()),
        });
    }

    Ok(Json(CompletionResponse {
        id: generate_id("edit-"),
        object: "edit".to_string(),
        created: unix_now(),
        model: if request.model.is_empty() {
            config.name.clone()
        } else {
            request.model
        },
        choices,
        usage: Some(usage.to_usage()),
    })
    .into_response())
}

struct CompletionMeta {
    id: String,
    created: i64,
    model: String,
    object: &'static str,
}

impl CompletionMeta {
    fn chunk(&self, text: String, finish_reason: Option<&str>, usage: Option<Usage>) -> CompletionResponse {
        CompletionResponse {
            id: self.id.clone(),
            object: self.object.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage,
        }
    }
}

async fn stream_completion(tx: SseSender, mut tokens: TokenStream, meta: CompletionMeta, max_tokens: i32) {
    while let Some(token) = tokens.next().await {
        match token {
            Ok(token) => {
                if !sse::send_data(&tx, &meta.chunk(token.text, None, None)).await {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Completion stream failed mid-way");
                sse::send_data(&tx, &stream_error(&e)).await;
                sse::send_done(&tx).await;
                return;
            }
        }
    }
    let usage = tokens.usage();
    let reason = finish_reason(false, &usage, max_tokens);
    if sse::send_data(&tx, &meta.chunk(String::new(), Some(reason), Some(usage.to_usage()))).await {
        sse::send_done(&tx).await;
    }
}
