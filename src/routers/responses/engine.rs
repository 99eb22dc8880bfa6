//! Generation for the Responses API.
//!
//! A [`ResponseRun`] turns a prepared conversation into output items, either
//! in one shot or as a stream of events. Both paths run the server-side tool
//! loop: calls to tools owned by a registered executor are executed, their
//! outputs become `function_call_output` items and the model is invoked
//! again, up to the model's iteration limit.

use std::sync::Arc;

use futures::StreamExt;
use grpc_client::proto;
use openai_protocol::{
    chat::{ChatMessage, ChatRole},
    common::{generate_id, FunctionCallResponse, ToolCall},
    event_types::ResponseEvent,
    responses::{
        FunctionOutput, IncompleteDetails, ResponseContentPart, ResponseError, ResponseItem,
        ResponseObject, ResponseStatus, ResponseUsage,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::emitter::{self, EventEmitter, Halt};
use crate::{
    config::model::ModelConfig,
    error::{GatewayError, GatewayResult},
    inference::{
        prompt::{parse_output, prepare_chat},
        ChatInput, PreparedPrompt, StreamDelta, StreamProcessor, TokenUsage,
    },
    mcp::Toolset,
    routers::unix_now,
    server::AppContext,
};

/// A function call the model produced in one iteration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallRecord {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

pub(crate) struct ResponseRun {
    pub ctx: Arc<AppContext>,
    /// Resolved config with request overrides applied
    pub config: ModelConfig,
    pub input: ChatInput,
    pub toolset: Toolset,
    pub correlation_id: String,
}

impl ResponseRun {
    async fn prepare(
        &self,
        input: &ChatInput,
    ) -> GatewayResult<(ModelConfig, PreparedPrompt, proto::PredictOptions)> {
        let mut config = self.config.clone();
        let prepared = prepare_chat(&self.ctx.evaluator, &mut config, input).await?;
        let mut options = self.ctx.dispatcher.predict_options(&config);
        prepared.apply(&mut options);
        options.correlation_id = self.correlation_id.clone();
        Ok((config, prepared, options))
    }

    /// Execute executor-owned calls and extend the conversation with their
    /// results. `None` ends the loop: nothing to run, or a call belongs to
    /// the client.
    async fn run_tools(
        &self,
        content: &str,
        calls: &[CallRecord],
        input: &mut ChatInput,
    ) -> Option<Vec<ResponseItem>> {
        if calls.is_empty() || !calls.iter().all(|c| self.toolset.owns(&c.name)) {
            return None;
        }

        let mut assistant = ChatMessage::new(ChatRole::Assistant, content);
        assistant.tool_calls = Some(
            calls
                .iter()
                .enumerate()
                .map(|(i, c)| ToolCall {
                    id: c.call_id.clone(),
                    index: i as u32,
                    tool_type: "function".to_string(),
                    function: FunctionCallResponse {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect(),
        );
        input.messages.push(assistant);

        let mut outputs = Vec::with_capacity(calls.len());
        for call in calls {
            let output = match self.toolset.call(&call.name, &call.arguments).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool execution failed");
                    format!("error: {e}")
                }
            };
            debug!(tool = %call.name, "Tool executed");
            let mut message = ChatMessage::new(ChatRole::Tool, output.clone());
            message.tool_call_id = Some(call.call_id.clone());
            input.messages.push(message);
            outputs.push(ResponseItem::FunctionCallOutput {
                id: Some(generate_id("fco_")),
                call_id: call.call_id.clone(),
                output: FunctionOutput::Text(output),
                status: Some("completed".to_string()),
            });
        }
        Some(outputs)
    }

    /// Run to completion and return the finished resource.
    pub async fn execute(&self, mut resource: ResponseObject) -> GatewayResult<ResponseObject> {
        let mut input = self.input.clone();
        let mut usage = TokenUsage::default();
        let max_iterations = self.config.max_iterations();

        for iteration in 1..=max_iterations {
            let (config, prepared, options) = self.prepare(&input).await?;
            let prediction = self.ctx.dispatcher.predict(&config, options).await?;
            accumulate(&mut usage, &prediction.usage);
            let parsed = parse_output(&config, &prepared.parsing, &prepared.prompt, &prediction.text).await;

            if let Some(reasoning) = parsed.reasoning.filter(|r| !r.is_empty()) {
                resource.output.push(ResponseItem::reasoning(reasoning, "completed"));
            }
            if !parsed.content.trim().is_empty() || parsed.tool_calls.is_empty() {
                resource
                    .output
                    .push(ResponseItem::output_message(parsed.content.clone(), "completed"));
            }
            let calls: Vec<CallRecord> = parsed
                .tool_calls
                .into_iter()
                .map(|c| CallRecord {
                    call_id: generate_id("call_"),
                    name: c.name,
                    arguments: c.arguments,
                })
                .collect();
            for call in &calls {
                resource.output.push(ResponseItem::function_call(
                    call.call_id.clone(),
                    call.name.clone(),
                    call.arguments.clone(),
                    "completed",
                ));
            }

            if iteration == max_iterations {
                break;
            }
            match self.run_tools(&parsed.content, &calls, &mut input).await {
                Some(outputs) => resource.output.extend(outputs),
                None => break,
            }
        }

        finalize(&mut resource, &usage);
        Ok(resource)
    }

    /// Run while emitting events. Never fails: errors become a
    /// `response.failed` event, while a departed client or a fired `cancel`
    /// token cancels the stored response.
    pub async fn stream(
        self,
        mut resource: ResponseObject,
        mut emitter: EventEmitter,
        cancel: CancellationToken,
    ) {
        resource.status = ResponseStatus::InProgress;
        match self.stream_events(&mut resource, &mut emitter, &cancel).await {
            Ok(()) => {}
            Err(Halt::Disconnected) => emitter.abandon("client disconnected"),
            Err(Halt::Cancelled) => emitter.abandon("run cancelled"),
            Err(Halt::Closed) => {
                debug!(response_id = %emitter.response_id(), "Response closed while generating")
            }
        }
    }

    async fn stream_events(
        &self,
        resource: &mut ResponseObject,
        emitter: &mut EventEmitter,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        emitter
            .emit(emitter::response_event(ResponseEvent::CREATED, resource))
            .await?;
        emitter
            .emit(emitter::response_event(ResponseEvent::IN_PROGRESS, resource))
            .await?;

        let mut input = self.input.clone();
        let mut usage = TokenUsage::default();
        let mut tracker = OutputTracker::default();
        let max_iterations = self.config.max_iterations();

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let (config, prepared, options) = match self.prepare(&input).await {
                Ok(prepared) => prepared,
                Err(e) => return fail(resource, tracker, emitter, e).await,
            };
            let mut tokens = match self.ctx.dispatcher.predict_stream(&config, options).await {
                Ok(tokens) => tokens,
                Err(e) => return fail(resource, tracker, emitter, e).await,
            };
            let mut processor = StreamProcessor::new(&prepared.parsing);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Halt::Cancelled),
                    next = tokens.next() => next,
                };
                match next {
                    Some(Ok(token)) => {
                        for delta in processor.push(&token.text).await {
                            tracker.push(emitter, delta).await?;
                        }
                    }
                    Some(Err(e)) => return fail(resource, tracker, emitter, e).await,
                    None => break,
                }
            }
            for delta in processor.finish().await {
                tracker.push(emitter, delta).await?;
            }
            tracker.close_all(emitter).await?;
            accumulate(&mut usage, &tokens.usage());

            let (content, calls) = tracker.take_turn();
            if iteration == max_iterations {
                break;
            }
            match self.run_tools(&content, &calls, &mut input).await {
                Some(outputs) => {
                    for item in outputs {
                        tracker.add_item(emitter, item).await?;
                    }
                }
                None => break,
            }
        }

        resource.output = tracker.into_output();
        finalize(resource, &usage);
        emitter.save(resource);
        let terminal = match resource.status {
            ResponseStatus::Incomplete => ResponseEvent::INCOMPLETE,
            _ => ResponseEvent::COMPLETED,
        };
        emitter.emit(emitter::response_event(terminal, resource)).await?;
        info!(
            response_id = %resource.id,
            status = resource.status.as_str(),
            items = resource.output.len(),
            "Response finished"
        );
        Ok(())
    }
}

fn accumulate(total: &mut TokenUsage, usage: &TokenUsage) {
    total.prompt_tokens = total.prompt_tokens.max(usage.prompt_tokens);
    total.completion_tokens += usage.completion_tokens;
}

/// Set the terminal status, usage and completion time.
fn finalize(resource: &mut ResponseObject, usage: &TokenUsage) {
    let truncated = resource
        .max_output_tokens
        .is_some_and(|max| max > 0 && usage.completion_tokens >= max as u32);
    if truncated {
        resource.status = ResponseStatus::Incomplete;
        resource.incomplete_details = Some(IncompleteDetails {
            reason: "max_output_tokens".to_string(),
        });
    } else {
        resource.status = ResponseStatus::Completed;
    }
    resource.usage = Some(ResponseUsage::new(usage.prompt_tokens, usage.completion_tokens));
    resource.completed_at = Some(unix_now());
}

async fn fail(
    resource: &mut ResponseObject,
    tracker: OutputTracker,
    emitter: &mut EventEmitter,
    err: GatewayError,
) -> Result<(), Halt> {
    warn!(response_id = %resource.id, error = %err, "Response generation failed");
    emitter.emit(emitter::error_event(&err)).await?;
    resource.output = tracker.into_output();
    resource.status = ResponseStatus::Failed;
    resource.completed_at = Some(unix_now());
    resource.error = Some(ResponseError {
        error_type: "model_error".to_string(),
        code: Some(err.code().to_string()),
        message: err.to_string(),
    });
    emitter.save(resource);
    emitter
        .emit(emitter::response_event(ResponseEvent::FAILED, resource))
        .await
}

struct OpenText {
    id: String,
    output_index: usize,
    text: String,
}

struct OpenCall {
    tool_index: usize,
    id: String,
    output_index: usize,
    record: CallRecord,
}

/// Output items of a streamed response.
///
/// At most one item is open at a time; opening an item closes the current
/// one, so `output_index` is always the number of finished items.
#[derive(Default)]
pub(crate) struct OutputTracker {
    output: Vec<ResponseItem>,
    message: Option<OpenText>,
    reasoning: Option<OpenText>,
    call: Option<OpenCall>,
    turn_content: String,
    turn_calls: Vec<CallRecord>,
}

impl OutputTracker {
    pub async fn push(&mut self, emitter: &mut EventEmitter, delta: StreamDelta) -> Result<(), Halt> {
        match delta {
            StreamDelta::Reasoning(text) => {
                if self.reasoning.is_none() {
                    self.close_all(emitter).await?;
                    let item = ResponseItem::Reasoning {
                        id: Some(generate_id("rs_")),
                        summary: Vec::new(),
                        content: Some(Vec::new()),
                        status: Some("in_progress".to_string()),
                    };
                    self.reasoning = Some(self.open_text(emitter, item).await?);
                }
                if let Some(open) = &mut self.reasoning {
                    open.text.push_str(&text);
                    emitter
                        .emit(emitter::reasoning_text_delta(&open.id, open.output_index, &text))
                        .await?;
                }
            }
            StreamDelta::Content(text) => {
                // separators between calls are not worth a message of their own
                if self.call.is_some() && text.trim().is_empty() {
                    return Ok(());
                }
                if self.message.is_none() {
                    self.close_all(emitter).await?;
                    let item = ResponseItem::Message {
                        id: Some(generate_id("msg_")),
                        role: "assistant".to_string(),
                        content: Vec::new(),
                        status: Some("in_progress".to_string()),
                    };
                    let open = self.open_text(emitter, item).await?;
                    emitter
                        .emit(emitter::content_part_added(
                            &open.id,
                            open.output_index,
                            &ResponseContentPart::output_text(""),
                        ))
                        .await?;
                    self.message = Some(open);
                }
                if let Some(open) = &mut self.message {
                    open.text.push_str(&text);
                    self.turn_content.push_str(&text);
                    emitter
                        .emit(emitter::output_text_delta(&open.id, open.output_index, &text))
                        .await?;
                }
            }
            StreamDelta::ToolCall(item) => {
                if let Some(name) = item.name {
                    self.close_all(emitter).await?;
                    let record = CallRecord {
                        call_id: generate_id("call_"),
                        name,
                        arguments: String::new(),
                    };
                    let added = ResponseItem::function_call(
                        record.call_id.clone(),
                        record.name.clone(),
                        String::new(),
                        "in_progress",
                    );
                    let output_index = self.output.len();
                    emitter
                        .emit(emitter::output_item_added(output_index, &added))
                        .await?;
                    self.call = Some(OpenCall {
                        tool_index: item.tool_index,
                        id: added.id().unwrap_or_default().to_string(),
                        output_index,
                        record,
                    });
                }
                match &mut self.call {
                    Some(open) if open.tool_index == item.tool_index => {
                        if !item.parameters.is_empty() {
                            open.record.arguments.push_str(&item.parameters);
                            emitter
                                .emit(emitter::arguments_delta(
                                    &open.id,
                                    open.output_index,
                                    &item.parameters,
                                ))
                                .await?;
                        }
                    }
                    _ => debug!(tool_index = item.tool_index, "Arguments for a closed call dropped"),
                }
            }
        }
        Ok(())
    }

    async fn open_text(&mut self, emitter: &mut EventEmitter, item: ResponseItem) -> Result<OpenText, Halt> {
        let output_index = self.output.len();
        emitter
            .emit(emitter::output_item_added(output_index, &item))
            .await?;
        Ok(OpenText {
            id: item.id().unwrap_or_default().to_string(),
            output_index,
            text: String::new(),
        })
    }

    /// Close whatever item is open.
    pub async fn close_all(&mut self, emitter: &mut EventEmitter) -> Result<(), Halt> {
        if let Some(open) = self.reasoning.take() {
            emitter
                .emit(emitter::reasoning_text_done(&open.id, open.output_index, &open.text))
                .await?;
            let item = ResponseItem::Reasoning {
                id: Some(open.id),
                summary: Vec::new(),
                content: Some(vec![ResponseContentPart::ReasoningText { text: open.text }]),
                status: Some("completed".to_string()),
            };
            emitter
                .emit(emitter::output_item_done(open.output_index, &item))
                .await?;
            self.output.push(item);
        }
        if let Some(open) = self.message.take() {
            emitter
                .emit(emitter::output_text_done(&open.id, open.output_index, &open.text))
                .await?;
            let part = ResponseContentPart::output_text(open.text);
            emitter
                .emit(emitter::content_part_done(&open.id, open.output_index, &part))
                .await?;
            let item = ResponseItem::Message {
                id: Some(open.id),
                role: "assistant".to_string(),
                content: vec![part],
                status: Some("completed".to_string()),
            };
            emitter
                .emit(emitter::output_item_done(open.output_index, &item))
                .await?;
            self.output.push(item);
        }
        if let Some(mut open) = self.call.take() {
            if open.record.arguments.trim().is_empty() {
                open.record.arguments = "{}".to_string();
            }
            emitter
                .emit(emitter::arguments_done(&open.id, open.output_index, &open.record.arguments))
                .await?;
            let item = ResponseItem::FunctionCall {
                id: Some(open.id),
                call_id: open.record.call_id.clone(),
                name: open.record.name.clone(),
                arguments: open.record.arguments.clone(),
                status: Some("completed".to_string()),
            };
            emitter
                .emit(emitter::output_item_done(open.output_index, &item))
                .await?;
            self.output.push(item);
            self.turn_calls.push(open.record);
        }
        Ok(())
    }

    /// Emit a finished item in one go.
    pub async fn add_item(&mut self, emitter: &mut EventEmitter, item: ResponseItem) -> Result<(), Halt> {
        self.close_all(emitter).await?;
        let output_index = self.output.len();
        emitter
            .emit(emitter::output_item_added(output_index, &item))
            .await?;
        emitter
            .emit(emitter::output_item_done(output_index, &item))
            .await?;
        self.output.push(item);
        Ok(())
    }

    /// Content and calls produced since the last turn.
    pub fn take_turn(&mut self) -> (String, Vec<CallRecord>) {
        (
            std::mem::take(&mut self.turn_content),
            std::mem::take(&mut self.turn_calls),
        )
    }

    pub fn into_output(self) -> Vec<ResponseItem> {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use tool_parser::ToolCallItem;

    use super::*;
    use crate::routers::responses::emitter::EventSink;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Value>>>);

    #[async_trait]
    impl EventSink for Recorder {
        async fn send(&mut self, event: &Value) -> bool {
            self.0.lock().push(event.clone());
            true
        }
    }

    fn types(recorder: &Recorder) -> Vec<String> {
        recorder
            .0
            .lock()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn text_then_call_closes_message_first() {
        let recorder = Recorder::default();
        let mut emitter = EventEmitter::new("resp_1".into(), None, Some(Box::new(recorder.clone())));
        let mut tracker = OutputTracker::default();

        tracker.push(&mut emitter, StreamDelta::Content("let me check".into())).await.unwrap();
        tracker
            .push(
                &mut emitter,
                StreamDelta::ToolCall(ToolCallItem {
                    tool_index: 0,
                    name: Some("get_weather".into()),
                    parameters: String::new(),
                }),
            )
            .await
            .unwrap();
        tracker
            .push(
                &mut emitter,
                StreamDelta::ToolCall(ToolCallItem {
                    tool_index: 0,
                    name: None,
                    parameters: r#"{"location":"Paris"}"#.into(),
                }),
            )
            .await
            .unwrap();
        tracker.close_all(&mut emitter).await.unwrap();

        assert_eq!(
            types(&recorder),
            vec![
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.output_item.added",
                "response.function_call_arguments.delta",
                "response.function_call_arguments.done",
                "response.output_item.done",
            ]
        );
        let events = recorder.0.lock();
        assert_eq!(events[6]["output_index"], 1);
        assert_eq!(events[6]["item"]["type"], "function_call");
        drop(events);

        let (content, calls) = tracker.take_turn();
        assert_eq!(content, "let me check");
        assert_eq!(calls[0].arguments, r#"{"location":"Paris"}"#);
        let output = tracker.into_output();
        assert_eq!(output.len(), 2);
        assert_eq!(output[1].item_type(), "function_call");
    }

    #[tokio::test]
    async fn reasoning_becomes_its_own_item() {
        let recorder = Recorder::default();
        let mut emitter = EventEmitter::new("resp_1".into(), None, Some(Box::new(recorder.clone())));
        let mut tracker = OutputTracker::default();
        tracker.push(&mut emitter, StreamDelta::Reasoning("hmm".into())).await.unwrap();
        tracker.push(&mut emitter, StreamDelta::Content("hi".into())).await.unwrap();
        tracker.close_all(&mut emitter).await.unwrap();

        let output = tracker.into_output();
        assert_eq!(output[0].item_type(), "reasoning");
        assert_eq!(output[1].item_type(), "message");
        assert!(types(&recorder).contains(&"response.reasoning_text.done".to_string()));
    }

    #[tokio::test]
    async fn fired_token_cancels_stored_response() {
        use std::time::Duration;

        use grpc_client::testing::FakeBackend;

        use crate::config::GatewayConfig;

        let mut fake = FakeBackend::with_tokens(["a", "b", "c", "d", "e", "f"]);
        fake.token_delay = Duration::from_millis(100);
        let (addr, _server) = fake.serve().await.unwrap();
        let models = tempfile::tempdir().unwrap();
        std::fs::write(
            models.path().join("slow.yaml"),
            "name: slow\nbackend: fake\nparameters:\n  model: slow.bin\n",
        )
        .unwrap();
        let mut config = GatewayConfig {
            models_path: models.path().to_path_buf(),
            templates_path: models.path().to_path_buf(),
            ..Default::default()
        };
        config.backend.load_delay = Duration::from_millis(20);
        config.backend.external_backends.insert("fake".into(), addr.to_string());
        let ctx = Arc::new(AppContext::new(config).unwrap());

        let request = serde_json::from_value(serde_json::json!({
            "model": "slow", "input": "hi", "stream": true
        }))
        .unwrap();
        let started = crate::routers::responses::start(&ctx, None, "corr".into(), &request)
            .await
            .unwrap();
        let id = started.id.clone();
        ctx.store.store(&id, request, started.resource.clone());

        let cancel = CancellationToken::new();
        let emitter = EventEmitter::new(id.clone(), Some(ctx.store.clone()), None);
        let run = tokio::spawn(started.run.stream(started.resource, emitter, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        run.await.unwrap();

        let stored = ctx.store.get(&id).unwrap();
        assert_eq!(stored.status, ResponseStatus::Cancelled);
        assert!(stored.closed);
        let events = ctx.store.get_events_after(&id, None).unwrap();
        assert_eq!(events.last().unwrap().event_type, ResponseEvent::FAILED);
    }

    #[test]
    fn max_output_tokens_marks_incomplete() {
        let request = serde_json::from_value(serde_json::json!({
            "model": "m", "input": "x", "max_output_tokens": 4
        }))
        .unwrap();
        let mut resource = ResponseObject::from_request("r".into(), &request, ResponseStatus::InProgress);
        let usage = TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
            ..Default::default()
        };
        finalize(&mut resource, &usage);
        assert_eq!(resource.status, ResponseStatus::Incomplete);
        assert_eq!(resource.usage.as_ref().unwrap().total_tokens, 7);
    }
}
