//! Prompt assembly for chat-shaped requests and parsing of what comes back.
//!
//! Chat, Anthropic Messages and Responses requests are all lowered to a list
//! of [`ChatMessage`]s before reaching [`prepare_chat`]. The resulting
//! [`OutputParsing`] remembers whether tool calling and reasoning extraction
//! apply, so the unary and streaming paths post-process output the same way.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use grpc_client::proto;
use llm_templates::{
    ChatPromptConfig, Evaluator, MultimodalOptions, PromptExtras, PromptTemplateData,
    TemplateError, TemplateMessage, TemplateType,
};
use openai_protocol::{
    chat::{ChatMessage, ChatRole, ContentPart, MessageContent},
    common::{ResponseFormat, Tool, ToolChoiceMode},
};
use reasoning_parser::{
    detect_thinking_forced_open, extract_reasoning, BaseReasoningParser, ParserConfig,
    ReasoningOptions, ReasoningParser,
};
use serde_json::{json, Value};
use tool_parser::{
    schema_to_grammar, ConfiguredParser, FunctionCall, Functions, FunctionsConfig, ToolCallItem,
    ToolParser, NO_ACTION_MESSAGE_PARAM,
};
use tracing::{debug, warn};

use super::finetune::finetune;
use crate::{
    config::model::ModelConfig,
    error::{GatewayError, GatewayResult},
};

/// Everything a chat-shaped request contributes to the prompt.
#[derive(Debug, Clone, Default)]
pub struct ChatInput {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub tool_choice: Option<ToolChoiceMode>,
    pub response_format: Option<ResponseFormat>,
    pub reasoning_effort: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Media referenced by the conversation, base64 encoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Media {
    pub images: Vec<String>,
    pub videos: Vec<String>,
    pub audios: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PreparedPrompt {
    pub prompt: String,
    pub media: Media,
    /// Raw messages for backends that apply the tokenizer's own template
    pub messages: Vec<proto::Message>,
    pub tools_json: String,
    pub tool_choice_json: String,
    pub parsing: OutputParsing,
}

impl PreparedPrompt {
    /// Fill the prompt-specific fields of a backend request.
    pub fn apply(&self, options: &mut proto::PredictOptions) {
        options.prompt = self.prompt.clone();
        options.images = self.media.images.clone();
        options.videos = self.media.videos.clone();
        options.audios = self.media.audios.clone();
        options.messages = self.messages.clone();
        options.tools = self.tools_json.clone();
        options.tool_choice = self.tool_choice_json.clone();
    }
}

/// How raw model output is turned into content, reasoning and tool calls.
#[derive(Debug, Clone, Default)]
pub struct OutputParsing {
    /// Set when the request offered tools the model may call
    pub functions: Option<FunctionsConfig>,
    /// Tools offered, used to index streamed calls
    pub tools: Vec<Tool>,
    pub reasoning: bool,
    pub thinking_forced_open: bool,
}

impl OutputParsing {
    pub fn tools_active(&self) -> bool {
        self.functions.is_some()
    }

    fn no_action_name(&self) -> Option<&str> {
        self.functions
            .as_ref()
            .filter(|f| !f.disable_no_action)
            .map(FunctionsConfig::no_action_name)
    }
}

/// Final output of a prediction after post-processing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<FunctionCall>,
}

/// Build the prompt for a chat-shaped request.
///
/// Mutates `config` where the request changes how the model runs: the
/// grammar synthesised from tools or a JSON response format, and the
/// no-action function when a specific tool is forced.
pub async fn prepare_chat(
    evaluator: &Evaluator,
    config: &mut ModelConfig,
    input: &ChatInput,
) -> GatewayResult<PreparedPrompt> {
    let functions = select_functions(config, input);
    let tools_active = !functions.is_empty();

    if tools_active {
        if !config.function.grammar.no_grammar && config.grammar.is_empty() {
            config.grammar = functions.grammar(&config.function)?;
            debug!(model = %config.name, "Synthesised function-call grammar");
        }
    } else if config.grammar.is_empty() {
        if let Some(grammar) = response_format_grammar(config, input.response_format.as_ref())? {
            config.grammar = grammar;
        }
    }

    let (templated, media, messages) = render_messages(evaluator, config, &input.messages).await?;

    let prompt_functions: Vec<Value> = if tools_active {
        let offered = if config.function.disable_no_action {
            functions.clone()
        } else {
            functions.clone().with_no_action(
                config.function.no_action_name(),
                config.function.no_action_description(),
            )
        };
        offered
            .iter()
            .filter_map(|f| serde_json::to_value(f).ok())
            .collect()
    } else {
        Vec::new()
    };

    let prompt = evaluator.template_messages(
        &templated,
        &ChatPromptConfig {
            model: config.model_file(),
            templates: &config.template,
            system_prompt: &config.system_prompt,
            roles: &config.roles,
            grammar_active: tools_active && !config.function.grammar.no_grammar,
        },
        &prompt_functions,
        tools_active,
        &PromptExtras {
            reasoning_effort: input.reasoning_effort.clone().unwrap_or_default(),
            metadata: input.metadata.clone(),
        },
    )?;

    let reasoning = !config.reasoning.disable;
    let thinking_forced_open = reasoning && detect_thinking_forced_open(&prompt);
    debug!(model = %config.name, prompt_len = prompt.len(), tools_active, thinking_forced_open, "Prompt ready");

    Ok(PreparedPrompt {
        prompt,
        media,
        messages,
        tools_json: if input.tools.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&input.tools).unwrap_or_default()
        },
        tool_choice_json: input
            .tool_choice
            .as_ref()
            .map(tool_choice_json)
            .unwrap_or_default(),
        parsing: OutputParsing {
            functions: tools_active.then(|| config.function.clone()),
            tools: input.tools.clone(),
            reasoning,
            thinking_forced_open,
        },
    })
}

/// Prompt for `/v1/completions`: the completion template wraps the text.
pub fn prepare_completion(
    evaluator: &Evaluator,
    config: &mut ModelConfig,
    prompt: &str,
    response_format: Option<&ResponseFormat>,
) -> GatewayResult<PreparedPrompt> {
    if config.grammar.is_empty() {
        if let Some(grammar) = response_format_grammar(config, response_format)? {
            config.grammar = grammar;
        }
    }
    let data = PromptTemplateData {
        system_prompt: config.system_prompt.clone(),
        input: prompt.to_string(),
        ..Default::default()
    };
    let prompt = evaluator.evaluate_template_for_prompt(
        TemplateType::Completion,
        config.model_file(),
        &config.template,
        &data,
    )?;
    Ok(plain_prompt(config, prompt))
}

/// Prompt for `/v1/edits`: input and instruction through the edit template.
pub fn prepare_edit(
    evaluator: &Evaluator,
    config: &ModelConfig,
    input: &str,
    instruction: &str,
) -> GatewayResult<PreparedPrompt> {
    let data = PromptTemplateData {
        system_prompt: config.system_prompt.clone(),
        input: input.to_string(),
        instruction: instruction.to_string(),
        ..Default::default()
    };
    let prompt = evaluator.evaluate_template_for_prompt(
        TemplateType::Edit,
        config.model_file(),
        &config.template,
        &data,
    )?;
    Ok(plain_prompt(config, prompt))
}

fn plain_prompt(config: &ModelConfig, prompt: String) -> PreparedPrompt {
    let reasoning = !config.reasoning.disable;
    PreparedPrompt {
        parsing: OutputParsing {
            reasoning,
            thinking_forced_open: reasoning && detect_thinking_forced_open(&prompt),
            ..Default::default()
        },
        prompt,
        ..Default::default()
    }
}

/// Functions offered to the model after applying `tool_choice`.
fn select_functions(config: &mut ModelConfig, input: &ChatInput) -> Functions {
    let offered: Vec<Tool> = input
        .tools
        .iter()
        .filter(|t| t.tool_type.is_empty() || t.tool_type == "function")
        .cloned()
        .collect();
    let functions = Functions::from_tools(&offered);
    match &input.tool_choice {
        Some(ToolChoiceMode::None) => Functions::default(),
        Some(ToolChoiceMode::Function(name)) => {
            config.function.disable_no_action = true;
            let selected = functions.select(name);
            if selected.is_empty() {
                warn!(model = %config.name, tool = %name, "tool_choice names a tool that was not offered");
            }
            selected
        }
        Some(ToolChoiceMode::Required) => {
            config.function.disable_no_action = true;
            functions
        }
        Some(ToolChoiceMode::Auto) | None => functions,
    }
}

fn response_format_grammar(
    config: &ModelConfig,
    format: Option<&ResponseFormat>,
) -> GatewayResult<Option<String>> {
    let schema = match format {
        Some(ResponseFormat::JsonObject) => json!({"type": "object"}),
        Some(ResponseFormat::JsonSchema { json_schema }) => json_schema.schema.clone(),
        Some(ResponseFormat::Text) | None => return Ok(None),
    };
    let grammar = schema_to_grammar(&schema, &config.function.grammar_options())?;
    Ok(Some(grammar))
}

fn tool_choice_json(choice: &ToolChoiceMode) -> String {
    match choice {
        ToolChoiceMode::None => "\"none\"".to_string(),
        ToolChoiceMode::Auto => "\"auto\"".to_string(),
        ToolChoiceMode::Required => "\"required\"".to_string(),
        ToolChoiceMode::Function(name) => {
            json!({"type": "function", "function": {"name": name}}).to_string()
        }
    }
}

/// Turn request messages into template input, collecting media on the way.
async fn render_messages(
    evaluator: &Evaluator,
    config: &ModelConfig,
    messages: &[ChatMessage],
) -> GatewayResult<(Vec<TemplateMessage>, Media, Vec<proto::Message>)> {
    let mut media = Media::default();
    let mut templated = Vec::with_capacity(messages.len());
    let mut raw = Vec::with_capacity(messages.len());
    let mut pending_thinking: Option<String> = None;

    for message in messages {
        let text = message.text();
        if message.role == ChatRole::Thinking && config.reasoning.merge_thinking_messages {
            let acc = pending_thinking.get_or_insert_with(String::new);
            if !acc.is_empty() {
                acc.push('\n');
            }
            acc.push_str(&text);
            continue;
        }

        let before = (media.images.len(), media.videos.len(), media.audios.len());
        if let Some(MessageContent::Parts(parts)) = &message.content {
            collect_media(parts, &mut media).await?;
        }
        let options = MultimodalOptions {
            total_images: media.images.len(),
            total_videos: media.videos.len(),
            total_audios: media.audios.len(),
            images_in_message: media.images.len() - before.0,
            videos_in_message: media.videos.len() - before.1,
            audios_in_message: media.audios.len() - before.2,
        };
        let has_media = options.images_in_message + options.videos_in_message + options.audios_in_message > 0;
        let content = if has_media {
            match evaluator.template_multimodal(&config.template.multimodal, options, &text) {
                Ok(content) => content,
                Err(TemplateError::RenderFailed { reason, .. }) => {
                    warn!(model = %config.name, %reason, "Multimodal template failed, using plain text");
                    text.clone()
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            text.clone()
        };

        let mut reasoning = message.reasoning_content.clone();
        if message.role == ChatRole::Assistant {
            if let Some(thinking) = pending_thinking.take() {
                reasoning = Some(match reasoning {
                    Some(existing) => format!("{thinking}\n{existing}"),
                    None => thinking,
                });
            }
        }

        let tool_calls = message
            .tool_calls
            .as_ref()
            .filter(|calls| !calls.is_empty())
            .and_then(|calls| serde_json::to_value(calls).ok());
        let function_call = message
            .function_call
            .as_ref()
            .and_then(|call| serde_json::to_value(call).ok());

        raw.push(proto::Message {
            role: message.role.as_str().to_string(),
            content: text,
            name: message.name.clone().unwrap_or_default(),
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
            reasoning_content: reasoning.clone().unwrap_or_default(),
            tool_calls: tool_calls.as_ref().map(Value::to_string).unwrap_or_default(),
        });
        templated.push(TemplateMessage {
            role: message.role.as_str().to_string(),
            content,
            name: message.name.clone().or_else(|| message.tool_call_id.clone()),
            function_call,
            tool_calls,
            reasoning,
        });
    }

    Ok((templated, media, raw))
}

async fn collect_media(parts: &[ContentPart], media: &mut Media) -> GatewayResult<()> {
    for part in parts {
        match part {
            ContentPart::Text { .. } => {}
            ContentPart::ImageUrl { image_url } => media.images.push(load_media(&image_url.url).await?),
            ContentPart::VideoUrl { video_url } => media.videos.push(load_media(&video_url.url).await?),
            ContentPart::AudioUrl { audio_url } => media.audios.push(load_media(&audio_url.url).await?),
            ContentPart::InputAudio { input_audio } => media.audios.push(input_audio.data.clone()),
        }
    }
    Ok(())
}

/// Base64 payload of a `data:` URL, or the body of a remote URL encoded.
pub async fn load_media(url: &str) -> GatewayResult<String> {
    if let Some(rest) = url.strip_prefix("data:") {
        return rest
            .split_once(";base64,")
            .map(|(_, payload)| payload.to_string())
            .ok_or_else(|| GatewayError::validation("media data URL must be base64 encoded"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let bytes = reqwest::get(url)
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| GatewayError::validation(format!("failed to fetch {url}: {e}")))?
            .bytes()
            .await
            .map_err(|e| GatewayError::validation(format!("failed to read {url}: {e}")))?;
        return Ok(base64::engine::general_purpose::STANDARD.encode(bytes));
    }
    // Bare base64
    Ok(url.to_string())
}

/// Post-process a complete prediction.
pub async fn parse_output(
    config: &ModelConfig,
    parsing: &OutputParsing,
    prompt: &str,
    raw: &str,
) -> ParsedOutput {
    let text = finetune(config, prompt, raw);
    let (reasoning, mut content) = if parsing.reasoning {
        extract_reasoning(
            &text,
            &ReasoningOptions {
                thinking_forced_open: parsing.thinking_forced_open,
            },
        )
    } else {
        (String::new(), text)
    };

    let mut tool_calls = Vec::new();
    if let Some(functions) = &parsing.functions {
        let parser = ConfiguredParser::new(functions.clone());
        match parser.parse_complete(&content).await {
            Ok((normal, calls)) if !calls.is_empty() => {
                content = normal;
                tool_calls = calls.into_iter().map(|c| c.function).collect();
            }
            Ok(_) => {}
            Err(e) => debug!(model = %config.name, error = %e, "No tool call in output"),
        }
        if let Some(no_action) = parsing.no_action_name() {
            let (answers, calls): (Vec<_>, Vec<_>) =
                tool_calls.into_iter().partition(|c| c.name == no_action);
            tool_calls = calls;
            for answer in answers {
                let message = no_action_message(&answer.arguments);
                if content.trim().is_empty() {
                    content = message;
                } else {
                    content.push_str(&message);
                }
            }
        }
    }

    ParsedOutput {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls,
    }
}

fn no_action_message(arguments: &str) -> String {
    serde_json::from_str::<Value>(arguments)
        .ok()
        .and_then(|v| v.get(NO_ACTION_MESSAGE_PARAM).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// One piece of streamed output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Reasoning(String),
    Content(String),
    /// First fragment of a call carries the name, later ones argument text
    ToolCall(ToolCallItem),
}

/// Splits streamed tokens into reasoning, content and tool call fragments.
pub struct StreamProcessor {
    reasoning: Option<BaseReasoningParser>,
    tools: Option<ConfiguredParser>,
    offered: Vec<Tool>,
    no_action: Option<String>,
    /// Parser index of each no-action call and its buffered arguments
    answers: HashMap<usize, String>,
    /// Parser index to client-facing index for real calls
    call_index: HashMap<usize, usize>,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("reasoning", &self.reasoning.is_some())
            .field("tools", &self.tools.is_some())
            .finish()
    }
}

impl StreamProcessor {
    pub fn new(parsing: &OutputParsing) -> Self {
        let reasoning = parsing.reasoning.then(|| {
            BaseReasoningParser::new(ParserConfig {
                initial_in_reasoning: parsing.thinking_forced_open,
                ..Default::default()
            })
        });
        Self {
            reasoning,
            tools: parsing.functions.clone().map(ConfiguredParser::new),
            offered: parsing.tools.clone(),
            no_action: parsing.no_action_name().map(str::to_string),
            answers: HashMap::new(),
            call_index: HashMap::new(),
        }
    }

    pub fn tools_active(&self) -> bool {
        self.tools.is_some()
    }

    pub async fn push(&mut self, token: &str) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        let normal = match &mut self.reasoning {
            Some(parser) => match parser.parse_reasoning_streaming_incremental(token) {
                Ok(result) => {
                    if !result.reasoning_text.is_empty() {
                        out.push(StreamDelta::Reasoning(result.reasoning_text));
                    }
                    result.normal_text
                }
                Err(e) => {
                    debug!(error = %e, "Reasoning parser gave up, passing text through");
                    token.to_string()
                }
            },
            None => token.to_string(),
        };
        self.push_content(&normal, &mut out).await;
        out
    }

    /// Release buffered text and call fragments at end of stream.
    pub async fn finish(&mut self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if let Some(parser) = &mut self.reasoning {
            let rest = parser.flush();
            if !rest.reasoning_text.is_empty() {
                out.push(StreamDelta::Reasoning(rest.reasoning_text));
            }
            self.push_content(&rest.normal_text, &mut out).await;
        }
        let unstreamed = self
            .tools
            .as_ref()
            .and_then(ToolParser::get_unstreamed_tool_args)
            .unwrap_or_default();
        for item in unstreamed {
            self.route_call(item, &mut out);
        }
        let mut answers: Vec<_> = self.answers.drain().collect();
        answers.sort_by_key(|(index, _)| *index);
        for (_, arguments) in answers {
            let message = no_action_message(&arguments);
            if !message.is_empty() {
                out.push(StreamDelta::Content(message));
            }
        }
        out
    }

    async fn push_content(&mut self, text: &str, out: &mut Vec<StreamDelta>) {
        if text.is_empty() {
            return;
        }
        let Some(parser) = &mut self.tools else {
            out.push(StreamDelta::Content(text.to_string()));
            return;
        };
        match parser.parse_incremental(text, &self.offered).await {
            Ok(result) => {
                if !result.normal_text.is_empty() {
                    out.push(StreamDelta::Content(result.normal_text));
                }
                for item in result.calls {
                    self.route_call(item, out);
                }
            }
            Err(e) => {
                debug!(error = %e, "Tool parser rejected chunk, passing text through");
                out.push(StreamDelta::Content(text.to_string()));
            }
        }
    }

    fn route_call(&mut self, item: ToolCallItem, out: &mut Vec<StreamDelta>) {
        if let Some(name) = &item.name {
            if self.no_action.as_deref() == Some(name.as_str()) {
                self.answers.entry(item.tool_index).or_default();
                return;
            }
        }
        if let Some(args) = self.answers.get_mut(&item.tool_index) {
            args.push_str(&item.parameters);
            return;
        }
        let next = self.call_index.len();
        let index = *self.call_index.entry(item.tool_index).or_insert(next);
        out.push(StreamDelta::ToolCall(ToolCallItem {
            tool_index: index,
            ..item
        }));
    }
}

#[cfg(test)]
mod tests {
    use llm_templates::TemplateCache;
    use openai_protocol::common::Function;

    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::new(TemplateCache::new("/nonexistent"))
    }

    fn weather_tool() -> Tool {
        Tool {
            tool_type: "function".into(),
            function: Function {
                name: "get_weather".into(),
                description: Some("Current weather".into()),
                parameters: json!({"type": "object", "properties": {"location": {"type": "string"}}}),
                strict: None,
            },
        }
    }

    fn user(text: &str) -> ChatMessage {
        ChatMessage::new(ChatRole::User, text)
    }

    #[tokio::test]
    async fn plain_chat_joins_messages() {
        let mut config = ModelConfig::for_model_file("m");
        config.roles = [("user".to_string(), "User: ".to_string())].into();
        let input = ChatInput {
            messages: vec![ChatMessage::new(ChatRole::System, "be brief"), user("hi")],
            ..Default::default()
        };
        let prepared = prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert_eq!(prepared.prompt, "be brief\nUser: hi");
        assert!(!prepared.parsing.tools_active());
        assert_eq!(prepared.messages.len(), 2);
        assert!(config.grammar.is_empty());
    }

    #[tokio::test]
    async fn tools_synthesise_grammar() {
        let mut config = ModelConfig::for_model_file("m");
        let input = ChatInput {
            messages: vec![user("weather?")],
            tools: vec![weather_tool()],
            ..Default::default()
        };
        let prepared = prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert!(prepared.parsing.tools_active());
        assert!(config.grammar.contains("get_weather"));
        assert!(config.grammar.contains("answer"));
        assert!(prepared.tools_json.contains("get_weather"));
    }

    #[tokio::test]
    async fn named_tool_choice_drops_no_action() {
        let mut config = ModelConfig::for_model_file("m");
        let input = ChatInput {
            messages: vec![user("weather?")],
            tools: vec![weather_tool()],
            tool_choice: Some(ToolChoiceMode::Function("get_weather".into())),
            ..Default::default()
        };
        prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert!(config.grammar.contains("get_weather"));
        assert!(!config.grammar.contains("answer"));
    }

    #[tokio::test]
    async fn tool_choice_none_disables_tools() {
        let mut config = ModelConfig::for_model_file("m");
        let input = ChatInput {
            messages: vec![user("weather?")],
            tools: vec![weather_tool()],
            tool_choice: Some(ToolChoiceMode::None),
            ..Default::default()
        };
        let prepared = prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert!(!prepared.parsing.tools_active());
        assert!(config.grammar.is_empty());
    }

    #[tokio::test]
    async fn json_response_format_builds_grammar() {
        let mut config = ModelConfig::for_model_file("m");
        let input = ChatInput {
            messages: vec![user("give json")],
            response_format: Some(ResponseFormat::JsonObject),
            ..Default::default()
        };
        prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert!(config.grammar.contains("root"));
    }

    #[tokio::test]
    async fn thinking_messages_merge_into_next_assistant() {
        let mut config = ModelConfig::for_model_file("m");
        config.reasoning.merge_thinking_messages = true;
        let input = ChatInput {
            messages: vec![
                user("q"),
                ChatMessage::new(ChatRole::Thinking, "pondering"),
                ChatMessage::new(ChatRole::Assistant, "a"),
            ],
            ..Default::default()
        };
        let prepared = prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert_eq!(prepared.messages.len(), 2);
        assert_eq!(prepared.messages[1].reasoning_content, "pondering");
    }

    #[tokio::test]
    async fn data_urls_become_media() {
        let mut config = ModelConfig::for_model_file("m");
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]
        }))
        .unwrap();
        let input = ChatInput {
            messages: vec![message],
            ..Default::default()
        };
        let prepared = prepare_chat(&evaluator(), &mut config, &input).await.unwrap();
        assert_eq!(prepared.media.images, vec!["AAAA"]);
        assert!(prepared.prompt.contains("[img-0]what is this?"));
    }

    fn tool_parsing() -> OutputParsing {
        OutputParsing {
            functions: Some(FunctionsConfig::default()),
            tools: vec![weather_tool()],
            reasoning: true,
            thinking_forced_open: false,
        }
    }

    #[tokio::test]
    async fn parses_tool_call_with_string_arguments() {
        let config = ModelConfig::default();
        let raw = r#"{"name":"get_weather","arguments":{"location":"San Francisco"}}"#;
        let out = parse_output(&config, &tool_parsing(), "", raw).await;
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "get_weather");
        assert_eq!(out.tool_calls[0].arguments, r#"{"location":"San Francisco"}"#);
    }

    #[tokio::test]
    async fn no_action_call_becomes_content() {
        let config = ModelConfig::default();
        let raw = r#"{"name":"answer","arguments":{"message":"It is sunny"}}"#;
        let out = parse_output(&config, &tool_parsing(), "", raw).await;
        assert!(out.tool_calls.is_empty());
        assert_eq!(out.content, "It is sunny");
    }

    #[tokio::test]
    async fn reasoning_is_split_from_content() {
        let config = ModelConfig::default();
        let parsing = OutputParsing {
            reasoning: true,
            ..Default::default()
        };
        let out = parse_output(&config, &parsing, "", "<think>hmm</think>hello").await;
        assert_eq!(out.reasoning.as_deref(), Some("hmm"));
        assert_eq!(out.content, "hello");
    }

    async fn run(processor: &mut StreamProcessor, tokens: &[&str]) -> Vec<StreamDelta> {
        let mut all = Vec::new();
        for token in tokens {
            all.extend(processor.push(token).await);
        }
        all.extend(processor.finish().await);
        all
    }

    fn text_of(deltas: &[StreamDelta], reasoning: bool) -> String {
        deltas
            .iter()
            .filter_map(|d| match (d, reasoning) {
                (StreamDelta::Reasoning(t), true) | (StreamDelta::Content(t), false) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn stream_splits_reasoning() {
        let parsing = OutputParsing {
            reasoning: true,
            ..Default::default()
        };
        let mut processor = StreamProcessor::new(&parsing);
        let deltas = run(&mut processor, &["<think>", "deep", "</think>", "he", "llo"]).await;
        assert_eq!(text_of(&deltas, true), "deep");
        assert_eq!(text_of(&deltas, false), "hello");
    }

    #[tokio::test]
    async fn stream_emits_tool_call_fragments() {
        let mut processor = StreamProcessor::new(&tool_parsing());
        let deltas = run(
            &mut processor,
            &[r#"{"name":"get_weather","#, r#""arguments":{"location":"#, r#""Paris"}}"#],
        )
        .await;
        let items: Vec<&ToolCallItem> = deltas
            .iter()
            .filter_map(|d| match d {
                StreamDelta::ToolCall(item) => Some(item),
                _ => None,
            })
            .collect();
        assert_eq!(items[0].name.as_deref(), Some("get_weather"));
        let args: String = items.iter().map(|i| i.parameters.as_str()).collect();
        assert_eq!(args, r#"{"location":"Paris"}"#);
        assert!(items.iter().all(|i| i.tool_index == 0));
    }

    #[tokio::test]
    async fn stream_no_action_turns_into_content() {
        let mut processor = StreamProcessor::new(&tool_parsing());
        let deltas = run(
            &mut processor,
            &[r#"{"name":"answer","arguments":"#, r#"{"message":"hi there"}}"#],
        )
        .await;
        assert!(deltas.iter().all(|d| !matches!(d, StreamDelta::ToolCall(_))));
        assert_eq!(text_of(&deltas, false), "hi there");
    }
}
