use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::*;
use crate::validated::Normalizable;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Function,
    Thinking,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::Developer => "developer",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
            ChatRole::Function => "function",
            ChatRole::Thinking => "thinking",
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<MessageContent>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Legacy single function call on assistant messages
    pub function_call: Option<FunctionCallResponse>,
    pub tool_call_id: Option<String>,
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            name: None,
            tool_calls: None,
            function_call: None,
            tool_call_id: None,
            reasoning_content: None,
        }
    }

    /// Concatenated text of the message, ignoring media parts.
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::text)
            .unwrap_or_default()
    }
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    InputAudio { input_audio: InputAudio },
    AudioUrl { audio_url: MediaUrl },
    VideoUrl { video_url: MediaUrl },
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUrl {
    /// `http(s)://` URL or a `data:` URL carrying base64
    pub url: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    /// base64 audio
    pub data: String,
    #[serde(default)]
    pub format: String,
}

// ============================================================================
// Request
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatCompletionRequest {
    /// Model name; may be empty when the bearer token selects the model
    #[serde(default)]
    pub model: String,

    #[validate(length(min = 1, message = "messages array is required and cannot be empty"))]
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,

    pub stream_options: Option<StreamOptions>,

    /// Up to 4 sequences where the API will stop generating further tokens
    pub stop: Option<StringOrArray>,

    pub tools: Option<Vec<Tool>>,

    pub tool_choice: Option<ToolChoice>,

    /// Deprecated in favour of `tools`
    pub functions: Option<Vec<Function>>,

    /// Deprecated in favour of `tool_choice`
    pub function_call: Option<FunctionCallChoice>,

    pub parallel_tool_calls: Option<bool>,

    pub response_format: Option<ResponseFormat>,

    /// Replaces `max_tokens` in newer clients
    pub max_completion_tokens: Option<i32>,

    pub n: Option<u32>,

    pub user: Option<String>,

    pub reasoning_effort: Option<String>,

    #[serde(flatten)]
    #[validate(nested)]
    pub sampling: SamplingOverrides,
}

impl Normalizable for ChatCompletionRequest {
    fn normalize(&mut self) {
        if self.sampling.max_tokens.is_none() {
            self.sampling.max_tokens = self.max_completion_tokens;
        }
        // legacy `functions` are tools
        if self.tools.is_none() {
            if let Some(functions) = self.functions.take() {
                self.tools = Some(
                    functions
                        .into_iter()
                        .map(|function| Tool {
                            tool_type: "function".to_string(),
                            function,
                        })
                        .collect(),
                );
            }
        }
    }
}

impl ChatCompletionRequest {
    pub fn resolved_tool_choice(&self) -> Option<ToolChoiceMode> {
        self.tool_choice
            .as_ref()
            .map(ToolChoice::resolve)
            .or_else(|| self.function_call.as_ref().map(FunctionCallChoice::resolve))
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .is_some_and(|opts| opts.include_usage)
    }
}

// ============================================================================
// Response
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    /// Always "chat.completion"
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<Usage>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatCompletionMessage,
    #[serialize_always]
    pub finish_reason: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serialize_always]
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionStreamResponse {
    pub id: String,
    /// Always "chat.completion.chunk"
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatStreamChoice>,
    pub usage: Option<Usage>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChoice {
    pub index: u32,
    pub delta: ChatMessageDelta,
    #[serialize_always]
    pub finish_reason: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}
