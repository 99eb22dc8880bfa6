//! Open Responses API types (`/v1/responses`).
//!
//! Output items and content parts always carry the fields clients rely on
//! (`annotations`, `logprobs`, `strict`, `error`, ...), present as empty
//! arrays or `null` rather than omitted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use super::common::{generate_id, ToolChoice};
use crate::validated::Normalizable;

// ============================================================================
// Request
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_background"))]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: String,

    /// String or list of input items
    pub input: Option<ResponseInput>,

    pub instructions: Option<String>,

    pub tools: Option<Vec<ResponseTool>>,

    pub tool_choice: Option<ToolChoice>,

    pub parallel_tool_calls: Option<bool>,

    pub max_tool_calls: Option<u32>,

    pub stream: Option<bool>,

    /// Persist the response (default true)
    pub store: Option<bool>,

    /// Run detached; requires `store`
    pub background: Option<bool>,

    pub previous_response_id: Option<String>,

    #[validate(range(min = 1, message = "max_output_tokens must be greater than 0"))]
    pub max_output_tokens: Option<i32>,

    pub temperature: Option<f64>,

    pub top_p: Option<f64>,

    pub presence_penalty: Option<f64>,

    pub frequency_penalty: Option<f64>,

    pub text: Option<TextConfig>,

    /// Older spelling of `text.format`
    pub text_format: Option<TextFormat>,

    pub reasoning: Option<ReasoningConfig>,

    pub metadata: Option<HashMap<String, String>>,

    pub truncation: Option<String>,

    pub include: Option<Vec<String>>,

    pub user: Option<String>,
}

fn validate_background(req: &ResponsesRequest) -> Result<(), validator::ValidationError> {
    if req.is_background() && !req.should_store() {
        let mut e = validator::ValidationError::new("background_requires_store");
        e.message = Some("background=true requires store=true".into());
        return Err(e);
    }
    Ok(())
}

impl Normalizable for ResponsesRequest {
    fn normalize(&mut self) {
        if self.text.is_none() {
            if let Some(format) = self.text_format.take() {
                self.text = Some(TextConfig {
                    format: Some(format),
                });
            }
        }
    }
}

impl ResponsesRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn should_store(&self) -> bool {
        self.store.unwrap_or(true)
    }

    pub fn is_background(&self) -> bool {
        self.background.unwrap_or(false)
    }

    /// Input as a list of items; a bare string becomes one user message.
    pub fn input_items(&self) -> Vec<ResponseInputItem> {
        match &self.input {
            None => Vec::new(),
            Some(ResponseInput::Text(text)) => vec![ResponseInputItem::EasyMessage(
                EasyInputMessage {
                    item_type: None,
                    role: "user".to_string(),
                    content: EasyContent::Text(text.clone()),
                },
            )],
            Some(ResponseInput::Items(items)) => items.clone(),
        }
    }

    pub fn function_tools(&self) -> Vec<&FunctionTool> {
        self.tools
            .iter()
            .flatten()
            .filter_map(|t| match t {
                ResponseTool::Function(f) => Some(f),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseInput {
    Text(String),
    Items(Vec<ResponseInputItem>),
}

/// An input item: a fully typed item, or the "easy" `{role, content}` message form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseInputItem {
    Typed(ResponseItem),
    EasyMessage(EasyInputMessage),
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EasyInputMessage {
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub role: String,
    pub content: EasyContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EasyContent {
    Text(String),
    Parts(Vec<ResponseContentPart>),
}

impl ResponseInputItem {
    /// Normalise into a typed item.
    pub fn into_item(self) -> ResponseItem {
        match self {
            ResponseInputItem::Typed(item) => item,
            ResponseInputItem::EasyMessage(msg) => {
                let content = match msg.content {
                    EasyContent::Text(text) => vec![ResponseContentPart::InputText { text }],
                    EasyContent::Parts(parts) => parts,
                };
                ResponseItem::Message {
                    id: None,
                    role: msg.role,
                    content,
                    status: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<TextFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextFormat {
    Text,
    JsonObject,
    JsonSchema {
        #[serde(default)]
        name: String,
        schema: Value,
        #[serde(default)]
        strict: Option<bool>,
    },
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub effort: Option<String>,
    pub summary: Option<String>,
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseTool {
    Function(FunctionTool),
    Mcp(McpTool),
    /// Built-in tools the gateway does not execute
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub strict: bool,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub server_label: String,
    pub server_url: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
}

// ============================================================================
// Items
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseItem {
    Message {
        id: Option<String>,
        role: String,
        content: Vec<ResponseContentPart>,
        status: Option<String>,
    },
    FunctionCall {
        id: Option<String>,
        call_id: String,
        name: String,
        arguments: String,
        status: Option<String>,
    },
    FunctionCallOutput {
        id: Option<String>,
        call_id: String,
        output: FunctionOutput,
        status: Option<String>,
    },
    Reasoning {
        id: Option<String>,
        #[serde(default)]
        summary: Vec<ResponseContentPart>,
        content: Option<Vec<ResponseContentPart>>,
        status: Option<String>,
    },
    ItemReference {
        id: String,
    },
    McpCall {
        id: Option<String>,
        server_label: String,
        name: String,
        arguments: String,
        #[serialize_always]
        output: Option<String>,
        #[serialize_always]
        error: Option<String>,
        status: Option<String>,
    },
}

impl ResponseItem {
    pub fn id(&self) -> Option<&str> {
        match self {
            ResponseItem::Message { id, .. }
            | ResponseItem::FunctionCall { id, .. }
            | ResponseItem::FunctionCallOutput { id, .. }
            | ResponseItem::Reasoning { id, .. }
            | ResponseItem::McpCall { id, .. } => id.as_deref(),
            ResponseItem::ItemReference { id } => Some(id),
        }
    }

    pub fn item_type(&self) -> &'static str {
        match self {
            ResponseItem::Message { .. } => "message",
            ResponseItem::FunctionCall { .. } => "function_call",
            ResponseItem::FunctionCallOutput { .. } => "function_call_output",
            ResponseItem::Reasoning { .. } => "reasoning",
            ResponseItem::ItemReference { .. } => "item_reference",
            ResponseItem::McpCall { .. } => "mcp_call",
        }
    }

    pub fn output_message(text: impl Into<String>, status: &str) -> Self {
        ResponseItem::Message {
            id: Some(generate_id("msg_")),
            role: "assistant".to_string(),
            content: vec![ResponseContentPart::output_text(text)],
            status: Some(status.to_string()),
        }
    }

    pub fn function_call(call_id: String, name: String, arguments: String, status: &str) -> Self {
        ResponseItem::FunctionCall {
            id: Some(generate_id("fc_")),
            call_id,
            name,
            arguments,
            status: Some(status.to_string()),
        }
    }

    pub fn reasoning(text: impl Into<String>, status: &str) -> Self {
        ResponseItem::Reasoning {
            id: Some(generate_id("rs_")),
            summary: Vec::new(),
            content: Some(vec![ResponseContentPart::ReasoningText { text: text.into() }]),
            status: Some(status.to_string()),
        }
    }
}

/// `function_call_output.output`: plain text or content parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionOutput {
    Text(String),
    Parts(Vec<ResponseContentPart>),
}

impl FunctionOutput {
    pub fn text(&self) -> String {
        match self {
            FunctionOutput::Text(s) => s.clone(),
            FunctionOutput::Parts(parts) => parts
                .iter()
                .filter_map(ResponseContentPart::text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContentPart {
    InputText {
        text: String,
    },
    OutputText {
        text: String,
        #[serde(default)]
        annotations: Vec<Value>,
        #[serde(default)]
        logprobs: Vec<Value>,
    },
    InputImage {
        image_url: Option<String>,
        file_id: Option<String>,
        detail: Option<String>,
    },
    InputFile {
        file_data: Option<String>,
        file_url: Option<String>,
        filename: Option<String>,
    },
    Refusal {
        refusal: String,
    },
    ReasoningText {
        text: String,
    },
    SummaryText {
        text: String,
    },
}

impl ResponseContentPart {
    pub fn output_text(text: impl Into<String>) -> Self {
        ResponseContentPart::OutputText {
            text: text.into(),
            annotations: Vec::new(),
            logprobs: Vec::new(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ResponseContentPart::InputText { text }
            | ResponseContentPart::OutputText { text, .. }
            | ResponseContentPart::ReasoningText { text }
            | ResponseContentPart::SummaryText { text } => Some(text),
            ResponseContentPart::Refusal { refusal } => Some(refusal),
            _ => None,
        }
    }
}

// ============================================================================
// Response resource
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Incomplete,
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Incomplete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Incomplete => "incomplete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseObject {
    pub id: String,
    /// Always "response"
    pub object: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub status: ResponseStatus,
    pub model: String,
    pub output: Vec<ResponseItem>,
    pub error: Option<ResponseError>,
    pub incomplete_details: Option<IncompleteDetails>,
    pub previous_response_id: Option<String>,
    pub instructions: Option<String>,
    pub tools: Vec<ResponseTool>,
    pub tool_choice: Value,
    pub parallel_tool_calls: bool,
    pub max_tool_calls: Option<u32>,
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub max_output_tokens: Option<i32>,
    pub text: Option<TextConfig>,
    pub truncation: String,
    pub reasoning: Option<ReasoningConfig>,
    pub usage: Option<ResponseUsage>,
    pub metadata: HashMap<String, String>,
    pub store: bool,
    pub background: bool,
}

impl ResponseObject {
    /// A fresh `in_progress` (or `queued`) resource mirroring the request's settings.
    pub fn from_request(id: String, request: &ResponsesRequest, status: ResponseStatus) -> Self {
        Self {
            id,
            object: "response".to_string(),
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            status,
            model: request.model.clone(),
            output: Vec::new(),
            error: None,
            incomplete_details: None,
            previous_response_id: request.previous_response_id.clone(),
            instructions: request.instructions.clone(),
            tools: request.tools.clone().unwrap_or_default(),
            tool_choice: request
                .tool_choice
                .as_ref()
                .and_then(|c| serde_json::to_value(c).ok())
                .unwrap_or_else(|| Value::String("auto".to_string())),
            parallel_tool_calls: request.parallel_tool_calls.unwrap_or(true),
            max_tool_calls: request.max_tool_calls,
            temperature: request.temperature.unwrap_or(1.0),
            top_p: request.top_p.unwrap_or(1.0),
            presence_penalty: request.presence_penalty.unwrap_or(0.0),
            frequency_penalty: request.frequency_penalty.unwrap_or(0.0),
            max_output_tokens: request.max_output_tokens,
            text: Some(request.text.clone().unwrap_or(TextConfig {
                format: Some(TextFormat::Text),
            })),
            truncation: request
                .truncation
                .clone()
                .unwrap_or_else(|| "disabled".to_string()),
            reasoning: request.reasoning.clone(),
            usage: None,
            metadata: request.metadata.clone().unwrap_or_default(),
            store: request.should_store(),
            background: request.is_background(),
        }
    }

    /// Concatenated `output_text` of all assistant messages.
    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .filter_map(|item| match item {
                ResponseItem::Message { content, .. } => Some(content),
                _ => None,
            })
            .flatten()
            .filter_map(|part| match part {
                ResponseContentPart::OutputText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// invalid_request | not_found | server_error | model_error | cancelled
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncompleteDetails {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub input_tokens_details: InputTokensDetails,
    pub output_tokens_details: OutputTokensDetails,
}

impl ResponseUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputTokensDetails {
    pub cached_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputTokensDetails {
    pub reasoning_tokens: u32,
}

/// `GET /v1/responses/{id}/input_items`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseInputItemList {
    /// Always "list"
    pub object: String,
    pub data: Vec<ResponseItem>,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub has_more: bool,
}
