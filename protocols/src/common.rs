use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

// ============================================================================
// Polymorphic request fields
// ============================================================================

/// A field that accepts either one string or a list of strings (`stop`, `prompt`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrArray {
    String(String),
    Array(Vec<String>),
}

impl StringOrArray {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrArray::String(s) => vec![s.clone()],
            StringOrArray::Array(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            StringOrArray::String(s) => s.is_empty(),
            StringOrArray::Array(v) => v.is_empty(),
        }
    }
}

/// Embedding / completion `input`: text, texts, one token array or many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputField {
    Text(String),
    Texts(Vec<String>),
    Tokens(Vec<i32>),
    TokenArrays(Vec<Vec<i32>>),
}

/// One embedding input after flattening `InputField`.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Text(String),
    Tokens(Vec<i32>),
}

impl InputField {
    pub fn values(&self) -> Vec<InputValue> {
        match self {
            InputField::Text(s) => vec![InputValue::Text(s.clone())],
            InputField::Texts(v) => v.iter().cloned().map(InputValue::Text).collect(),
            InputField::Tokens(t) => vec![InputValue::Tokens(t.clone())],
            InputField::TokenArrays(v) => v.iter().cloned().map(InputValue::Tokens).collect(),
        }
    }
}

/// Legacy `function_call`: `"none" | "auto" | "required"` or `{"name": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FunctionCallChoice {
    Mode(String),
    Named { name: String },
}

/// `tool_choice`: a mode string or a named tool.
///
/// Both the chat shape `{"type":"function","function":{"name":..}}` and the
/// Responses shape `{"type":"function","name":..}` are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named(NamedToolChoice),
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: Option<FunctionName>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionName {
    pub name: String,
}

/// Resolved form of `tool_choice` / `function_call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
    Function(String),
}

impl ToolChoice {
    pub fn resolve(&self) -> ToolChoiceMode {
        match self {
            ToolChoice::Mode(mode) => mode_from_str(mode),
            ToolChoice::Named(named) => {
                let name = named
                    .function
                    .as_ref()
                    .map(|f| f.name.clone())
                    .or_else(|| named.name.clone());
                match name {
                    Some(name) if !name.is_empty() => ToolChoiceMode::Function(name),
                    _ => ToolChoiceMode::Auto,
                }
            }
        }
    }
}

impl FunctionCallChoice {
    pub fn resolve(&self) -> ToolChoiceMode {
        match self {
            FunctionCallChoice::Mode(mode) => mode_from_str(mode),
            FunctionCallChoice::Named { name } => ToolChoiceMode::Function(name.clone()),
        }
    }
}

fn mode_from_str(mode: &str) -> ToolChoiceMode {
    match mode {
        "none" => ToolChoiceMode::None,
        "required" | "any" => ToolChoiceMode::Required,
        _ => ToolChoiceMode::Auto,
    }
}

fn default_tool_type() -> String {
    "function".to_string()
}

// ============================================================================
// Tools
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: Function,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments object
    #[serde(default)]
    pub parameters: Value,
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub index: u32,
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: FunctionCallResponse,
}

/// A function invocation; `arguments` is a JSON document encoded as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Streaming tool call fragment
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub tool_type: Option<String>,
    pub function: Option<FunctionCallDelta>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// ============================================================================
// Response format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { json_schema: JsonSchemaFormat },
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub schema: Value,
    pub strict: Option<bool>,
}

// ============================================================================
// Usage and streaming options
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Backend prompt processing time in milliseconds
    pub timing_prompt_processing: Option<f64>,
    /// Backend token generation time in milliseconds
    pub timing_token_generation: Option<f64>,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

// ============================================================================
// Per-request prediction overrides
// ============================================================================

/// Prediction knobs a request may set on top of the model's YAML config.
///
/// Flattened into every generation request so the same field names work on
/// chat, completion, edits and responses.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct SamplingOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i32>,
    #[validate(range(min = 1, message = "max_tokens must be greater than 0"))]
    pub max_tokens: Option<i32>,
    pub seed: Option<i32>,
    pub repeat_penalty: Option<f64>,
    pub repeat_last_n: Option<i32>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub mirostat: Option<i32>,
    pub mirostat_eta: Option<f64>,
    pub mirostat_tau: Option<f64>,
    pub typical_p: Option<f64>,
    pub tfz: Option<f64>,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
    pub clip_skip: Option<i32>,
    pub negative_prompt: Option<String>,
    pub negative_prompt_scale: Option<f32>,
    pub n_keep: Option<i32>,
    pub ignore_eos: Option<bool>,
    /// Raw grammar text; replaces any grammar the gateway would synthesise
    pub grammar: Option<String>,
    /// Backend kind to force for this request
    pub backend: Option<String>,
    pub model_base_name: Option<String>,
    pub use_fast_tokenizer: Option<bool>,
}

// ============================================================================
// Errors
// ============================================================================

/// OpenAI-shaped error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

/// Identifier with a prefix and a random uuid body, e.g. `chatcmpl-…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn input_field_variants() {
        let text: InputField = serde_json::from_value(json!("hi")).unwrap();
        assert_eq!(text.values(), vec![InputValue::Text("hi".into())]);

        let tokens: InputField = serde_json::from_value(json!([1, 2, 3])).unwrap();
        assert_eq!(tokens.values(), vec![InputValue::Tokens(vec![1, 2, 3])]);

        let arrays: InputField = serde_json::from_value(json!([[1], [2, 3]])).unwrap();
        assert_eq!(arrays.values().len(), 2);

        let texts: InputField = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert!(matches!(texts, InputField::Texts(_)));
    }

    #[test]
    fn tool_choice_shapes() {
        let chat: ToolChoice =
            serde_json::from_value(json!({"type": "function", "function": {"name": "f"}}))
                .unwrap();
        assert_eq!(chat.resolve(), ToolChoiceMode::Function("f".into()));

        let responses: ToolChoice =
            serde_json::from_value(json!({"type": "function", "name": "g"})).unwrap();
        assert_eq!(responses.resolve(), ToolChoiceMode::Function("g".into()));

        let mode: ToolChoice = serde_json::from_value(json!("required")).unwrap();
        assert_eq!(mode.resolve(), ToolChoiceMode::Required);
    }

    #[test]
    fn function_call_choice_shapes() {
        let named: FunctionCallChoice = serde_json::from_value(json!({"name": "f"})).unwrap();
        assert_eq!(named.resolve(), ToolChoiceMode::Function("f".into()));
        let none: FunctionCallChoice = serde_json::from_value(json!("none")).unwrap();
        assert_eq!(none.resolve(), ToolChoiceMode::None);
    }

    #[test]
    fn stop_accepts_string_or_array() {
        let one: StringOrArray = serde_json::from_value(json!("\n")).unwrap();
        assert_eq!(one.to_vec(), vec!["\n".to_string()]);
        let many: StringOrArray = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(many.to_vec().len(), 2);
    }

    #[test]
    fn max_tokens_must_be_positive() {
        let overrides = SamplingOverrides {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(overrides.validate().is_err());
    }
}
