use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::*;
use crate::validated::Normalizable;

// ============================================================================
// Completions API (v1/completions)
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CompletionRequest {
    /// Model name; may be empty when the bearer token selects the model
    #[serde(default)]
    pub model: String,

    /// The prompt(s) to generate completions for
    pub prompt: Option<StringOrArray>,

    /// The suffix that comes after a completion of inserted text
    pub suffix: Option<String>,

    /// How many completions to generate for each prompt
    pub n: Option<u32>,

    /// Whether to stream back partial progress
    #[serde(default)]
    pub stream: bool,

    /// Options for streaming response
    pub stream_options: Option<StreamOptions>,

    /// Echo back the prompt in addition to the completion
    #[serde(default)]
    pub echo: bool,

    /// Up to 4 sequences where the API will stop generating further tokens
    pub stop: Option<StringOrArray>,

    /// JSON-mode constraint for the generated text
    pub response_format: Option<ResponseFormat>,

    /// A unique identifier representing your end-user
    pub user: Option<String>,

    #[serde(flatten)]
    #[validate(nested)]
    pub sampling: SamplingOverrides,
}

impl Normalizable for CompletionRequest {}

impl CompletionRequest {
    pub fn prompts(&self) -> Vec<String> {
        self.prompt.as_ref().map(StringOrArray::to_vec).unwrap_or_default()
    }
}

// ============================================================================
// Edits API (v1/edits)
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EditRequest {
    #[serde(default)]
    pub model: String,

    /// Text to edit
    pub input: Option<StringOrArray>,

    /// How the model should edit the input
    #[serde(default)]
    pub instruction: String,

    #[serde(flatten)]
    #[validate(nested)]
    pub sampling: SamplingOverrides,
}

impl Normalizable for EditRequest {}

// ============================================================================
// Response
// ============================================================================

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    /// "text_completion" or "edit"
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<Usage>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    #[serialize_always]
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn prompt_accepts_array() {
        let req: CompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "prompt": ["a", "b"],
            "top_k": 40
        }))
        .unwrap();
        assert_eq!(req.prompts(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(req.sampling.top_k, Some(40));
    }
}
