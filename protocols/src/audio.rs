use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validated::Normalizable;

/// `/v1/audio/speech`
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SpeechRequest {
    #[serde(default)]
    pub model: String,
    #[validate(length(min = 1, message = "input cannot be empty"))]
    pub input: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub backend: Option<String>,
    /// Stream audio chunks as they are produced
    #[serde(default)]
    pub stream: bool,
    pub response_format: Option<String>,
}

impl Normalizable for SpeechRequest {}

/// `/v1/sound-generation`
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SoundGenerationRequest {
    #[serde(default)]
    pub model: String,
    #[validate(length(min = 1, message = "text cannot be empty"))]
    pub text: String,
    /// Seconds
    pub duration: Option<f32>,
    pub temperature: Option<f32>,
    pub do_sample: Option<bool>,
    pub backend: Option<String>,
}

impl Normalizable for SoundGenerationRequest {}

/// Transcription result (multipart request is parsed by the handler)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub id: i32,
    /// Seconds
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub tokens: Vec<i32>,
}
