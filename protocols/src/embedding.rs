use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::*;
use crate::validated::Normalizable;

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,

    /// Text, texts, one token array or several
    pub input: InputField,

    /// Only "float" is produced; accepted for compatibility
    pub encoding_format: Option<String>,

    pub dimensions: Option<u32>,

    pub user: Option<String>,

    pub backend: Option<String>,
}

impl Normalizable for EmbeddingRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Always "list"
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    /// Always "embedding"
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: u32,
}
