use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validated::Normalizable;

/// Jina-style rerank request
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RerankRequest {
    #[serde(default)]
    pub model: String,
    #[validate(length(min = 1, message = "query cannot be empty"))]
    pub query: String,
    #[validate(length(min = 1, message = "documents cannot be empty"))]
    pub documents: Vec<String>,
    pub top_n: Option<i32>,
    pub backend: Option<String>,
}

impl Normalizable for RerankRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResponse {
    pub model: String,
    pub usage: RerankUsage,
    pub results: Vec<RerankResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankUsage {
    pub total_tokens: i32,
    pub prompt_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: i32,
    pub document: RerankDocument,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankDocument {
    pub text: String,
}
