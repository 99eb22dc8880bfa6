//! Gateway-specific endpoints that have no OpenAI counterpart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validated::Normalizable;

// ============================================================================
// Tokenize
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokenizeRequest {
    #[serde(default)]
    pub model: String,
    pub content: String,
}

impl Normalizable for TokenizeRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<i32>,
}

// ============================================================================
// Voice activity detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VadRequest {
    #[serde(default)]
    pub model: String,
    /// Mono f32 PCM samples
    #[validate(length(min = 1, message = "audio cannot be empty"))]
    pub audio: Vec<f32>,
}

impl Normalizable for VadRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadResponse {
    pub segments: Vec<VadSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSegment {
    /// Seconds
    pub start: f32,
    pub end: f32,
}

// ============================================================================
// Object detection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DetectionRequest {
    #[serde(default)]
    pub model: String,
    /// URL or base64 image
    #[validate(length(min = 1, message = "image cannot be empty"))]
    pub image: String,
}

impl Normalizable for DetectionRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_name: String,
}

// ============================================================================
// Vector stores
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoresSetRequest {
    #[serde(default)]
    pub store: String,
    pub keys: Vec<Vec<f32>>,
    pub values: Vec<String>,
}

impl Normalizable for StoresSetRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoresDeleteRequest {
    #[serde(default)]
    pub store: String,
    pub keys: Vec<Vec<f32>>,
}

impl Normalizable for StoresDeleteRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoresGetRequest {
    #[serde(default)]
    pub store: String,
    pub keys: Vec<Vec<f32>>,
}

impl Normalizable for StoresGetRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresGetResponse {
    pub keys: Vec<Vec<f32>>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoresFindRequest {
    #[serde(default)]
    pub store: String,
    pub key: Vec<f32>,
    #[validate(range(min = 1))]
    pub topk: i32,
}

impl Normalizable for StoresFindRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresFindResponse {
    pub keys: Vec<Vec<f32>>,
    pub values: Vec<String>,
    pub similarities: Vec<f32>,
}

// ============================================================================
// Backend monitor
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackendMonitorRequest {
    #[validate(length(min = 1, message = "model cannot be empty"))]
    pub model: String,
}

impl Normalizable for BackendMonitorRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMonitorResponse {
    pub model: String,
    pub backend: String,
    /// Backend-reported state ("ready", "busy", ...)
    pub state: String,
    pub pid: Option<u32>,
    pub uptime_seconds: u64,
    pub memory: HashMap<String, u64>,
    pub metrics: Option<serde_json::Value>,
}
