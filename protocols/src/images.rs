use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validated::Normalizable;

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImageGenerationRequest {
    #[serde(default)]
    pub model: String,

    /// Prompt; `positive|negative` splits off a negative prompt
    #[validate(length(min = 1, message = "prompt cannot be empty"))]
    pub prompt: String,

    pub negative_prompt: Option<String>,

    #[validate(range(min = 1, max = 10))]
    pub n: Option<u32>,

    /// `WIDTHxHEIGHT`
    pub size: Option<String>,

    /// "url" (default) or "b64_json"
    pub response_format: Option<String>,

    pub seed: Option<i32>,

    /// Diffusion steps
    pub step: Option<i32>,

    pub mode: Option<i32>,

    /// Source image (URL or base64) for image-to-image
    pub file: Option<String>,

    pub backend: Option<String>,
}

impl Normalizable for ImageGenerationRequest {}

impl ImageGenerationRequest {
    /// Parse `size` into (width, height); defaults to 512x512.
    pub fn dimensions(&self) -> Result<(i32, i32), String> {
        let Some(size) = self.size.as_deref().filter(|s| !s.is_empty()) else {
            return Ok((512, 512));
        };
        let (w, h) = size
            .split_once('x')
            .ok_or_else(|| format!("invalid size '{size}', expected WIDTHxHEIGHT"))?;
        let width = w.trim().parse().map_err(|_| format!("invalid width in '{size}'"))?;
        let height = h.trim().parse().map_err(|_| format!("invalid height in '{size}'"))?;
        Ok((width, height))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    pub url: Option<String>,
    pub b64_json: Option<String>,
}

/// `/video` request
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VideoGenerationRequest {
    #[serde(default)]
    pub model: String,
    #[validate(length(min = 1, message = "prompt cannot be empty"))]
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub start_image: Option<String>,
    pub end_image: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub num_frames: Option<i32>,
    pub fps: Option<i32>,
    pub seed: Option<i32>,
    pub cfg_scale: Option<f32>,
    pub step: Option<i32>,
    pub response_format: Option<String>,
}

impl Normalizable for VideoGenerationRequest {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size() {
        let mut req: ImageGenerationRequest =
            serde_json::from_value(serde_json::json!({"prompt": "cat"})).unwrap();
        assert_eq!(req.dimensions().unwrap(), (512, 512));
        req.size = Some("256x128".into());
        assert_eq!(req.dimensions().unwrap(), (256, 128));
        req.size = Some("big".into());
        assert!(req.dimensions().is_err());
    }
}
