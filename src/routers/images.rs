//! Image and video generation, and serving of generated files.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::Engine as _;
use grpc_client::proto;
use openai_protocol::{
    common::SamplingOverrides,
    images::{ImageData, ImageGenerationRequest, ImageGenerationResponse, VideoGenerationRequest},
    validated::ValidatedJson,
};
use tracing::{debug, warn};

use super::{error::not_found, generated_path, resolve_model, unix_now};
use crate::{
    error::{GatewayError, GatewayResult},
    inference::prompt::load_media,
    middleware::ModelOverride,
    server::AppContext,
};

const DEFAULT_STEPS: i32 = 15;
const GENERATED_KINDS: &[&str] = &["images", "audio", "videos"];

pub async fn generate_images(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<ImageGenerationRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_images(ctx, model_override, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// `positive|negative` prompts split on the first bar.
fn split_prompt(prompt: &str) -> (String, String) {
    match prompt.split_once('|') {
        Some((pos, neg)) => (pos.to_string(), neg.to_string()),
        None => (prompt.to_string(), String::new()),
    }
}

fn wants_b64(response_format: Option<&str>) -> bool {
    response_format == Some("b64_json")
}

async fn handle_images(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    request: ImageGenerationRequest,
) -> GatewayResult<Response> {
    let mut config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    config.overlay(&SamplingOverrides {
        backend: request.backend.clone(),
        ..Default::default()
    });
    let (width, height) = request.dimensions().map_err(GatewayError::validation)?;
    let (positive, mut negative) = split_prompt(&request.prompt);
    if let Some(n) = request.negative_prompt.as_ref().filter(|n| !n.is_empty()) {
        negative = n.clone();
    }

    let src = match request.file.as_deref().filter(|f| !f.is_empty()) {
        Some(file) => Some(save_source_image(&ctx, file).await?),
        None => None,
    };

    let step = request
        .step
        .filter(|s| *s > 0)
        .or((config.step > 0).then_some(config.step))
        .unwrap_or(DEFAULT_STEPS);
    let seed = request.seed.or(config.parameters.seed).unwrap_or_default();

    let mut data = Vec::new();
    for _ in 0..request.n.unwrap_or(1).max(1) {
        let (dst, url) = generated_path(&ctx, "images", "png").await?;
        let generate = proto::GenerateImageRequest {
            height,
            width,
            mode: request.mode.unwrap_or_default(),
            step,
            seed,
            positive_prompt: positive.clone(),
            negative_prompt: negative.clone(),
            dst: dst.to_string_lossy().into_owned(),
            src: src.clone().unwrap_or_default(),
            enable_parameters: config.diffusers.enable_parameters.clone(),
            clip_skip: config.diffusers.clip_skip,
            ref_images: Vec::new(),
        };
        ctx.dispatcher.generate_image(&config, generate).await?;
        debug!(model = %config.name, dst = %dst.display(), "Image generated");

        if wants_b64(request.response_format.as_deref()) {
            let bytes = tokio::fs::read(&dst).await?;
            data.push(ImageData {
                url: None,
                b64_json: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            });
        } else {
            data.push(ImageData {
                url: Some(url),
                b64_json: None,
            });
        }
    }

    if let Some(src) = src {
        if let Err(e) = tokio::fs::remove_file(&src).await {
            warn!(path = %src, error = %e, "Failed to remove source image");
        }
    }

    Ok(Json(ImageGenerationResponse {
        created: unix_now(),
        data,
    })
    .into_response())
}

/// Decode a base64 or URL source image into a temporary upload.
async fn save_source_image(ctx: &AppContext, file: &str) -> GatewayResult<String> {
    let encoded = load_media(file).await?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| GatewayError::validation(format!("file is not valid base64: {e}")))?;
    let (path, _) = generated_path(ctx, "uploads", "png").await?;
    tokio::fs::write(&path, bytes).await?;
    Ok(path.to_string_lossy().into_owned())
}

pub async fn generate_video(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<VideoGenerationRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_video(ctx, model_override, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_video(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    request: VideoGenerationRequest,
) -> GatewayResult<Response> {
    let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    let (dst, url) = generated_path(&ctx, "videos", "mp4").await?;
    let generate = proto::GenerateVideoRequest {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone().unwrap_or_default(),
        start_image: request.start_image.clone().unwrap_or_default(),
        end_image: request.end_image.clone().unwrap_or_default(),
        width: request.width.unwrap_or(512),
        height: request.height.unwrap_or(512),
        num_frames: request.num_frames.unwrap_or_default(),
        fps: request.fps.unwrap_or_default(),
        seed: request.seed.or(config.parameters.seed).unwrap_or_default(),
        cfg_scale: request.cfg_scale.unwrap_or(config.cfg_scale),
        step: request.step.unwrap_or(config.step),
        dst: dst.to_string_lossy().into_owned(),
    };
    ctx.dispatcher.generate_video(&config, generate).await?;

    let item = if wants_b64(request.response_format.as_deref()) {
        let bytes = tokio::fs::read(&dst).await?;
        ImageData {
            url: None,
            b64_json: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    } else {
        ImageData {
            url: Some(url),
            b64_json: None,
        }
    };
    Ok(Json(ImageGenerationResponse {
        created: unix_now(),
        data: vec![item],
    })
    .into_response())
}

/// `GET /generated/{kind}/{file}`
pub async fn serve_generated(
    State(ctx): State<Arc<AppContext>>,
    Path((kind, file)): Path<(String, String)>,
) -> Response {
    if !GENERATED_KINDS.contains(&kind.as_str())
        || file.contains("..")
        || file.contains('/')
        || file.contains('\\')
    {
        return not_found("file_not_found", "File not found");
    }
    let path = ctx.config.generated_content_path.join(&kind).join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&file))],
            Body::from(bytes),
        )
            .into_response(),
        Err(_) => not_found("file_not_found", format!("File not found: {file}")),
    }
}

pub(crate) fn content_type(file: &str) -> &'static str {
    match file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_split_on_bar() {
        assert_eq!(split_prompt("a cat|blurry"), ("a cat".into(), "blurry".into()));
        assert_eq!(split_prompt("a cat"), ("a cat".into(), String::new()));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type("x.PNG"), "image/png");
        assert_eq!(content_type("x.wav"), "audio/wav");
        assert_eq!(content_type("x"), "application/octet-stream");
    }
}
