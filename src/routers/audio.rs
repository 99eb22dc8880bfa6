//! Speech synthesis, sound generation and transcription.

use std::{io, sync::Arc};

use axum::{
    body::Body,
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use futures::StreamExt;
use grpc_client::proto;
use openai_protocol::{
    audio::{SoundGenerationRequest, SpeechRequest, TranscriptionResult, TranscriptionSegment},
    common::SamplingOverrides,
    validated::ValidatedJson,
};
use tracing::{debug, warn};

use super::{generated_path, resolve_model};
use crate::{
    config::model::ModelConfig,
    error::{GatewayError, GatewayResult},
    middleware::ModelOverride,
    server::AppContext,
};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

fn with_backend(mut config: ModelConfig, backend: Option<&String>) -> ModelConfig {
    config.overlay(&SamplingOverrides {
        backend: backend.cloned(),
        ..Default::default()
    });
    config
}

pub async fn speech(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<SpeechRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_speech(ctx, model_override, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_speech(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    request: SpeechRequest,
) -> GatewayResult<Response> {
    let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    let config = with_backend(config, request.backend.as_ref());
    let voice = request
        .voice
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| config.tts.voice.clone());
    let mut tts = proto::TtsRequest {
        text: request.input.clone(),
        model: config.model_file().to_string(),
        dst: String::new(),
        voice,
        language: request.language.clone().filter(|l| !l.is_empty()),
    };

    if request.stream {
        let audio = ctx.dispatcher.tts_stream(&config, tts).await?;
        let body = Body::from_stream(audio.map(|chunk| {
            chunk
                .map(Bytes::from)
                .map_err(|e| io::Error::other(e.to_string()))
        }));
        return Ok(([(header::CONTENT_TYPE, "audio/wav")], body).into_response());
    }

    let (dst, _) = generated_path(&ctx, "audio", "wav").await?;
    tts.dst = dst.to_string_lossy().into_owned();
    ctx.dispatcher.tts(&config, tts).await?;
    let bytes = tokio::fs::read(&dst).await?;
    debug!(model = %config.name, bytes = bytes.len(), "Speech generated");
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

pub async fn sound_generation(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    ValidatedJson(request): ValidatedJson<SoundGenerationRequest>,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_sound(ctx, model_override, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_sound(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    request: SoundGenerationRequest,
) -> GatewayResult<Response> {
    let config = resolve_model(&ctx, &request.model, model_override.as_ref())?;
    let config = with_backend(config, request.backend.as_ref());
    let (dst, _) = generated_path(&ctx, "audio", "wav").await?;
    let generate = proto::SoundGenerationRequest {
        text: request.text.clone(),
        model: config.model_file().to_string(),
        dst: dst.to_string_lossy().into_owned(),
        duration: request.duration,
        temperature: request.temperature,
        sample: request.do_sample,
        src: None,
        src_divisor: None,
    };
    ctx.dispatcher.sound_generation(&config, generate).await?;
    let bytes = tokio::fs::read(&dst).await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response())
}

#[derive(Debug, Default)]
struct TranscriptionForm {
    model: String,
    language: String,
    prompt: String,
    translate: bool,
    diarize: bool,
    response_format: String,
    file_name: String,
    file: Option<Bytes>,
}

async fn read_form(mut multipart: Multipart) -> GatewayResult<TranscriptionForm> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        GatewayError::validation(format!("invalid multipart body: {e}"))
    };
    let mut form = TranscriptionForm::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            form.file_name = field.file_name().unwrap_or("audio").to_string();
            form.file = Some(field.bytes().await.map_err(invalid)?);
            continue;
        }
        let value = field.text().await.map_err(invalid)?;
        match name.as_str() {
            "model" => form.model = value,
            "language" => form.language = value,
            "prompt" => form.prompt = value,
            "translate" => form.translate = value == "true",
            "diarize" => form.diarize = value == "true",
            "response_format" => form.response_format = value,
            _ => {}
        }
    }
    Ok(form)
}

pub async fn transcriptions(
    State(ctx): State<Arc<AppContext>>,
    model_override: Option<Extension<ModelOverride>>,
    multipart: Multipart,
) -> Response {
    let model_override = model_override.map(|Extension(m)| m);
    match handle_transcription(ctx, model_override, multipart).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_transcription(
    ctx: Arc<AppContext>,
    model_override: Option<ModelOverride>,
    multipart: Multipart,
) -> GatewayResult<Response> {
    let form = read_form(multipart).await?;
    let file = form
        .file
        .as_ref()
        .ok_or_else(|| GatewayError::validation("file is required"))?;
    let config = resolve_model(&ctx, &form.model, model_override.as_ref())?;

    let extension = form
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("wav");
    let (upload, _) = generated_path(&ctx, "uploads", extension).await?;
    tokio::fs::write(&upload, file).await?;

    let request = proto::TranscriptRequest {
        dst: upload.to_string_lossy().into_owned(),
        language: form.language.clone(),
        threads: config.threads.unwrap_or(4),
        translate: form.translate,
        diarize: form.diarize,
        prompt: form.prompt.clone(),
    };
    let result = ctx.dispatcher.transcribe(&config, request).await;
    if let Err(e) = tokio::fs::remove_file(&upload).await {
        warn!(path = %upload.display(), error = %e, "Failed to remove uploaded audio");
    }
    let transcript = to_transcription(result?);

    if form.response_format == "text" {
        return Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], transcript.text).into_response());
    }
    Ok(Json(transcript).into_response())
}

/// Backend segments carry nanosecond offsets; clients expect seconds.
fn to_transcription(result: proto::TranscriptResult) -> TranscriptionResult {
    TranscriptionResult {
        text: result.text,
        segments: result
            .segments
            .into_iter()
            .map(|s| TranscriptionSegment {
                id: s.id,
                start: s.start as f64 / NANOS_PER_SECOND,
                end: s.end as f64 / NANOS_PER_SECOND,
                text: s.text,
                tokens: s.tokens,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_times_in_seconds() {
        let result = to_transcription(proto::TranscriptResult {
            text: "hi".into(),
            segments: vec![proto::TranscriptSegment {
                id: 0,
                start: 500_000_000,
                end: 2_000_000_000,
                text: "hi".into(),
                tokens: vec![1],
                speaker: String::new(),
            }],
        });
        assert_eq!(result.segments[0].start, 0.5);
        assert_eq!(result.segments[0].end, 2.0);
    }
}
