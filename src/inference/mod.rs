//! Inference dispatch: resolved configs in, backend calls out.
//!
//! [`Dispatcher`] is stateless apart from the loader it borrows backends
//! from. Every call holds an [`InferenceGuard`] for its duration so the
//! backend is marked busy and, for backends that are not re-entrant,
//! requests take turns.

pub mod finetune;
pub mod options;
pub mod prompt;

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use grpc_client::{proto, BackendClient, ReplyStream};
use openai_protocol::common::{InputValue, Usage};
use tracing::debug;

use crate::{
    backend::{BackendLoader, InferenceGuard},
    config::model::ModelConfig,
    error::{BackendError, GatewayResult},
};

pub use prompt::{ChatInput, OutputParsing, ParsedOutput, PreparedPrompt, StreamDelta, StreamProcessor};

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub timing_prompt_processing: f64,
    pub timing_token_generation: f64,
}

impl TokenUsage {
    fn from_reply(reply: &proto::Reply) -> Self {
        Self {
            prompt_tokens: reply.prompt_tokens.max(0) as u32,
            completion_tokens: reply.tokens.max(0) as u32,
            timing_prompt_processing: reply.timing_prompt_processing,
            timing_token_generation: reply.timing_token_generation,
        }
    }

    /// Fold in one streamed chunk. Backends report either per-chunk or
    /// running counts, so the larger of the reported count and the number
    /// of chunks seen wins.
    fn observe_chunk(&mut self, reply: &proto::Reply, chunks: u32) {
        let reported = Self::from_reply(reply);
        self.prompt_tokens = self.prompt_tokens.max(reported.prompt_tokens);
        self.completion_tokens = reported.completion_tokens.max(chunks).max(self.completion_tokens);
        if reported.timing_prompt_processing > 0.0 {
            self.timing_prompt_processing = reported.timing_prompt_processing;
        }
        if reported.timing_token_generation > 0.0 {
            self.timing_token_generation = reported.timing_token_generation;
        }
    }

    pub fn to_usage(&self) -> Usage {
        let mut usage = Usage::new(self.prompt_tokens, self.completion_tokens);
        if self.timing_prompt_processing > 0.0 {
            usage.timing_prompt_processing = Some(self.timing_prompt_processing);
        }
        if self.timing_token_generation > 0.0 {
            usage.timing_token_generation = Some(self.timing_token_generation);
        }
        usage
    }
}

#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub text: String,
    pub usage: TokenUsage,
}

/// One streamed chunk with the usage seen so far.
#[derive(Debug, Clone, Default)]
pub struct Token {
    pub text: String,
    pub usage: TokenUsage,
}

/// Streamed prediction that keeps the backend busy until dropped.
///
/// Dropping it before the end cancels the backend call.
pub struct TokenStream {
    inner: ReplyStream,
    usage: TokenUsage,
    chunks: u32,
    _guard: InferenceGuard,
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("correlation_id", &self.inner.correlation_id())
            .field("usage", &self.usage)
            .finish()
    }
}

impl TokenStream {
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}

impl Stream for TokenStream {
    type Item = GatewayResult<Token>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(reply))) => {
                let this = &mut *self;
                this.chunks += 1;
                this.usage.observe_chunk(&reply, this.chunks);
                Poll::Ready(Some(Ok(Token {
                    text: String::from_utf8_lossy(&reply.message).into_owned(),
                    usage: this.usage,
                })))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    loader: Arc<BackendLoader>,
    models_path: PathBuf,
    trim_trailing_zero_embeddings: bool,
}

impl Dispatcher {
    pub fn new(loader: Arc<BackendLoader>, models_path: impl Into<PathBuf>, trim_trailing_zero_embeddings: bool) -> Self {
        Self {
            loader,
            models_path: models_path.into(),
            trim_trailing_zero_embeddings,
        }
    }

    pub fn loader(&self) -> &Arc<BackendLoader> {
        &self.loader
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    /// Base request for `config`, before prompt-specific fields are set.
    pub fn predict_options(&self, config: &ModelConfig) -> proto::PredictOptions {
        options::predict_options(config, &self.models_path)
    }

    pub fn model_options(&self, config: &ModelConfig) -> proto::ModelOptions {
        options::model_options(config, &self.models_path)
    }

    async fn acquire(&self, config: &ModelConfig) -> GatewayResult<InferenceGuard> {
        let instance = self.loader.get(config).await?;
        Ok(instance.acquire().await)
    }

    /// Run one call against the backend serving `config`.
    async fn call<T, F, Fut>(&self, config: &ModelConfig, f: F) -> GatewayResult<T>
    where
        F: FnOnce(BackendClient) -> Fut,
        Fut: Future<Output = grpc_client::Result<T>>,
    {
        let guard = self.acquire(config).await?;
        let result = f(guard.client().clone()).await?;
        Ok(result)
    }

    pub async fn predict(&self, config: &ModelConfig, options: proto::PredictOptions) -> GatewayResult<Prediction> {
        let reply = self.call(config, |c| async move { c.predict(options).await }).await?;
        Ok(Prediction {
            text: String::from_utf8_lossy(&reply.message).into_owned(),
            usage: TokenUsage::from_reply(&reply),
        })
    }

    pub async fn predict_stream(&self, config: &ModelConfig, options: proto::PredictOptions) -> GatewayResult<TokenStream> {
        let guard = self.acquire(config).await?;
        let inner = guard.client().predict_stream(options).await?;
        Ok(TokenStream {
            inner,
            usage: TokenUsage::default(),
            chunks: 0,
            _guard: guard,
        })
    }

    /// Stream a prediction through `callback`, which returns `false` to stop
    /// early. Returns the accumulated text and usage.
    pub async fn for_each_token<F>(
        &self,
        config: &ModelConfig,
        options: proto::PredictOptions,
        mut callback: F,
    ) -> GatewayResult<Prediction>
    where
        F: FnMut(&str, &TokenUsage) -> bool,
    {
        let mut stream = self.predict_stream(config, options).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            text.push_str(&token.text);
            if !callback(&token.text, &token.usage) {
                debug!(model = %config.name, "Token callback stopped the stream");
                break;
            }
        }
        Ok(Prediction {
            text,
            usage: stream.usage(),
        })
    }

    pub async fn embeddings(&self, config: &ModelConfig, input: &InputValue) -> GatewayResult<Vec<f32>> {
        let mut options = self.predict_options(config);
        match input {
            InputValue::Text(text) => options.embeddings = text.clone(),
            InputValue::Tokens(tokens) => options.embedding_tokens = tokens.clone(),
        }
        let mut embedding = self.call(config, |c| async move { c.embeddings(options).await }).await?;
        if config.trims_trailing_zero_embeddings(self.trim_trailing_zero_embeddings) {
            trim_trailing_zeros(&mut embedding);
        }
        Ok(embedding)
    }

    pub async fn generate_image(&self, config: &ModelConfig, request: proto::GenerateImageRequest) -> GatewayResult<()> {
        self.call(config, |c| async move { c.generate_image(request).await }).await?;
        Ok(())
    }

    pub async fn generate_video(&self, config: &ModelConfig, request: proto::GenerateVideoRequest) -> GatewayResult<()> {
        self.call(config, |c| async move { c.generate_video(request).await }).await?;
        Ok(())
    }

    pub async fn tts(&self, config: &ModelConfig, request: proto::TtsRequest) -> GatewayResult<()> {
        self.call(config, |c| async move { c.tts(request).await }).await?;
        Ok(())
    }

    /// Streamed speech; chunks carry audio bytes in `audio`.
    pub async fn tts_stream(
        &self,
        config: &ModelConfig,
        request: proto::TtsRequest,
    ) -> GatewayResult<impl Stream<Item = GatewayResult<Vec<u8>>> + Send + 'static> {
        let guard = self.acquire(config).await?;
        let stream = guard.client().tts_stream(request).await?;
        Ok(stream.map(move |reply| {
            let _busy = &guard;
            reply
                .map(|r| if r.audio.is_empty() { r.message } else { r.audio })
                .map_err(Into::into)
        }))
    }

    pub async fn sound_generation(&self, config: &ModelConfig, request: proto::SoundGenerationRequest) -> GatewayResult<()> {
        self.call(config, |c| async move { c.sound_generation(request).await }).await?;
        Ok(())
    }

    pub async fn transcribe(&self, config: &ModelConfig, request: proto::TranscriptRequest) -> GatewayResult<proto::TranscriptResult> {
        self.call(config, |c| async move { c.audio_transcription(request).await }).await
    }

    pub async fn rerank(&self, config: &ModelConfig, request: proto::RerankRequest) -> GatewayResult<proto::RerankResult> {
        self.call(config, |c| async move { c.rerank(request).await }).await
    }

    pub async fn tokenize(&self, config: &ModelConfig, text: &str) -> GatewayResult<Vec<i32>> {
        let mut options = self.predict_options(config);
        options.prompt = text.to_string();
        let response = self.call(config, |c| async move { c.tokenize(options).await }).await?;
        Ok(response.tokens)
    }

    pub async fn vad(&self, config: &ModelConfig, audio: Vec<f32>) -> GatewayResult<proto::VadResponse> {
        self.call(config, |c| async move { c.vad(proto::VadRequest { audio }).await }).await
    }

    pub async fn detect(&self, config: &ModelConfig, src: String) -> GatewayResult<proto::DetectResponse> {
        self.call(config, |c| async move { c.detect(proto::DetectOptions { src }).await }).await
    }

    /// Status of an already loaded backend; never triggers a load.
    pub async fn status(&self, model: &str) -> GatewayResult<proto::StatusResponse> {
        let instance = self
            .loader
            .lookup(model)
            .ok_or_else(|| BackendError::NotFound(format!("model {model} is not loaded")))?;
        Ok(instance.client().status().await?)
    }

    pub async fn metrics(&self, model: &str) -> GatewayResult<proto::MetricsResponse> {
        let instance = self
            .loader
            .lookup(model)
            .ok_or_else(|| BackendError::NotFound(format!("model {model} is not loaded")))?;
        Ok(instance.client().metrics().await?)
    }

    pub async fn model_metadata(&self, config: &ModelConfig) -> GatewayResult<proto::ModelMetadataResponse> {
        let options = self.model_options(config);
        self.call(config, |c| async move { c.model_metadata(options).await }).await
    }

    pub async fn stores_set(&self, config: &ModelConfig, options: proto::StoresSetOptions) -> GatewayResult<()> {
        self.call(config, |c| async move { c.stores_set(options).await }).await?;
        Ok(())
    }

    pub async fn stores_delete(&self, config: &ModelConfig, options: proto::StoresDeleteOptions) -> GatewayResult<()> {
        self.call(config, |c| async move { c.stores_delete(options).await }).await?;
        Ok(())
    }

    pub async fn stores_get(&self, config: &ModelConfig, options: proto::StoresGetOptions) -> GatewayResult<proto::StoresGetResult> {
        self.call(config, |c| async move { c.stores_get(options).await }).await
    }

    pub async fn stores_find(&self, config: &ModelConfig, options: proto::StoresFindOptions) -> GatewayResult<proto::StoresFindResult> {
        self.call(config, |c| async move { c.stores_find(options).await }).await
    }
}

/// Drop trailing `0.0` entries, keeping at least one element.
pub fn trim_trailing_zeros(embedding: &mut Vec<f32>) {
    while embedding.len() > 1 && embedding.last() == Some(&0.0) {
        embedding.pop();
    }
}
