use std::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use tonic::{
    transport::{Channel, Endpoint},
    Request, Streaming,
};
use tracing::debug;

use crate::error::{ClientError, Result};

pub mod proto {
    #![allow(clippy::all, unused_qualifications)]
    tonic::include_proto!("backend");
}

/// Server stream of `Reply` chunks that cancels the RPC when dropped
/// before the backend finished.
///
/// Dropping the underlying HTTP/2 stream resets it, which the backend sees
/// as a cancelled call and uses to stop generating.
pub struct ReplyStream {
    inner: Streaming<proto::Reply>,
    label: &'static str,
    correlation_id: String,
    completed: AtomicBool,
}

pub type PredictStream = ReplyStream;
pub type TtsStream = ReplyStream;

impl ReplyStream {
    fn new(inner: Streaming<proto::Reply>, label: &'static str, correlation_id: String) -> Self {
        debug!(rpc = label, %correlation_id, "Opened backend stream");
        Self {
            inner,
            label,
            correlation_id,
            completed: AtomicBool::new(false),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if !self.completed.load(Ordering::Acquire) {
            debug!(
                rpc = self.label,
                correlation_id = %self.correlation_id,
                "Backend stream dropped before completion, cancelling call"
            );
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<proto::Reply>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                self.completed.store(true, Ordering::Release);
                Poll::Ready(None)
            }
            Poll::Ready(Some(item)) => Poll::Ready(Some(item.map_err(ClientError::from))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn ensure_success(result: proto::OpResult) -> Result<proto::OpResult> {
    if result.success {
        Ok(result)
    } else {
        Err(ClientError::Failed(result.message))
    }
}

/// Typed client for one backend process.
///
/// Cloning is cheap; clones share the underlying channel.
#[derive(Clone, Debug)]
pub struct BackendClient {
    address: String,
    client: proto::backend_client::BackendClient<Channel>,
}

impl BackendClient {
    fn endpoint(address: &str) -> Result<Endpoint> {
        // Accept bare host:port as well as explicit URIs
        let uri = if address.contains("://") {
            address.replacen("grpc://", "http://", 1)
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri).map_err(|e| ClientError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(endpoint
            .connect_timeout(Duration::from_secs(5))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .tcp_nodelay(true))
    }

    /// Connect eagerly, failing if the backend is not listening.
    pub async fn connect(address: &str) -> Result<Self> {
        debug!(%address, "Connecting to backend");
        let channel = Self::endpoint(address)?
            .connect()
            .await
            .map_err(|e| ClientError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_channel(address, channel))
    }

    /// Build a client whose connection is established on first use.
    pub fn connect_lazy(address: &str) -> Result<Self> {
        let channel = Self::endpoint(address)?.connect_lazy();
        Ok(Self::from_channel(address, channel))
    }

    fn from_channel(address: &str, channel: Channel) -> Self {
        Self {
            address: address.to_string(),
            client: proto::backend_client::BackendClient::new(channel)
                .max_decoding_message_size(64 * 1024 * 1024)
                .max_encoding_message_size(64 * 1024 * 1024),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Health probe bounded by `timeout`.
    pub async fn health(&self, timeout: Duration) -> Result<bool> {
        let mut request = Request::new(proto::HealthMessage {});
        request.set_timeout(timeout);
        let mut client = self.client.clone();
        let reply = client.health(request).await?.into_inner();
        Ok(reply.message == b"OK")
    }

    pub async fn load_model(&self, options: proto::ModelOptions) -> Result<proto::OpResult> {
        debug!(address = %self.address, model = %options.model, "Sending LoadModel");
        let mut client = self.client.clone();
        let result = client.load_model(Request::new(options)).await?.into_inner();
        ensure_success(result)
    }

    pub async fn predict(&self, options: proto::PredictOptions) -> Result<proto::Reply> {
        let mut client = self.client.clone();
        Ok(client.predict(Request::new(options)).await?.into_inner())
    }

    /// Start a streaming prediction. The returned stream cancels the call
    /// when dropped.
    pub async fn predict_stream(&self, options: proto::PredictOptions) -> Result<PredictStream> {
        let correlation_id = options.correlation_id.clone();
        let mut client = self.client.clone();
        let stream = client.predict_stream(Request::new(options)).await?.into_inner();
        Ok(ReplyStream::new(stream, "PredictStream", correlation_id))
    }

    pub async fn embeddings(&self, options: proto::PredictOptions) -> Result<Vec<f32>> {
        let mut client = self.client.clone();
        Ok(client
            .embedding(Request::new(options))
            .await?
            .into_inner()
            .embeddings)
    }

    pub async fn generate_image(&self, request: proto::GenerateImageRequest) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.generate_image(Request::new(request)).await?.into_inner())
    }

    pub async fn generate_video(&self, request: proto::GenerateVideoRequest) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.generate_video(Request::new(request)).await?.into_inner())
    }

    pub async fn tts(&self, request: proto::TtsRequest) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.tts(Request::new(request)).await?.into_inner())
    }

    pub async fn tts_stream(&self, request: proto::TtsRequest) -> Result<TtsStream> {
        let mut client = self.client.clone();
        let stream = client.tts_stream(Request::new(request)).await?.into_inner();
        Ok(ReplyStream::new(stream, "TTSStream", String::new()))
    }

    pub async fn sound_generation(
        &self,
        request: proto::SoundGenerationRequest,
    ) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.sound_generation(Request::new(request)).await?.into_inner())
    }

    pub async fn audio_transcription(
        &self,
        request: proto::TranscriptRequest,
    ) -> Result<proto::TranscriptResult> {
        let mut client = self.client.clone();
        Ok(client
            .audio_transcription(Request::new(request))
            .await?
            .into_inner())
    }

    pub async fn rerank(&self, request: proto::RerankRequest) -> Result<proto::RerankResult> {
        let mut client = self.client.clone();
        Ok(client.rerank(Request::new(request)).await?.into_inner())
    }

    pub async fn tokenize(
        &self,
        options: proto::PredictOptions,
    ) -> Result<proto::TokenizationResponse> {
        let mut client = self.client.clone();
        Ok(client.tokenize_string(Request::new(options)).await?.into_inner())
    }

    pub async fn vad(&self, request: proto::VadRequest) -> Result<proto::VadResponse> {
        let mut client = self.client.clone();
        Ok(client.vad(Request::new(request)).await?.into_inner())
    }

    pub async fn detect(&self, options: proto::DetectOptions) -> Result<proto::DetectResponse> {
        let mut client = self.client.clone();
        Ok(client.detect(Request::new(options)).await?.into_inner())
    }

    pub async fn status(&self) -> Result<proto::StatusResponse> {
        let mut client = self.client.clone();
        Ok(client
            .status(Request::new(proto::HealthMessage {}))
            .await?
            .into_inner())
    }

    pub async fn metrics(&self) -> Result<proto::MetricsResponse> {
        let mut client = self.client.clone();
        Ok(client
            .get_metrics(Request::new(proto::MetricsRequest {}))
            .await?
            .into_inner())
    }

    pub async fn model_metadata(
        &self,
        options: proto::ModelOptions,
    ) -> Result<proto::ModelMetadataResponse> {
        let mut client = self.client.clone();
        Ok(client.model_metadata(Request::new(options)).await?.into_inner())
    }

    pub async fn stores_set(&self, options: proto::StoresSetOptions) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.stores_set(Request::new(options)).await?.into_inner())
    }

    pub async fn stores_delete(
        &self,
        options: proto::StoresDeleteOptions,
    ) -> Result<proto::OpResult> {
        let mut client = self.client.clone();
        ensure_success(client.stores_delete(Request::new(options)).await?.into_inner())
    }

    pub async fn stores_get(&self, options: proto::StoresGetOptions) -> Result<proto::StoresGetResult> {
        let mut client = self.client.clone();
        Ok(client.stores_get(Request::new(options)).await?.into_inner())
    }

    pub async fn stores_find(
        &self,
        options: proto::StoresFindOptions,
    ) -> Result<proto::StoresFindResult> {
        let mut client = self.client.clone();
        Ok(client.stores_find(Request::new(options)).await?.into_inner())
    }
}
