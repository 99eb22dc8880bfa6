//! Scriptable in-process backend for tests.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};

use crate::proto::{self, backend_server::Backend};

type ReplyStream = Pin<Box<dyn Stream<Item = Result<proto::Reply, Status>> + Send>>;

/// What the fake backend answers and what it observed.
#[derive(Clone, Default)]
pub struct FakeBackend {
    /// Chunks streamed by `PredictStream`; `Predict` returns them joined
    pub tokens: Vec<String>,
    pub prompt_tokens: i32,
    pub embeddings: Vec<f32>,
    /// Makes `LoadModel` fail with this message
    pub load_error: Option<String>,
    /// Pause between streamed chunks
    pub token_delay: Duration,
    /// Time `LoadModel` takes before answering
    pub load_delay: Duration,

    pub predictions: Arc<Mutex<Vec<proto::PredictOptions>>>,
    pub loads: Arc<Mutex<Vec<proto::ModelOptions>>>,
    pub load_count: Arc<AtomicUsize>,
    /// Set when a stream's receiver went away before all chunks were sent
    pub stream_cancelled: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn with_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            prompt_tokens: 3,
            ..Default::default()
        }
    }

    /// Serve on an ephemeral localhost port.
    pub async fn serve(self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let incoming = TcpListenerStream::new(listener);
        let handle = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(proto::backend_server::BackendServer::new(self))
                .serve_with_incoming(incoming)
                .await;
        });
        Ok((addr, handle))
    }

    fn reply(&self, text: &str) -> proto::Reply {
        proto::Reply {
            message: text.as_bytes().to_vec(),
            tokens: self.tokens.len() as i32,
            prompt_tokens: self.prompt_tokens,
            ..Default::default()
        }
    }

    fn stream_tokens(&self) -> ReplyStream {
        let (tx, rx) = mpsc::channel(1);
        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        let cancelled = self.stream_cancelled.clone();
        let prompt_tokens = self.prompt_tokens;
        tokio::spawn(async move {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let reply = proto::Reply {
                    message: token.into_bytes(),
                    tokens: 1,
                    prompt_tokens,
                    ..Default::default()
                };
                if tx.send(Ok(reply)).await.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

fn ok() -> proto::OpResult {
    proto::OpResult {
        message: String::new(),
        success: true,
    }
}

#[tonic::async_trait]
impl Backend for FakeBackend {
    type PredictStreamStream = ReplyStream;
    type TTSStreamStream = ReplyStream;

    async fn health(&self, _: Request<proto::HealthMessage>) -> Result<Response<proto::Reply>, Status> {
        Ok(Response::new(proto::Reply {
            message: b"OK".to_vec(),
            ..Default::default()
        }))
    }

    async fn load_model(
        &self,
        request: Request<proto::ModelOptions>,
    ) -> Result<Response<proto::OpResult>, Status> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.loads.lock().push(request.into_inner());
        Ok(Response::new(match &self.load_error {
            Some(message) => proto::OpResult {
                message: message.clone(),
                success: false,
            },
            None => ok(),
        }))
    }

    async fn predict(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<proto::Reply>, Status> {
        self.predictions.lock().push(request.into_inner());
        Ok(Response::new(self.reply(&self.tokens.concat())))
    }

    async fn predict_stream(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<Self::PredictStreamStream>, Status> {
        self.predictions.lock().push(request.into_inner());
        Ok(Response::new(self.stream_tokens()))
    }

    async fn embedding(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<proto::EmbeddingResult>, Status> {
        self.predictions.lock().push(request.into_inner());
        Ok(Response::new(proto::EmbeddingResult {
            embeddings: self.embeddings.clone(),
        }))
    }

    async fn generate_image(
        &self,
        _: Request<proto::GenerateImageRequest>,
    ) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn generate_video(
        &self,
        _: Request<proto::GenerateVideoRequest>,
    ) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn tts(&self, _: Request<proto::TtsRequest>) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn tts_stream(
        &self,
        _: Request<proto::TtsRequest>,
    ) -> Result<Response<Self::TTSStreamStream>, Status> {
        Ok(Response::new(self.stream_tokens()))
    }

    async fn sound_generation(
        &self,
        _: Request<proto::SoundGenerationRequest>,
    ) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn audio_transcription(
        &self,
        _: Request<proto::TranscriptRequest>,
    ) -> Result<Response<proto::TranscriptResult>, Status> {
        let text = self.tokens.concat();
        Ok(Response::new(proto::TranscriptResult {
            segments: vec![proto::TranscriptSegment {
                id: 0,
                start: 0,
                end: 1_000_000_000,
                text: text.clone(),
                ..Default::default()
            }],
            text,
        }))
    }

    async fn rerank(
        &self,
        request: Request<proto::RerankRequest>,
    ) -> Result<Response<proto::RerankResult>, Status> {
        let request = request.into_inner();
        let results = request
            .documents
            .iter()
            .enumerate()
            .map(|(i, doc)| proto::DocumentResult {
                index: i as i32,
                text: doc.clone(),
                relevance_score: 1.0 / (i as f32 + 1.0),
            })
            .collect();
        Ok(Response::new(proto::RerankResult {
            usage: Some(proto::Usage {
                total_tokens: 10,
                prompt_tokens: 10,
            }),
            results,
        }))
    }

    async fn tokenize_string(
        &self,
        request: Request<proto::PredictOptions>,
    ) -> Result<Response<proto::TokenizationResponse>, Status> {
        let tokens: Vec<i32> = request
            .into_inner()
            .prompt
            .split_whitespace()
            .enumerate()
            .map(|(i, _)| i as i32)
            .collect();
        Ok(Response::new(proto::TokenizationResponse {
            length: tokens.len() as i32,
            tokens,
        }))
    }

    async fn vad(&self, _: Request<proto::VadRequest>) -> Result<Response<proto::VadResponse>, Status> {
        Ok(Response::new(proto::VadResponse {
            segments: vec![proto::VadSegment { start: 0.0, end: 1.0 }],
        }))
    }

    async fn detect(
        &self,
        _: Request<proto::DetectOptions>,
    ) -> Result<Response<proto::DetectResponse>, Status> {
        Ok(Response::new(proto::DetectResponse::default()))
    }

    async fn status(
        &self,
        _: Request<proto::HealthMessage>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        Ok(Response::new(proto::StatusResponse {
            state: proto::status_response::State::Ready as i32,
            memory: None,
        }))
    }

    async fn get_metrics(
        &self,
        _: Request<proto::MetricsRequest>,
    ) -> Result<Response<proto::MetricsResponse>, Status> {
        Ok(Response::new(proto::MetricsResponse::default()))
    }

    async fn model_metadata(
        &self,
        _: Request<proto::ModelOptions>,
    ) -> Result<Response<proto::ModelMetadataResponse>, Status> {
        Ok(Response::new(proto::ModelMetadataResponse::default()))
    }

    async fn stores_set(
        &self,
        _: Request<proto::StoresSetOptions>,
    ) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn stores_delete(
        &self,
        _: Request<proto::StoresDeleteOptions>,
    ) -> Result<Response<proto::OpResult>, Status> {
        Ok(Response::new(ok()))
    }

    async fn stores_get(
        &self,
        _: Request<proto::StoresGetOptions>,
    ) -> Result<Response<proto::StoresGetResult>, Status> {
        Ok(Response::new(proto::StoresGetResult::default()))
    }

    async fn stores_find(
        &self,
        _: Request<proto::StoresFindOptions>,
    ) -> Result<Response<proto::StoresFindResult>, Status> {
        Ok(Response::new(proto::StoresFindResult::default()))
    }
}
