//! Capability interface and its network implementation.
//!
//! Callers hold an `Arc<dyn WorkerClient>` and never care whether the
//! worker lives in this process ([`EmbeddedClient`](super::EmbeddedClient))
//! or behind a socket ([`NetworkClient`]).

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};
use crate::wire::sse::{data_payload, event_name, SseLineBuffer};
use crate::wire::*;
use super::context::CallContext;
use super::runtime::ReplyStream;

/// Liveness deadline for `Health`.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait WorkerClient: Send + Sync {
    fn address(&self) -> &str;

    /// True while the worker is serving a call that would block this one.
    async fn is_busy(&self) -> bool;

    /// `Health` with a 10 second deadline. Any failure, timeouts included, is `false`.
    async fn health_check(&self, ctx: &CallContext) -> bool;

    async fn load_model(&self, ctx: &CallContext, opts: ModelOptions) -> WorkerResult<WireResult>;
    async fn predict(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply>;
    async fn predict_stream(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<ReplyStream>;
    async fn embeddings(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<EmbeddingResult>;
    async fn generate_image(&self, ctx: &CallContext, req: GenerateImageRequest) -> WorkerResult<WireResult>;
    async fn generate_video(&self, ctx: &CallContext, req: GenerateVideoRequest) -> WorkerResult<WireResult>;
    async fn tts(&self, ctx: &CallContext, req: TtsRequest) -> WorkerResult<WireResult>;
    async fn sound_generation(&self, ctx: &CallContext, req: SoundGenerationRequest) -> WorkerResult<WireResult>;
    async fn audio_transcription(&self, ctx: &CallContext, req: TranscriptRequest) -> WorkerResult<TranscriptResult>;
    async fn vad(&self, ctx: &CallContext, req: VadRequest) -> WorkerResult<VadResponse>;
    async fn detect(&self, ctx: &CallContext, req: DetectOptions) -> WorkerResult<DetectResponse>;
    async fn tokenize_string(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<TokenizationResponse>;
    async fn rerank(&self, ctx: &CallContext, req: RerankRequest) -> WorkerResult<RerankResult>;
    async fn get_token_metrics(&self, ctx: &CallContext) -> WorkerResult<MetricsResponse>;
    async fn status(&self, ctx: &CallContext) -> WorkerResult<StatusResponse>;
    async fn stores_set(&self, ctx: &CallContext, opts: StoresSetOptions) -> WorkerResult<WireResult>;
    async fn stores_delete(&self, ctx: &CallContext, opts: StoresDeleteOptions) -> WorkerResult<WireResult>;
    async fn stores_get(&self, ctx: &CallContext, opts: StoresGetOptions) -> WorkerResult<StoresGetResult>;
    async fn stores_find(&self, ctx: &CallContext, opts: StoresFindOptions) -> WorkerResult<StoresFindResult>;
    async fn stores_reset(&self, ctx: &CallContext) -> WorkerResult<WireResult>;
}

/// Counts calls this client has in flight.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Talks to a worker over HTTP/JSON.
pub struct NetworkClient {
    address: String,
    base_url: String,
    http: Client,
    in_flight: Arc<AtomicUsize>,
}

impl NetworkClient {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            address,
            base_url,
            http,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn request<Req: Serialize + ?Sized>(&self, ctx: &CallContext, name: &str, body: &Req) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(format!("{}{}", self.base_url, method::path(name)))
            .json(body);
        if let Some(remaining) = ctx.remaining() {
            builder = builder.header(DEADLINE_HEADER, remaining.as_millis().to_string());
        }
        builder
    }

    async fn call<Req, Resp>(&self, ctx: &CallContext, name: &str, body: &Req) -> WorkerResult<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let _flight = InFlight::enter(&self.in_flight);
        let builder = self.request(ctx, name, body);
        let exchange = async {
            let resp = builder.send().await?;
            decode(resp).await
        };
        tokio::select! {
            _ = ctx.done() => Err(WorkerError::Cancelled),
            result = exchange => result,
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> WorkerResult<T> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.bytes().await?;
        return serde_json::from_slice(&body)
            .map_err(|e| WorkerError::Transport(format!("malformed reply: {}", e)));
    }
    Err(error_from(resp).await)
}

async fn error_from(resp: reqwest::Response) -> WorkerError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<WireStatus>(&body) {
        Ok(wire) => WorkerError::from_status(wire),
        Err(_) => WorkerError::Transport(format!("worker returned {}: {}", status, body)),
    }
}

#[async_trait]
impl WorkerClient for NetworkClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_busy(&self) -> bool {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let ctx = CallContext::with_timeout(Duration::from_secs(2));
        matches!(
            self.status(&ctx).await,
            Ok(StatusResponse { state: WorkerState::Busy, .. })
        )
    }

    async fn health_check(&self, ctx: &CallContext) -> bool {
        let ctx = ctx.child_with_timeout(HEALTH_CHECK_TIMEOUT);
        match self.call::<_, Reply>(&ctx, method::HEALTH, &HealthMessage {}).await {
            Ok(reply) => reply.text() == HEALTH_OK,
            Err(e) => {
                debug!("Health check of {} failed: {}", self.address, e);
                false
            }
        }
    }

    async fn load_model(&self, ctx: &CallContext, opts: ModelOptions) -> WorkerResult<WireResult> {
        self.call(ctx, method::LOAD_MODEL, &opts).await
    }

    async fn predict(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply> {
        self.call(ctx, method::PREDICT, &opts).await
    }

    async fn predict_stream(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<ReplyStream> {
        let flight = InFlight::enter(&self.in_flight);
        let builder = self
            .request(ctx, method::PREDICT_STREAM, &opts)
            .header("Accept", "text/event-stream");

        let resp = tokio::select! {
            _ = ctx.done() => return Err(WorkerError::Cancelled),
            resp = builder.send() => resp?,
        };
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let ctx = ctx.clone();
        let mut body = resp.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let _flight = flight;
            let mut lines = SseLineBuffer::new();
            let mut event: Option<String> = None;
            let mut finished = false;

            while !finished {
                let next = tokio::select! {
                    biased;
                    _ = ctx.done() => None,
                    chunk = body.next() => Some(chunk),
                };
                let chunk = match next {
                    None => {
                        yield Err(WorkerError::Cancelled);
                        break;
                    }
                    Some(None) => break,
                    Some(Some(Err(e))) => {
                        yield Err(WorkerError::Transport(e.to_string()));
                        break;
                    }
                    Some(Some(Ok(chunk))) => chunk,
                };

                for line in lines.push(&chunk) {
                    if line.is_empty() {
                        event = None;
                        continue;
                    }
                    if let Some(name) = event_name(&line) {
                        event = Some(name.to_string());
                        continue;
                    }
                    let Some(data) = data_payload(&line) else { continue };
                    if event.as_deref() == Some("error") {
                        let err = serde_json::from_str::<WireStatus>(data)
                            .map(WorkerError::from_status)
                            .unwrap_or_else(|_| WorkerError::model(data.to_string()));
                        yield Err(err);
                        finished = true;
                        break;
                    }
                    match serde_json::from_str::<Reply>(data) {
                        Ok(reply) => yield Ok(reply),
                        Err(e) => {
                            yield Err(WorkerError::Transport(format!("malformed frame: {}", e)));
                            finished = true;
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn embeddings(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<EmbeddingResult> {
        self.call(ctx, method::EMBEDDING, &opts).await
    }

    async fn generate_image(&self, ctx: &CallContext, req: GenerateImageRequest) -> WorkerResult<WireResult> {
        self.call(ctx, method::GENERATE_IMAGE, &req).await
    }

    async fn generate_video(&self, ctx: &CallContext, req: GenerateVideoRequest) -> WorkerResult<WireResult> {
        self.call(ctx, method::GENERATE_VIDEO, &req).await
    }

    async fn tts(&self, ctx: &CallContext, req: TtsRequest) -> WorkerResult<WireResult> {
        self.call(ctx, method::TTS, &req).await
    }

    async fn sound_generation(&self, ctx: &CallContext, req: SoundGenerationRequest) -> WorkerResult<WireResult> {
        self.call(ctx, method::SOUND_GENERATION, &req).await
    }

    async fn audio_transcription(&self, ctx: &CallContext, req: TranscriptRequest) -> WorkerResult<TranscriptResult> {
        self.call(ctx, method::AUDIO_TRANSCRIPTION, &req).await
    }

    async fn vad(&self, ctx: &CallContext, req: VadRequest) -> WorkerResult<VadResponse> {
        self.call(ctx, method::VAD, &req).await
    }

    async fn detect(&self, ctx: &CallContext, req: DetectOptions) -> WorkerResult<DetectResponse> {
        self.call(ctx, method::DETECT, &req).await
    }

    async fn tokenize_string(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<TokenizationResponse> {
        self.call(ctx, method::TOKENIZE_STRING, &opts).await
    }

    async fn rerank(&self, ctx: &CallContext, req: RerankRequest) -> WorkerResult<RerankResult> {
        self.call(ctx, method::RERANK, &req).await
    }

    async fn get_token_metrics(&self, ctx: &CallContext) -> WorkerResult<MetricsResponse> {
        self.call(ctx, method::GET_TOKEN_METRICS, &HealthMessage {}).await
    }

    async fn status(&self, ctx: &CallContext) -> WorkerResult<StatusResponse> {
        self.call(ctx, method::STATUS, &HealthMessage {}).await
    }

    async fn stores_set(&self, ctx: &CallContext, opts: StoresSetOptions) -> WorkerResult<WireResult> {
        self.call(ctx, method::STORES_SET, &opts).await
    }

    async fn stores_delete(&self, ctx: &CallContext, opts: StoresDeleteOptions) -> WorkerResult<WireResult> {
        self.call(ctx, method::STORES_DELETE, &opts).await
    }

    async fn stores_get(&self, ctx: &CallContext, opts: StoresGetOptions) -> WorkerResult<StoresGetResult> {
        self.call(ctx, method::STORES_GET, &opts).await
    }

    async fn stores_find(&self, ctx: &CallContext, opts: StoresFindOptions) -> WorkerResult<StoresFindResult> {
        self.call(ctx, method::STORES_FIND, &opts).await
    }

    async fn stores_reset(&self, ctx: &CallContext) -> WorkerResult<WireResult> {
        self.call(ctx, method::STORES_RESET, &StoresResetOptions {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_predict_decodes_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/rpc/Predict")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"NA==","tokens":1,"prompt_tokens":3}"#)
            .create_async()
            .await;

        let client = NetworkClient::new(server.url());
        let reply = client
            .predict(&CallContext::background(), PredictOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.text(), "4");
        assert_eq!(reply.prompt_tokens, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_body_rebuilds_worker_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rpc/StoresFind")
            .with_status(501)
            .with_body(r#"{"code":"unimplemented","message":"unimplemented"}"#)
            .create_async()
            .await;

        let client = NetworkClient::new(server.url());
        let err = client
            .stores_find(&CallContext::background(), StoresFindOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::Unimplemented);
    }

    #[tokio::test]
    async fn test_stream_frames_and_terminal_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rpc/PredictStream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "data: {\"message\":\"SGVs\"}\n\n\
                 data: {\"message\":\"bG8=\"}\n\n\
                 event: error\ndata: {\"code\":\"model_error\",\"message\":\"oom\"}\n\n",
            )
            .create_async()
            .await;

        let client = NetworkClient::new(server.url());
        let stream = client
            .predict_stream(&CallContext::background(), PredictOptions::default())
            .await
            .unwrap();
        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().unwrap().text(), "Hel");
        assert_eq!(frames[1].as_ref().unwrap().text(), "lo");
        assert_eq!(frames[2], Err(WorkerError::model("oom")));
    }

    #[tokio::test]
    async fn test_health_check_false_when_unreachable() {
        // nothing listens on the discard port
        let client = NetworkClient::new("127.0.0.1:9");
        assert!(!client.health_check(&CallContext::background()).await);
    }

    #[tokio::test]
    async fn test_health_check_ok() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/rpc/Health")
            .with_status(200)
            .with_body(r#"{"message":"T0s="}"#)
            .create_async()
            .await;
        let client = NetworkClient::new(server.url());
        assert!(client.health_check(&CallContext::background()).await);
    }

    #[test]
    fn test_address_normalisation() {
        assert_eq!(NetworkClient::new("127.0.0.1:50051").base_url, "http://127.0.0.1:50051");
        assert_eq!(NetworkClient::new("http://host:1/").base_url, "http://host:1");
    }
}
