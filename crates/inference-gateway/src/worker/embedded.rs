//! In-process view of a worker.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::WorkerResult;
use crate::wire::*;
use super::client::WorkerClient;
use super::context::CallContext;
use super::runtime::{ReplyStream, WorkerRuntime};

/// Dispatches straight into a [`WorkerRuntime`] living in this process.
/// Locking and streaming behave exactly as they do behind the wire server.
pub struct EmbeddedClient {
    address: String,
    runtime: Arc<WorkerRuntime>,
}

impl EmbeddedClient {
    pub fn new(address: impl Into<String>, runtime: Arc<WorkerRuntime>) -> Self {
        Self {
            address: address.into(),
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }
}

#[async_trait]
impl WorkerClient for EmbeddedClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn is_busy(&self) -> bool {
        self.runtime.is_busy()
    }

    async fn health_check(&self, _ctx: &CallContext) -> bool {
        self.runtime.health() == HEALTH_OK
    }

    async fn load_model(&self, _ctx: &CallContext, opts: ModelOptions) -> WorkerResult<WireResult> {
        self.runtime.load(opts).await
    }

    async fn predict(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply> {
        self.runtime.predict(ctx, opts).await
    }

    async fn predict_stream(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<ReplyStream> {
        Ok(self.runtime.predict_stream(ctx.clone(), opts))
    }

    async fn embeddings(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<EmbeddingResult> {
        self.runtime.embeddings(ctx, opts).await
    }

    async fn generate_image(&self, ctx: &CallContext, req: GenerateImageRequest) -> WorkerResult<WireResult> {
        self.runtime.generate_image(ctx, req).await
    }

    async fn generate_video(&self, ctx: &CallContext, req: GenerateVideoRequest) -> WorkerResult<WireResult> {
        self.runtime.generate_video(ctx, req).await
    }

    async fn tts(&self, ctx: &CallContext, req: TtsRequest) -> WorkerResult<WireResult> {
        self.runtime.tts(ctx, req).await
    }

    async fn sound_generation(&self, ctx: &CallContext, req: SoundGenerationRequest) -> WorkerResult<WireResult> {
        self.runtime.sound_generation(ctx, req).await
    }

    async fn audio_transcription(&self, ctx: &CallContext, req: TranscriptRequest) -> WorkerResult<TranscriptResult> {
        self.runtime.audio_transcription(ctx, req).await
    }

    async fn vad(&self, ctx: &CallContext, req: VadRequest) -> WorkerResult<VadResponse> {
        self.runtime.vad(ctx, req).await
    }

    async fn detect(&self, ctx: &CallContext, req: DetectOptions) -> WorkerResult<DetectResponse> {
        self.runtime.detect(ctx, req).await
    }

    async fn tokenize_string(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<TokenizationResponse> {
        self.runtime.tokenize_string(ctx, opts).await
    }

    async fn rerank(&self, ctx: &CallContext, req: RerankRequest) -> WorkerResult<RerankResult> {
        self.runtime.rerank(ctx, req).await
    }

    async fn get_token_metrics(&self, ctx: &CallContext) -> WorkerResult<MetricsResponse> {
        self.runtime.get_token_metrics(ctx).await
    }

    async fn status(&self, _ctx: &CallContext) -> WorkerResult<StatusResponse> {
        self.runtime.status().await
    }

    async fn stores_set(&self, ctx: &CallContext, opts: StoresSetOptions) -> WorkerResult<WireResult> {
        self.runtime.stores_set(ctx, opts).await
    }

    async fn stores_delete(&self, ctx: &CallContext, opts: StoresDeleteOptions) -> WorkerResult<WireResult> {
        self.runtime.stores_delete(ctx, opts).await
    }

    async fn stores_get(&self, ctx: &CallContext, opts: StoresGetOptions) -> WorkerResult<StoresGetResult> {
        self.runtime.stores_get(ctx, opts).await
    }

    async fn stores_find(&self, ctx: &CallContext, opts: StoresFindOptions) -> WorkerResult<StoresFindResult> {
        self.runtime.stores_find(ctx, opts).await
    }

    async fn stores_reset(&self, ctx: &CallContext) -> WorkerResult<WireResult> {
        self.runtime.stores_reset(ctx).await
    }
}
