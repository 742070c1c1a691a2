//! The capability surface every worker implements.
//!
//! All capabilities default to [`WorkerError::Unimplemented`], so a concrete
//! backend overrides only what it supports.

use async_trait::async_trait;
use std::collections::BTreeMap;
use sysinfo::System;
use tokio::sync::mpsc;

use crate::error::{WorkerError, WorkerResult};
use crate::wire::*;
use super::context::CallContext;

/// Receives incremental tokens from `predict_stream`. Dropping it closes the
/// reply channel.
pub type TokenSender = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Every call, `load` included, runs under one mutex.
    SingleThread,
    /// Calls may overlap; the backend synchronises its own state.
    Reentrant,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::SingleThread
    }

    async fn load(&self, _opts: ModelOptions) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn predict(&self, _ctx: &CallContext, _opts: PredictOptions) -> WorkerResult<Reply> {
        Err(WorkerError::Unimplemented)
    }

    /// Pushes tokens into `tokens` in model order. Returning drops the
    /// sender, which closes the channel. A failed send means the consumer
    /// went away and the backend should stop.
    async fn predict_stream(
        &self,
        _ctx: &CallContext,
        _opts: PredictOptions,
        _tokens: TokenSender,
    ) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn embeddings(&self, _ctx: &CallContext, _opts: PredictOptions) -> WorkerResult<Vec<f32>> {
        Err(WorkerError::Unimplemented)
    }

    async fn generate_image(&self, _ctx: &CallContext, _req: GenerateImageRequest) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn generate_video(&self, _ctx: &CallContext, _req: GenerateVideoRequest) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn tts(&self, _ctx: &CallContext, _req: TtsRequest) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn sound_generation(
        &self,
        _ctx: &CallContext,
        _req: SoundGenerationRequest,
    ) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn audio_transcription(
        &self,
        _ctx: &CallContext,
        _req: TranscriptRequest,
    ) -> WorkerResult<TranscriptResult> {
        Err(WorkerError::Unimplemented)
    }

    async fn vad(&self, _ctx: &CallContext, _req: VadRequest) -> WorkerResult<VadResponse> {
        Err(WorkerError::Unimplemented)
    }

    async fn detect(&self, _ctx: &CallContext, _req: DetectOptions) -> WorkerResult<DetectResponse> {
        Err(WorkerError::Unimplemented)
    }

    async fn tokenize_string(
        &self,
        _ctx: &CallContext,
        _opts: PredictOptions,
    ) -> WorkerResult<TokenizationResponse> {
        Err(WorkerError::Unimplemented)
    }

    async fn rerank(&self, _ctx: &CallContext, _req: RerankRequest) -> WorkerResult<RerankResult> {
        Err(WorkerError::Unimplemented)
    }

    async fn get_token_metrics(&self) -> WorkerResult<MetricsResponse> {
        Err(WorkerError::Unimplemented)
    }

    async fn stores_set(&self, _opts: StoresSetOptions) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn stores_delete(&self, _opts: StoresDeleteOptions) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    async fn stores_get(&self, _opts: StoresGetOptions) -> WorkerResult<StoresGetResult> {
        Err(WorkerError::Unimplemented)
    }

    async fn stores_find(&self, _opts: StoresFindOptions) -> WorkerResult<StoresFindResult> {
        Err(WorkerError::Unimplemented)
    }

    async fn stores_reset(&self) -> WorkerResult<()> {
        Err(WorkerError::Unimplemented)
    }

    /// Backend-specific status. The runtime overrides `state` with what it
    /// tracks itself, so implementations mostly contribute `memory`.
    async fn status(&self) -> WorkerResult<StatusResponse> {
        Ok(StatusResponse {
            state: WorkerState::Ready,
            memory: memory_usage(),
        })
    }
}

/// Resident and virtual memory of the current process.
pub fn memory_usage() -> Option<MemoryUsageData> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    let process = sys.process(pid)?;

    let mut breakdown = BTreeMap::new();
    breakdown.insert("rss".to_string(), process.memory());
    breakdown.insert("vms".to_string(), process.virtual_memory());
    Some(MemoryUsageData {
        total: process.memory(),
        breakdown,
    })
}
