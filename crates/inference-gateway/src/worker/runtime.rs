//! Worker runtime
//!
//! Wraps a [`Backend`] and enforces its concurrency discipline. Both the
//! wire server and the embedded client call through this type, so the
//! locking policy holds no matter how a worker is reached.
//!
//! - `load` is exclusive against every other call.
//! - Single-thread backends additionally serialise every call on one mutex.
//! - Streaming runs the backend on its own task feeding a bounded channel.

use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::wire::*;
use super::backend::{Backend, ConcurrencyMode};
use super::context::{CallContext, CancelOnDrop};

/// Default depth of the token channel between a streaming backend and its consumer.
pub const DEFAULT_STREAM_QUEUE: usize = 64;

/// Stream of reply frames. Ends after the last token, or after one error item.
pub type ReplyStream = Pin<Box<dyn Stream<Item = WorkerResult<Reply>> + Send>>;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_ERROR: u8 = 2;

struct CallGuard {
    _gate: OwnedRwLockReadGuard<()>,
    _serial: Option<OwnedMutexGuard<()>>,
}

struct LoadGuard {
    _gate: OwnedRwLockWriteGuard<()>,
    _serial: Option<OwnedMutexGuard<()>>,
}

pub struct WorkerRuntime {
    backend: Arc<dyn Backend>,
    mode: ConcurrencyMode,
    /// Readers are capability calls, the writer is `load`.
    load_gate: Arc<RwLock<()>>,
    serial: Arc<Mutex<()>>,
    state: AtomicU8,
    stream_queue: usize,
}

impl WorkerRuntime {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_stream_queue(backend, DEFAULT_STREAM_QUEUE)
    }

    pub fn with_stream_queue(backend: Arc<dyn Backend>, stream_queue: usize) -> Self {
        let mode = backend.concurrency_mode();
        Self {
            backend,
            mode,
            load_gate: Arc::new(RwLock::new(())),
            serial: Arc::new(Mutex::new(())),
            state: AtomicU8::new(STATE_UNINITIALIZED),
            stream_queue: stream_queue.max(1),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn concurrency_mode(&self) -> ConcurrencyMode {
        self.mode
    }

    async fn enter(&self) -> CallGuard {
        let gate = self.load_gate.clone().read_owned().await;
        let serial = match self.mode {
            ConcurrencyMode::SingleThread => Some(self.serial.clone().lock_owned().await),
            ConcurrencyMode::Reentrant => None,
        };
        CallGuard { _gate: gate, _serial: serial }
    }

    async fn enter_exclusive(&self) -> LoadGuard {
        let gate = self.load_gate.clone().write_owned().await;
        let serial = match self.mode {
            ConcurrencyMode::SingleThread => Some(self.serial.clone().lock_owned().await),
            ConcurrencyMode::Reentrant => None,
        };
        LoadGuard { _gate: gate, _serial: serial }
    }

    /// Runs `fut` under the call guard, giving up when `ctx` is done.
    async fn guarded<T, F>(&self, ctx: &CallContext, fut: F) -> WorkerResult<T>
    where
        F: Future<Output = WorkerResult<T>>,
    {
        tokio::select! {
            _ = ctx.done() => Err(WorkerError::Cancelled),
            result = async {
                let _guard = self.enter().await;
                fut.await
            } => result,
        }
    }

    /// Non-blocking: true while a single-thread worker is inside a call, or
    /// while any worker is loading.
    pub fn is_busy(&self) -> bool {
        if self.load_gate.try_read().is_err() {
            return true;
        }
        match self.mode {
            ConcurrencyMode::SingleThread => self.serial.try_lock().is_err(),
            ConcurrencyMode::Reentrant => false,
        }
    }

    pub fn health(&self) -> &'static str {
        HEALTH_OK
    }

    pub async fn load(&self, opts: ModelOptions) -> WorkerResult<WireResult> {
        let model = opts.model.clone();
        let _guard = self.enter_exclusive().await;
        info!("Loading model '{}' into {} backend", model, self.backend.name());

        match self.backend.load(opts).await {
            Ok(()) => {
                self.state.store(STATE_READY, Ordering::SeqCst);
                info!("✅ Model '{}' loaded", model);
                Ok(WireResult::ok("Loading succeeded"))
            }
            Err(e) => {
                self.state.store(STATE_ERROR, Ordering::SeqCst);
                error!("Failed to load model '{}': {}", model, e);
                Err(match e {
                    WorkerError::Unimplemented | WorkerError::InvalidArgument(_) => e,
                    WorkerError::LoadFailed(msg) => {
                        WorkerError::LoadFailed(format!("Error loading model: {}", msg))
                    }
                    other => WorkerError::LoadFailed(format!("Error loading model: {}", other)),
                })
            }
        }
    }

    pub async fn status(&self) -> WorkerResult<StatusResponse> {
        let busy = self.is_busy();
        // status must answer even while a call holds the lock
        let mut status = self.backend.status().await?;
        status.state = match self.state.load(Ordering::SeqCst) {
            STATE_UNINITIALIZED => WorkerState::Uninitialized,
            STATE_ERROR => WorkerState::Error,
            _ if busy => WorkerState::Busy,
            _ => WorkerState::Ready,
        };
        Ok(status)
    }

    pub async fn predict(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply> {
        self.guarded(ctx, self.backend.predict(ctx, opts)).await
    }

    /// Starts a streaming prediction.
    ///
    /// The backend runs on its own task and pushes tokens into a bounded
    /// channel; the returned stream forwards them as frames. Dropping the
    /// stream, or cancelling `ctx`, cancels the producer and no further
    /// frame is yielded.
    pub fn predict_stream(self: &Arc<Self>, ctx: CallContext, opts: PredictOptions) -> ReplyStream {
        let (tx, mut rx) = mpsc::channel::<String>(self.stream_queue);
        let runtime = Arc::clone(self);
        let producer_ctx = ctx.clone();

        let producer = tokio::spawn(async move {
            let _guard = runtime.enter().await;
            if producer_ctx.is_done() {
                return Err(WorkerError::Cancelled);
            }
            runtime.backend.predict_stream(&producer_ctx, opts, tx).await
        });

        Box::pin(async_stream::stream! {
            let _cancel_on_drop = CancelOnDrop(ctx.token().clone());
            let mut cancelled = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.done() => None,
                    token = rx.recv() => Some(token),
                };
                match next {
                    None => {
                        cancelled = true;
                        break;
                    }
                    Some(Some(token)) => yield Ok(Reply::from_text(token)),
                    Some(None) => break,
                }
            }

            // drain so a producer blocked on a full channel can observe the close
            rx.close();
            while rx.try_recv().is_ok() {}

            if cancelled {
                debug!("Stream cancelled by caller");
                producer.abort();
                yield Err(WorkerError::Cancelled);
            } else {
                match producer.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Streaming prediction failed: {}", e);
                        yield Err(e);
                    }
                    Err(join) => yield Err(WorkerError::model(format!("stream task failed: {}", join))),
                }
            }
        })
    }

    pub async fn embeddings(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<EmbeddingResult> {
        let embeddings = self.guarded(ctx, self.backend.embeddings(ctx, opts)).await?;
        Ok(EmbeddingResult { embeddings })
    }

    pub async fn generate_image(&self, ctx: &CallContext, req: GenerateImageRequest) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.generate_image(ctx, req)).await?;
        Ok(WireResult::ok("Image generated"))
    }

    pub async fn generate_video(&self, ctx: &CallContext, req: GenerateVideoRequest) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.generate_video(ctx, req)).await?;
        Ok(WireResult::ok("Video generated"))
    }

    pub async fn tts(&self, ctx: &CallContext, req: TtsRequest) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.tts(ctx, req)).await?;
        Ok(WireResult::ok("TTS audio generated"))
    }

    pub async fn sound_generation(&self, ctx: &CallContext, req: SoundGenerationRequest) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.sound_generation(ctx, req)).await?;
        Ok(WireResult::ok("Sound generated"))
    }

    pub async fn audio_transcription(&self, ctx: &CallContext, req: TranscriptRequest) -> WorkerResult<TranscriptResult> {
        self.guarded(ctx, self.backend.audio_transcription(ctx, req)).await
    }

    pub async fn vad(&self, ctx: &CallContext, req: VadRequest) -> WorkerResult<VadResponse> {
        self.guarded(ctx, self.backend.vad(ctx, req)).await
    }

    pub async fn detect(&self, ctx: &CallContext, req: DetectOptions) -> WorkerResult<DetectResponse> {
        self.guarded(ctx, self.backend.detect(ctx, req)).await
    }

    pub async fn tokenize_string(&self, ctx: &CallContext, opts: PredictOptions) -> WorkerResult<TokenizationResponse> {
        self.guarded(ctx, self.backend.tokenize_string(ctx, opts)).await
    }

    pub async fn rerank(&self, ctx: &CallContext, req: RerankRequest) -> WorkerResult<RerankResult> {
        self.guarded(ctx, self.backend.rerank(ctx, req)).await
    }

    pub async fn get_token_metrics(&self, ctx: &CallContext) -> WorkerResult<MetricsResponse> {
        self.guarded(ctx, self.backend.get_token_metrics()).await
    }

    pub async fn stores_set(&self, ctx: &CallContext, opts: StoresSetOptions) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.stores_set(opts)).await?;
        Ok(WireResult::ok("Stored"))
    }

    pub async fn stores_delete(&self, ctx: &CallContext, opts: StoresDeleteOptions) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.stores_delete(opts)).await?;
        Ok(WireResult::ok("Deleted"))
    }

    pub async fn stores_get(&self, ctx: &CallContext, opts: StoresGetOptions) -> WorkerResult<StoresGetResult> {
        self.guarded(ctx, self.backend.stores_get(opts)).await
    }

    pub async fn stores_find(&self, ctx: &CallContext, opts: StoresFindOptions) -> WorkerResult<StoresFindResult> {
        self.guarded(ctx, self.backend.stores_find(opts)).await
    }

    pub async fn stores_reset(&self, ctx: &CallContext) -> WorkerResult<WireResult> {
        self.guarded(ctx, self.backend.stores_reset()).await?;
        Ok(WireResult::ok("Reset"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::backend::TokenSender;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Emits numbered tokens with a small pause between them.
    struct Counter {
        mode: ConcurrencyMode,
        tokens: usize,
        pause: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        emitted: AtomicUsize,
    }

    impl Counter {
        fn new(mode: ConcurrencyMode, tokens: usize, pause: Duration) -> Self {
            Self {
                mode,
                tokens,
                pause,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                emitted: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn concurrency_mode(&self) -> ConcurrencyMode {
            self.mode
        }

        async fn load(&self, opts: ModelOptions) -> WorkerResult<()> {
            if opts.model.is_empty() {
                return Err(WorkerError::LoadFailed("no model".into()));
            }
            Ok(())
        }

        async fn predict(&self, _ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.pause).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Reply::from_text(opts.prompt))
        }

        async fn predict_stream(
            &self,
            ctx: &CallContext,
            _opts: PredictOptions,
            tokens: TokenSender,
        ) -> WorkerResult<()> {
            for i in 0..self.tokens {
                if ctx.is_done() {
                    return Err(WorkerError::Cancelled);
                }
                if tokens.send(i.to_string()).await.is_err() {
                    return Ok(());
                }
                self.emitted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.pause).await;
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Backend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn predict_stream(
            &self,
            _ctx: &CallContext,
            _opts: PredictOptions,
            tokens: TokenSender,
        ) -> WorkerResult<()> {
            let _ = tokens.send("partial".into()).await;
            Err(WorkerError::model("out of memory"))
        }
    }

    #[tokio::test]
    async fn test_load_tracks_state() {
        let runtime = WorkerRuntime::new(Arc::new(Counter::new(
            ConcurrencyMode::SingleThread,
            0,
            Duration::ZERO,
        )));
        assert_eq!(runtime.status().await.unwrap().state, WorkerState::Uninitialized);

        let result = runtime.load(ModelOptions { model: "m".into(), ..Default::default() }).await;
        assert_eq!(result.unwrap().message, "Loading succeeded");
        assert_eq!(runtime.status().await.unwrap().state, WorkerState::Ready);

        let err = runtime.load(ModelOptions::default()).await.unwrap_err();
        assert_eq!(err, WorkerError::LoadFailed("Error loading model: no model".into()));
        assert_eq!(runtime.status().await.unwrap().state, WorkerState::Error);
    }

    #[tokio::test]
    async fn test_single_thread_serialises_calls() {
        let backend = Arc::new(Counter::new(
            ConcurrencyMode::SingleThread,
            0,
            Duration::from_millis(20),
        ));
        let runtime = Arc::new(WorkerRuntime::new(backend.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                runtime
                    .predict(&CallContext::background(), PredictOptions::default())
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reentrant_calls_overlap() {
        let backend = Arc::new(Counter::new(
            ConcurrencyMode::Reentrant,
            0,
            Duration::from_millis(50),
        ));
        let runtime = Arc::new(WorkerRuntime::new(backend.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let runtime = runtime.clone();
            handles.push(tokio::spawn(async move {
                runtime
                    .predict(&CallContext::background(), PredictOptions::default())
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(backend.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_busy_while_single_thread_call_runs() {
        let runtime = Arc::new(WorkerRuntime::new(Arc::new(Counter::new(
            ConcurrencyMode::SingleThread,
            0,
            Duration::from_millis(100),
        ))));
        runtime
            .load(ModelOptions { model: "m".into(), ..Default::default() })
            .await
            .unwrap();
        assert!(!runtime.is_busy());

        let call = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .predict(&CallContext::background(), PredictOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(runtime.is_busy());
        assert_eq!(runtime.status().await.unwrap().state, WorkerState::Busy);

        call.await.unwrap().unwrap();
        assert!(!runtime.is_busy());
    }

    #[tokio::test]
    async fn test_stream_delivers_tokens_in_order() {
        let runtime = Arc::new(WorkerRuntime::new(Arc::new(Counter::new(
            ConcurrencyMode::Reentrant,
            5,
            Duration::ZERO,
        ))));
        let frames: Vec<_> = runtime
            .predict_stream(CallContext::background(), PredictOptions::default())
            .collect()
            .await;
        let texts: Vec<String> = frames.into_iter().map(|f| f.unwrap().text()).collect();
        assert_eq!(texts, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_stream_error_after_partial_output() {
        let runtime = Arc::new(WorkerRuntime::new(Arc::new(Failing)));
        let frames: Vec<_> = runtime
            .predict_stream(CallContext::background(), PredictOptions::default())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().text(), "partial");
        assert_eq!(frames[1], Err(WorkerError::model("out of memory")));
    }

    #[tokio::test]
    async fn test_cancelled_stream_stops_promptly() {
        let backend = Arc::new(Counter::new(
            ConcurrencyMode::Reentrant,
            10_000,
            Duration::from_millis(5),
        ));
        let runtime = Arc::new(WorkerRuntime::with_stream_queue(backend.clone(), 1));
        let ctx = CallContext::background();
        let mut stream = runtime.predict_stream(ctx.clone(), PredictOptions::default());

        let mut received = 0;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(_) => {
                    received += 1;
                    if received == 3 {
                        ctx.cancel();
                    }
                }
                Err(e) => {
                    assert_eq!(e, WorkerError::Cancelled);
                    break;
                }
            }
        }
        assert_eq!(received, 3);
        assert!(stream.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let emitted = backend.emitted.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // producer stopped: nothing further is emitted
        assert_eq!(backend.emitted.load(Ordering::SeqCst), emitted);
        // bounded queue of 1 plus the token in flight
        assert!(emitted <= received + 2);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        let backend = Arc::new(Counter::new(
            ConcurrencyMode::Reentrant,
            10_000,
            Duration::from_millis(5),
        ));
        let runtime = Arc::new(WorkerRuntime::with_stream_queue(backend.clone(), 1));
        let ctx = CallContext::background();
        {
            let mut stream = runtime.predict_stream(ctx.clone(), PredictOptions::default());
            stream.next().await.unwrap().unwrap();
        }
        assert!(ctx.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_unary_call_honours_deadline() {
        let runtime = WorkerRuntime::new(Arc::new(Counter::new(
            ConcurrencyMode::Reentrant,
            0,
            Duration::from_secs(5),
        )));
        let ctx = CallContext::with_timeout(Duration::from_millis(20));
        let result = runtime.predict(&ctx, PredictOptions::default()).await;
        assert_eq!(result, Err(WorkerError::Cancelled));
    }
}
