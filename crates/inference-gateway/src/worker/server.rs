//! Worker wire server.
//!
//! One route per capability under `/rpc/`. Every call goes through the
//! [`WorkerRuntime`], which applies the backend's locking policy. Failures
//! answer with a non-2xx status and a `{code, message}` body.

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, State},
    http::request::Parts,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{WorkerError, WorkerResult};
use crate::wire::{self, method, *};
use super::backend::Backend;
use super::context::{CallContext, CancelOnDrop};
use super::runtime::WorkerRuntime;

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let deadline = parts
            .headers
            .get(DEADLINE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok(match deadline {
            Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
            None => CallContext::background(),
        })
    }
}

fn parse<T>(body: Result<Json<T>, JsonRejection>) -> WorkerResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| WorkerError::invalid(e.body_text()))
}

type RuntimeState = State<Arc<WorkerRuntime>>;

/// Generates a unary handler: decode the request, call the runtime, encode
/// the reply. A dropped connection cancels the call's context.
macro_rules! unary {
    ($handler:ident, $req:ty, $call:ident) => {
        async fn $handler(
            State(rt): RuntimeState,
            ctx: CallContext,
            body: Result<Json<$req>, JsonRejection>,
        ) -> Result<Response, WorkerError> {
            let req = parse(body)?;
            let _cancel = CancelOnDrop(ctx.token().clone());
            let reply = rt.$call(&ctx, req).await?;
            Ok(Json(reply).into_response())
        }
    };
}

unary!(predict, PredictOptions, predict);
unary!(embedding, PredictOptions, embeddings);
unary!(generate_image, GenerateImageRequest, generate_image);
unary!(generate_video, GenerateVideoRequest, generate_video);
unary!(tts, TtsRequest, tts);
unary!(sound_generation, SoundGenerationRequest, sound_generation);
unary!(audio_transcription, TranscriptRequest, audio_transcription);
unary!(vad, VadRequest, vad);
unary!(detect, DetectOptions, detect);
unary!(tokenize_string, PredictOptions, tokenize_string);
unary!(rerank, RerankRequest, rerank);
unary!(stores_set, StoresSetOptions, stores_set);
unary!(stores_delete, StoresDeleteOptions, stores_delete);
unary!(stores_get, StoresGetOptions, stores_get);
unary!(stores_find, StoresFindOptions, stores_find);

async fn health(State(rt): RuntimeState) -> Json<Reply> {
    Json(Reply::from_text(rt.health()))
}

async fn load_model(
    State(rt): RuntimeState,
    body: Result<Json<ModelOptions>, JsonRejection>,
) -> Result<Json<WireResult>, WorkerError> {
    let opts = parse(body)?;
    Ok(Json(rt.load(opts).await?))
}

async fn status(State(rt): RuntimeState) -> Result<Json<StatusResponse>, WorkerError> {
    Ok(Json(rt.status().await?))
}

async fn get_token_metrics(State(rt): RuntimeState, ctx: CallContext) -> Result<Json<MetricsResponse>, WorkerError> {
    Ok(Json(rt.get_token_metrics(&ctx).await?))
}

async fn stores_reset(State(rt): RuntimeState, ctx: CallContext) -> Result<Json<WireResult>, WorkerError> {
    Ok(Json(rt.stores_reset(&ctx).await?))
}

/// Each token becomes a `data:` frame holding a [`Reply`]. A failure ends
/// the stream with an `event: error` frame holding a [`WireStatus`].
async fn predict_stream(
    State(rt): RuntimeState,
    ctx: CallContext,
    body: Result<Json<PredictOptions>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, WorkerError> {
    let opts = parse(body)?;
    let replies = rt.predict_stream(ctx, opts);

    let events = replies.map(|frame| {
        let event = match frame {
            Ok(reply) => Event::default().json_data(&reply),
            Err(e) => {
                debug!("Stream ended with {}: {}", e.code(), e);
                Event::default().event("error").json_data(e.to_status())
            }
        };
        Ok(event.unwrap_or_else(|_| Event::default().event("error").data("encoding failure")))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// The capability dispatch table.
pub fn router(runtime: Arc<WorkerRuntime>) -> Router {
    let rpc = |name: &str| method::path(name);
    Router::new()
        .route(&rpc(method::HEALTH), post(health))
        .route(&rpc(method::LOAD_MODEL), post(load_model))
        .route(&rpc(method::PREDICT), post(predict))
        .route(&rpc(method::PREDICT_STREAM), post(predict_stream))
        .route(&rpc(method::EMBEDDING), post(embedding))
        .route(&rpc(method::GENERATE_IMAGE), post(generate_image))
        .route(&rpc(method::GENERATE_VIDEO), post(generate_video))
        .route(&rpc(method::TTS), post(tts))
        .route(&rpc(method::SOUND_GENERATION), post(sound_generation))
        .route(&rpc(method::AUDIO_TRANSCRIPTION), post(audio_transcription))
        .route(&rpc(method::VAD), post(vad))
        .route(&rpc(method::DETECT), post(detect))
        .route(&rpc(method::TOKENIZE_STRING), post(tokenize_string))
        .route(&rpc(method::RERANK), post(rerank))
        .route(&rpc(method::GET_TOKEN_METRICS), post(get_token_metrics))
        .route(&rpc(method::STATUS), post(status))
        .route(&rpc(method::STORES_SET), post(stores_set))
        .route(&rpc(method::STORES_DELETE), post(stores_delete))
        .route(&rpc(method::STORES_GET), post(stores_get))
        .route(&rpc(method::STORES_FIND), post(stores_find))
        .route(&rpc(method::STORES_RESET), post(stores_reset))
        .layer(DefaultBodyLimit::max(wire::MAX_MESSAGE_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

/// Serves `backend` on an already bound listener until `shutdown` resolves.
pub async fn serve_listener<F>(
    listener: TcpListener,
    runtime: Arc<WorkerRuntime>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("🚀 {} worker listening on {}", runtime.backend_name(), addr);
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Worker on {} stopped", addr);
    Ok(())
}

/// Binds `address` and serves `backend` until Ctrl-C.
pub async fn serve(address: &str, backend: Arc<dyn Backend>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    let runtime = Arc::new(WorkerRuntime::new(backend));
    serve_listener(listener, runtime, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
