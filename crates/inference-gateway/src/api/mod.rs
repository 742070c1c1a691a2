//! OpenAI-compatible HTTP surface of the gateway.
//!
//! Each handler resolves a model, merges its config with the request,
//! obtains a worker through the model loader and projects the worker's reply
//! back into the OpenAI shape.

pub mod admin_api;
pub mod audio_api;
pub mod chat_api;
pub mod completion_api;
pub mod embeddings_api;
pub mod image_api;
pub mod responses_api;
pub mod schema;
pub mod worker_api;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::error::WorkerError;
use crate::model_config::ModelConfig;
use crate::model_loader::LoadedModel;
use crate::shared_state::AppState;
use crate::worker::CallContext;

pub use chat_api::{chat_completions, chat_completions_for_model};
pub use completion_api::completions;
pub use embeddings_api::embeddings;
pub use image_api::generate_image;
pub use responses_api::{responses_ws, ResponseStore};

use schema::SamplingParams;

/// An error rendered as `{"error": {message, type, code}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into(), code: Some("invalid_argument") }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into(), code: None }
    }

    pub fn body(&self) -> serde_json::Value {
        let kind = if self.status.is_client_error() { "invalid_request_error" } else { "server_error" };
        json!({
            "error": {
                "message": self.message,
                "type": kind,
                "code": self.code,
            }
        })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        Self { status: e.http_status(), message: e.to_string(), code: Some(e.code()) }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Picks the model for a request.
///
/// Order: path parameter, then body, then a bearer token naming an existing
/// model file (which overrides both). With `pick_first`, an unnamed request
/// falls back to the first available model.
pub fn resolve_model(
    state: &AppState,
    path_model: Option<&str>,
    body_model: &str,
    headers: &HeaderMap,
    pick_first: bool,
) -> ApiResult<String> {
    let mut model = path_model.filter(|m| !m.is_empty()).unwrap_or(body_model).to_string();

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| state.loader.exists_in_model_path(t));

    if let Some(token) = bearer {
        debug!("Using model from bearer token: {}", token);
        return Ok(token.to_string());
    }

    if model.is_empty() && pick_first {
        match state.loader.list_models().into_iter().next() {
            Some(first) => {
                debug!("No model specified, using: {}", first);
                model = first;
            }
            None => return Err(ApiError::bad_request("no model specified")),
        }
    }
    if model.is_empty() {
        return Err(ApiError::bad_request("no model specified"));
    }
    Ok(model)
}

/// The model's config with startup defaults and request overrides applied.
pub fn request_config(state: &AppState, model: &str, sampling: &SamplingParams) -> ModelConfig {
    let mut config = state.configs.resolve(model, &state.defaults());
    apply_sampling(&mut config, sampling);
    config
}

pub fn apply_sampling(config: &mut ModelConfig, sampling: &SamplingParams) {
    let p = &mut config.parameters;
    if let Some(t) = sampling.temperature {
        p.temperature = Some(t);
    }
    if let Some(v) = sampling.top_p.filter(|v| *v != 0.0) {
        p.top_p = Some(v);
    }
    if let Some(v) = sampling.top_k.filter(|v| *v != 0) {
        p.top_k = Some(v);
    }
    if let Some(v) = sampling.max_tokens.filter(|v| *v > 0) {
        p.max_tokens = Some(v);
    }
    if let Some(v) = sampling.seed {
        p.seed = Some(v);
    }
    if let Some(v) = sampling.frequency_penalty {
        p.frequency_penalty = v;
    }
    if let Some(v) = sampling.presence_penalty {
        p.presence_penalty = v;
    }
    if let Some(v) = sampling.repeat_penalty {
        p.repeat_penalty = v;
    }
    if let Some(v) = sampling.ignore_eos {
        p.ignore_eos = v;
    }
    config.stopwords.extend(sampling.stop_words());
    if !sampling.grammar.is_empty() {
        config.grammar = sampling.grammar.clone();
    }
}

pub async fn load_worker(state: &AppState, ctx: &CallContext, config: &ModelConfig) -> ApiResult<Arc<LoadedModel>> {
    Ok(state.loader.load(ctx, config).await?)
}

/// Whitespace token count, used when a worker reports no usage.
pub fn count_tokens(text: &str) -> i32 {
    text.split_whitespace().count() as i32
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// One JSON payload as an SSE `data:` frame.
pub fn sse_json<T: serde::Serialize>(value: &T) -> axum::response::sse::Event {
    use axum::response::sse::Event;
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => Event::default().data(ApiError::internal(e.to_string()).body().to_string()),
    }
}
