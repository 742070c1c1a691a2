//! Health, model listing and backend administration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::info;

use super::schema::{ModelEntry, ModelList, ModelSelector};
use super::{ApiError, ApiResult};
use crate::shared_state::AppState;
use crate::wire::StatusResponse;

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub loaded_models: Vec<String>,
    pub total_requests: usize,
}

/// `GET /healthz` and `GET /readyz`
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        loaded_models: state.loader.loaded_models(),
        total_requests: state.counters.total_requests.load(std::sync::atomic::Ordering::Relaxed),
    })
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let data = state
        .loader
        .list_models()
        .into_iter()
        .map(|id| ModelEntry { id, object: "model".to_string() })
        .collect();
    Json(ModelList { object: "list".to_string(), data })
}

/// `POST /backend/monitor`: status of a loaded worker.
pub async fn backend_monitor(State(state): State<AppState>, Json(req): Json<ModelSelector>) -> ApiResult<Json<StatusResponse>> {
    if req.model.is_empty() {
        return Err(ApiError::bad_request("model is required"));
    }
    let ctx = state.request_context();
    Ok(Json(state.loader.status(&ctx, &req.model).await?))
}

/// `POST /backend/shutdown`
pub async fn backend_shutdown(State(state): State<AppState>, Json(req): Json<ModelSelector>) -> ApiResult<StatusCode> {
    if state.loader.shutdown_model(&req.model) {
        info!("Backend for '{}' stopped on request", req.model);
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::bad_request(format!("model '{}' is not loaded", req.model)))
    }
}
