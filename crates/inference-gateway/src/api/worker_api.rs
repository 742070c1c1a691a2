//! Thin endpoints that map almost directly onto a worker capability:
//! tokenization, reranking and the vector stores.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::schema::{
    RerankBody, RerankDocument, RerankItem, RerankResponse, StoresFindBody, StoresFindResponse, StoresGetResponse,
    StoresKeysBody, StoresSetBody, TokenizeRequest, Usage,
};
use super::{load_worker, request_config, resolve_model, ApiError, ApiResult};
use crate::backends::BackendKind;
use crate::model_loader::LoadedModel;
use crate::shared_state::AppState;
use crate::wire::{RerankRequest, TokenizationResponse};
use crate::worker::{store_client, CallContext, CancelOnDrop};
use std::sync::Arc;

pub const DEFAULT_STORE: &str = "default";

/// `POST /v1/tokenize`
pub async fn tokenize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenizeRequest>,
) -> ApiResult<Json<TokenizationResponse>> {
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    let config = request_config(&state, &model, &Default::default());
    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;

    let mut opts = config.predict_options();
    opts.prompt = req.content;
    Ok(Json(loaded.client.tokenize_string(&ctx, opts).await?))
}

/// `POST /v1/rerank`, answered in the Jina shape.
pub async fn rerank(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<RerankBody>) -> ApiResult<Json<RerankResponse>> {
    if req.query.is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    info!("Reranking {} documents with model '{}'", req.documents.len(), model);

    let mut config = request_config(&state, &model, &Default::default());
    config.reranking = true;
    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;

    let top_n = req.top_n.filter(|n| *n > 0).unwrap_or(req.documents.len() as i32);
    let result = loaded
        .client
        .rerank(&ctx, RerankRequest { query: req.query, documents: req.documents, top_n })
        .await?;

    Ok(Json(RerankResponse {
        model: req.model,
        usage: Usage::new(result.usage.prompt_tokens, 0),
        results: result
            .results
            .into_iter()
            .map(|r| RerankItem {
                index: r.index,
                document: RerankDocument { text: r.text },
                relevance_score: r.relevance_score,
            })
            .collect(),
    }))
}

/// Loads the store named `store`, defaulting to the in-process vector store.
async fn store_worker(state: &AppState, ctx: &CallContext, store: &str) -> ApiResult<Arc<LoadedModel>> {
    let name = if store.is_empty() { DEFAULT_STORE } else { store };
    let mut config = state.configs.resolve(name, &state.defaults());
    if config.backend.is_empty() {
        config.backend = BackendKind::Store.as_str().to_string();
    }
    debug!("Using store '{}' on backend '{}'", name, config.backend);
    load_worker(state, ctx, &config).await
}

fn to_strings(values: Vec<Vec<u8>>) -> Vec<String> {
    values.into_iter().map(|v| String::from_utf8_lossy(&v).into_owned()).collect()
}

/// `POST /stores/set`
pub async fn stores_set(State(state): State<AppState>, Json(req): Json<StoresSetBody>) -> ApiResult<Json<Value>> {
    let ctx = state.request_context();
    let loaded = store_worker(&state, &ctx, &req.store).await?;
    let values = req.values.into_iter().map(String::into_bytes).collect();
    store_client::set_cols(loaded.client.as_ref(), &ctx, req.keys, values).await?;
    Ok(Json(json!({})))
}

/// `POST /stores/delete`
pub async fn stores_delete(State(state): State<AppState>, Json(req): Json<StoresKeysBody>) -> ApiResult<Json<Value>> {
    let ctx = state.request_context();
    let loaded = store_worker(&state, &ctx, &req.store).await?;
    store_client::delete_cols(loaded.client.as_ref(), &ctx, req.keys).await?;
    Ok(Json(json!({})))
}

/// `POST /stores/get`
pub async fn stores_get(State(state): State<AppState>, Json(req): Json<StoresKeysBody>) -> ApiResult<Json<StoresGetResponse>> {
    let ctx = state.request_context();
    let loaded = store_worker(&state, &ctx, &req.store).await?;
    let (keys, values) = store_client::get_cols(loaded.client.as_ref(), &ctx, req.keys).await?;
    Ok(Json(StoresGetResponse { keys, values: to_strings(values) }))
}

/// `POST /stores/find`
pub async fn stores_find(State(state): State<AppState>, Json(req): Json<StoresFindBody>) -> ApiResult<Json<StoresFindResponse>> {
    let ctx = state.request_context();
    let loaded = store_worker(&state, &ctx, &req.store).await?;
    let (keys, values, similarities) = store_client::find(loaded.client.as_ref(), &ctx, req.key, req.topk).await?;
    Ok(Json(StoresFindResponse { keys, values: to_strings(values), similarities }))
}
