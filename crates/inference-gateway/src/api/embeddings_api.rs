//! `POST /v1/embeddings`

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use tracing::info;

use super::schema::{DataItem, EmbeddingsRequest, OpenAIResponse, Usage};
use super::{count_tokens, load_worker, new_id, request_config, resolve_model, unix_now, ApiError, ApiResult};
use crate::shared_state::AppState;
use crate::worker::CancelOnDrop;

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EmbeddingsRequest>,
) -> ApiResult<Json<OpenAIResponse>> {
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    let inputs = req.inputs();
    if inputs.is_empty() {
        return Err(ApiError::bad_request("input is required"));
    }
    info!("Embedding {} inputs with model '{}'", inputs.len(), model);

    let mut config = request_config(&state, &model, &Default::default());
    config.embeddings = true;
    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;

    let mut data = Vec::with_capacity(inputs.len());
    let mut prompt_tokens = 0;
    for (index, input) in inputs.iter().enumerate() {
        let mut opts = config.predict_options();
        opts.embeddings = input.clone();
        let result = loaded.client.embeddings(&ctx, opts).await?;
        prompt_tokens += count_tokens(input);
        data.push(DataItem {
            embedding: result.embeddings,
            index,
            object: "embedding".to_string(),
            ..Default::default()
        });
    }

    Ok(Json(OpenAIResponse {
        id: new_id("emb"),
        object: "list".to_string(),
        created: unix_now(),
        model: req.model,
        data,
        usage: Some(Usage::new(prompt_tokens, 0)),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{state_with, Scripted};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_one_vector_per_input() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![("emb", Scripted::replying(&[]))]);
        let req: EmbeddingsRequest = serde_json::from_value(json!({"model": "emb", "input": ["ab", "abcd"]})).unwrap();

        let Json(resp) = embeddings(State(state), HeaderMap::new(), Json(req)).await.unwrap();
        assert_eq!(resp.object, "list");
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].embedding, vec![2.0, 0.5]);
        assert_eq!(resp.data[1].embedding, vec![4.0, 0.5]);
        assert_eq!(resp.data[1].index, 1);
        assert_eq!(resp.data[1].object, "embedding");
    }

    #[tokio::test]
    async fn test_missing_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![]);
        let req: EmbeddingsRequest = serde_json::from_value(json!({"model": "emb"})).unwrap();
        let err = embeddings(State(state), HeaderMap::new(), Json(req)).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
