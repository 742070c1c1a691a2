//! `POST /v1/completions`

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::schema::{Choice, CompletionRequest, OpenAIResponse, Usage};
use super::{count_tokens, load_worker, new_id, request_config, resolve_model, sse_json, unix_now, ApiError, ApiResult};
use crate::metrics::StreamGuard;
use crate::model_config::ModelConfig;
use crate::shared_state::AppState;
use crate::templates::{PromptTemplateData, TemplateEngine};
use crate::worker::{CallContext, CancelOnDrop};

/// Applies the completion template (or `<model>.tmpl`) to one raw prompt.
pub fn completion_prompt(templates: &TemplateEngine, config: &ModelConfig, input: &str) -> String {
    let template = if !config.template.completion.is_empty() {
        config.template.completion.as_str()
    } else if templates.has_model_template(config.model_file()) {
        config.model_file()
    } else {
        return input.to_string();
    };
    let data = PromptTemplateData {
        system_prompt: config.system_prompt.clone(),
        input: input.to_string(),
        ..Default::default()
    };
    templates.evaluate_prompt(template, &data).unwrap_or_else(|e| {
        warn!("Completion template '{}' failed, using raw prompt: {:#}", template, e);
        input.to_string()
    })
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompletionRequest>,
) -> ApiResult<Response> {
    let request_num = state.counters.inc_total_requests();
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    info!("Completion request #{} for model '{}'", request_num, model);

    let config = request_config(&state, &model, &req.sampling);
    let prompts = req.prompts();
    let ctx = state.request_context();
    let loaded = load_worker(&state, &ctx, &config).await?;

    if req.stream {
        let [prompt] = prompts.as_slice() else {
            return Err(ApiError::bad_request("streaming is only supported for a single prompt"));
        };
        let prompt = completion_prompt(&state.templates, &config, prompt);
        return stream_completion(state, ctx, loaded, config, prompt, req.model).await;
    }

    let _cancel = CancelOnDrop(ctx.token().clone());
    let mut choices = Vec::with_capacity(prompts.len());
    let mut usage = Usage::default();

    for (index, raw) in prompts.iter().enumerate() {
        let prompt = completion_prompt(&state.templates, &config, raw);
        debug!("Completion prompt {}: {}", index, prompt);
        let mut opts = config.predict_options();
        opts.prompt = prompt.clone();
        let reply = loaded.client.predict(&ctx, opts).await?;
        let mut text = reply.text();

        let prompt_tokens = if reply.prompt_tokens > 0 { reply.prompt_tokens } else { count_tokens(&prompt) };
        let completion_tokens = if reply.tokens > 0 { reply.tokens } else { count_tokens(&text) };
        usage = Usage::new(usage.prompt_tokens + prompt_tokens, usage.completion_tokens + completion_tokens);

        if req.echo || config.parameters.echo {
            text = format!("{}{}", raw, text);
        }
        choices.push(Choice {
            index,
            finish_reason: Some("stop".to_string()),
            text: Some(text),
            ..Default::default()
        });
    }

    Ok(Json(OpenAIResponse {
        id: new_id("cmpl"),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: req.model,
        choices,
        usage: Some(usage),
        ..Default::default()
    })
    .into_response())
}

async fn stream_completion(
    state: AppState,
    ctx: CallContext,
    loaded: std::sync::Arc<crate::model_loader::LoadedModel>,
    config: ModelConfig,
    prompt: String,
    model: String,
) -> ApiResult<Response> {
    let mut opts = config.predict_options();
    opts.prompt = prompt.clone();
    let cancel = CancelOnDrop(ctx.token().clone());
    let mut replies = loaded.client.predict_stream(&ctx, opts).await?;
    state.counters.inc_streamed_responses();

    let id = new_id("cmpl");
    let created = unix_now();

    let events = async_stream::stream! {
        let _cancel = cancel;
        let _active = StreamGuard::new();
        let _worker = loaded;

        let chunk = |text: String, finish: Option<&str>, usage: Option<Usage>| OpenAIResponse {
            id: id.clone(),
            object: "text_completion".to_string(),
            created,
            model: model.clone(),
            choices: vec![Choice { index: 0, finish_reason: finish.map(str::to_string), text: Some(text), ..Default::default() }],
            usage,
            ..Default::default()
        };

        let mut completion_tokens = 0;
        while let Some(item) = replies.next().await {
            match item {
                Ok(reply) => {
                    completion_tokens = if reply.tokens > 0 { reply.tokens } else { completion_tokens + 1 };
                    let text = reply.text();
                    if !text.is_empty() {
                        yield Ok::<Event, Infallible>(sse_json(&chunk(text, None, None)));
                    }
                }
                Err(e) => {
                    error!("Completion stream for '{}' failed: {}", model, e);
                    yield Ok(sse_json(&ApiError::from(e).body()));
                    return;
                }
            }
        }

        let usage = Usage::new(count_tokens(&prompt), completion_tokens);
        yield Ok(sse_json(&chunk(String::new(), Some("stop"), Some(usage))));
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}
