//! `POST /v1/chat/completions`
//!
//! Flow: resolve model → merge config → function grammar → per-message
//! templating → prompt template → reasoning prefill detection → worker
//! `Predict` (JSON answer) or `PredictStream` (SSE).

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::schema::{
    ChatRequest, Choice, FunctionCall, Message, MessageContent, OpenAIResponse, ToolCall, Usage,
};
use super::{count_tokens, load_worker, new_id, request_config, resolve_model, sse_json, unix_now, ApiError, ApiResult};
use crate::error::WorkerError;
use crate::functions::{
    functions_grammar, parse_function_call, prepare, schema_to_grammar, FuncCallResult, Function, GrammarOptions,
    JSON_BNF,
};
use crate::metrics::StreamGuard;
use crate::model_config::ModelConfig;
use crate::model_loader::LoadedModel;
use crate::reasoning::{detect_thinking_start_token, process_completion};
use crate::shared_state::AppState;
use crate::templates::{ChatMessageTemplateData, PromptTemplateData, TemplateEngine};
use crate::wire::{ChatMessage, PredictOptions, Reply};
use crate::worker::{CallContext, CancelOnDrop};

/// How the request wants functions used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionChoice {
    Auto,
    Disabled,
    Force(String),
}

impl FunctionChoice {
    /// `function_call` wins over `tool_choice` when both are present.
    pub fn from_request(req: &ChatRequest) -> Self {
        if let Some(choice) = &req.function_call {
            return match choice {
                Value::String(s) if s == "none" => Self::Disabled,
                Value::String(s) if s.is_empty() || s == "auto" => Self::Auto,
                Value::String(name) => Self::Force(name.clone()),
                other => other
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|n| Self::Force(n.to_string()))
                    .unwrap_or(Self::Auto),
            };
        }
        match &req.tool_choice {
            Some(Value::String(s)) if s == "none" => Self::Disabled,
            Some(other @ Value::Object(_)) => other
                .pointer("/function/name")
                .and_then(Value::as_str)
                .map(|n| Self::Force(n.to_string()))
                .unwrap_or(Self::Auto),
            _ => Self::Auto,
        }
    }

    fn forced(&self) -> Option<&str> {
        match self {
            Self::Force(name) => Some(name),
            _ => None,
        }
    }
}

/// Everything needed to run one chat request against a worker.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub config: ModelConfig,
    pub prompt: String,
    pub functions: Vec<Function>,
    pub process_functions: bool,
    /// The functions came from `tools`, so calls are answered as `tool_calls`.
    pub use_tools: bool,
    pub stream: bool,
    pub thinking_token: Option<String>,
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    handle_chat(state, None, headers, req).await
}

/// Same as [`chat_completions`] with the model taken from the path.
pub async fn chat_completions_for_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    handle_chat(state, Some(model), headers, req).await
}

async fn handle_chat(state: AppState, path_model: Option<String>, headers: HeaderMap, req: ChatRequest) -> ApiResult<Response> {
    let request_num = state.counters.inc_total_requests();
    let model = resolve_model(&state, path_model.as_deref(), &req.model, &headers, true)?;
    info!("Chat request #{} for model '{}'", request_num, model);

    let chat = prepare_chat(&state, &model, &req)?;
    let ctx = state.request_context();
    let loaded = load_worker(&state, &ctx, &chat.config).await?;

    if chat.stream {
        return stream_chat(state, ctx, loaded, chat, req).await;
    }

    // the handler future is dropped when the client goes away
    let _cancel = CancelOnDrop(ctx.token().clone());
    let response = complete_chat(&ctx, &loaded, &chat, &req).await?;
    if matches!(response.choices.first().and_then(|c| c.finish_reason.as_deref()), Some("function_call" | "tool_calls")) {
        state.counters.inc_function_calls();
    }
    Ok(Json(response).into_response())
}

/// Merges config and request, picks the grammar and renders the prompt.
pub fn prepare_chat(state: &AppState, model: &str, req: &ChatRequest) -> ApiResult<PreparedChat> {
    let mut config = request_config(state, model, &req.sampling);

    let mut declared = req.functions.clone();
    declared.extend(req.tools.iter().filter(|t| t.kind == "function").map(|t| t.function.clone()));
    let use_tools = req.functions.is_empty() && !req.tools.is_empty();
    let choice = FunctionChoice::from_request(req);

    let mut functions = Vec::new();
    let mut process_functions = false;

    match req.response_format_type() {
        Some("json_object") => config.grammar = JSON_BNF.to_string(),
        Some("json_schema") if req.response_schema().is_some() => {
            let schema = req.response_schema().cloned().unwrap_or(Value::Null);
            config.grammar = schema_to_grammar(&schema, &GrammarOptions::default()).map_err(WorkerError::from)?;
        }
        _ if !declared.is_empty() && choice != FunctionChoice::Disabled => {
            debug!("Response needs to process functions");
            process_functions = true;
            functions = prepare(&declared, &config.function, choice.forced());
            if functions.is_empty() {
                return Err(ApiError::bad_request(format!(
                    "function '{}' is not declared",
                    choice.forced().unwrap_or_default()
                )));
            }
            if !config.function.disable_grammar {
                config.grammar = functions_grammar(&functions, &config.function).map_err(WorkerError::from)?;
            }
        }
        _ => {}
    }

    // functions are not streamed
    let stream = req.stream && !process_functions;

    let prompt = build_prompt(&state.templates, &config, &req.messages, &functions, process_functions);
    debug!("Prompt (after templating): {}", prompt);

    let thinking_token = if config.reasoning.disable_reasoning {
        None
    } else {
        detect_thinking_start_token(&prompt, &config.reasoning)
    };

    Ok(PreparedChat { config, prompt, functions, process_functions, use_tools, stream, thinking_token })
}

/// Renders every message, joins them and applies the prompt template.
pub fn build_prompt(
    templates: &TemplateEngine,
    config: &ModelConfig,
    messages: &[Message],
    functions: &[Function],
    process_functions: bool,
) -> String {
    let mut suppress_system_prompt = false;
    let mut rendered = Vec::with_capacity(messages.len());
    let last = messages.len().saturating_sub(1);

    for (index, message) in messages.iter().enumerate() {
        let is_call = message.function_call.is_some() || message.tool_calls.is_some();
        let role = if message.role == "assistant" && is_call && !config.role_marker("assistant_function_call").is_empty() {
            "assistant_function_call"
        } else {
            message.role.as_str()
        };
        let marker = config.role_marker(role);
        let text = message.text();
        let mut content = String::new();

        if !config.template.chat_message.is_empty() {
            let data = ChatMessageTemplateData {
                system_prompt: config.system_prompt.clone(),
                role: marker.to_string(),
                role_name: role.to_string(),
                content: text.clone(),
                function_name: message.name.clone().unwrap_or_default(),
                last_message: index == last,
                function: process_functions && index == last,
                message_index: index,
            };
            match templates.evaluate_chat_message(&config.template.chat_message, &data) {
                Ok(out) if out.trim().is_empty() => {
                    warn!("Template '{}' produced blank output for message {}, skipping", config.template.chat_message, index);
                    continue;
                }
                Ok(out) => content = out,
                Err(e) => error!("Failed to render message {} with '{}': {:#}", index, config.template.chat_message, e),
            }
        }

        if content.is_empty() {
            content = plain_message(marker, &text, call_json(message));
            if !text.is_empty() && role == "system" {
                suppress_system_prompt = true;
            }
        }
        if content.is_empty() {
            continue;
        }
        rendered.push(content);
    }

    let joiner = config.template.join_chat_messages_by_character.as_deref().unwrap_or("\n");
    let input = rendered.join(joiner);
    debug!("Prompt (before templating): {}", input);

    let template = if process_functions && !config.template.functions.is_empty() {
        Some(config.template.functions.as_str())
    } else if !process_functions && !config.template.chat.is_empty() {
        Some(config.template.chat.as_str())
    } else if templates.has_model_template(config.model_file()) {
        Some(config.model_file())
    } else {
        None
    };

    let Some(template) = template else { return input };
    let data = PromptTemplateData {
        system_prompt: config.system_prompt.clone(),
        suppress_system_prompt,
        input: input.clone(),
        instruction: String::new(),
        functions: functions.to_vec(),
    };
    match templates.evaluate_prompt(template, &data) {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!("Prompt template '{}' failed, using raw input: {:#}", template, e);
            input
        }
    }
}

fn call_json(message: &Message) -> Option<String> {
    if let Some(call) = &message.function_call {
        return serde_json::to_string(call).ok();
    }
    message.tool_calls.as_ref().and_then(|calls| serde_json::to_string(calls).ok())
}

/// Role marker prefix fallback when no per-message template applies.
fn plain_message(marker: &str, text: &str, call: Option<String>) -> String {
    let prefixed = |s: &str| if marker.is_empty() { s.to_string() } else { format!("{} {}", marker, s) };
    let mut out = String::new();
    if !text.is_empty() {
        out = prefixed(text);
    }
    if let Some(call) = call {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&prefixed(&call));
    }
    out
}

pub fn predict_options(config: &ModelConfig, prompt: &str, messages: &[Message]) -> PredictOptions {
    let mut opts = config.predict_options();
    opts.prompt = prompt.to_string();
    opts.messages = messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.clone(),
            content: m.text(),
            name: m.name.clone(),
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect();
    opts
}

fn usage_for(prompt: &str, reply: &Reply, text: &str) -> Usage {
    let prompt_tokens = if reply.prompt_tokens > 0 { reply.prompt_tokens } else { count_tokens(prompt) };
    let completion_tokens = if reply.tokens > 0 { reply.tokens } else { count_tokens(text) };
    Usage::new(prompt_tokens, completion_tokens)
}

async fn complete_chat(
    ctx: &CallContext,
    loaded: &LoadedModel,
    chat: &PreparedChat,
    req: &ChatRequest,
) -> ApiResult<OpenAIResponse> {
    let opts = predict_options(&chat.config, &chat.prompt, &req.messages);
    let reply = loaded.client.predict(ctx, opts.clone()).await?;
    let text = reply.text();
    let mut usage = usage_for(&chat.prompt, &reply, &text);

    let choices = if chat.process_functions {
        function_choices(ctx, loaded, chat, opts, &text, &mut usage).await?
    } else {
        vec![answer_choice(&text, chat)]
    };

    Ok(OpenAIResponse {
        id: new_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: req.model.clone(),
        choices,
        usage: Some(usage),
        ..Default::default()
    })
}

/// A plain assistant answer with reasoning split out.
fn answer_choice(text: &str, chat: &PreparedChat) -> Choice {
    let extracted = process_completion(text, chat.thinking_token.as_deref(), &chat.config.reasoning);
    let mut message = Message::assistant(extracted.cleaned_content);
    if !extracted.reasoning.is_empty() {
        message.reasoning = Some(extracted.reasoning);
    }
    Choice { index: 0, finish_reason: Some("stop".to_string()), message: Some(message), ..Default::default() }
}

fn no_action_message(call: &FuncCallResult) -> Option<String> {
    let args: Value = serde_json::from_str(&call.arguments).ok()?;
    args.get("message").and_then(Value::as_str).filter(|m| !m.is_empty()).map(str::to_string)
}

async fn function_choices(
    ctx: &CallContext,
    loaded: &LoadedModel,
    chat: &PreparedChat,
    opts: PredictOptions,
    text: &str,
    usage: &mut Usage,
) -> ApiResult<Vec<Choice>> {
    let calls = parse_function_call(text, &chat.config.function);
    debug!("Function return: {} {:?}", text, calls);
    if calls.is_empty() {
        warn!("Model output did not contain a function call");
        return Ok(vec![answer_choice(text, chat)]);
    }

    let no_action = chat.config.function.no_action_name();
    let (answers, real): (Vec<_>, Vec<_>) = calls.into_iter().partition(|c| c.name == no_action);

    if real.is_empty() {
        if let Some(message) = answers.first().and_then(no_action_message) {
            debug!("Reply received from LLM: {}", message);
            return Ok(vec![answer_choice(&message, chat)]);
        }

        debug!("No action received from LLM without a message, computing a reply");
        let mut retry = opts;
        retry.grammar.clear();
        let reply = loaded.client.predict(ctx, retry).await?;
        let answer = reply.text();
        let extra = if reply.tokens > 0 { reply.tokens } else { count_tokens(&answer) };
        *usage = Usage::new(usage.prompt_tokens, usage.completion_tokens + extra);
        return Ok(vec![answer_choice(&answer, chat)]);
    }

    if chat.use_tools {
        let tool_calls = real
            .into_iter()
            .enumerate()
            .map(|(i, call)| ToolCall {
                index: Some(i),
                id: new_id("call"),
                kind: "function".to_string(),
                function: FunctionCall { name: call.name, arguments: call.arguments },
            })
            .collect();
        let message = Message {
            role: "assistant".to_string(),
            tool_calls: Some(tool_calls),
            ..Default::default()
        };
        return Ok(vec![Choice {
            index: 0,
            finish_reason: Some("tool_calls".to_string()),
            message: Some(message),
            ..Default::default()
        }]);
    }

    let mut choices = Vec::with_capacity(real.len());
    for (index, call) in real.into_iter().enumerate() {
        let message = Message {
            role: "assistant".to_string(),
            function_call: Some(json!({ "name": call.name, "arguments": call.arguments })),
            ..Default::default()
        };
        choices.push(Choice {
            index,
            finish_reason: Some("function_call".to_string()),
            message: Some(message),
            ..Default::default()
        });
    }
    Ok(choices)
}

async fn stream_chat(
    state: AppState,
    ctx: CallContext,
    loaded: Arc<LoadedModel>,
    chat: PreparedChat,
    req: ChatRequest,
) -> ApiResult<Response> {
    let opts = predict_options(&chat.config, &chat.prompt, &req.messages);
    let cancel = CancelOnDrop(ctx.token().clone());
    let mut replies = loaded.client.predict_stream(&ctx, opts).await?;
    state.counters.inc_streamed_responses();

    let id = new_id("chatcmpl");
    let created = unix_now();
    let model = req.model;
    let prompt_tokens = count_tokens(&chat.prompt);

    let events = async_stream::stream! {
        let _cancel = cancel;
        let _active = StreamGuard::new();
        let _worker = loaded;

        let chunk = |delta: Message, finish: Option<&str>, usage: Option<Usage>| OpenAIResponse {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.clone(),
            choices: vec![Choice {
                index: 0,
                finish_reason: finish.map(str::to_string),
                delta: Some(delta),
                ..Default::default()
            }],
            usage,
            ..Default::default()
        };

        let opening = Message {
            role: "assistant".to_string(),
            content: Some(MessageContent::Text(String::new())),
            ..Default::default()
        };
        yield Ok::<Event, Infallible>(sse_json(&chunk(opening, None, None)));

        let mut usage = Usage::new(prompt_tokens, 0);
        while let Some(item) = replies.next().await {
            match item {
                Ok(reply) => {
                    if reply.prompt_tokens > 0 {
                        usage.prompt_tokens = reply.prompt_tokens;
                    }
                    usage.completion_tokens = if reply.tokens > 0 { reply.tokens } else { usage.completion_tokens + 1 };
                    let text = reply.text();
                    if text.is_empty() {
                        continue;
                    }
                    let delta = Message { content: Some(MessageContent::Text(text)), ..Default::default() };
                    yield Ok(sse_json(&chunk(delta, None, None)));
                }
                Err(e) => {
                    error!("Stream for model '{}' failed: {}", model, e);
                    yield Ok(sse_json(&ApiError::from(e).body()));
                    return;
                }
            }
        }

        let closing = Message { content: Some(MessageContent::Text(String::new())), ..Default::default() };
        let usage = Usage::new(usage.prompt_tokens, usage.completion_tokens);
        yield Ok(sse_json(&chunk(closing, Some("stop"), Some(usage))));
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}
