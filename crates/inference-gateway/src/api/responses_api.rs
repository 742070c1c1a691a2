//! Responses API over WebSocket (`GET /v1/responses`, upgraded).
//!
//! A client sends `response.create` messages and receives the response as a
//! stream of typed events. Completed responses are kept in a [`ResponseStore`]
//! so a later request can continue the conversation with
//! `previous_response_id`.
//!
//! Every event for a connection goes through one writer task, which stamps
//! the per-connection `sequence_number`. Only one response may be generated
//! at a time per connection.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::chat_api::{build_prompt, predict_options};
use super::schema::{Message, MessageContent, SamplingParams};
use super::{count_tokens, request_config, unix_now};
use crate::error::WorkerError;
use crate::metrics::StreamGuard;
use crate::reasoning::{detect_thinking_start_token, process_completion};
use crate::shared_state::AppState;
use crate::worker::{CallContext, CancelOnDrop};

pub const WS_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
pub const WS_CONNECTION_LIMIT: Duration = Duration::from_secs(60 * 60);
const STORE_CAPACITY: u64 = 10_000;

/// `response.create` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponsesRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    /// A string or a list of `{role, content}` items.
    pub input: Value,
    pub instructions: String,
    pub previous_response_id: String,
    pub store: Option<bool>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<i32>,
}

impl ResponsesRequest {
    pub fn input_messages(&self) -> Vec<Message> {
        match &self.input {
            Value::String(text) => vec![user_message(text)],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(user_message(text)),
                    other => item_message(other),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_output_tokens,
            ..Default::default()
        }
    }

    fn should_store(&self) -> bool {
        self.store != Some(false)
    }
}

fn user_message(text: &str) -> Message {
    Message {
        role: "user".to_string(),
        content: Some(MessageContent::Text(text.to_string())),
        ..Default::default()
    }
}

/// `{role, content}` where content is text or `input_text`/`output_text` parts.
fn item_message(item: &Value) -> Option<Message> {
    let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
    let text = match item.get("content")? {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    Some(Message {
        role: role.to_string(),
        content: Some(MessageContent::Text(text)),
        ..Default::default()
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub annotations: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub status: String,
    pub role: String,
    pub content: Vec<OutputContent>,
}

impl OutputItem {
    fn message(id: &str, status: &str, text: Option<String>) -> Self {
        Self {
            kind: "message".to_string(),
            id: id.to_string(),
            status: status.to_string(),
            role: "assistant".to_string(),
            content: text
                .map(|text| vec![OutputContent { kind: "output_text".to_string(), text, annotations: Vec::new() }])
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseResource {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    /// `in_progress`, `completed` or `failed`.
    pub status: String,
    pub model: String,
    pub output: Vec<OutputItem>,
    pub error: Option<ErrorPayload>,
    pub previous_response_id: Option<String>,
    pub usage: Option<ResponseUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ErrorPayload {
    fn invalid(message: impl Into<String>, param: Option<&str>) -> Self {
        Self {
            kind: "invalid_request".to_string(),
            code: None,
            message: message.into(),
            param: param.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_index: Option<usize>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<OutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl StreamEvent {
    fn with_response(kind: &str, response: &ResponseResource) -> Self {
        Self { kind: kind.to_string(), response: Some(response.clone()), ..Default::default() }
    }

    fn error(payload: ErrorPayload) -> Self {
        Self { kind: "error".to_string(), error: Some(payload), ..Default::default() }
    }
}

/// A finished response plus the conversation that led to it.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub response: ResponseResource,
    pub messages: Vec<Message>,
}

/// Completed responses by id, with an optional TTL.
pub struct ResponseStore {
    cache: Cache<String, Arc<StoredResponse>>,
}

impl ResponseStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(STORE_CAPACITY);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self { cache: builder.build() }
    }

    pub async fn insert(&self, stored: StoredResponse) {
        self.cache.insert(stored.response.id.clone(), Arc::new(stored)).await;
    }

    pub async fn get(&self, id: &str) -> Option<Arc<StoredResponse>> {
        self.cache.get(id).await
    }
}

/// Parses one client frame. Anything that is not a valid `response.create`
/// comes back as the `error` event to send.
pub fn parse_client_message(text: &str) -> Result<ResponsesRequest, StreamEvent> {
    let envelope: Value =
        serde_json::from_str(text).map_err(|_| StreamEvent::error(ErrorPayload::invalid("invalid JSON message", None)))?;
    let kind = envelope.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind != "response.create" {
        return Err(StreamEvent::error(ErrorPayload::invalid(
            format!("unsupported message type: {}", kind),
            Some("type"),
        )));
    }
    serde_json::from_value(envelope)
        .map_err(|e| StreamEvent::error(ErrorPayload::invalid(format!("failed to parse request: {}", e), None)))
}

pub async fn responses_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// Serialises events to the socket, numbering them in send order.
pub async fn write_events<S>(mut events: mpsc::Receiver<StreamEvent>, mut sink: S)
where
    S: Sink<WsMessage> + Unpin,
{
    let mut sequence = 0u64;
    while let Some(mut event) = events.recv().await {
        event.sequence_number = sequence;
        sequence += 1;
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unserialisable {} event: {}", event.kind, e);
                continue;
            }
        };
        if sink.send(WsMessage::Text(text)).await.is_err() {
            debug!("WebSocket closed while writing");
            break;
        }
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (sink, mut incoming) = socket.split();
    let (tx, rx) = mpsc::channel::<StreamEvent>(state.config.stream_queue_size.max(1));
    let writer = tokio::spawn(write_events(rx, sink));
    let connection = CallContext::with_timeout(WS_CONNECTION_LIMIT);
    let mut inflight: Option<(JoinHandle<()>, CallContext)> = None;
    debug!("Responses WebSocket connected");

    loop {
        let frame = tokio::select! {
            _ = connection.done() => {
                let limit = ErrorPayload::invalid("Connection exceeded maximum duration", None);
                tx.send(StreamEvent::error(ErrorPayload { kind: "websocket_connection_limit_reached".into(), ..limit })).await.ok();
                break;
            }
            frame = incoming.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        };

        let request = match parse_client_message(&text) {
            Ok(request) => request,
            Err(event) => {
                tx.send(event).await.ok();
                continue;
            }
        };
        if inflight.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            let busy = ErrorPayload::invalid("a response is already in progress on this connection", None);
            tx.send(StreamEvent::error(busy)).await.ok();
            continue;
        }

        let ctx = CallContext::with_timeout(state.config.request_timeout());
        let task = tokio::spawn(create_response(state.clone(), ctx.clone(), request, tx.clone()));
        inflight = Some((task, ctx));
    }

    if let Some((task, ctx)) = inflight {
        ctx.cancel();
        task.abort();
    }
    drop(tx);
    writer.await.ok();
    debug!("Responses WebSocket closed");
}

async fn fail(tx: &mpsc::Sender<StreamEvent>, response: &mut ResponseResource, error: WorkerError) {
    warn!("Response {} failed: {}", response.id, error);
    response.status = "failed".to_string();
    response.completed_at = Some(unix_now());
    let payload = ErrorPayload {
        kind: "server_error".to_string(),
        code: Some(error.code().to_string()),
        message: error.to_string(),
        param: None,
    };
    response.error = Some(payload.clone());
    let mut event = StreamEvent::with_response("response.failed", response);
    event.error = Some(payload);
    tx.send(event).await.ok();
}

/// Generates one response, sending its events to `tx`.
pub async fn create_response(state: AppState, ctx: CallContext, req: ResponsesRequest, tx: mpsc::Sender<StreamEvent>) {
    if req.model.is_empty() {
        tx.send(StreamEvent::error(ErrorPayload::invalid("model is required", Some("model")))).await.ok();
        return;
    }

    let mut messages = Vec::new();
    if !req.previous_response_id.is_empty() {
        match state.responses.get(&req.previous_response_id).await {
            Some(previous) => messages = previous.messages.clone(),
            None => {
                let missing = WorkerError::PreviousResponseNotFound(req.previous_response_id.clone());
                let payload = ErrorPayload {
                    kind: "invalid_request_error".to_string(),
                    code: Some(missing.code().to_string()),
                    message: missing.to_string(),
                    param: Some("previous_response_id".to_string()),
                };
                tx.send(StreamEvent::error(payload)).await.ok();
                return;
            }
        }
    }
    messages.extend(req.input_messages());
    if !req.instructions.is_empty() {
        messages.insert(
            0,
            Message { role: "system".into(), content: Some(MessageContent::Text(req.instructions.clone())), ..Default::default() },
        );
    }

    let id = format!("resp_{}", uuid::Uuid::new_v4());
    let item_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    info!("Creating response {} with model '{}'", id, req.model);

    let config = request_config(&state, &req.model, &req.sampling());
    let prompt = build_prompt(&state.templates, &config, &messages, &[], false);
    let thinking_token = if config.reasoning.disable_reasoning {
        None
    } else {
        detect_thinking_start_token(&prompt, &config.reasoning)
    };

    let mut response = ResponseResource {
        id: id.clone(),
        object: "response".to_string(),
        created_at: unix_now(),
        completed_at: None,
        status: "in_progress".to_string(),
        model: req.model.clone(),
        output: Vec::new(),
        error: None,
        previous_response_id: Some(req.previous_response_id.clone()).filter(|p| !p.is_empty()),
        usage: None,
    };
    tx.send(StreamEvent::with_response("response.created", &response)).await.ok();
    tx.send(StreamEvent::with_response("response.in_progress", &response)).await.ok();
    tx.send(StreamEvent {
        kind: "response.output_item.added".to_string(),
        output_index: Some(0),
        item: Some(OutputItem::message(&item_id, "in_progress", None)),
        ..Default::default()
    })
    .await
    .ok();

    let _cancel = CancelOnDrop(ctx.token().clone());
    let _active = StreamGuard::new();
    let loaded = match state.loader.load(&ctx, &config).await {
        Ok(loaded) => loaded,
        Err(e) => return fail(&tx, &mut response, e).await,
    };
    let opts = predict_options(&config, &prompt, &messages);
    let mut replies = match loaded.client.predict_stream(&ctx, opts).await {
        Ok(replies) => replies,
        Err(e) => return fail(&tx, &mut response, e).await,
    };

    let mut text = String::new();
    let mut output_tokens = 0;
    while let Some(item) = replies.next().await {
        match item {
            Ok(reply) => {
                output_tokens = if reply.tokens > 0 { reply.tokens } else { output_tokens + 1 };
                let token = reply.text();
                if token.is_empty() {
                    continue;
                }
                text.push_str(&token);
                let delta = StreamEvent {
                    kind: "response.output_text.delta".to_string(),
                    item_id: item_id.clone(),
                    output_index: Some(0),
                    content_index: Some(0),
                    delta: Some(token),
                    ..Default::default()
                };
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
            Err(e) => return fail(&tx, &mut response, e).await,
        }
    }

    let answer = process_completion(&text, thinking_token.as_deref(), &config.reasoning).cleaned_content;
    let input_tokens = count_tokens(&prompt);
    response.status = "completed".to_string();
    response.completed_at = Some(unix_now());
    response.output = vec![OutputItem::message(&item_id, "completed", Some(answer.clone()))];
    response.usage = Some(ResponseUsage { input_tokens, output_tokens, total_tokens: input_tokens + output_tokens });

    if req.should_store() {
        messages.push(Message::assistant(answer));
        state.responses.insert(StoredResponse { response: response.clone(), messages }).await;
    }
    tx.send(StreamEvent::with_response("response.completed", &response)).await.ok();
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{state_with, Scripted};
    use super::*;
    use serde_json::json;

    async fn run(state: &AppState, body: Value) -> Vec<StreamEvent> {
        let req: ResponsesRequest = serde_json::from_value(body).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        create_response(state.clone(), state.request_context(), req, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[StreamEvent]) -> Vec<&str> {
        events.iter().map(|e| e.kind.as_str()).collect()
    }

    #[tokio::test]
    async fn test_event_sequence_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![("m", Scripted::streaming(&["Hel", "lo"]))]);

        let events = run(&state, json!({"type": "response.create", "model": "m", "input": "hi"})).await;
        assert_eq!(
            kinds(&events),
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.completed",
            ]
        );
        let done = events.last().unwrap().response.clone().unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.output[0].content[0].text, "Hello");
        assert!(done.id.starts_with("resp_"));

        let stored = state.responses.get(&done.id).await.unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].text(), "Hello");
    }

    #[tokio::test]
    async fn test_previous_response_continues_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Scripted::streaming(&["ok"]);
        let state = state_with(dir.path(), vec![], vec![("m", backend.clone())]);

        let first = run(&state, json!({"model": "m", "input": "first"})).await;
        let id = first.last().unwrap().response.as_ref().unwrap().id.clone();
        run(&state, json!({"model": "m", "input": [{"role": "user", "content": "second"}], "previous_response_id": id})).await;

        let seen = backend.seen();
        let roles: Vec<_> = seen[1].messages.iter().map(|m| (m.role.as_str(), m.content.as_str())).collect();
        assert_eq!(roles, vec![("user", "first"), ("assistant", "ok"), ("user", "second")]);
    }

    #[tokio::test]
    async fn test_unknown_previous_response() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![]);
        let events = run(&state, json!({"model": "m", "input": "x", "previous_response_id": "resp_missing"})).await;
        assert_eq!(kinds(&events), vec!["error"]);
        let error = events[0].error.clone().unwrap();
        assert_eq!(error.code.as_deref(), Some("previous_response_not_found"));
        assert_eq!(error.param.as_deref(), Some("previous_response_id"));
    }

    #[tokio::test]
    async fn test_store_false_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(
            dir.path(),
            vec![],
            vec![("ok", Scripted::streaming(&["a"])), ("bad", Scripted::failing_after(&["a"]))],
        );

        let events = run(&state, json!({"model": "ok", "input": "x", "store": false})).await;
        let id = events.last().unwrap().response.as_ref().unwrap().id.clone();
        assert!(state.responses.get(&id).await.is_none());

        let events = run(&state, json!({"model": "bad", "input": "x"})).await;
        let last = events.last().unwrap();
        assert_eq!(last.kind, "response.failed");
        assert_eq!(last.response.as_ref().unwrap().status, "failed");
    }

    #[tokio::test]
    async fn test_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![]);
        let events = run(&state, json!({"input": "x"})).await;
        assert_eq!(events[0].error.as_ref().unwrap().param.as_deref(), Some("model"));
    }

    #[test]
    fn test_parse_client_message() {
        assert!(parse_client_message(r#"{"type":"response.create","model":"m"}"#).is_ok());
        let err = parse_client_message(r#"{"type":"session.update"}"#).unwrap_err();
        assert_eq!(err.kind, "error");
        assert!(err.error.unwrap().message.contains("session.update"));
        assert!(parse_client_message("not json").is_err());
    }

    #[tokio::test]
    async fn test_writer_numbers_events_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let (sink, collected) = futures::channel::mpsc::unbounded::<WsMessage>();
        for kind in ["a", "b", "c"] {
            tx.send(StreamEvent { kind: kind.into(), ..Default::default() }).await.unwrap();
        }
        drop(tx);
        write_events(rx, sink).await;

        let frames: Vec<WsMessage> = collected.collect().await;
        let numbers: Vec<u64> = frames
            .into_iter()
            .map(|f| match f {
                WsMessage::Text(t) => serde_json::from_str::<StreamEvent>(&t).unwrap().sequence_number,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }
}
