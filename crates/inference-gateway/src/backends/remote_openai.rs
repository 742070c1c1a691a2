//! Remote OpenAI-compatible proxy worker.
//!
//! Forwards chat predictions to a third-party `/chat/completions` endpoint,
//! relaying streamed deltas token by token. The API key and base URL come
//! from environment variables named in [`RemoteSettings`].

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::wire::sse::{data_payload, SseLineBuffer, DONE_MARKER};
use crate::wire::*;
use crate::worker::{Backend, CallContext, ConcurrencyMode, TokenSender};

pub const DEFAULT_API_KEY_ENV: &str = "AVIAN_API_KEY";
pub const DEFAULT_BASE_URL_ENV: &str = "AVIAN_API_BASE";
pub const DEFAULT_BASE_URL: &str = "https://api.avian.io/v1";

/// Where the proxy finds its credentials.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub api_key_env: String,
    pub base_url_env: String,
    pub default_base_url: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            base_url_env: DEFAULT_BASE_URL_ENV.to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug)]
struct Session {
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<UpstreamMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct UpstreamMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<UpstreamMessage>,
}

#[derive(Debug, Deserialize, Default)]
struct UpstreamUsage {
    #[serde(default)]
    prompt_tokens: i32,
    #[serde(default)]
    completion_tokens: i32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct RemoteOpenAIBackend {
    settings: RemoteSettings,
    session: ArcSwapOption<Session>,
    http: Client,
}

impl RemoteOpenAIBackend {
    pub fn new() -> Self {
        Self::with_settings(RemoteSettings::default())
    }

    pub fn with_settings(settings: RemoteSettings) -> Self {
        Self {
            settings,
            session: ArcSwapOption::empty(),
            http: Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
        }
    }

    fn session(&self) -> WorkerResult<Arc<Session>> {
        self.session
            .load_full()
            .ok_or_else(|| WorkerError::invalid("model not loaded"))
    }

    fn to_messages(opts: &PredictOptions) -> Vec<UpstreamMessage> {
        if opts.messages.is_empty() {
            return vec![UpstreamMessage {
                role: "user".to_string(),
                content: Some(opts.prompt.clone()),
            }];
        }
        opts.messages
            .iter()
            .map(|m| UpstreamMessage {
                role: m.role.clone(),
                content: Some(m.content.clone()),
            })
            .collect()
    }

    fn request_body<'a>(session: &'a Session, opts: &PredictOptions, stream: bool) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &session.model,
            messages: Self::to_messages(opts),
            max_tokens: (opts.tokens > 0).then_some(opts.tokens),
            temperature: (opts.temperature > 0.0).then_some(opts.temperature),
            top_p: (opts.top_p > 0.0).then_some(opts.top_p),
            stop: opts.stop_prompts.clone(),
            stream,
        }
    }

    async fn post_chat(&self, session: &Session, body: &ChatCompletionRequest<'_>, stream: bool) -> WorkerResult<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", session.base_url))
            .bearer_auth(&session.api_key)
            .json(body);
        if stream {
            request = request.header("Accept", "text/event-stream");
        }
        let response = request.send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::remote_http(status.as_u16(), &body));
        }
        Ok(response)
    }
}

impl Default for RemoteOpenAIBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for RemoteOpenAIBackend {
    fn name(&self) -> &str {
        "remote-openai"
    }

    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Reentrant
    }

    async fn load(&self, opts: ModelOptions) -> WorkerResult<()> {
        let api_key = std::env::var(&self.settings.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                WorkerError::LoadFailed(format!(
                    "{} environment variable is required",
                    self.settings.api_key_env
                ))
            })?;
        if opts.model.is_empty() {
            return Err(WorkerError::invalid("model name is required"));
        }
        let base_url = std::env::var(&self.settings.base_url_env)
            .ok()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.settings.default_base_url.clone());
        let base_url = base_url.trim_end_matches('/').to_string();

        info!("Remote proxy bound to {} for model '{}'", base_url, opts.model);
        self.session.store(Some(Arc::new(Session {
            api_key,
            base_url,
            model: opts.model,
        })));
        Ok(())
    }

    async fn predict(&self, _ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Reply> {
        let session = self.session()?;
        let body = Self::request_body(&session, &opts, false);
        let response = self.post_chat(&session, &body, false).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::model(format!("failed to decode response: {}", e)))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| WorkerError::model("no choices in response"))?;
        let content = choice.message.and_then(|m| m.content).unwrap_or_default();
        let usage = completion.usage.unwrap_or_default();

        Ok(Reply {
            message: content.into_bytes(),
            tokens: usage.completion_tokens,
            prompt_tokens: usage.prompt_tokens,
        })
    }

    async fn predict_stream(
        &self,
        ctx: &CallContext,
        opts: PredictOptions,
        tokens: TokenSender,
    ) -> WorkerResult<()> {
        let session = self.session()?;
        let body = Self::request_body(&session, &opts, true);
        let response = self.post_chat(&session, &body, true).await?;

        let mut body = response.bytes_stream();
        let mut lines = SseLineBuffer::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.done() => return Err(WorkerError::Cancelled),
                chunk = body.next() => chunk,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("Upstream stream read failed: {}", e);
                    return Err(WorkerError::Transport(e.to_string()));
                }
            };
            for line in lines.push(&chunk) {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some(data) = data_payload(line) else { continue };
                if data.trim() == DONE_MARKER {
                    return Ok(());
                }
                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("Skipping unparseable chunk: {}", e);
                        continue;
                    }
                };
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content)
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                if tokens.send(content).await.is_err() {
                    debug!("Token receiver dropped, stopping upstream read");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn embeddings(&self, _ctx: &CallContext, opts: PredictOptions) -> WorkerResult<Vec<f32>> {
        let session = self.session()?;
        let input = if opts.embeddings.is_empty() { opts.prompt } else { opts.embeddings };
        let response = self
            .http
            .post(format!("{}/embeddings", session.base_url))
            .bearer_auth(&session.api_key)
            .json(&EmbeddingRequest {
                model: &session.model,
                input: vec![input],
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::remote_http(status.as_u16(), &body));
        }
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| WorkerError::model(format!("failed to decode embeddings: {}", e)))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| WorkerError::model("no embedding in response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Each test uses its own variable names so parallel tests never race on the environment.
    fn settings(tag: &str, base: &str) -> RemoteSettings {
        let key_env = format!("REMOTE_TEST_KEY_{}", tag);
        let base_env = format!("REMOTE_TEST_BASE_{}", tag);
        std::env::set_var(&key_env, "sk-test");
        std::env::set_var(&base_env, base);
        RemoteSettings {
            api_key_env: key_env,
            base_url_env: base_env,
            default_base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    async fn loaded(tag: &str, base: &str) -> RemoteOpenAIBackend {
        let backend = RemoteOpenAIBackend::with_settings(settings(tag, base));
        backend
            .load(ModelOptions {
                model: "gpt-test".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_load_requires_api_key() {
        let backend = RemoteOpenAIBackend::with_settings(RemoteSettings {
            api_key_env: "REMOTE_TEST_KEY_MISSING".into(),
            base_url_env: "REMOTE_TEST_BASE_MISSING".into(),
            default_base_url: DEFAULT_BASE_URL.into(),
        });
        let err = backend
            .load(ModelOptions { model: "m".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkerError::LoadFailed("REMOTE_TEST_KEY_MISSING environment variable is required".into())
        );
    }

    #[tokio::test]
    async fn test_predict_posts_non_streaming_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-test",
                "messages": [{"role": "user", "content": "2+2?"}],
                "stream": false
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"4"}}],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#)
            .create_async()
            .await;

        let backend = loaded("PREDICT", &server.url()).await;
        let opts = PredictOptions {
            messages: vec![ChatMessage::new("user", "2+2?")],
            ..Default::default()
        };
        let reply = backend.predict(&CallContext::background(), opts).await.unwrap();
        assert_eq!(reply.text(), "4");
        assert_eq!(reply.prompt_tokens, 5);
        assert_eq!(reply.tokens, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_prompt_becomes_single_user_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({
                "messages": [{"role": "user", "content": "hello"}],
                "max_tokens": 16
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"hi"}}]}"#)
            .create_async()
            .await;

        let backend = loaded("PROMPT", &server.url()).await;
        let opts = PredictOptions {
            prompt: "hello".into(),
            tokens: 16,
            ..Default::default()
        };
        let reply = backend.predict(&CallContext::background(), opts).await.unwrap();
        assert_eq!(reply.text(), "hi");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_200_carries_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body("invalid api key")
            .create_async()
            .await;

        let backend = loaded("UNAUTH", &server.url()).await;
        let err = backend
            .predict(&CallContext::background(), PredictOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::RemoteHttp { status: 401, body: "invalid api key".into() });
    }

    #[tokio::test]
    async fn test_empty_choices_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let backend = loaded("NOCHOICE", &server.url()).await;
        let err = backend
            .predict(&CallContext::background(), PredictOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, WorkerError::model("no choices in response"));
    }

    #[tokio::test]
    async fn test_stream_relays_deltas() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_header("accept", "text/event-stream")
            .match_body(Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "data:{\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                 : keep-alive\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
                 data: [DONE]\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
            )
            .create_async()
            .await;

        let backend = loaded("STREAM", &server.url()).await;
        let (tx, mut rx) = mpsc::channel(16);
        backend
            .predict_stream(&CallContext::background(), PredictOptions::default(), tx)
            .await
            .unwrap();

        let mut tokens = Vec::new();
        while let Some(t) = rx.recv().await {
            tokens.push(t);
        }
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_stream_non_200_fails_before_tokens() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let backend = loaded("STREAMERR", &server.url()).await;
        let (tx, mut rx) = mpsc::channel(4);
        let err = backend
            .predict_stream(&CallContext::background(), PredictOptions::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::RemoteHttp { status: 500, .. }));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_predict_before_load() {
        let backend = RemoteOpenAIBackend::new();
        let err = backend
            .predict(&CallContext::background(), PredictOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArgument(_)));
    }
}
