//! End-to-end tests: real worker listeners on loopback, the gateway router
//! driven with `oneshot`, and a mock OpenAI-compatible upstream.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use inference_gateway::backends::{RemoteOpenAIBackend, RemoteSettings, VectorStore};
use inference_gateway::worker::{server, store_client, CallContext, NetworkClient, WorkerClient, WorkerRuntime};
use inference_gateway::wire::ModelOptions;
use inference_gateway::{build_router, AppState, Backend, Config};
use mockito::Matcher;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::ServiceExt;

/// A worker serving `backend` on an ephemeral port; stops when dropped.
struct Worker {
    address: String,
    _stop: oneshot::Sender<()>,
}

async fn start_worker(backend: Arc<dyn Backend>) -> Worker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (stop, stopped) = oneshot::channel::<()>();
    let runtime = Arc::new(WorkerRuntime::new(backend));
    tokio::spawn(server::serve_listener(listener, runtime, async {
        stopped.await.ok();
    }));
    Worker { address, _stop: stop }
}

/// Remote proxy worker pointed at `upstream`, with env names private to `tag`.
fn remote_backend(tag: &str, upstream: &str) -> Arc<dyn Backend> {
    let api_key_env = format!("GATEWAY_IT_KEY_{}", tag);
    let base_url_env = format!("GATEWAY_IT_BASE_{}", tag);
    std::env::set_var(&api_key_env, "sk-test");
    std::env::set_var(&base_url_env, upstream);
    Arc::new(RemoteOpenAIBackend::with_settings(RemoteSettings {
        api_key_env,
        base_url_env,
        default_base_url: upstream.to_string(),
    }))
}

fn gateway(models: &Path, worker_address: &str) -> axum::Router {
    std::fs::write(
        models.join("gpt-test.yaml"),
        format!("name: gpt-test\naddress: {}\nparameters:\n  model: gpt-test\n", worker_address),
    )
    .unwrap();
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.models_path = models.to_path_buf();
    config.generated_content_dir = models.join("generated");
    config.upload_dir = models.join("uploads");
    build_router(AppState::new(config).unwrap())
}

fn chat_request(body: Value) -> Request<Body> {
    Request::post("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn chat_non_stream_through_remote_worker() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({"model": "gpt-test", "stream": false})))
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"4"}}]}"#)
        .create_async()
        .await;

    let worker = start_worker(remote_backend("NONSTREAM", &upstream.url())).await;
    let models = tempfile::tempdir().unwrap();
    let app = gateway(models.path(), &worker.address);

    let resp = app
        .oneshot(chat_request(json!({
            "model": "gpt-test",
            "messages": [{"role": "user", "content": "2+2?"}]
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "4");
    mock.assert_async().await;
}

#[tokio::test]
async fn chat_stream_through_remote_worker() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"4\"}}]}\n\ndata: [DONE]\n\n")
        .create_async()
        .await;

    let worker = start_worker(remote_backend("STREAM", &upstream.url())).await;
    let models = tempfile::tempdir().unwrap();
    let app = gateway(models.path(), &worker.address);

    let resp = app
        .oneshot(chat_request(json!({
            "model": "gpt-test",
            "stream": true,
            "messages": [{"role": "user", "content": "2+2?"}]
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/event-stream"));

    let text = body_text(resp).await;
    let frames: Vec<Value> = text
        .split("\n\n")
        .filter_map(|f| f.trim().strip_prefix("data:"))
        .map(str::trim)
        .filter(|d| *d != "[DONE]")
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(frames[1]["choices"][0]["delta"]["content"], "4");
    assert_eq!(frames[2]["choices"][0]["finish_reason"], "stop");
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn function_call_through_remote_worker() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("POST", "/chat/completions")
        .with_header("content-type", "application/json")
        .with_body(
            json!({"choices": [{"message": {
                "content": r#"{"function": "search", "arguments": {"query": "cats"}}"#
            }}]})
            .to_string(),
        )
        .create_async()
        .await;

    let worker = start_worker(remote_backend("FUNCTION", &upstream.url())).await;
    let models = tempfile::tempdir().unwrap();
    let app = gateway(models.path(), &worker.address);

    let resp = app
        .oneshot(chat_request(json!({
            "model": "gpt-test",
            "messages": [{"role": "user", "content": "find cats"}],
            "functions": [{"name": "search", "parameters": {"properties": {"query": {"type": "string"}}}}]
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
    let choice = &body["choices"][0];
    assert_eq!(choice["finish_reason"], "function_call");
    assert_eq!(choice["message"]["function_call"]["name"], "search");
    let arguments: Value =
        serde_json::from_str(choice["message"]["function_call"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments, json!({"query": "cats"}));
}

#[tokio::test]
async fn upstream_failure_surfaces_as_error() {
    let mut upstream = mockito::Server::new_async().await;
    upstream
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("overloaded")
        .create_async()
        .await;

    let worker = start_worker(remote_backend("FAILURE", &upstream.url())).await;
    let models = tempfile::tempdir().unwrap();
    let app = gateway(models.path(), &worker.address);

    let resp = app
        .oneshot(chat_request(json!({
            "model": "gpt-test",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();
    assert!(!resp.status().is_success());
    let body: Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["error"]["code"], "remote_http_error");
}

#[tokio::test]
async fn vector_store_over_loopback() {
    let worker = start_worker(Arc::new(VectorStore::new())).await;
    let client = NetworkClient::new(&worker.address);
    let ctx = CallContext::background();

    assert!(client.health_check(&ctx).await);
    let loaded = client.load_model(&ctx, ModelOptions::default()).await.unwrap();
    assert!(loaded.success);

    let keys = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0], vec![-1.0, 0.0, 0.0]];
    let values = ["x", "y", "z", "-x"].iter().map(|v| v.as_bytes().to_vec()).collect();
    store_client::set_cols(&client, &ctx, keys, values).await.unwrap();

    let (_, values, similarities) = store_client::find(&client, &ctx, vec![1.0, 0.0, 0.0], 4).await.unwrap();
    assert_eq!(values.first().map(Vec::as_slice), Some(&b"x"[..]));
    assert_eq!(values.last().map(Vec::as_slice), Some(&b"-x"[..]));
    let expected = [1.0, 0.0, 0.0, -1.0];
    for (got, want) in similarities.iter().zip(expected) {
        assert!((got - want).abs() < 1e-6, "{:?}", similarities);
    }

    let err = store_client::find(&client, &ctx, vec![1.0, 0.0, 0.0], 0).await.unwrap_err();
    assert_eq!(err.code(), "invalid_argument");
}

#[tokio::test]
async fn unsupported_capability_is_unimplemented_over_the_wire() {
    let worker = start_worker(Arc::new(VectorStore::new())).await;
    let client = NetworkClient::new(&worker.address);
    let ctx = CallContext::background();
    client.load_model(&ctx, ModelOptions::default()).await.unwrap();

    let err = client.predict(&ctx, Default::default()).await.unwrap_err();
    assert_eq!(err.code(), "unimplemented");
}
