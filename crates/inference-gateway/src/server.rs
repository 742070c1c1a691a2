//! Gateway startup: builds the shared state, mounts the OpenAI-compatible
//! routes and serves them until Ctrl-C, then stops every worker.

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{admin_api, audio_api, image_api, worker_api};
use crate::config::Config;
use crate::shared_state::AppState;

/// Runs the gateway with `cfg` until interrupted.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let state = AppState::new(cfg)?;
    let loader = state.loader.clone();

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
        })
        .await?;

    loader.shutdown_all();
    info!("Gateway stopped");
    Ok(())
}

/// The full public router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    let images = ServeDir::new(image_api::images_dir(&state));
    let body_limit = state.config.upload_limit_bytes();
    let timeout = state.config.request_timeout();

    Router::new()
        // chat and completions
        .route("/v1/chat/completions", post(crate::api::chat_completions))
        .route("/chat/completions", post(crate::api::chat_completions))
        .route("/v1/engines/:model/chat/completions", post(crate::api::chat_completions_for_model))
        .route("/v1/completions", post(crate::api::completions))
        .route("/completions", post(crate::api::completions))
        .route("/v1/embeddings", post(crate::api::embeddings))
        .route("/embeddings", post(crate::api::embeddings))
        .route("/v1/responses", get(crate::api::responses_ws))
        // media
        .route("/v1/images/generations", post(crate::api::generate_image))
        .nest_service(image_api::IMAGES_ROUTE, images)
        .route("/v1/audio/transcriptions", post(audio_api::transcribe))
        .route("/v1/audio/speech", post(audio_api::speech))
        .route("/tts", post(audio_api::speech))
        .route("/v1/sound-generation", post(audio_api::sound_generation))
        // direct worker projections
        .route("/tokenize", post(worker_api::tokenize))
        .route("/v1/tokenize", post(worker_api::tokenize))
        .route("/rerank", post(worker_api::rerank))
        .route("/v1/rerank", post(worker_api::rerank))
        .route("/stores/set", post(worker_api::stores_set))
        .route("/stores/delete", post(worker_api::stores_delete))
        .route("/stores/get", post(worker_api::stores_get))
        .route("/stores/find", post(worker_api::stores_find))
        // admin
        .route("/healthz", get(admin_api::health))
        .route("/readyz", get(admin_api::health))
        .route("/version", get(admin_api::version))
        .route("/v1/models", get(admin_api::list_models))
        .route("/models", get(admin_api::list_models))
        .route("/backend/monitor", get(admin_api::backend_monitor).post(admin_api::backend_monitor))
        .route("/backend/shutdown", post(admin_api::backend_shutdown))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(middleware::from_fn(crate::metrics::track_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout.max(Duration::from_secs(1))))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{state_with, Scripted};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_and_models_routes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"").unwrap();
        let app = build_router(state_with(dir.path(), vec![], vec![]));

        let resp = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let list: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(list["data"][0]["id"], "tiny.gguf");
    }

    #[tokio::test]
    async fn test_generated_images_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![("m", Scripted::replying(&[]))]);
        let images = image_api::images_dir(&state);
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("cat.png"), b"png bytes").unwrap();

        let resp = build_router(state)
            .oneshot(Request::get("/generated-images/cat.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"png bytes");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let resp = build_router(state_with(dir.path(), vec![], vec![]))
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
