//! Audio endpoints: transcription, text to speech and sound generation.

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::{SoundGenerationBody, SpeechRequest};
use super::{load_worker, new_id, request_config, resolve_model, ApiError, ApiResult};
use crate::shared_state::AppState;
use crate::wire::{SoundGenerationRequest, TranscriptRequest, TranscriptResult, TtsRequest};
use crate::worker::CancelOnDrop;

/// Removes the wrapped file when dropped.
struct TempUpload(PathBuf);

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!("Upload {} already gone: {}", self.0.display(), e);
        }
    }
}

fn safe_file_name(name: &str) -> String {
    let base = Path::new(name).file_name().and_then(|n| n.to_str()).unwrap_or("audio");
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `POST /v1/audio/transcriptions` (multipart: `file`, `model`, `language`).
pub async fn transcribe(State(state): State<AppState>, headers: HeaderMap, mut multipart: Multipart) -> ApiResult<Json<TranscriptResult>> {
    let mut model = String::new();
    let mut language = String::new();
    let mut translate = false;
    let mut upload: Option<TempUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "model" => model = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?,
            "language" => language = field.text().await.map_err(|e| ApiError::bad_request(e.to_string()))?,
            "translate" => translate = field.text().await.map(|v| v == "true").unwrap_or(false),
            "file" => {
                let name = safe_file_name(field.file_name().unwrap_or("audio"));
                let bytes = field.bytes().await.map_err(|e| ApiError::bad_request(e.to_string()))?;
                let dir = &state.config.upload_dir;
                tokio::fs::create_dir_all(dir).await.map_err(|e| ApiError::internal(e.to_string()))?;
                let path = dir.join(format!("{}-{}", new_id("upload"), name));
                tokio::fs::write(&path, &bytes).await.map_err(|e| ApiError::internal(e.to_string()))?;
                upload = Some(TempUpload(path));
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("file is required"))?;
    let model = resolve_model(&state, None, &model, &headers, true)?;
    info!("Transcribing {} with model '{}'", upload.0.display(), model);

    let config = request_config(&state, &model, &Default::default());
    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;
    let request = TranscriptRequest {
        dst: upload.0.to_string_lossy().into_owned(),
        language,
        threads: config.threads.unwrap_or_default().max(0) as u32,
        translate,
    };
    let result = loaded.client.audio_transcription(&ctx, request).await?;
    Ok(Json(result))
}

async fn audio_file_response(path: &Path) -> ApiResult<Response> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::internal(format!("reading {}: {}", path.display(), e)))?;
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Could not remove {}: {}", path.display(), e);
    }
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "audio/wav")], Body::from(bytes)).into_response())
}

fn audio_dst(state: &AppState, prefix: &str) -> ApiResult<PathBuf> {
    let dir = state.config.generated_content_dir.join("audio");
    std::fs::create_dir_all(&dir).map_err(|e| ApiError::internal(format!("creating {}: {}", dir.display(), e)))?;
    Ok(dir.join(format!("{}.wav", new_id(prefix))))
}

/// `POST /v1/audio/speech` and `/tts`. Responds with the WAV bytes.
pub async fn speech(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<SpeechRequest>) -> ApiResult<Response> {
    if req.input.is_empty() {
        return Err(ApiError::bad_request("input is required"));
    }
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    let config = request_config(&state, &model, &Default::default());
    let voice = if req.voice.is_empty() { config.voice.clone() } else { req.voice.clone() };
    let dst = audio_dst(&state, "tts")?;
    info!("Speech for {} chars with model '{}'", req.input.len(), model);

    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;
    let request = TtsRequest {
        text: req.input,
        model: config.model_file().to_string(),
        dst: dst.to_string_lossy().into_owned(),
        voice,
        language: req.language,
    };
    loaded.client.tts(&ctx, request).await?;
    audio_file_response(&dst).await
}

/// `POST /v1/sound-generation`
pub async fn sound_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SoundGenerationBody>,
) -> ApiResult<Response> {
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    let config = request_config(&state, &model, &Default::default());
    let dst = audio_dst(&state, "sound")?;

    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;
    let request = SoundGenerationRequest {
        text: req.text,
        model: config.model_file().to_string(),
        dst: dst.to_string_lossy().into_owned(),
        duration: req.duration,
        temperature: req.temperature,
        sample: req.sample,
        src: None,
    };
    loaded.client.sound_generation(&ctx, request).await?;
    audio_file_response(&dst).await
}
