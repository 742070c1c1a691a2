//! `POST /v1/images/generations`
//!
//! The worker writes each image to a file under the generated content
//! directory. Files are either returned inline as base64 (and removed) or
//! served back from `/generated-images`.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::{DataItem, ImageRequest, OpenAIResponse};
use super::{load_worker, new_id, request_config, resolve_model, unix_now, ApiError, ApiResult};
use crate::shared_state::AppState;
use crate::wire::GenerateImageRequest;
use crate::worker::CancelOnDrop;

pub const IMAGES_ROUTE: &str = "/generated-images";
const DEFAULT_SIZE: (i32, i32) = (512, 512);

/// Parses `WIDTHxHEIGHT`. An empty size means 512x512.
pub fn parse_size(size: &str) -> ApiResult<(i32, i32)> {
    if size.trim().is_empty() {
        return Ok(DEFAULT_SIZE);
    }
    let invalid = || ApiError::bad_request(format!("invalid size '{}', expected WIDTHxHEIGHT", size));
    let (w, h) = size.trim().split_once('x').ok_or_else(invalid)?;
    let width: i32 = w.parse().map_err(|_| invalid())?;
    let height: i32 = h.parse().map_err(|_| invalid())?;
    if width <= 0 || height <= 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Splits `positive|negative`; an explicit negative prompt wins.
pub fn split_prompt(prompt: &str, negative: &str) -> (String, String) {
    match prompt.split_once('|') {
        Some((pos, neg)) if negative.is_empty() => (pos.to_string(), neg.to_string()),
        Some((pos, _)) => (pos.to_string(), negative.to_string()),
        None => (prompt.to_string(), negative.to_string()),
    }
}

pub fn images_dir(state: &AppState) -> PathBuf {
    state.config.generated_content_dir.join("images")
}

/// Decodes a base64 source image into the upload dir. Anything that does not
/// decode is passed through as a path.
fn source_image(upload_dir: &Path, file: &str) -> ApiResult<String> {
    if file.is_empty() {
        return Ok(String::new());
    }
    let payload = file.split_once("base64,").map(|(_, b)| b).unwrap_or(file);
    match STANDARD.decode(payload.trim()) {
        Ok(bytes) => {
            std::fs::create_dir_all(upload_dir).map_err(|e| ApiError::internal(e.to_string()))?;
            let path = upload_dir.join(format!("{}.png", new_id("src")));
            std::fs::write(&path, bytes).map_err(|e| ApiError::internal(e.to_string()))?;
            Ok(path.to_string_lossy().into_owned())
        }
        Err(_) => Ok(file.to_string()),
    }
}

pub async fn generate_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Json<OpenAIResponse>> {
    let model = resolve_model(&state, None, &req.model, &headers, true)?;
    let (width, height) = parse_size(&req.size)?;
    let (positive, negative) = split_prompt(&req.prompt, &req.negative_prompt);
    let count = req.n.unwrap_or(1).max(1);
    let inline = req.response_format == "b64_json";
    info!("Generating {} image(s) of {}x{} with model '{}'", count, width, height, model);

    let config = request_config(&state, &model, &Default::default());
    let dir = images_dir(&state);
    std::fs::create_dir_all(&dir).map_err(|e| ApiError::internal(format!("creating {}: {}", dir.display(), e)))?;
    let src = source_image(&state.config.upload_dir, &req.file)?;

    let ctx = state.request_context();
    let _cancel = CancelOnDrop(ctx.token().clone());
    let loaded = load_worker(&state, &ctx, &config).await?;
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.config.api_host, state.config.api_port));

    let mut data = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let file_name = format!("{}.png", new_id("b64"));
        let dst = dir.join(&file_name);
        let request = GenerateImageRequest {
            height,
            width,
            step: if req.step > 0 { req.step } else { config.step },
            seed: req.seed.or(config.parameters.seed).unwrap_or(-1),
            positive_prompt: positive.clone(),
            negative_prompt: negative.clone(),
            dst: dst.to_string_lossy().into_owned(),
            src: src.clone(),
            ref_images: req.ref_images.clone(),
            options: req.options.clone(),
            ..Default::default()
        };
        loaded.client.generate_image(&ctx, request).await?;
        debug!("Image {} written to {}", index, dst.display());

        let mut item = DataItem { index, ..Default::default() };
        if inline {
            let bytes = std::fs::read(&dst).map_err(|e| ApiError::internal(format!("reading {}: {}", dst.display(), e)))?;
            if let Err(e) = std::fs::remove_file(&dst) {
                warn!("Could not remove {}: {}", dst.display(), e);
            }
            item.b64_json = Some(STANDARD.encode(bytes));
        } else {
            item.url = Some(format!("http://{}{}/{}", host, IMAGES_ROUTE, file_name));
        }
        data.push(item);
    }

    if src.starts_with(&*state.config.upload_dir.to_string_lossy()) {
        std::fs::remove_file(&src).ok();
    }

    Ok(Json(OpenAIResponse {
        id: new_id("img"),
        created: unix_now(),
        model: req.model,
        data,
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{state_with, Scripted};
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("").unwrap(), (512, 512));
        assert_eq!(parse_size("256x128").unwrap(), (256, 128));
        assert!(parse_size("big").is_err());
        assert!(parse_size("0x10").is_err());
    }

    #[test]
    fn test_split_prompt() {
        assert_eq!(split_prompt("cat|blurry", ""), ("cat".into(), "blurry".into()));
        assert_eq!(split_prompt("cat|blurry", "dark"), ("cat".into(), "dark".into()));
        assert_eq!(split_prompt("cat", ""), ("cat".into(), "".into()));
    }

    #[tokio::test]
    async fn test_b64_response_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![("sd", Scripted::replying(&[]))]);
        let req: ImageRequest =
            serde_json::from_value(json!({"model": "sd", "prompt": "cat", "size": "64x32", "response_format": "b64_json"})).unwrap();

        let Json(resp) = generate_image(State(state.clone()), HeaderMap::new(), Json(req)).await.unwrap();
        let encoded = resp.data[0].b64_json.clone().unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), b"64x32");
        assert_eq!(std::fs::read_dir(images_dir(&state)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_url_response_uses_host_header() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(dir.path(), vec![], vec![("sd", Scripted::replying(&[]))]);
        let req: ImageRequest = serde_json::from_value(json!({"model": "sd", "prompt": "cat", "n": 2})).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gw.local:9000"));

        let Json(resp) = generate_image(State(state), headers, Json(req)).await.unwrap();
        assert_eq!(resp.data.len(), 2);
        let url = resp.data[1].url.clone().unwrap();
        assert!(url.starts_with("http://gw.local:9000/generated-images/b64-"));
        assert_eq!(resp.data[1].index, 1);
    }
}
