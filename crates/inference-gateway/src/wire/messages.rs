use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{WorkerError, WorkerResult};

/// Bytes travel as standard base64 strings inside JSON bodies.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Request to a text worker.
///
/// Cancellation is not part of the message: callers pass a
/// [`CallContext`](crate::worker::CallContext) next to it, and over the wire
/// it is carried by the connection lifetime plus the deadline header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    pub prompt: String,
    pub messages: Vec<ChatMessage>,

    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub tokens: i32,
    pub mirostat: i32,
    pub mirostat_eta: f32,
    pub mirostat_tau: f32,
    pub tail_free_sampling_z: f32,
    pub typical_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub repeat_penalty: f32,
    pub seed: i32,

    pub stop_prompts: Vec<String>,
    pub grammar: String,
    pub ignore_eos: bool,
    pub negative_prompt: String,
    pub negative_prompt_scale: f32,

    pub batch: i32,
    pub n_keep: i32,
    pub prompt_cache_path: String,
    pub prompt_cache_all: bool,
    pub prompt_cache_ro: bool,
    pub n_draft: i32,

    pub threads: i32,
    pub main_gpu: String,
    pub tensor_split: String,
    pub mmap: bool,
    pub mlock: bool,
    pub f16_kv: bool,
    pub low_vram: bool,
    pub numa: bool,
    pub debug: bool,

    /// Text to embed, for `Embedding` calls.
    pub embeddings: String,
}

/// One streamed token, or the whole answer of a unary `Predict`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reply {
    #[serde(with = "b64")]
    pub message: Vec<u8>,
    pub tokens: i32,
    pub prompt_tokens: i32,
}

impl Reply {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            message: text.into().into_bytes(),
            ..Default::default()
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub model: String,
    pub model_file: String,
    pub model_path: String,
    pub threads: i32,
    pub context_size: i32,
    pub f16: bool,
    pub n_gpu_layers: i32,
    pub n_batch: i32,
    pub n_gqa: i32,
    pub rms_norm_eps: f32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub main_gpu: String,
    pub tensor_split: String,
    pub mmap: bool,
    pub lora_adapter: String,
    pub lora_base: String,
    pub draft_model: String,
    pub scheduler_type: String,
    pub embeddings: bool,
    pub reranking: bool,
    pub library_search_path: String,
    pub cfg_scale: f32,
    pub tokenizer: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMessage {}

/// Generic unary outcome, `{success, message}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireResult {
    pub success: bool,
    pub message: String,
}

impl WireResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingResult {
    pub embeddings: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateImageRequest {
    pub height: i32,
    pub width: i32,
    pub step: i32,
    pub seed: i32,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub dst: String,
    pub src: String,
    /// Legacy channel, `mask:<path>` and `sampler:<name>` entries only.
    pub enable_parameters: String,
    pub ref_images: Vec<String>,
    pub options: BTreeMap<String, String>,
}

impl GenerateImageRequest {
    /// Options with the legacy `enable_parameters` entries folded in.
    /// Explicit `options` entries win over legacy ones.
    pub fn effective_options(&self) -> WorkerResult<BTreeMap<String, String>> {
        let mut merged = BTreeMap::new();
        for entry in self
            .enable_parameters
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            match entry.split_once(':') {
                Some((key @ ("mask" | "sampler"), value)) if !value.is_empty() => {
                    merged.insert(key.to_string(), value.to_string());
                }
                _ => {
                    return Err(WorkerError::invalid(format!(
                        "unsupported enable_parameters entry '{}': expected mask:<path> or sampler:<name>",
                        entry
                    )))
                }
            }
        }
        for (k, v) in &self.options {
            merged.insert(k.clone(), v.clone());
        }
        Ok(merged)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateVideoRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub start_image: String,
    pub end_image: String,
    pub width: i32,
    pub height: i32,
    pub num_frames: i32,
    pub fps: i32,
    pub seed: i32,
    pub cfg_scale: f32,
    pub step: i32,
    pub dst: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsRequest {
    pub text: String,
    pub model: String,
    pub dst: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundGenerationRequest {
    pub text: String,
    pub model: String,
    pub dst: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptRequest {
    /// Path of the audio file on the worker's filesystem.
    pub dst: String,
    pub language: String,
    pub threads: u32,
    pub translate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptSegment {
    pub id: i32,
    /// Offsets in nanoseconds.
    pub start: i64,
    pub end: i64,
    pub text: String,
    pub tokens: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptResult {
    pub segments: Vec<TranscriptSegment>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadRequest {
    pub audio: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSegment {
    pub start: f32,
    pub end: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadResponse {
    pub segments: Vec<VadSegment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOptions {
    pub src: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectResponse {
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizationResponse {
    pub length: i32,
    pub tokens: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
    pub top_n: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankUsage {
    pub total_tokens: i32,
    pub prompt_tokens: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentResult {
    pub index: i32,
    pub text: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankResult {
    pub usage: RerankUsage,
    pub results: Vec<DocumentResult>,
}

/// Token throughput of the last prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsResponse {
    pub slot_id: i32,
    pub prompt_json_for_slot: String,
    pub tokens_per_second: f32,
    pub tokens_generated: i32,
    pub prompt_tokens_processed: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresKey {
    pub floats: Vec<f32>,
}

impl From<Vec<f32>> for StoresKey {
    fn from(floats: Vec<f32>) -> Self {
        Self { floats }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresValue {
    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
}

impl From<Vec<u8>> for StoresValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresSetOptions {
    pub keys: Vec<StoresKey>,
    pub values: Vec<StoresValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresDeleteOptions {
    pub keys: Vec<StoresKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresGetOptions {
    pub keys: Vec<StoresKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresGetResult {
    pub keys: Vec<StoresKey>,
    pub values: Vec<StoresValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresFindOptions {
    pub key: StoresKey,
    pub top_k: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresFindResult {
    pub keys: Vec<StoresKey>,
    pub values: Vec<StoresValue>,
    pub similarities: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoresResetOptions {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    Uninitialized,
    Ready,
    Busy,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryUsageData {
    pub total: u64,
    pub breakdown: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsageData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_message_travels_as_base64() {
        let reply = Reply::from_text("hi");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["message"], "aGk=");

        let back: Reply = serde_json::from_value(json).unwrap();
        assert_eq!(back.text(), "hi");
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let opts: PredictOptions = serde_json::from_str(r#"{"prompt":"hello"}"#).unwrap();
        assert_eq!(opts.prompt, "hello");
        assert_eq!(opts.tokens, 0);
        assert!(opts.messages.is_empty());
    }

    #[test]
    fn test_worker_state_wire_names() {
        let status = StatusResponse {
            state: WorkerState::Busy,
            memory: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"state":"BUSY"}"#);
    }

    #[test]
    fn test_legacy_image_parameters() {
        let req = GenerateImageRequest {
            enable_parameters: "mask:/tmp/mask.png, sampler:euler_a".into(),
            ..Default::default()
        };
        let opts = req.effective_options().unwrap();
        assert_eq!(opts.get("mask").map(String::as_str), Some("/tmp/mask.png"));
        assert_eq!(opts.get("sampler").map(String::as_str), Some("euler_a"));
    }

    #[test]
    fn test_options_override_legacy_parameters() {
        let mut options = BTreeMap::new();
        options.insert("sampler".to_string(), "dpm".to_string());
        let req = GenerateImageRequest {
            enable_parameters: "sampler:euler_a".into(),
            options,
            ..Default::default()
        };
        let opts = req.effective_options().unwrap();
        assert_eq!(opts.get("sampler").map(String::as_str), Some("dpm"));
    }

    #[test]
    fn test_legacy_image_parameters_reject_other_keys() {
        let req = GenerateImageRequest {
            enable_parameters: "negative_prompt,num_inference_steps".into(),
            ..Default::default()
        };
        assert!(matches!(
            req.effective_options(),
            Err(WorkerError::InvalidArgument(_))
        ));
    }
}
