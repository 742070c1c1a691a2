//! Worker wire contract.
//!
//! One request/reply family shared by every worker kind. Unary calls are
//! `POST /rpc/<Method>` with a JSON body; `PredictStream` answers with a
//! server-sent event stream of [`Reply`] frames.

pub mod messages;
pub mod sse;

pub use messages::*;

use serde::{Deserialize, Serialize};

/// Largest request or reply body accepted in either direction.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Fixed success token returned by `Health`.
pub const HEALTH_OK: &str = "OK";

/// Header carrying the caller's remaining deadline in milliseconds.
pub const DEADLINE_HEADER: &str = "x-worker-deadline-ms";

/// Error body of a failed call, `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStatus {
    pub code: String,
    pub message: String,
}

/// Method names, shared by the worker router and the network client.
pub mod method {
    pub const HEALTH: &str = "Health";
    pub const LOAD_MODEL: &str = "LoadModel";
    pub const PREDICT: &str = "Predict";
    pub const PREDICT_STREAM: &str = "PredictStream";
    pub const EMBEDDING: &str = "Embedding";
    pub const GENERATE_IMAGE: &str = "GenerateImage";
    pub const GENERATE_VIDEO: &str = "GenerateVideo";
    pub const TTS: &str = "TTS";
    pub const SOUND_GENERATION: &str = "SoundGeneration";
    pub const AUDIO_TRANSCRIPTION: &str = "AudioTranscription";
    pub const VAD: &str = "VAD";
    pub const DETECT: &str = "Detect";
    pub const TOKENIZE_STRING: &str = "TokenizeString";
    pub const RERANK: &str = "Rerank";
    pub const GET_TOKEN_METRICS: &str = "GetMetrics";
    pub const STATUS: &str = "Status";
    pub const STORES_SET: &str = "StoresSet";
    pub const STORES_DELETE: &str = "StoresDelete";
    pub const STORES_GET: &str = "StoresGet";
    pub const STORES_FIND: &str = "StoresFind";
    pub const STORES_RESET: &str = "StoresReset";

    pub fn path(name: &str) -> String {
        format!("/rpc/{}", name)
    }
}
