//! Error categories surfaced at the worker wire boundary.
//!
//! Every failure that leaves a worker is one of these variants. The stable
//! string returned by [`WorkerError::code`] is what travels over the wire,
//! and the network client rebuilds the same variant from it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::wire::WireStatus;

/// Longest upstream body kept inside a `RemoteHttp` error.
const BODY_SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("unimplemented")]
    Unimplemented,

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    LoadFailed(String),

    #[error("{0}")]
    ModelError(String),

    #[error("API returned status {status}: {body}")]
    RemoteHttp { status: u16, body: String },

    #[error("checksum mismatch: expected {expected}, got {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("previous response not found: {0}")]
    PreviousResponseNotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::ModelError(msg.into())
    }

    /// Builds a `RemoteHttp` error, truncating the body to a short snippet.
    pub fn remote_http(status: u16, body: &str) -> Self {
        let body = if body.len() > BODY_SNIPPET_LIMIT {
            let mut cut = BODY_SNIPPET_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &body[..cut])
        } else {
            body.to_string()
        };
        Self::RemoteHttp { status, body }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unimplemented => "unimplemented",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::LoadFailed(_) => "load_failed",
            Self::ModelError(_) => "model_error",
            Self::RemoteHttp { .. } => "remote_http_error",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::PreviousResponseNotFound(_) => "previous_response_not_found",
            Self::Cancelled => "cancelled",
            Self::Transport(_) => "transport",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::PreviousResponseNotFound(_) => StatusCode::NOT_FOUND,
            Self::RemoteHttp { .. } | Self::Transport(_) => StatusCode::BAD_GATEWAY,
            // 499 is not a registered code but every proxy understands it
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
            Self::LoadFailed(_) | Self::ModelError(_) | Self::ChecksumMismatch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_status(&self) -> WireStatus {
        let message = match self {
            Self::RemoteHttp { status, body } => format!("{}|{}", status, body),
            Self::ChecksumMismatch { expected, computed } => format!("{}|{}", expected, computed),
            Self::InvalidArgument(m)
            | Self::LoadFailed(m)
            | Self::ModelError(m)
            | Self::PreviousResponseNotFound(m)
            | Self::Transport(m) => m.clone(),
            Self::Unimplemented | Self::Cancelled => self.to_string(),
        };
        WireStatus {
            code: self.code().to_string(),
            message,
        }
    }

    /// Inverse of [`WorkerError::to_status`]. Unknown codes become `ModelError`.
    pub fn from_status(status: WireStatus) -> Self {
        let WireStatus { code, message } = status;
        match code.as_str() {
            "unimplemented" => Self::Unimplemented,
            "invalid_argument" => Self::InvalidArgument(message),
            "load_failed" => Self::LoadFailed(message),
            "remote_http_error" => match message.split_once('|') {
                Some((status, body)) => Self::RemoteHttp {
                    status: status.parse().unwrap_or(502),
                    body: body.to_string(),
                },
                None => Self::RemoteHttp { status: 502, body: message },
            },
            "checksum_mismatch" => match message.split_once('|') {
                Some((expected, computed)) => Self::ChecksumMismatch {
                    expected: expected.to_string(),
                    computed: computed.to_string(),
                },
                None => Self::ChecksumMismatch { expected: message, computed: String::new() },
            },
            "previous_response_not_found" => Self::PreviousResponseNotFound(message),
            "cancelled" => Self::Cancelled,
            "transport" => Self::Transport(message),
            _ => Self::ModelError(message),
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("malformed JSON: {}", err))
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::ModelError(err.to_string())
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        (self.http_status(), Json(self.to_status())).into_response()
    }
}
