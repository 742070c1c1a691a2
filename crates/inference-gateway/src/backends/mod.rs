//! Concrete workers.
//!
//! - `store`: in-process vector key/value store
//! - `remote_openai`: proxy to an OpenAI-compatible HTTP endpoint
//! - `process`: any other backend, run as its own worker binary

pub mod process;
pub mod remote_openai;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use process::WorkerProcess;
pub use remote_openai::{RemoteOpenAIBackend, RemoteSettings};
pub use store::VectorStore;

use crate::worker::Backend;

/// Backends this binary can host itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Store,
    RemoteOpenAI,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "local-store",
            Self::RemoteOpenAI => "remote-openai",
        }
    }

    pub fn instantiate(&self) -> Arc<dyn Backend> {
        match self {
            Self::Store => Arc::new(VectorStore::new()),
            Self::RemoteOpenAI => Arc::new(RemoteOpenAIBackend::new()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "store" | "local-store" | "stores" => Ok(Self::Store),
            "remote-openai" | "openai" | "avian" => Ok(Self::RemoteOpenAI),
            other => Err(anyhow::anyhow!("unknown in-process backend '{}'", other)),
        }
    }
}
