// inference-gateway/src/lib.rs

pub mod api;
pub mod backends;
pub mod config;
pub mod error;
pub mod functions;
pub mod metrics;
pub mod model_config;
pub mod model_loader;
pub mod reasoning;
pub mod release;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod templates;
pub mod wire;
pub mod worker;

// Public API exports
pub use config::Config;
pub use error::{WorkerError, WorkerResult};
pub use model_config::ModelConfig;
pub use model_loader::ModelLoader;
pub use release::ReleaseManager;
pub use server::{build_router, run_server};
pub use shared_state::AppState;
pub use worker::{Backend, CallContext, WorkerClient, WorkerRuntime};

// API exports
pub use api::{chat_completions, completions, embeddings, generate_image, responses_ws};
