use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::model_config::ModelDefaults;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub models_path: PathBuf,
    pub threads: i32,
    pub context_size: i32,
    pub f16: bool,
    pub debug: bool,
    pub upload_limit_mb: usize,
    pub request_timeout_seconds: u64,
    pub health_check_timeout_seconds: u64,
    pub worker_binary_dir: Option<PathBuf>,
    /// Zero keeps stored responses until the process exits.
    pub responses_store_ttl_seconds: u64,
    pub stream_queue_size: usize,
    pub generated_content_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub release_owner: String,
    pub release_repo: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let threads = match var("THREADS", "auto").as_str() {
            "auto" => Self::auto_detect_threads(),
            raw => raw.parse().with_context(|| format!("THREADS must be a number or 'auto', got '{}'", raw))?,
        };

        let worker_binary_dir = lookup("WORKER_BINARY_DIR")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let generated_content_dir = lookup("GENERATED_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("inference-gateway").join("generated"));
        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("inference-gateway").join("uploads"));

        Ok(Self {
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: var("API_PORT", "8080").parse().context("API_PORT")?,
            models_path: PathBuf::from(var("MODELS_PATH", "./models")),
            threads,
            context_size: var("CONTEXT_SIZE", "512").parse().context("CONTEXT_SIZE")?,
            f16: parse_bool(&var("F16", "false")),
            debug: parse_bool(&var("DEBUG", "false")),
            upload_limit_mb: var("UPLOAD_LIMIT_MB", "15").parse().context("UPLOAD_LIMIT_MB")?,
            request_timeout_seconds: var("REQUEST_TIMEOUT_SECONDS", "600")
                .parse()
                .context("REQUEST_TIMEOUT_SECONDS")?,
            health_check_timeout_seconds: var("HEALTH_CHECK_TIMEOUT_SECONDS", "10")
                .parse()
                .context("HEALTH_CHECK_TIMEOUT_SECONDS")?,
            worker_binary_dir,
            responses_store_ttl_seconds: var("RESPONSES_STORE_TTL_SECONDS", "0")
                .parse()
                .context("RESPONSES_STORE_TTL_SECONDS")?,
            stream_queue_size: var("STREAM_QUEUE_SIZE", "64").parse().context("STREAM_QUEUE_SIZE")?,
            generated_content_dir,
            upload_dir,
            release_owner: var("RELEASE_OWNER", "mudler"),
            release_repo: var("RELEASE_REPO", "LocalAI"),
        })
    }

    fn auto_detect_threads() -> i32 {
        let cpus = num_cpus::get() as i32;
        info!("Auto‑detected CPU cores: {}", cpus);
        cpus.max(1)
    }

    pub fn model_defaults(&self) -> ModelDefaults {
        ModelDefaults {
            threads: self.threads,
            context_size: self.context_size,
            f16: self.f16,
            debug: self.debug,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn upload_limit_bytes(&self) -> usize {
        self.upload_limit_mb * 1024 * 1024
    }

    pub fn responses_ttl(&self) -> Option<Duration> {
        (self.responses_store_ttl_seconds > 0).then(|| Duration::from_secs(self.responses_store_ttl_seconds))
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Models Path: {}", self.models_path.display());
        info!("- Threads: {}", self.threads);
        info!("- Context Size: {}", self.context_size);
        info!("- F16: {}", self.f16);
        info!("- Upload Limit: {} MB", self.upload_limit_mb);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        match &self.worker_binary_dir {
            Some(dir) => info!("- Worker Binaries: {}", dir.display()),
            None => info!("- Worker Binaries: $PATH"),
        }
        info!("- Generated Content: {}", self.generated_content_dir.display());
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
