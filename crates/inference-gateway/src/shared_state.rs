//! State shared by every gateway handler.
//!
//! Everything here is behind an `Arc` and read-mostly; the only mutable
//! pieces are the model loader's worker cache, the stored responses and the
//! request counters.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::api::responses_api::ResponseStore;
use crate::config::Config;
use crate::model_config::{ConfigLoader, ModelDefaults};
use crate::model_loader::ModelLoader;
use crate::templates::TemplateEngine;
use crate::worker::CallContext;

/// Atomic counters for gateway activity.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub total_requests: AtomicUsize,
    pub streamed_responses: AtomicUsize,
    pub function_calls: AtomicUsize,
}

impl AtomicCounters {
    pub fn inc_total_requests(&self) -> usize {
        self.total_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_streamed_responses(&self) -> usize {
        self.streamed_responses.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_function_calls(&self) -> usize {
        self.function_calls.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub configs: Arc<ConfigLoader>,
    pub loader: Arc<ModelLoader>,
    pub templates: Arc<TemplateEngine>,
    pub responses: Arc<ResponseStore>,
    pub counters: Arc<AtomicCounters>,
}

impl AppState {
    /// Reads the model configs from `config.models_path` and builds the loader.
    pub fn new(config: Config) -> Result<Self> {
        let configs = Arc::new(ConfigLoader::new(&config.models_path));
        let count = configs.load_all()?;
        info!("{} model configs available", count);
        Ok(Self::with_configs(config, configs))
    }

    pub fn with_configs(config: Config, configs: Arc<ConfigLoader>) -> Self {
        let loader = Arc::new(ModelLoader::new(Arc::clone(&configs), config.worker_binary_dir.clone()));
        let templates = Arc::new(TemplateEngine::new(&config.models_path));
        let responses = Arc::new(ResponseStore::new(config.responses_ttl()));
        Self {
            config: Arc::new(config),
            configs,
            loader,
            templates,
            responses,
            counters: Arc::new(AtomicCounters::default()),
        }
    }

    pub fn defaults(&self) -> ModelDefaults {
        self.config.model_defaults()
    }

    /// A fresh context bounded by the request timeout.
    pub fn request_context(&self) -> CallContext {
        CallContext::with_timeout(self.config.request_timeout())
    }
}
