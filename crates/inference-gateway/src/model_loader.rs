//! Model loader
//!
//! Resolves a model name to a ready worker client. Depending on its config a
//! model is served by an embedded backend (registered in the worker
//! registry), by an external worker already listening at `address`, or by a
//! worker binary spawned on demand. Each model is loaded once; concurrent
//! first requests share the same load.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backends::{BackendKind, WorkerProcess};
use crate::error::{WorkerError, WorkerResult};
use crate::model_config::{ConfigLoader, ModelConfig};
use crate::templates::TEMPLATE_EXTENSION;
use crate::wire::StatusResponse;
use crate::worker::{registry, Backend, CallContext, NetworkClient, WorkerClient};

/// A model with a live worker behind it.
pub struct LoadedModel {
    pub name: String,
    pub address: String,
    pub client: Arc<dyn WorkerClient>,
    embedded: bool,
    process: Option<WorkerProcess>,
}

impl LoadedModel {
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn is_spawned(&self) -> bool {
        self.process.is_some()
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        if self.embedded {
            registry::unregister(&self.address);
        }
    }
}

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

pub struct ModelLoader {
    models_path: PathBuf,
    worker_binary_dir: Option<PathBuf>,
    instance: String,
    configs: Arc<ConfigLoader>,
    loaded: DashMap<String, Slot>,
    /// Backends supplied by the embedding application, keyed by model name.
    injected: DashMap<String, Arc<dyn Backend>>,
}

impl ModelLoader {
    pub fn new(configs: Arc<ConfigLoader>, worker_binary_dir: Option<PathBuf>) -> Self {
        Self {
            models_path: configs.models_path().to_path_buf(),
            worker_binary_dir,
            instance: Uuid::new_v4().simple().to_string()[..8].to_string(),
            configs,
            loaded: DashMap::new(),
            injected: DashMap::new(),
        }
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    pub fn configs(&self) -> &Arc<ConfigLoader> {
        &self.configs
    }

    pub fn exists_in_model_path(&self, file: &str) -> bool {
        !file.is_empty() && !file.contains("..") && self.models_path.join(file).is_file()
    }

    /// Configured models plus bare model files, sorted and deduplicated.
    pub fn list_models(&self) -> Vec<String> {
        let mut names = self.configs.names();
        if let Ok(entries) = std::fs::read_dir(&self.models_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(file) = path.file_name().and_then(|f| f.to_str()) else { continue };
                let skip = file.starts_with('.')
                    || matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml") | Some("md") | Some("json") | Some("partial")
                    )
                    || path.extension().is_some_and(|e| e == TEMPLATE_EXTENSION);
                if !skip {
                    names.push(file.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Serves `model` with `backend` in process instead of what its config says.
    pub fn inject_backend(&self, model: &str, backend: Arc<dyn Backend>) {
        self.injected.insert(model.to_string(), backend);
    }

    fn embedded_address(&self, model: &str) -> String {
        format!("embedded://{}/{}", self.instance, model)
    }

    /// Returns the worker for `config`, loading it on first use.
    pub async fn load(&self, ctx: &CallContext, config: &ModelConfig) -> WorkerResult<Arc<LoadedModel>> {
        let slot: Slot = self
            .loaded
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        slot.get_or_try_init(|| self.start(ctx, config))
            .await
            .cloned()
    }

    async fn start(&self, ctx: &CallContext, config: &ModelConfig) -> WorkerResult<Arc<LoadedModel>> {
        info!("Loading model '{}' (backend: '{}')", config.name, config.backend);
        let model = self.connect(config).await?;

        let result = model
            .client
            .load_model(ctx, config.model_options(&self.models_path))
            .await
            .map_err(|e| {
                error!("Failed to load model '{}': {}", config.name, e);
                e
            })?;
        if !result.success {
            return Err(WorkerError::LoadFailed(result.message));
        }
        info!("✅ Model '{}' ready at {}", config.name, model.address);
        Ok(Arc::new(model))
    }

    async fn connect(&self, config: &ModelConfig) -> WorkerResult<LoadedModel> {
        let embedded_backend = match self.injected.get(&config.name) {
            Some(backend) => Some(Arc::clone(backend.value())),
            None => BackendKind::from_str(&config.backend).ok().map(|kind| kind.instantiate()),
        };

        if let Some(backend) = embedded_backend {
            let address = self.embedded_address(&config.name);
            registry::register(&address, backend);
            return Ok(LoadedModel {
                name: config.name.clone(),
                client: registry::client_for(&address),
                address,
                embedded: true,
                process: None,
            });
        }

        if !config.address.is_empty() {
            return Ok(LoadedModel {
                name: config.name.clone(),
                client: Arc::new(NetworkClient::new(&config.address)),
                address: config.address.clone(),
                embedded: false,
                process: None,
            });
        }

        if config.backend.is_empty() {
            return Err(WorkerError::invalid(format!("no backend configured for model '{}'", config.name)));
        }

        let binary = WorkerProcess::locate(self.worker_binary_dir.as_deref(), &config.backend)
            .map_err(|e| WorkerError::LoadFailed(e.to_string()))?;
        let process = WorkerProcess::spawn(&binary, &config.backend, &[])
            .await
            .map_err(|e| WorkerError::LoadFailed(e.to_string()))?;
        let address = process.address().to_string();
        Ok(LoadedModel {
            name: config.name.clone(),
            client: Arc::new(NetworkClient::new(&address)),
            address,
            embedded: false,
            process: Some(process),
        })
    }

    pub fn get(&self, model: &str) -> Option<Arc<LoadedModel>> {
        self.loaded.get(model).and_then(|slot| slot.get().cloned())
    }

    /// Names of the models with a live worker.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loaded
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Worker status for a loaded model.
    pub async fn status(&self, ctx: &CallContext, model: &str) -> WorkerResult<StatusResponse> {
        let loaded = self
            .get(model)
            .ok_or_else(|| WorkerError::invalid(format!("model '{}' is not loaded", model)))?;
        loaded.client.status(ctx).await
    }

    /// Stops one model's worker. Returns false if it was not loaded.
    pub fn shutdown_model(&self, model: &str) -> bool {
        match self.loaded.remove(model) {
            Some((_, slot)) => {
                info!("Shutting down model '{}'", model);
                slot.initialized()
            }
            None => {
                warn!("Shutdown requested for unknown model '{}'", model);
                false
            }
        }
    }

    pub fn shutdown_all(&self) {
        let names: Vec<String> = self.loaded.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.shutdown_model(&name);
        }
    }
}

impl Drop for ModelLoader {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::VectorStore;
    use crate::wire::ModelOptions;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoads(Arc<AtomicUsize>);

    #[async_trait]
    impl Backend for CountingLoads {
        fn name(&self) -> &str {
            "counting"
        }

        async fn load(&self, _opts: ModelOptions) -> WorkerResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn loader(dir: &Path) -> ModelLoader {
        ModelLoader::new(Arc::new(ConfigLoader::new(dir)), None)
    }

    #[tokio::test]
    async fn test_embedded_store_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let config = ModelConfig { name: "vectors".into(), backend: "local-store".into(), ..Default::default() };

        let first = loader.load(&CallContext::background(), &config).await.unwrap();
        let second = loader.load(&CallContext::background(), &config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_embedded());
        assert!(registry::is_embedded(&first.address));
        assert_eq!(loader.loaded_models(), vec!["vectors".to_string()]);

        let address = first.address.clone();
        drop(first);
        drop(second);
        assert!(loader.shutdown_model("vectors"));
        assert!(!registry::is_embedded(&address));
        assert!(loader.loaded_models().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_shares_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(loader(dir.path()));
        let loads = Arc::new(AtomicUsize::new(0));
        loader.inject_backend("m", Arc::new(CountingLoads(loads.clone())));
        let config = ModelConfig { name: "m".into(), ..Default::default() };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                loader.load(&CallContext::background(), &config).await.map(|_| ())
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_backend_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        let config = ModelConfig { name: "orphan".into(), ..Default::default() };
        let err = loader.load(&CallContext::background(), &config).await.err().unwrap();
        assert!(matches!(err, WorkerError::InvalidArgument(_)));
        // A failed load leaves nothing behind.
        assert!(loader.get("orphan").is_none());
    }

    #[tokio::test]
    async fn test_unknown_worker_binary_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(Arc::new(ConfigLoader::new(dir.path())), Some(dir.path().to_path_buf()));
        let config = ModelConfig { name: "x".into(), backend: "no-such-worker-binary".into(), ..Default::default() };
        let err = loader.load(&CallContext::background(), &config).await.err().unwrap();
        assert!(matches!(err, WorkerError::LoadFailed(_)));
    }

    #[test]
    fn test_list_models_merges_configs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "name: alpha\nbackend: local-store\n").unwrap();
        std::fs::write(dir.path().join("weights.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("weights.gguf.tmpl"), b"{{.Input}}").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let configs = Arc::new(ConfigLoader::new(dir.path()));
        configs.load_all().unwrap();
        let loader = ModelLoader::new(configs, None);
        assert_eq!(loader.list_models(), vec!["alpha".to_string(), "weights.gguf".to_string()]);
        assert!(loader.exists_in_model_path("weights.gguf"));
        assert!(!loader.exists_in_model_path("../etc/passwd"));
    }

    #[tokio::test]
    async fn test_status_of_loaded_store() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(dir.path());
        loader.inject_backend("s", Arc::new(VectorStore::new()));
        let config = ModelConfig { name: "s".into(), ..Default::default() };
        loader.load(&CallContext::background(), &config).await.unwrap();
        let status = loader.status(&CallContext::background(), "s").await.unwrap();
        assert_eq!(status.state, crate::wire::WorkerState::Ready);
    }
}
