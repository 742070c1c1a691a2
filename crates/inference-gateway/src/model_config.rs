//! Per-model YAML configuration.
//!
//! Each `*.yaml` file in the models directory describes one model: which
//! backend serves it, its sampling defaults, prompt templates, function
//! calling and reasoning settings.

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::functions::FunctionsConfig;
use crate::reasoning::ReasoningConfig;
use crate::wire::{ModelOptions, PredictOptions};

const DEFAULT_TEMPERATURE: f32 = 0.9;
const DEFAULT_TOP_P: f32 = 0.95;
const DEFAULT_TOP_K: i32 = 40;

/// Sampling defaults under `parameters:`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionParams {
    /// Model file relative to the models directory.
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub max_tokens: Option<i32>,
    pub seed: Option<i32>,
    pub typical_p: Option<f32>,
    pub tfz: Option<f32>,
    pub mirostat: Option<i32>,
    pub mirostat_eta: Option<f32>,
    pub mirostat_tau: Option<f32>,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub ignore_eos: bool,
    pub n_keep: i32,
    pub batch: i32,
    pub negative_prompt: String,
    pub negative_prompt_scale: f32,
    pub echo: bool,
}

/// Prompt templates under `template:`. Each entry is either an inline
/// template or the name of `<models>/<name>.tmpl`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub chat: String,
    pub chat_message: String,
    pub completion: String,
    pub functions: String,
    pub join_chat_messages_by_character: Option<String>,
}

/// Startup values applied to every model that leaves them unset.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefaults {
    pub threads: i32,
    pub context_size: i32,
    pub f16: bool,
    pub debug: bool,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            threads: num_cpus::get() as i32,
            context_size: 512,
            f16: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub description: String,
    /// Worker backend, e.g. `local-store`, `remote-openai`, `llama-cpp`.
    pub backend: String,
    /// Address of an already running external worker.
    pub address: String,
    pub parameters: PredictionParams,
    pub roles: HashMap<String, String>,
    pub template: TemplateConfig,
    pub function: FunctionsConfig,
    pub reasoning: ReasoningConfig,
    pub system_prompt: String,
    pub stopwords: Vec<String>,
    pub grammar: String,
    pub context_size: Option<i32>,
    pub threads: Option<i32>,
    pub f16: Option<bool>,
    pub debug: Option<bool>,
    pub embeddings: bool,
    pub reranking: bool,
    pub gpu_layers: Option<i32>,
    pub mmap: Option<bool>,
    pub mmlock: Option<bool>,
    pub low_vram: bool,
    pub numa: bool,
    pub main_gpu: String,
    pub tensor_split: String,
    pub lora_adapter: String,
    pub lora_base: String,
    pub draft_model: String,
    pub n_draft: i32,
    pub prompt_cache_path: String,
    pub prompt_cache_all: bool,
    pub prompt_cache_ro: bool,
    pub rms_norm_eps: f32,
    pub ngqa: i32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    /// Image generation.
    pub step: i32,
    pub cfg_scale: f32,
    pub scheduler_type: String,
    /// Default voice for text to speech.
    pub voice: String,
    pub options: BTreeMap<String, String>,
}

impl ModelConfig {
    /// A config for a bare model file with no YAML of its own.
    pub fn for_model_file(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: PredictionParams { model: name.to_string(), ..Default::default() },
            ..Default::default()
        }
    }

    pub fn model_file(&self) -> &str {
        if self.parameters.model.is_empty() {
            &self.name
        } else {
            &self.parameters.model
        }
    }

    /// Fills unset fields from startup defaults.
    pub fn apply_defaults(&mut self, defaults: &ModelDefaults) {
        let p = &mut self.parameters;
        p.temperature.get_or_insert(DEFAULT_TEMPERATURE);
        p.top_p.get_or_insert(DEFAULT_TOP_P);
        p.top_k.get_or_insert(DEFAULT_TOP_K);
        p.typical_p.get_or_insert(1.0);
        p.tfz.get_or_insert(1.0);

        self.threads.get_or_insert(defaults.threads);
        self.context_size.get_or_insert(defaults.context_size);
        self.f16.get_or_insert(defaults.f16);
        if defaults.debug {
            self.debug = Some(true);
        }
        self.debug.get_or_insert(false);
    }

    pub fn role_marker(&self, role: &str) -> &str {
        self.roles.get(role).map(String::as_str).unwrap_or_default()
    }

    /// Options sent with `LoadModel`.
    pub fn model_options(&self, models_path: &Path) -> ModelOptions {
        ModelOptions {
            model: self.model_file().to_string(),
            model_file: models_path.join(self.model_file()).to_string_lossy().into_owned(),
            model_path: models_path.to_string_lossy().into_owned(),
            threads: self.threads.unwrap_or_default(),
            context_size: self.context_size.unwrap_or_default(),
            f16: self.f16.unwrap_or_default(),
            n_gpu_layers: self.gpu_layers.unwrap_or(9_999_999),
            n_batch: self.parameters.batch,
            n_gqa: self.ngqa,
            rms_norm_eps: self.rms_norm_eps,
            rope_freq_base: self.rope_freq_base,
            rope_freq_scale: self.rope_freq_scale,
            main_gpu: self.main_gpu.clone(),
            tensor_split: self.tensor_split.clone(),
            mmap: self.mmap.unwrap_or(true),
            lora_adapter: self.lora_adapter.clone(),
            lora_base: self.lora_base.clone(),
            draft_model: self.draft_model.clone(),
            scheduler_type: self.scheduler_type.clone(),
            embeddings: self.embeddings,
            reranking: self.reranking,
            cfg_scale: self.cfg_scale,
            options: self.options.clone(),
            ..Default::default()
        }
    }

    /// Sampling options for a prediction, before request overrides.
    pub fn predict_options(&self) -> PredictOptions {
        let p = &self.parameters;
        PredictOptions {
            temperature: p.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: p.top_p.unwrap_or(DEFAULT_TOP_P),
            top_k: p.top_k.unwrap_or(DEFAULT_TOP_K),
            tokens: p.max_tokens.unwrap_or_default(),
            seed: p.seed.unwrap_or(-1),
            typical_p: p.typical_p.unwrap_or(1.0),
            tail_free_sampling_z: p.tfz.unwrap_or(1.0),
            mirostat: p.mirostat.unwrap_or_default(),
            mirostat_eta: p.mirostat_eta.unwrap_or_default(),
            mirostat_tau: p.mirostat_tau.unwrap_or_default(),
            repeat_penalty: p.repeat_penalty,
            frequency_penalty: p.frequency_penalty,
            presence_penalty: p.presence_penalty,
            ignore_eos: p.ignore_eos,
            n_keep: p.n_keep,
            batch: p.batch,
            negative_prompt: p.negative_prompt.clone(),
            negative_prompt_scale: p.negative_prompt_scale,
            stop_prompts: self.stopwords.clone(),
            grammar: self.grammar.clone(),
            threads: self.threads.unwrap_or_default(),
            main_gpu: self.main_gpu.clone(),
            tensor_split: self.tensor_split.clone(),
            mmap: self.mmap.unwrap_or(true),
            mlock: self.mmlock.unwrap_or_default(),
            f16_kv: self.f16.unwrap_or_default(),
            low_vram: self.low_vram,
            numa: self.numa,
            debug: self.debug.unwrap_or_default(),
            n_draft: self.n_draft,
            prompt_cache_path: self.prompt_cache_path.clone(),
            prompt_cache_all: self.prompt_cache_all,
            prompt_cache_ro: self.prompt_cache_ro,
            ..Default::default()
        }
    }
}

/// Model configs read from the models directory, keyed by name.
pub struct ConfigLoader {
    models_path: PathBuf,
    configs: DashMap<String, ModelConfig>,
}

impl ConfigLoader {
    pub fn new(models_path: impl Into<PathBuf>) -> Self {
        Self {
            models_path: models_path.into(),
            configs: DashMap::new(),
        }
    }

    pub fn models_path(&self) -> &Path {
        &self.models_path
    }

    /// Parses one YAML file. A missing `name` falls back to the file stem.
    pub fn load_file(path: &Path) -> Result<ModelConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {}", path.display()))?;
        let mut config: ModelConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing model config {}", path.display()))?;
        if config.name.is_empty() {
            config.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(config)
    }

    /// Loads every `*.yaml`/`*.yml` in the models directory, skipping broken files.
    pub fn load_all(&self) -> Result<usize> {
        if !self.models_path.exists() {
            warn!("Models directory {} does not exist", self.models_path.display());
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.models_path)
            .with_context(|| format!("listing {}", self.models_path.display()))?
        {
            let path = entry?.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            match Self::load_file(&path) {
                Ok(config) => {
                    debug!("Loaded config for model '{}'", config.name);
                    self.configs.insert(config.name.clone(), config);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
            }
        }
        info!("Loaded {} model configs from {}", loaded, self.models_path.display());
        Ok(loaded)
    }

    pub fn insert(&self, config: ModelConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    pub fn get(&self, name: &str) -> Option<ModelConfig> {
        self.configs.get(name).map(|c| c.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// The named config with startup defaults applied, or a bare config for `name`.
    pub fn resolve(&self, name: &str, defaults: &ModelDefaults) -> ModelConfig {
        let mut config = self.get(name).unwrap_or_else(|| ModelConfig::for_model_file(name));
        config.apply_defaults(defaults);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: gpt-test
backend: remote-openai
parameters:
  model: gpt-4o-mini
  temperature: 0.2
  max_tokens: 64
roles:
  user: "USER:"
  assistant: "ASSISTANT:"
template:
  chat: "{{.Input}}\nASSISTANT:"
  chat_message: "{{.RoleName}}: {{.Content}}"
function:
  disable_no_action: true
  grammar:
    parallel_calls: true
    properties_order: "function,arguments"
reasoning:
  thinking_forced_open: true
stopwords: ["USER:"]
"#;

    #[test]
    fn test_parse_full_config() {
        let config: ModelConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.name, "gpt-test");
        assert_eq!(config.backend, "remote-openai");
        assert_eq!(config.model_file(), "gpt-4o-mini");
        assert_eq!(config.parameters.temperature, Some(0.2));
        assert_eq!(config.role_marker("user"), "USER:");
        assert_eq!(config.role_marker("tool"), "");
        assert!(config.function.disable_no_action);
        assert!(config.function.grammar.maybe_array);
        assert_eq!(config.function.grammar.prop_order, "function,arguments");
        assert!(config.reasoning.thinking_forced_open);
    }

    #[test]
    fn test_defaults_fill_only_unset_fields() {
        let mut config: ModelConfig = serde_yaml::from_str(YAML).unwrap();
        config.threads = Some(2);
        config.apply_defaults(&ModelDefaults { threads: 8, context_size: 4096, f16: true, debug: false });
        assert_eq!(config.threads, Some(2));
        assert_eq!(config.context_size, Some(4096));
        assert_eq!(config.f16, Some(true));
        assert_eq!(config.parameters.temperature, Some(0.2));
        assert_eq!(config.parameters.top_k, Some(DEFAULT_TOP_K));

        let opts = config.predict_options();
        assert_eq!(opts.tokens, 64);
        assert_eq!(opts.stop_prompts, vec!["USER:".to_string()]);
    }

    #[test]
    fn test_loader_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gpt.yaml"), YAML).unwrap();
        std::fs::write(dir.path().join("unnamed.yml"), "backend: local-store\n").unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "name: [unterminated").unwrap();
        std::fs::write(dir.path().join("weights.gguf"), b"GGUF").unwrap();

        let loader = ConfigLoader::new(dir.path());
        assert_eq!(loader.load_all().unwrap(), 2);
        assert_eq!(loader.names(), vec!["gpt-test".to_string(), "unnamed".to_string()]);
        assert_eq!(loader.get("unnamed").unwrap().backend, "local-store");

        let bare = loader.resolve("weights.gguf", &ModelDefaults::default());
        assert_eq!(bare.model_file(), "weights.gguf");
        assert!(bare.threads.is_some());
    }

    #[test]
    fn test_model_options_paths() {
        let config = ModelConfig::for_model_file("m.bin");
        let opts = config.model_options(Path::new("/models"));
        assert_eq!(opts.model, "m.bin");
        assert_eq!(opts.model_file, "/models/m.bin");
        assert!(opts.mmap);
    }
}
