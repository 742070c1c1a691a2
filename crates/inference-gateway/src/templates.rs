//! Prompt templating.
//!
//! Templates are rendered with minijinja. Model files written for Go-style
//! templates (`{{.Input}}`, `{{if .SystemPrompt}}...{{end}}`) are rewritten
//! to the equivalent Jinja syntax first. A template is either inline text or
//! the name of a `<models>/<name>.tmpl` file.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use minijinja::Environment;
use moka::sync::Cache;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::functions::Function;

pub const TEMPLATE_EXTENSION: &str = "tmpl";

lazy_static! {
    static ref GO_FIELD: Regex = Regex::new(r"\{\{(-?)\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*(-?)\}\}").unwrap();
    static ref GO_IF: Regex = Regex::new(r"\{\{(-?)\s*if\s+(not\s+)?\.([A-Za-z_][A-Za-z0-9_]*)\s*(-?)\}\}").unwrap();
    static ref GO_ELSE: Regex = Regex::new(r"\{\{(-?)\s*else\s*(-?)\}\}").unwrap();
    static ref GO_END: Regex = Regex::new(r"\{\{(-?)\s*end\s*(-?)\}\}").unwrap();
}

/// Rewrites the Go template subset used by model files into Jinja.
pub fn normalize_go_template(source: &str) -> String {
    let s = GO_IF.replace_all(source, "{%$1 if $2$3 $4%}");
    let s = GO_ELSE.replace_all(&s, "{%$1 else $2%}");
    let s = GO_END.replace_all(&s, "{%$1 endif $2%}");
    GO_FIELD.replace_all(&s, "{{$1 $2 $3}}").into_owned()
}

fn is_inline(template: &str) -> bool {
    template.contains("{{") || template.contains("{%")
}

/// Data for a per-message template.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessageTemplateData {
    pub system_prompt: String,
    /// The configured role marker.
    pub role: String,
    pub role_name: String,
    pub content: String,
    pub function_name: String,
    pub last_message: bool,
    /// True on the last message when a grammar is active.
    pub function: bool,
    pub message_index: usize,
}

/// Data for a prompt-level template.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PromptTemplateData {
    pub system_prompt: String,
    pub suppress_system_prompt: bool,
    pub input: String,
    pub instruction: String,
    pub functions: Vec<Function>,
}

pub struct TemplateEngine {
    models_path: PathBuf,
    sources: Cache<PathBuf, Arc<str>>,
}

impl TemplateEngine {
    pub fn new(models_path: impl Into<PathBuf>) -> Self {
        Self {
            models_path: models_path.into(),
            sources: Cache::new(256),
        }
    }

    pub fn exists_in_model_path(&self, file: &str) -> bool {
        self.models_path.join(file).is_file()
    }

    /// Whether `<models>/<model>.tmpl` exists.
    pub fn has_model_template(&self, model: &str) -> bool {
        self.exists_in_model_path(&format!("{}.{}", model, TEMPLATE_EXTENSION))
    }

    fn template_path(&self, name: &str) -> PathBuf {
        let file = if Path::new(name).extension().is_some_and(|e| e == TEMPLATE_EXTENSION) {
            name.to_string()
        } else {
            format!("{}.{}", name, TEMPLATE_EXTENSION)
        };
        self.models_path.join(file)
    }

    fn source(&self, template: &str) -> Result<Arc<str>> {
        if is_inline(template) {
            return Ok(Arc::from(normalize_go_template(template)));
        }
        let path = self.template_path(template);
        if let Some(cached) = self.sources.get(&path) {
            return Ok(cached);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading template {}", path.display()))?;
        let normalized: Arc<str> = Arc::from(normalize_go_template(&raw));
        self.sources.insert(path, normalized.clone());
        Ok(normalized)
    }

    fn render<S: Serialize>(&self, template: &str, data: &S) -> Result<String> {
        let source = self.source(template)?;
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.render_str(&source, data)
            .with_context(|| format!("rendering template '{}'", template))
    }

    pub fn evaluate_chat_message(&self, template: &str, data: &ChatMessageTemplateData) -> Result<String> {
        self.render(template, data)
    }

    pub fn evaluate_prompt(&self, template: &str, data: &PromptTemplateData) -> Result<String> {
        self.render(template, data)
    }
}
