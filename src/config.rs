//! YAML configuration
//!
//! ```yaml
//! scheduler:
//!   max_concurrent: 3
//!   token_limit: 100000
//!   window_mode: sliding
//! pipeline:
//!   fast: gemini-flash
//!   detail: claude
//!   fallback: [claude, gpt]
//!   ensemble: [claude, gpt, gemini-flash]
//! providers:
//!   claude:
//!     kind: anthropic
//!   gpt:
//!     kind: openai
//!     model: gpt-4o
//!   gemini-flash:
//!     kind: gemini
//!     api_key_env: GOOGLE_API_KEY
//! ```
//!
//! Every section is optional. API keys are read from the environment, never
//! from the file.

use crate::fusion::FusionStrategy;
use crate::pipeline::{PipelineSettings, StagedPipeline, CORE_VOCABULARY, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::provider::{ProviderAdapter, ProviderConfigPatch, ProviderKind, ProviderRegistry, RemoteAdapter};
use crate::queue::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    pub providers: BTreeMap<String, ProviderSpec>,
    /// SQLite job store; the in-memory store is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

/// Which providers fill which pipeline role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub confidence_threshold: f64,
    pub core_vocabulary: Vec<String>,
    pub fast: Option<String>,
    pub detail: Option<String>,
    pub discovery: Option<String>,
    pub fallback: Vec<String>,
    pub ensemble: Vec<String>,
    /// Strategy used when a job asks for fusion without naming one
    pub default_fusion: FusionStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            core_vocabulary: CORE_VOCABULARY.iter().map(|w| w.to_string()).collect(),
            fast: None,
            detail: None,
            discovery: None,
            fallback: Vec::new(),
            ensemble: Vec::new(),
            default_fusion: FusionStrategy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            confidence_threshold: self.confidence_threshold,
            core_vocabulary: self.core_vocabulary.clone(),
        }
    }

    /// Strategy for a fused run: the one asked for, else the configured default
    pub fn fusion_strategy(&self, requested: Option<FusionStrategy>) -> FusionStrategy {
        requested.unwrap_or(self.default_fusion)
    }

    /// Every provider name this section refers to
    fn referenced(&self) -> impl Iterator<Item = &String> {
        self.fast
            .iter()
            .chain(self.detail.iter())
            .chain(self.discovery.iter())
            .chain(self.fallback.iter())
            .chain(self.ensemble.iter())
    }
}

/// One configured provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ProviderSpec {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            model: None,
            api_key_env: None,
            base_url: None,
            timeout_secs: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Configured variable, or the conventional one for the provider kind
    pub fn key_variable(&self) -> Option<&str> {
        if let Some(var) = &self.api_key_env {
            return Some(var);
        }
        match self.kind {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Gemini => Some("GEMINI_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    pub fn patch(&self) -> ProviderConfigPatch {
        ProviderConfigPatch {
            model: self.model.clone(),
            timeout_secs: self.timeout_secs,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            base_url: self.base_url.clone(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// `attrex/config.yaml` under the user config directory, if present
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("attrex").join("config.yaml"))
    }

    /// Reject unknown provider references and unusable limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate().map_err(ConfigError::Invalid)?;

        let threshold = self.pipeline.confidence_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "pipeline.confidence_threshold must be within 0-100, got {}",
                threshold
            )));
        }

        if let Some(unknown) = self
            .pipeline
            .referenced()
            .find(|name| !self.providers.contains_key(*name))
        {
            return Err(ConfigError::Invalid(format!(
                "pipeline refers to unknown provider '{}'",
                unknown
            )));
        }
        Ok(())
    }

    /// Build adapters for every configured provider, reading keys from the
    /// process environment
    pub fn build_registry(&self) -> ProviderRegistry {
        self.build_registry_with(|var| std::env::var(var).ok())
    }

    /// Like [`build_registry`](Self::build_registry) with an explicit key lookup
    pub fn build_registry_with(&self, lookup: impl Fn(&str) -> Option<String>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (name, spec) in &self.providers {
            let api_key = spec
                .key_variable()
                .and_then(&lookup)
                .filter(|key| !key.trim().is_empty());
            if api_key.is_none() && spec.kind.requires_api_key() {
                tracing::warn!(provider = %name, "no API key found; provider will report unhealthy");
            }
            let adapter = RemoteAdapter::new(name.clone(), spec.kind, api_key).with_config(&spec.patch());
            registry.register(Arc::new(adapter));
        }
        registry
    }

    /// Wire the pipeline roles to adapters from `registry`
    pub fn build_pipeline(&self, registry: &ProviderRegistry) -> Result<StagedPipeline, ConfigError> {
        let one = |name: &Option<String>| -> Result<Option<Arc<dyn ProviderAdapter>>, ConfigError> {
            match name {
                Some(name) => registry
                    .get(name)
                    .map(Some)
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown provider '{}'", name))),
                None => Ok(None),
            }
        };
        let many = |names: &[String]| {
            registry
                .resolve(names)
                .map_err(|name| ConfigError::Invalid(format!("unknown provider '{}'", name)))
        };

        let mut pipeline = StagedPipeline::new()
            .with_settings(self.pipeline.settings())
            .with_fallback_chain(many(self.pipeline.fallback.as_slice())?)
            .with_ensemble(many(self.pipeline.ensemble.as_slice())?);
        if let Some(fast) = one(&self.pipeline.fast)? {
            pipeline = pipeline.with_fast(fast);
        }
        if let Some(detail) = one(&self.pipeline.detail)? {
            pipeline = pipeline.with_detail(detail);
        }
        if let Some(discovery) = one(&self.pipeline.discovery)? {
            pipeline = pipeline.with_discovery(discovery);
        }
        Ok(pipeline)
    }
}
