//! HTTP adapter for hosted and local vision models
//!
//! One adapter type covers every supported backend; the wire format is
//! selected by [`ProviderKind`]. Request/response shapes:
//!
//! - OpenAI / Ollama: `POST {base}/chat/completions`, image as a `data:` URL
//! - Anthropic: `POST {base}/v1/messages`, image as a base64 source block
//! - Gemini: `POST {base}/v1beta/models/{model}:generateContent`, inline data

use super::parse;
use super::prompt::build_prompt;
use super::traits::ProviderAdapter;
use super::types::{
    ContextHints, ExtractionMode, ImagePayload, ProviderConfig, ProviderConfigPatch,
    ProviderError, ProviderOutput,
};
use crate::schema::AttributeSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backend wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    /// Local Ollama server through its OpenAI-compatible endpoint
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o",
            Self::Anthropic => "claude-3-5-sonnet-latest",
            Self::Gemini => "gemini-1.5-flash",
            Self::Ollama => "llava",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }

    /// Build the JSON request body
    fn request_body(&self, config: &ProviderConfig, prompt: &str, image: &ImagePayload) -> Value {
        match self {
            Self::OpenAi | Self::Ollama => json!({
                "model": config.model,
                "temperature": config.temperature,
                "max_tokens": config.max_tokens,
                "response_format": { "type": "json_object" },
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": prompt },
                        { "type": "image_url", "image_url": { "url": image.data_url() } }
                    ]
                }]
            }),
            Self::Anthropic => json!({
                "model": config.model,
                "max_tokens": config.max_tokens,
                "temperature": config.temperature,
                "messages": [{
                    "role": "user",
                    "content": [
                        {
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.mime_type,
                                "data": image.to_base64()
                            }
                        },
                        { "type": "text", "text": prompt }
                    ]
                }]
            }),
            Self::Gemini => json!({
                "contents": [{
                    "parts": [
                        { "text": prompt },
                        { "inline_data": { "mime_type": image.mime_type, "data": image.to_base64() } }
                    ]
                }],
                "generationConfig": {
                    "temperature": config.temperature,
                    "maxOutputTokens": config.max_tokens,
                    "responseMimeType": "application/json"
                }
            }),
        }
    }

    /// Pull the completion text and total token usage out of a response body
    fn read_completion(&self, body: &Value) -> Option<(String, Option<u64>)> {
        match self {
            Self::OpenAi | Self::Ollama => {
                let text = body["choices"][0]["message"]["content"].as_str()?.to_string();
                let tokens = body["usage"]["total_tokens"].as_u64();
                Some((text, tokens))
            }
            Self::Anthropic => {
                let text: String = body["content"]
                    .as_array()?
                    .iter()
                    .filter(|block| block["type"] == "text")
                    .filter_map(|block| block["text"].as_str())
                    .collect();
                let usage = &body["usage"];
                let tokens = match (usage["input_tokens"].as_u64(), usage["output_tokens"].as_u64()) {
                    (Some(i), Some(o)) => Some(i + o),
                    _ => None,
                };
                Some((text, tokens))
            }
            Self::Gemini => {
                let text: String = body["candidates"][0]["content"]["parts"]
                    .as_array()?
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect();
                let tokens = body["usageMetadata"]["totalTokenCount"].as_u64();
                Some((text, tokens))
            }
        }
    }
}

/// How long an adapter reports unhealthy after an outage
pub const DEFAULT_HEALTH_COOLDOWN: Duration = Duration::from_secs(30);

/// Rough token count for backends that do not report usage
fn estimate_tokens(prompt: &str, completion: &str) -> u64 {
    // ~4 characters per token, plus a flat charge for one image tile
    ((prompt.len() + completion.len()) / 4) as u64 + 765
}

/// Provider adapter speaking one of the supported HTTP wire formats
pub struct RemoteAdapter {
    id: String,
    kind: ProviderKind,
    api_key: Option<String>,
    config: RwLock<ProviderConfig>,
    http: reqwest::Client,
    /// When the backend last failed to answer; cleared by a successful call
    last_failure: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl RemoteAdapter {
    pub fn new(id: impl Into<String>, kind: ProviderKind, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            config: RwLock::new(ProviderConfig::for_model(kind.default_model())),
            http: reqwest::Client::new(),
            last_failure: Mutex::new(None),
            cooldown: DEFAULT_HEALTH_COOLDOWN,
        }
    }

    /// Time after an outage before the adapter is offered traffic again
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_config(self, patch: &ProviderConfigPatch) -> Self {
        self.configure(patch);
        self
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ProviderConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_outcome(&self, reachable: bool) {
        let mut last_failure = self
            .last_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_failure = if reachable { None } else { Some(Instant::now()) };
    }

    fn endpoint(&self, config: &ProviderConfig) -> String {
        let base = config
            .base_url
            .as_deref()
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/');
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::Ollama => format!("{}/chat/completions", base),
            ProviderKind::Anthropic => format!("{}/v1/messages", base),
            ProviderKind::Gemini => {
                format!("{}/v1beta/models/{}:generateContent", base, config.model)
            }
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(key) = &self.api_key else {
            return request;
        };
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::Ollama => request.bearer_auth(key),
            ProviderKind::Anthropic => request
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            ProviderKind::Gemini => request.query(&[("key", key)]),
        }
    }

    fn transport_error(&self, err: reqwest::Error, timeout_secs: u64) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                provider: self.id.clone(),
                seconds: timeout_secs,
            }
        } else if err.is_connect() {
            ProviderError::unavailable(&self.id, err.to_string())
        } else {
            ProviderError::Transport {
                provider: self.id.clone(),
                message: err.to_string(),
            }
        }
    }

    async fn call(
        &self,
        image: &ImagePayload,
        schema: &AttributeSchema,
        mode: ExtractionMode,
        hints: &ContextHints,
    ) -> Result<ProviderOutput, ProviderError> {
        if self.kind.requires_api_key() && self.api_key.is_none() {
            return Err(ProviderError::unavailable(&self.id, "no API key configured"));
        }

        let config = self.config();
        let prompt = build_prompt(schema, mode, hints);
        let body = self.kind.request_body(&config, &prompt, image);

        debug!(provider = %self.id, model = %config.model, %mode, attributes = schema.len(), "calling provider");

        let request = self
            .http
            .post(self.endpoint(&config))
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e, config.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            let message: String = message.chars().take(300).collect();
            return Err(ProviderError::Rejected {
                provider: self.id.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::parse(&self.id, format!("response body is not JSON: {}", e)))?;
        let (text, reported_tokens) = self
            .kind
            .read_completion(&body)
            .ok_or_else(|| ProviderError::parse(&self.id, "response carries no completion text"))?;

        let resource_cost = reported_tokens.unwrap_or_else(|| estimate_tokens(&prompt, &text));
        let parsed = parse::parse_output(&self.id, &text, schema, mode)
            .map_err(|e| e.with_cost(resource_cost))?;

        Ok(ProviderOutput {
            attributes: parsed.attributes,
            confidence: parsed.confidence,
            resource_cost,
            discoveries: parsed.discoveries,
        })
    }
}

#[async_trait]
impl ProviderAdapter for RemoteAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_healthy(&self) -> bool {
        if self.kind.requires_api_key() && self.api_key.is_none() {
            return false;
        }
        let last_failure = self
            .last_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last_failure {
            Some(at) => at.elapsed() >= self.cooldown,
            None => true,
        }
    }

    fn configure(&self, patch: &ProviderConfigPatch) {
        self.config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(patch);
    }

    async fn extract_attributes(
        &self,
        image: &ImagePayload,
        schema: &AttributeSchema,
        mode: ExtractionMode,
        hints: &ContextHints,
    ) -> Result<ProviderOutput, ProviderError> {
        let result = self.call(image, schema, mode, hints).await;
        // A parse failure means the backend answered; only outages mark it unhealthy
        let reachable = match &result {
            Ok(_) => true,
            Err(e) => e.is_parse_failure(),
        };
        self.record_outcome(reachable);
        if let Err(e) = &result {
            warn!(provider = %self.id, error = %e, "provider call failed");
        }
        result
    }
}

impl std::fmt::Debug for RemoteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAdapter")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_api_key", &self.api_key.is_some())
            .field("config", &self.config())
            .finish()
    }
}
