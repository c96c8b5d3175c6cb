//! Types exchanged with provider adapters

use crate::attributes::{AttributeMap, Discovery};
use crate::schema::ProductContext;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pipeline stage a call belongs to. Providers use it to pick prompt
/// wording and output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Cheap pass over core attributes
    Fast,
    /// Focused pass over attributes the fast pass left weak
    Detail,
    /// Look for attributes outside the schema
    Discovery,
    /// Whole schema in one call (fallback chain, fusion ensemble)
    Standard,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Detail => "detail",
            Self::Discovery => "discovery",
            Self::Standard => "standard",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded image bytes handed to providers
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImagePayload {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn from_base64(
        mime_type: impl Into<String>,
        encoded: &str,
    ) -> Result<Self, base64::DecodeError> {
        let data = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        Ok(Self::new(mime_type, data))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// `data:` URL form accepted by OpenAI-compatible APIs
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Extra context sent alongside the image
#[derive(Debug, Clone, Default)]
pub struct ContextHints {
    pub product: ProductContext,
    /// Results from earlier stages, for refinement or discovery
    pub partial: Option<AttributeMap>,
}

impl ContextHints {
    pub fn new(product: ProductContext) -> Self {
        Self {
            product,
            partial: None,
        }
    }

    pub fn with_partial(&self, partial: AttributeMap) -> Self {
        Self {
            product: self.product.clone(),
            partial: Some(partial),
        }
    }
}

/// Normalized output of one provider call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOutput {
    pub attributes: AttributeMap,
    /// Overall confidence, 0–100
    pub confidence: f64,
    /// Tokens consumed, as reported by the backend
    pub resource_cost: u64,
    #[serde(default)]
    pub discoveries: Vec<Discovery>,
}

/// Runtime configuration of a provider adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Merge the fields set in `patch`; applying the same patch twice is a no-op
    pub fn apply(&mut self, patch: &ProviderConfigPatch) {
        if let Some(model) = &patch.model {
            self.model = model.clone();
        }
        if let Some(timeout) = patch.timeout_secs {
            self.timeout_secs = timeout;
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = patch.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(base_url) = &patch.base_url {
            self.base_url = Some(base_url.clone());
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            timeout_secs: 60,
            temperature: 0.1,
            max_tokens: 1500,
            base_url: None,
        }
    }
}

/// Partial provider configuration accepted by `ProviderAdapter::configure`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfigPatch {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfigPatch {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Errors from provider adapters
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider '{provider}' unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("provider '{provider}' rejected the request (HTTP {status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("provider '{provider}' returned unparseable output: {message}")]
    Parse {
        provider: String,
        message: String,
        /// Tokens the backend charged for the unusable completion
        resource_cost: u64,
    },

    #[error("provider '{provider}' timed out after {seconds}s")]
    Timeout { provider: String, seconds: u64 },

    #[error("provider '{provider}' transport error: {message}")]
    Transport { provider: String, message: String },
}

impl ProviderError {
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            provider: provider.into(),
            message: message.into(),
            resource_cost: 0,
        }
    }

    /// Attach the tokens spent on the call; only parse failures carry a cost
    pub fn with_cost(mut self, tokens: u64) -> Self {
        if let Self::Parse { resource_cost, .. } = &mut self {
            *resource_cost = tokens;
        }
        self
    }

    /// Tokens consumed by the failed call, zero when the backend was not reached
    pub fn resource_cost(&self) -> u64 {
        match self {
            Self::Parse { resource_cost, .. } => *resource_cost,
            _ => 0,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::Unavailable { provider, .. }
            | Self::Rejected { provider, .. }
            | Self::Parse { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Transport { provider, .. } => provider,
        }
    }

    /// Parse failures are recovered as null-filled results rather than
    /// treated as a provider outage
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}
