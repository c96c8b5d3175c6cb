//! Request, outcome and error types for the staged pipeline

use crate::attributes::{AttributeMap, Discovery};
use crate::fusion::FusionStrategy;
use crate::provider::{ImagePayload, ProviderError};
use crate::schema::{AttributeSchema, ProductContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Attribute keys/labels the fast pass is responsible for
pub const CORE_VOCABULARY: &[&str] = &[
    "color", "colour", "fabric", "material", "pattern", "print", "fit", "size", "sleeve", "neck",
    "collar", "length", "style", "occasion", "closure", "waist", "rise",
];

/// Below this confidence an attribute is re-asked in the detail pass
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 70.0;

/// Tunables for the staged pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub confidence_threshold: f64,
    pub core_vocabulary: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            core_vocabulary: CORE_VOCABULARY.iter().map(|w| w.to_string()).collect(),
        }
    }
}

impl PipelineSettings {
    /// Whether an attribute belongs to the fast pass.
    ///
    /// Key and label are split into words; a vocabulary entry matches a word
    /// it begins, so `neck` covers `neckline` but `fit` does not cover `outfit`.
    pub fn is_core(&self, key: &str, label: &str) -> bool {
        let text = format!("{} {}", key, label).to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        self.core_vocabulary.iter().any(|entry| {
            let entry = entry.to_lowercase();
            words.iter().any(|w| w.starts_with(entry.as_str()))
        })
    }
}

/// One extraction to run through the pipeline
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub image: ImagePayload,
    pub schema: AttributeSchema,
    pub context: ProductContext,
    /// Run the discovery stage after extraction
    pub discovery: bool,
    /// Run the fusion ensemble instead of the staged passes
    pub fusion: Option<FusionStrategy>,
}

impl ExtractionRequest {
    pub fn new(image: ImagePayload, schema: AttributeSchema) -> Self {
        Self {
            image,
            schema,
            context: ProductContext::default(),
            discovery: false,
            fusion: None,
        }
    }

    pub fn with_context(mut self, context: ProductContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_discovery(mut self, discovery: bool) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_fusion(mut self, strategy: FusionStrategy) -> Self {
        self.fusion = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fast,
    Detail,
    Discovery,
    Fusion,
    Fallback,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Detail => "detail",
            Self::Discovery => "discovery",
            Self::Fusion => "fusion",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Not run: no provider, unhealthy provider, or nothing to do
    Skipped,
    /// Provider answered with unusable output; nulls were kept instead
    Recovered,
}

/// What happened in one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Number of schema keys requested
    pub requested: usize,
    pub resource_cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StageReport {
    pub(crate) fn skipped(stage: Stage, note: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            provider: None,
            requested: 0,
            resource_cost: 0,
            note: Some(note.into()),
        }
    }

    pub(crate) fn ran(stage: Stage, provider: &str, requested: usize, resource_cost: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            provider: Some(provider.to_string()),
            requested,
            resource_cost,
            note: None,
        }
    }

    pub(crate) fn recovered(stage: Stage, provider: &str, requested: usize, error: &ProviderError) -> Self {
        Self {
            stage,
            status: StageStatus::Recovered,
            provider: Some(provider.to_string()),
            requested,
            resource_cost: error.resource_cost(),
            note: Some(error.to_string()),
        }
    }
}

/// Which route produced the final attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPath {
    Staged,
    Fused,
    Fallback,
}

/// Final pipeline result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    /// One entry per schema key, null when not extracted
    pub attributes: AttributeMap,
    pub confidence: f64,
    /// Actual provider-reported cost across every call made
    pub resource_cost: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discoveries: Vec<Discovery>,
    pub path: ExtractionPath,
    #[serde(default)]
    pub stages: Vec<StageReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Errors that end an extraction
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: ProviderError,
        /// Tokens spent by earlier stages before the failure
        resource_cost: u64,
    },

    #[error("all providers failed after {attempts} attempt(s): {last_error}")]
    AllProvidersFailed {
        attempts: usize,
        last_error: String,
        /// Tokens spent across every attempt, including the failed primary route
        resource_cost: u64,
    },

    #[error("no providers configured")]
    NoProviders,
}

impl PipelineError {
    /// Tokens consumed before the extraction gave up
    pub fn resource_cost(&self) -> u64 {
        match self {
            Self::StageFailed { resource_cost, .. }
            | Self::AllProvidersFailed { resource_cost, .. } => *resource_cost,
            Self::NoProviders => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_matching_uses_key_or_label() {
        let settings = PipelineSettings::default();
        assert!(settings.is_core("primary_color", ""));
        assert!(settings.is_core("attr_17", "Sleeve Length"));
        assert!(!settings.is_core("care_instructions", "Care"));
    }

    #[test]
    fn core_matching_is_word_anchored() {
        let settings = PipelineSettings::default();
        assert!(!settings.is_core("benefit", ""));
        assert!(!settings.is_core("outfit", "Outfit"));
        assert!(!settings.is_core("surprise", "Surprise"));
        assert!(settings.is_core("neckline", ""));
        assert!(settings.is_core("sleeve_length", ""));
        assert!(settings.is_core("attr_3", "Fit Type"));
    }

    #[test]
    fn failure_cost_is_reported() {
        let err = PipelineError::AllProvidersFailed {
            attempts: 2,
            last_error: "timed out".into(),
            resource_cost: 390,
        };
        assert_eq!(err.resource_cost(), 390);
        assert_eq!(PipelineError::NoProviders.resource_cost(), 0);
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = ExtractionOutcome {
            attributes: AttributeMap::new(),
            confidence: 0.0,
            resource_cost: 12,
            discoveries: Vec::new(),
            path: ExtractionPath::Staged,
            stages: vec![StageReport::skipped(Stage::Fast, "no fast provider")],
            warnings: Vec::new(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["resourceCost"], 12);
        assert_eq!(json["path"], "staged");
        assert_eq!(json["stages"][0]["status"], "skipped");
    }
}
