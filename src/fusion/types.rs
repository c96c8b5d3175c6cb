//! Types for the fusion engine

use crate::attributes::AttributeMap;
use crate::provider::{ProviderError, ProviderOutput};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How per-provider answers are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FusionStrategy {
    /// Most providers win; ties go to the larger summed confidence
    #[default]
    #[serde(rename = "voting")]
    Voting,
    /// Votes weighted by confidence; fused confidence is the winner's best
    #[serde(rename = "weighted")]
    ConfidenceWeighted,
    /// The most confident provider, with gaps filled from the others
    #[serde(rename = "best")]
    BestOnly,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voting => "voting",
            Self::ConfidenceWeighted => "weighted",
            Self::BestOnly => "best",
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FusionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "voting" | "vote" => Ok(Self::Voting),
            "weighted" | "confidence" | "confidence_weighted" => Ok(Self::ConfidenceWeighted),
            "best" | "best_only" => Ok(Self::BestOnly),
            other => Err(format!("unknown fusion strategy: {}", other)),
        }
    }
}

/// One provider's answer (or failure) for a fusion call
#[derive(Debug, Clone)]
pub struct ProviderRun {
    pub provider: String,
    pub outcome: Result<ProviderOutput, ProviderError>,
}

impl ProviderRun {
    pub fn ok(provider: impl Into<String>, output: ProviderOutput) -> Self {
        Self {
            provider: provider.into(),
            outcome: Ok(output),
        }
    }

    pub fn failed(error: ProviderError) -> Self {
        Self {
            provider: error.provider().to_string(),
            outcome: Err(error),
        }
    }
}

/// Result of fusing several provider runs
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub strategy: FusionStrategy,
    pub attributes: AttributeMap,
    /// Mean of the non-null fused confidences
    pub confidence: f64,
    /// Sum over every provider that answered
    pub resource_cost: u64,
    /// Providers that took part, in invocation order
    pub participants: Vec<String>,
    /// Providers left out because their call failed
    pub excluded: Vec<ProviderError>,
}

#[derive(Debug, Clone, Error)]
pub enum FusionError {
    #[error("all providers failed")]
    AllProvidersFailed { errors: Vec<ProviderError> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_round_trip_through_from_str() {
        for strategy in [
            FusionStrategy::Voting,
            FusionStrategy::ConfidenceWeighted,
            FusionStrategy::BestOnly,
        ] {
            assert_eq!(strategy.as_str().parse::<FusionStrategy>(), Ok(strategy));
        }
        assert!("median".parse::<FusionStrategy>().is_err());
    }

    #[test]
    fn strategy_deserializes_from_short_names() {
        let s: FusionStrategy = serde_yaml::from_str("weighted").unwrap();
        assert_eq!(s, FusionStrategy::ConfidenceWeighted);
    }
}
