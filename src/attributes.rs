//! Extraction result types shared by providers, fusion and the pipeline

use crate::schema::{AttributeSchema, AttributeType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An observed or normalized attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    /// Identity used when tallying votes across providers
    pub(crate) fn vote_key(&self) -> String {
        match self {
            Self::Number(n) => format!("n:{}", n),
            Self::Text(s) => format!("t:{}", s),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// How strongly the fused providers agreed on a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementLevel {
    Unanimous,
    Majority,
    Split,
}

impl AgreementLevel {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            Self::Unanimous
        } else if ratio >= 0.5 {
            Self::Majority
        } else {
            Self::Split
        }
    }
}

/// Agreement metadata recorded by the fusion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    /// Supporters / participating providers
    pub ratio: f64,
    pub level: AgreementLevel,
    pub supporters: Vec<String>,
}

/// Where an attribute value came from
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<Agreement>,
}

impl Provenance {
    pub fn from_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reasoning: None,
            agreement: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Extraction result for one schema key.
///
/// A `None` schema value means "not extracted". It is never replaced by a
/// sentinel string or a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeResult {
    pub raw_value: Option<AttributeValue>,
    pub schema_value: Option<AttributeValue>,
    /// 0–100
    pub visual_confidence: f64,
    pub provenance: Provenance,
}

impl AttributeResult {
    pub fn new(
        raw_value: Option<AttributeValue>,
        schema_value: Option<AttributeValue>,
        visual_confidence: f64,
        provenance: Provenance,
    ) -> Self {
        Self {
            raw_value,
            schema_value,
            visual_confidence: clamp_confidence(visual_confidence),
            provenance,
        }
    }

    /// A value the provider reported and that matched the schema
    pub fn extracted(value: AttributeValue, confidence: f64, provider: impl Into<String>) -> Self {
        Self::new(
            Some(value.clone()),
            Some(value),
            confidence,
            Provenance::from_provider(provider),
        )
    }

    /// Placeholder for a key that was not extracted
    pub fn null(provider: impl Into<String>) -> Self {
        Self {
            raw_value: None,
            schema_value: None,
            visual_confidence: 0.0,
            provenance: Provenance::from_provider(provider),
        }
    }

    pub fn is_null(&self) -> bool {
        self.schema_value.is_none()
    }
}

/// Per-key results, keyed by schema attribute key
pub type AttributeMap = BTreeMap<String, AttributeResult>;

/// Mean confidence over the non-null entries, 0 when nothing was extracted
pub fn mean_confidence(attributes: &AttributeMap) -> f64 {
    let values: Vec<f64> = attributes
        .values()
        .filter(|r| !r.is_null())
        .map(|r| r.visual_confidence)
        .collect();
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Insert a null entry for every schema key missing from `attributes`
pub fn fill_missing(attributes: &mut AttributeMap, schema: &AttributeSchema, provider: &str) {
    for def in schema {
        attributes
            .entry(def.key.clone())
            .or_insert_with(|| AttributeResult::null(provider));
    }
}

/// A map holding a null entry for every schema key
pub fn null_filled(schema: &AttributeSchema, provider: &str) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    fill_missing(&mut attributes, schema, provider);
    attributes
}

/// Clamp a confidence into 0–100, mapping NaN to 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// An attribute observed in the image but absent from the schema.
///
/// Surfaced for human review only; never promoted to schema truth here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub key: String,
    pub raw_value: Option<AttributeValue>,
    pub normalized_value: Option<String>,
    pub confidence: f64,
    pub suggested_type: AttributeType,
    #[serde(default)]
    pub possible_values: Vec<String>,
    pub frequency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeDef;

    #[test]
    fn mean_confidence_ignores_nulls() {
        let mut map = AttributeMap::new();
        map.insert(
            "color".into(),
            AttributeResult::extracted(AttributeValue::text("Red"), 90.0, "a"),
        );
        map.insert(
            "fit".into(),
            AttributeResult::extracted(AttributeValue::text("Slim"), 70.0, "a"),
        );
        map.insert("fabric".into(), AttributeResult::null("a"));

        assert_eq!(mean_confidence(&map), 80.0);
        assert_eq!(mean_confidence(&AttributeMap::new()), 0.0);
    }

    #[test]
    fn fill_missing_keeps_existing_entries() {
        let schema = AttributeSchema::new(vec![
            AttributeDef::text("color", "Color"),
            AttributeDef::text("fabric", "Fabric"),
        ]);
        let mut map = AttributeMap::new();
        map.insert(
            "color".into(),
            AttributeResult::extracted(AttributeValue::text("Red"), 90.0, "a"),
        );

        fill_missing(&mut map, &schema, "pipeline");

        assert_eq!(map.len(), 2);
        assert!(!map["color"].is_null());
        assert!(map["fabric"].is_null());
        assert_eq!(map["fabric"].provenance.provider, "pipeline");
    }

    #[test]
    fn confidence_is_clamped() {
        let r = AttributeResult::extracted(AttributeValue::Number(3.0), 140.0, "a");
        assert_eq!(r.visual_confidence, 100.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(-4.0), 0.0);
    }

    #[test]
    fn agreement_levels() {
        assert_eq!(AgreementLevel::from_ratio(1.0), AgreementLevel::Unanimous);
        assert_eq!(AgreementLevel::from_ratio(0.5), AgreementLevel::Majority);
        assert_eq!(AgreementLevel::from_ratio(1.0 / 3.0), AgreementLevel::Split);
    }

    #[test]
    fn null_result_serializes_explicit_nulls() {
        let json = serde_json::to_value(AttributeResult::null("a")).unwrap();
        assert!(json.get("schemaValue").unwrap().is_null());
        assert!(json.get("rawValue").unwrap().is_null());
    }
}
