//! Normalization of untrusted provider output
//!
//! Every adapter funnels the raw completion text through [`parse_output`]:
//! code fences are stripped, the JSON object is located, and each schema key
//! is normalized against its definition. Sentinels ("n/a", "not visible", …)
//! become null, numbers are coerced, and select values outside the allowed
//! set are dropped to null so downstream code never sees an out-of-domain
//! enum value.

use super::types::{ExtractionMode, ProviderError};
use crate::attributes::{
    clamp_confidence, mean_confidence, AttributeMap, AttributeResult, AttributeValue, Discovery,
    Provenance,
};
use crate::schema::{AttributeDef, AttributeSchema, AttributeType};
use serde_json::Value;

/// Confidence assumed when a provider reports a value without one.
/// Below the detail threshold, so such values get a second look.
pub const UNSTATED_CONFIDENCE: f64 = 50.0;

/// Phrases providers use instead of leaving a field empty
const NOT_APPLICABLE: &[&str] = &[
    "",
    "-",
    "n/a",
    "na",
    "n.a",
    "none",
    "null",
    "nil",
    "unknown",
    "not applicable",
    "not visible",
    "not visible in image",
    "no packet",
    "not specified",
    "not available",
    "cannot determine",
    "undetermined",
];

/// Normalized result of one completion
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub attributes: AttributeMap,
    pub discoveries: Vec<Discovery>,
    pub confidence: f64,
}

/// Extract a JSON object from completion text.
///
/// Tries, in order:
/// 1. Direct parse
/// 2. The body of a ```json … ``` or ``` … ``` fence
/// 3. The span from the first `{` to the last `}`
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };

    if let Some(block) = fenced {
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    None
}

/// True for the sentinel phrases providers use for "no value"
pub fn is_not_applicable(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    let lowered = lowered.trim_end_matches('.');
    NOT_APPLICABLE.contains(&lowered)
}

/// Convert a scalar JSON value to an attribute value, dropping sentinels
fn scalar(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::String(s) if is_not_applicable(s) => None,
        Value::String(s) => Some(AttributeValue::Text(s.trim().to_string())),
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(AttributeValue::Number),
        Value::Bool(b) => Some(AttributeValue::Text(b.to_string())),
        // Some models answer select questions with a one-element list
        Value::Array(items) if items.len() == 1 => scalar(&items[0]),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Coerce an observed value into the schema's value space
pub fn coerce(def: &AttributeDef, raw: &AttributeValue) -> Option<AttributeValue> {
    match def.attr_type {
        AttributeType::Text => match raw {
            AttributeValue::Text(s) => Some(AttributeValue::Text(s.clone())),
            AttributeValue::Number(n) => Some(AttributeValue::Text(n.to_string())),
        },
        AttributeType::Number => match raw {
            AttributeValue::Number(n) => Some(AttributeValue::Number(*n)),
            AttributeValue::Text(s) => parse_number(s).map(AttributeValue::Number),
        },
        AttributeType::Select => {
            let candidate = raw.to_string();
            def.match_allowed(&candidate)
                .map(|allowed| AttributeValue::Text(allowed.full.clone()))
        }
    }
}

fn confidence_field(entry: &serde_json::Map<String, Value>) -> Option<f64> {
    ["visualConfidence", "visual_confidence", "confidence"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s.trim_end_matches('%')),
            _ => None,
        })
}

/// Normalize one provider answer for `def`
pub fn normalize_entry(def: &AttributeDef, entry: Option<&Value>, provider: &str) -> AttributeResult {
    let Some(entry) = entry else {
        return AttributeResult::null(provider);
    };

    let (value, confidence, reasoning) = match entry {
        Value::Object(fields) => {
            let value = ["schemaValue", "schema_value", "value", "rawValue", "raw_value"]
                .iter()
                .find_map(|k| fields.get(*k));
            let reasoning = fields
                .get("reasoning")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            (value, confidence_field(fields), reasoning)
        }
        other => (Some(other), None, None),
    };

    let raw = value.and_then(scalar);
    let schema_value = raw.as_ref().and_then(|r| coerce(def, r));
    let confidence = if schema_value.is_some() {
        clamp_confidence(confidence.unwrap_or(UNSTATED_CONFIDENCE))
    } else {
        0.0
    };

    let mut provenance = Provenance::from_provider(provider);
    provenance.reasoning = reasoning;
    AttributeResult {
        raw_value: raw,
        schema_value,
        visual_confidence: confidence,
        provenance,
    }
}

fn parse_discovery(item: &Value, schema: &AttributeSchema) -> Option<Discovery> {
    let fields = item.as_object()?;
    let key = fields
        .get("key")
        .or_else(|| fields.get("name"))
        .and_then(|v| v.as_str())?
        .trim()
        .to_string();
    if key.is_empty() || schema.contains(&key) {
        return None;
    }

    let raw_value = ["rawValue", "raw_value", "value"]
        .iter()
        .find_map(|k| fields.get(*k))
        .and_then(scalar);
    let normalized_value = fields
        .get("normalizedValue")
        .or_else(|| fields.get("normalized_value"))
        .and_then(scalar)
        .or_else(|| raw_value.clone())
        .map(|v| v.to_string());
    let suggested_type = match fields
        .get("suggestedType")
        .or_else(|| fields.get("suggested_type"))
        .and_then(|v| v.as_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("select") => AttributeType::Select,
        Some("number") => AttributeType::Number,
        _ => AttributeType::Text,
    };
    let possible_values = fields
        .get("possibleValues")
        .or_else(|| fields.get("possible_values"))
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !is_not_applicable(s))
                .map(|s| s.trim().to_string())
                .collect()
        })
        .unwrap_or_default();
    let frequency = fields
        .get("frequency")
        .and_then(|v| v.as_u64())
        .map(|f| f.min(u32::MAX as u64) as u32)
        .unwrap_or(1);

    Some(Discovery {
        key,
        raw_value,
        normalized_value,
        confidence: clamp_confidence(confidence_field(fields).unwrap_or(UNSTATED_CONFIDENCE)),
        suggested_type,
        possible_values,
        frequency,
    })
}

/// Parse and normalize a completion against `schema`.
///
/// Accepts `{"attributes": {...}}` or a bare `{key: value}` object. Every
/// schema key is present in the result. Discoveries are only read in
/// discovery mode.
pub fn parse_output(
    provider: &str,
    text: &str,
    schema: &AttributeSchema,
    mode: ExtractionMode,
) -> Result<ParsedOutput, ProviderError> {
    let parsed = extract_json(text).ok_or_else(|| {
        let preview: String = text.chars().take(200).collect();
        ProviderError::parse(provider, format!("no JSON object in response: {}", preview))
    })?;

    let answers = parsed
        .get("attributes")
        .filter(|v| v.is_object())
        .unwrap_or(&parsed);

    let attributes: AttributeMap = schema
        .iter()
        .map(|def| {
            let result = normalize_entry(def, answers.get(&def.key), provider);
            (def.key.clone(), result)
        })
        .collect();

    let discoveries = if mode == ExtractionMode::Discovery {
        parsed
            .get("discoveries")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|i| parse_discovery(i, schema)).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let confidence = parsed
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(clamp_confidence)
        .unwrap_or_else(|| mean_confidence(&attributes));

    Ok(ParsedOutput {
        attributes,
        discoveries,
        confidence,
    })
}
