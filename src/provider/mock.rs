//! Scripted provider for tests and offline runs
//!
//! Answers go through the same normalization as real completions, so a mock
//! answering "not visible" produces a null entry exactly as a remote model
//! would.

use super::parse;
use super::traits::ProviderAdapter;
use super::types::{
    ContextHints, ExtractionMode, ImagePayload, ProviderConfig, ProviderConfigPatch,
    ProviderError, ProviderOutput,
};
use crate::attributes::{mean_confidence, AttributeMap, Discovery};
use crate::schema::AttributeSchema;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

enum Script {
    Answers(HashMap<String, Value>),
    Raw(String),
    Fail(ProviderError),
}

/// A call observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub mode: ExtractionMode,
    pub keys: Vec<String>,
    pub had_partial: bool,
}

pub struct MockProvider {
    id: String,
    healthy: AtomicBool,
    script: Script,
    discoveries: Vec<Discovery>,
    resource_cost: u64,
    delay: Option<Duration>,
    config: Mutex<ProviderConfig>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl MockProvider {
    /// A healthy provider that answers null for everything
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            healthy: AtomicBool::new(true),
            script: Script::Answers(HashMap::new()),
            discoveries: Vec::new(),
            resource_cost: 0,
            delay: None,
            config: Mutex::new(ProviderConfig::for_model("mock")),
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Answer `key` with `value` at `confidence`
    pub fn with_answer(mut self, key: impl Into<String>, value: impl Into<Value>, confidence: f64) -> Self {
        let entry = json!({ "value": value.into(), "confidence": confidence });
        match &mut self.script {
            Script::Answers(answers) => {
                answers.insert(key.into(), entry);
            }
            _ => {
                self.script = Script::Answers(HashMap::from([(key.into(), entry)]));
            }
        }
        self
    }

    /// Respond with raw completion text, parsed like a remote response
    pub fn with_raw_response(mut self, text: impl Into<String>) -> Self {
        self.script = Script::Raw(text.into());
        self
    }

    /// Fail every call with `error`
    pub fn with_failure(mut self, error: ProviderError) -> Self {
        self.script = Script::Fail(error);
        self
    }

    /// Return `discovery` on discovery-mode calls
    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discoveries.push(discovery);
        self
    }

    pub fn with_cost(mut self, tokens: u64) -> Self {
        self.resource_cost = tokens;
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unhealthy(self) -> Self {
        self.set_healthy(false);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Number of `extract_attributes` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn config(&self) -> ProviderConfig {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn respond(
        &self,
        schema: &AttributeSchema,
        mode: ExtractionMode,
    ) -> Result<ProviderOutput, ProviderError> {
        let (attributes, mut discoveries, confidence) = match &self.script {
            Script::Fail(error) => return Err(error.clone()),
            Script::Raw(text) => {
                let parsed = parse::parse_output(&self.id, text, schema, mode)
                    .map_err(|e| e.with_cost(self.resource_cost))?;
                (parsed.attributes, parsed.discoveries, parsed.confidence)
            }
            Script::Answers(answers) => {
                let attributes: AttributeMap = schema
                    .iter()
                    .map(|def| {
                        let entry = parse::normalize_entry(def, answers.get(&def.key), &self.id);
                        (def.key.clone(), entry)
                    })
                    .collect();
                let confidence = mean_confidence(&attributes);
                (attributes, Vec::new(), confidence)
            }
        };

        if mode == ExtractionMode::Discovery {
            discoveries.extend(
                self.discoveries
                    .iter()
                    .filter(|d| !schema.contains(&d.key))
                    .cloned(),
            );
        }

        Ok(ProviderOutput {
            attributes,
            confidence,
            resource_cost: self.resource_cost,
            discoveries,
        })
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn configure(&self, patch: &ProviderConfigPatch) {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(patch);
    }

    async fn extract_attributes(
        &self,
        _image: &ImagePayload,
        schema: &AttributeSchema,
        mode: ExtractionMode,
        hints: &ContextHints,
    ) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                mode,
                keys: schema.keys().into_iter().map(str::to_string).collect(),
                had_partial: hints.partial.is_some(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.respond(schema, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::schema::{AttributeDef, ProductContext};

    fn schema() -> AttributeSchema {
        AttributeSchema::new(vec![
            AttributeDef::select("color", "Color", ["Red", "Blue"]),
            AttributeDef::text("packaging", "Packaging"),
        ])
    }

    async fn extract(mock: &MockProvider) -> Result<ProviderOutput, ProviderError> {
        mock.extract_attributes(
            &ImagePayload::new("image/png", vec![]),
            &schema(),
            ExtractionMode::Standard,
            &ContextHints::new(ProductContext::new()),
        )
        .await
    }

    #[tokio::test]
    async fn answers_are_normalized_and_every_key_present() {
        let mock = MockProvider::new("m")
            .with_answer("color", "red", 95.0)
            .with_answer("packaging", "not visible", 80.0)
            .with_cost(120);

        let out = extract(&mock).await.unwrap();

        assert_eq!(out.attributes["color"].schema_value, Some(AttributeValue::text("Red")));
        assert!(out.attributes["packaging"].schema_value.is_none());
        assert_eq!(out.resource_cost, 120);
        assert_eq!(out.confidence, 95.0);
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.recorded_calls()[0].keys, vec!["color", "packaging"]);
    }

    #[tokio::test]
    async fn failure_script_returns_error() {
        let mock = MockProvider::new("m").with_failure(ProviderError::unavailable("m", "down"));
        assert!(extract(&mock).await.is_err());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn raw_garbage_is_a_parse_failure() {
        let mock = MockProvider::new("m").with_raw_response("sorry, no").with_cost(55);
        let err = extract(&mock).await.unwrap_err();
        assert!(err.is_parse_failure());
        assert_eq!(err.resource_cost(), 55);
    }
}
