//! Staged pipeline controller
//!
//! fast pass (core attributes) → detail pass (missing or weak attributes)
//! → optional discovery pass. When a stage's provider call errors, the
//! request is retried against the fallback chain, one provider at a time.

use super::types::{
    ExtractionOutcome, ExtractionPath, ExtractionRequest, PipelineError, PipelineSettings,
    Stage, StageReport,
};
use crate::attributes::{fill_missing, mean_confidence, AttributeMap, Discovery};
use crate::fusion::{FusionEngine, FusionStrategy, FUSION_PROVIDER};
use crate::provider::{
    ContextHints, ExtractionMode, ProviderAdapter, ProviderError, ProviderOutput,
};
use crate::schema::AttributeSchema;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Provider recorded on keys the pipeline itself null-filled
pub const PIPELINE_PROVIDER: &str = "pipeline";

/// Work accumulated across stages
#[derive(Default)]
struct StagedState {
    attributes: AttributeMap,
    resource_cost: u64,
    discoveries: Vec<Discovery>,
    stages: Vec<StageReport>,
    warnings: Vec<String>,
}

impl StagedState {
    fn into_outcome(mut self, schema: &AttributeSchema, path: ExtractionPath) -> ExtractionOutcome {
        fill_missing(&mut self.attributes, schema, PIPELINE_PROVIDER);
        ExtractionOutcome {
            confidence: mean_confidence(&self.attributes),
            attributes: self.attributes,
            resource_cost: self.resource_cost,
            discoveries: self.discoveries,
            path,
            stages: self.stages,
            warnings: self.warnings,
        }
    }
}

/// Runs extraction requests through the configured providers
#[derive(Clone, Default)]
pub struct StagedPipeline {
    fast: Option<Arc<dyn ProviderAdapter>>,
    detail: Option<Arc<dyn ProviderAdapter>>,
    discovery: Option<Arc<dyn ProviderAdapter>>,
    fallback: Vec<Arc<dyn ProviderAdapter>>,
    ensemble: Vec<Arc<dyn ProviderAdapter>>,
    settings: PipelineSettings,
}

impl StagedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fast(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.fast = Some(provider);
        self
    }

    pub fn with_detail(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.detail = Some(provider);
        self
    }

    /// Provider for the discovery stage; the detail provider is used when unset
    pub fn with_discovery(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.discovery = Some(provider);
        self
    }

    /// Providers tried in order when the staged run errors
    pub fn with_fallback_chain(mut self, providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        self.fallback = providers;
        self
    }

    /// Providers run concurrently for fused requests
    pub fn with_ensemble(mut self, providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        self.ensemble = providers;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn has_providers(&self) -> bool {
        self.fast.is_some()
            || self.detail.is_some()
            || !self.fallback.is_empty()
            || !self.ensemble.is_empty()
    }

    /// Run one extraction.
    ///
    /// Every schema key is present in the returned attributes. Errors only
    /// when the staged run failed and every fallback provider failed too.
    #[instrument(skip_all, fields(keys = request.schema.len(), discovery = request.discovery))]
    pub async fn run(&self, request: &ExtractionRequest) -> Result<ExtractionOutcome, PipelineError> {
        if !self.has_providers() {
            return Err(PipelineError::NoProviders);
        }

        let attempt = match request.fusion {
            Some(strategy) if !self.ensemble.is_empty() => self.run_fused(request, strategy).await,
            Some(strategy) => {
                warn!(%strategy, "fusion requested without an ensemble, running staged");
                self.run_staged(request).await
            }
            None => self.run_staged(request).await,
        };

        match attempt {
            Ok(outcome) => {
                info!(
                    confidence = outcome.confidence,
                    tokens = outcome.resource_cost,
                    path = ?outcome.path,
                    "extraction complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "staged extraction failed, entering fallback chain");
                self.run_fallback(request, e).await
            }
        }
    }

    /// Stage 1 → Stage 2 → optional Stage 3, without fallback
    pub async fn run_staged(
        &self,
        request: &ExtractionRequest,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let hints = ContextHints::new(request.context.clone());
        let mut state = StagedState::default();

        self.fast_stage(request, &hints, &mut state).await?;
        self.detail_stage(request, &hints, &mut state).await?;
        if request.discovery {
            self.discovery_stage(request, &hints, &mut state).await?;
        }

        Ok(state.into_outcome(&request.schema, ExtractionPath::Staged))
    }

    async fn fast_stage(
        &self,
        request: &ExtractionRequest,
        hints: &ContextHints,
        state: &mut StagedState,
    ) -> Result<(), PipelineError> {
        let core = request
            .schema
            .filter(|def| self.settings.is_core(&def.key, def.display_name()));

        let provider = match &self.fast {
            Some(p) if p.is_healthy() => p,
            Some(p) => {
                debug!(provider = p.id(), "fast provider unhealthy, skipping stage");
                state.stages.push(StageReport::skipped(Stage::Fast, "provider unhealthy"));
                return Ok(());
            }
            None => {
                state.stages.push(StageReport::skipped(Stage::Fast, "no fast provider"));
                return Ok(());
            }
        };
        if core.is_empty() {
            state.stages.push(StageReport::skipped(Stage::Fast, "no core attributes"));
            return Ok(());
        }

        match call(provider, request, &core, ExtractionMode::Fast, hints).await {
            Ok(output) => {
                state.resource_cost += output.resource_cost;
                state.stages.push(StageReport::ran(
                    Stage::Fast,
                    provider.id(),
                    core.len(),
                    output.resource_cost,
                ));
                state.attributes = restrict(output.attributes, &core, provider.id());
                Ok(())
            }
            Err(e) if e.is_parse_failure() => {
                state.resource_cost += e.resource_cost();
                state.warnings.push(e.to_string());
                state.stages.push(StageReport::recovered(Stage::Fast, provider.id(), core.len(), &e));
                fill_missing(&mut state.attributes, &core, provider.id());
                Ok(())
            }
            Err(source) => Err(PipelineError::StageFailed {
                stage: Stage::Fast,
                source,
                resource_cost: state.resource_cost,
            }),
        }
    }

    async fn detail_stage(
        &self,
        request: &ExtractionRequest,
        hints: &ContextHints,
        state: &mut StagedState,
    ) -> Result<(), PipelineError> {
        let threshold = self.settings.confidence_threshold;
        let weak = request.schema.filter(|def| match state.attributes.get(&def.key) {
            Some(r) => r.is_null() || r.visual_confidence < threshold,
            None => true,
        });

        if weak.is_empty() {
            debug!("every attribute confident after fast pass, skipping detail");
            state.stages.push(StageReport::skipped(Stage::Detail, "all attributes confident"));
            return Ok(());
        }

        let provider = match &self.detail {
            Some(p) if p.is_healthy() => p,
            Some(p) => {
                let note = format!("detail provider {} unhealthy", p.id());
                state.warnings.push(note.clone());
                state.stages.push(StageReport::skipped(Stage::Detail, note));
                return Ok(());
            }
            None => {
                state.stages.push(StageReport::skipped(Stage::Detail, "no detail provider"));
                return Ok(());
            }
        };

        let detail_hints = hints.with_partial(state.attributes.clone());
        match call(provider, request, &weak, ExtractionMode::Detail, &detail_hints).await {
            Ok(output) => {
                state.resource_cost += output.resource_cost;
                state.stages.push(StageReport::ran(
                    Stage::Detail,
                    provider.id(),
                    weak.len(),
                    output.resource_cost,
                ));
                // Overwrite exactly the keys that were asked for.
                let filled = restrict(output.attributes, &weak, provider.id());
                state.attributes.extend(filled);
                Ok(())
            }
            Err(e) if e.is_parse_failure() => {
                state.resource_cost += e.resource_cost();
                state.warnings.push(e.to_string());
                state.stages.push(StageReport::recovered(Stage::Detail, provider.id(), weak.len(), &e));
                fill_missing(&mut state.attributes, &weak, provider.id());
                Ok(())
            }
            Err(source) => Err(PipelineError::StageFailed {
                stage: Stage::Detail,
                source,
                resource_cost: state.resource_cost,
            }),
        }
    }

    async fn discovery_stage(
        &self,
        request: &ExtractionRequest,
        hints: &ContextHints,
        state: &mut StagedState,
    ) -> Result<(), PipelineError> {
        let provider = match self.discovery.as_ref().or(self.detail.as_ref()) {
            Some(p) if p.is_healthy() => p,
            Some(p) => {
                let note = format!("discovery provider {} unhealthy", p.id());
                state.warnings.push(note.clone());
                state.stages.push(StageReport::skipped(Stage::Discovery, note));
                return Ok(());
            }
            None => {
                state.stages.push(StageReport::skipped(Stage::Discovery, "no discovery provider"));
                return Ok(());
            }
        };

        let discovery_hints = hints.with_partial(state.attributes.clone());
        match call(provider, request, &request.schema, ExtractionMode::Discovery, &discovery_hints).await {
            Ok(output) => {
                state.resource_cost += output.resource_cost;
                state.stages.push(StageReport::ran(
                    Stage::Discovery,
                    provider.id(),
                    request.schema.len(),
                    output.resource_cost,
                ));
                state.discoveries.extend(
                    output
                        .discoveries
                        .into_iter()
                        .filter(|d| !request.schema.contains(&d.key)),
                );
                Ok(())
            }
            Err(e) if e.is_parse_failure() => {
                state.resource_cost += e.resource_cost();
                state.warnings.push(e.to_string());
                state.stages.push(StageReport::recovered(
                    Stage::Discovery,
                    provider.id(),
                    request.schema.len(),
                    &e,
                ));
                Ok(())
            }
            Err(source) => Err(PipelineError::StageFailed {
                stage: Stage::Discovery,
                source,
                resource_cost: state.resource_cost,
            }),
        }
    }

    /// Run the ensemble concurrently and fuse. Discovery still runs
    /// afterwards when requested.
    pub async fn run_fused(
        &self,
        request: &ExtractionRequest,
        strategy: FusionStrategy,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let hints = ContextHints::new(request.context.clone());
        let engine = FusionEngine::new(strategy);

        let fused = engine
            .run(
                &self.ensemble,
                &request.image,
                &request.schema,
                ExtractionMode::Standard,
                &hints,
            )
            .await
            .map_err(|e| PipelineError::AllProvidersFailed {
                attempts: self.ensemble.len(),
                last_error: e.to_string(),
                resource_cost: 0,
            })?;

        let mut state = StagedState {
            resource_cost: fused.resource_cost,
            warnings: fused.excluded.iter().map(|e| e.to_string()).collect(),
            attributes: fused.attributes,
            ..StagedState::default()
        };
        state.stages.push(StageReport {
            note: Some(format!("{} via {}", strategy, fused.participants.join(", "))),
            ..StageReport::ran(
                Stage::Fusion,
                FUSION_PROVIDER,
                request.schema.len(),
                fused.resource_cost,
            )
        });

        if request.discovery {
            self.discovery_stage(request, &hints, &mut state).await?;
        }

        Ok(state.into_outcome(&request.schema, ExtractionPath::Fused))
    }

    /// Try each fallback provider with the full schema; first success wins.
    async fn run_fallback(
        &self,
        request: &ExtractionRequest,
        cause: PipelineError,
    ) -> Result<ExtractionOutcome, PipelineError> {
        let hints = ContextHints::new(request.context.clone());
        let mut attempts = 0;
        let mut last_error = cause.to_string();
        // Tokens already burned by the failed route and earlier attempts
        let mut spent = cause.resource_cost();

        for provider in &self.fallback {
            if !provider.is_healthy() {
                debug!(provider = provider.id(), "fallback provider unhealthy, skipping");
                last_error = format!("provider {} unhealthy", provider.id());
                continue;
            }
            attempts += 1;
            match call(provider, request, &request.schema, ExtractionMode::Standard, &hints).await {
                Ok(output) => {
                    info!(provider = provider.id(), attempts, "fallback provider succeeded");
                    let state = StagedState {
                        resource_cost: spent + output.resource_cost,
                        stages: vec![StageReport::ran(
                            Stage::Fallback,
                            provider.id(),
                            request.schema.len(),
                            output.resource_cost,
                        )],
                        warnings: vec![cause.to_string()],
                        attributes: restrict(output.attributes, &request.schema, provider.id()),
                        ..StagedState::default()
                    };
                    return Ok(state.into_outcome(&request.schema, ExtractionPath::Fallback));
                }
                Err(e) => {
                    warn!(provider = provider.id(), error = %e, "fallback provider failed");
                    spent += e.resource_cost();
                    last_error = e.to_string();
                }
            }
        }

        Err(PipelineError::AllProvidersFailed {
            attempts,
            last_error,
            resource_cost: spent,
        })
    }
}

impl std::fmt::Debug for StagedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = |ps: &[Arc<dyn ProviderAdapter>]| ps.iter().map(|p| p.id().to_string()).collect::<Vec<_>>();
        f.debug_struct("StagedPipeline")
            .field("fast", &self.fast.as_ref().map(|p| p.id().to_string()))
            .field("detail", &self.detail.as_ref().map(|p| p.id().to_string()))
            .field("discovery", &self.discovery.as_ref().map(|p| p.id().to_string()))
            .field("fallback", &ids(&self.fallback))
            .field("ensemble", &ids(&self.ensemble))
            .field("settings", &self.settings)
            .finish()
    }
}

async fn call(
    provider: &Arc<dyn ProviderAdapter>,
    request: &ExtractionRequest,
    schema: &AttributeSchema,
    mode: ExtractionMode,
    hints: &ContextHints,
) -> Result<ProviderOutput, ProviderError> {
    debug!(provider = provider.id(), %mode, keys = schema.len(), "calling provider");
    provider
        .extract_attributes(&request.image, schema, mode, hints)
        .await
}

/// Keep only `schema` keys and null-fill the rest of them
fn restrict(attributes: AttributeMap, schema: &AttributeSchema, provider: &str) -> AttributeMap {
    let mut kept: AttributeMap = attributes
        .into_iter()
        .filter(|(key, _)| schema.contains(key))
        .collect();
    fill_missing(&mut kept, schema, provider);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::pipeline::StageStatus;
    use crate::provider::{ImagePayload, MockProvider};
    use crate::schema::{AttributeDef, AttributeType, ProductContext};

    fn image() -> ImagePayload {
        ImagePayload::new("image/jpeg", vec![0xff, 0xd8])
    }

    fn apparel_schema() -> AttributeSchema {
        AttributeSchema::new(vec![
            AttributeDef::select("color", "Color", ["Red", "Blue"]),
            AttributeDef::select("fit", "Fit", ["Slim", "Regular"]),
            AttributeDef::text("care", "Care Instructions"),
        ])
    }

    #[tokio::test]
    async fn confident_fast_pass_skips_detail() {
        let fast = Arc::new(MockProvider::new("fast").with_answer("color", "Red", 95.0).with_cost(40));
        let detail = Arc::new(MockProvider::new("detail"));
        let pipeline = StagedPipeline::new()
            .with_fast(fast.clone())
            .with_detail(detail.clone());
        let schema = AttributeSchema::new(vec![AttributeDef::select("color", "Color", ["Red", "Blue"])]);

        let outcome = pipeline.run(&ExtractionRequest::new(image(), schema)).await.unwrap();

        assert_eq!(detail.calls(), 0);
        let color = &outcome.attributes["color"];
        assert_eq!(color.schema_value, Some(AttributeValue::text("Red")));
        assert_eq!(color.visual_confidence, 95.0);
        assert_eq!(color.provenance.provider, "fast");
        assert_eq!(outcome.confidence, 95.0);
        assert_eq!(outcome.resource_cost, 40);
        assert_eq!(outcome.path, ExtractionPath::Staged);
        assert_eq!(outcome.stages[1].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn detail_pass_asks_only_for_weak_and_missing_keys() {
        let fast = Arc::new(
            MockProvider::new("fast")
                .with_answer("color", "Blue", 92.0)
                .with_answer("fit", "Slim", 40.0)
                .with_cost(50),
        );
        let detail = Arc::new(
            MockProvider::new("detail")
                .with_answer("fit", "Regular", 85.0)
                .with_answer("care", "Machine wash", 75.0)
                .with_answer("color", "Red", 99.0)
                .with_cost(200),
        );
        let pipeline = StagedPipeline::new()
            .with_fast(fast.clone())
            .with_detail(detail.clone());

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        let fast_call = &fast.recorded_calls()[0];
        assert_eq!(fast_call.keys, vec!["color", "fit"]);
        assert_eq!(fast_call.mode, ExtractionMode::Fast);

        let detail_call = &detail.recorded_calls()[0];
        assert_eq!(detail_call.keys, vec!["fit", "care"]);
        assert!(detail_call.had_partial);

        // color was confident, so the detail answer for it is ignored
        assert_eq!(outcome.attributes["color"].schema_value, Some(AttributeValue::text("Blue")));
        assert_eq!(outcome.attributes["fit"].schema_value, Some(AttributeValue::text("Regular")));
        assert_eq!(outcome.attributes["fit"].provenance.provider, "detail");
        assert_eq!(outcome.resource_cost, 250);
        let expected = (92.0 + 85.0 + 75.0) / 3.0;
        assert!((outcome.confidence - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_fast_provider_sends_everything_to_detail() {
        let detail = Arc::new(MockProvider::new("detail").with_answer("color", "Red", 80.0));
        let pipeline = StagedPipeline::new().with_detail(detail.clone());

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        assert_eq!(detail.recorded_calls()[0].keys, vec!["color", "fit", "care"]);
        assert_eq!(outcome.attributes.len(), 3);
        assert!(outcome.attributes["care"].is_null());
        assert_eq!(outcome.stages[0].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn unhealthy_fast_provider_is_not_a_failure() {
        let fast = Arc::new(MockProvider::new("fast").unhealthy());
        let detail = Arc::new(MockProvider::new("detail").with_answer("fit", "Slim", 90.0));
        let fallback = Arc::new(MockProvider::new("backup"));
        let pipeline = StagedPipeline::new()
            .with_fast(fast.clone())
            .with_detail(detail)
            .with_fallback_chain(vec![fallback.clone()]);

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        assert_eq!(fast.calls(), 0);
        assert_eq!(fallback.calls(), 0);
        assert_eq!(outcome.path, ExtractionPath::Staged);
        assert_eq!(outcome.attributes["fit"].schema_value, Some(AttributeValue::text("Slim")));
    }

    #[tokio::test]
    async fn not_visible_answers_stay_null_but_present() {
        let fast = Arc::new(MockProvider::new("fast").with_answer("color", "not visible", 90.0));
        let pipeline = StagedPipeline::new().with_fast(fast);
        let schema = AttributeSchema::new(vec![AttributeDef::select("color", "Color", ["Red", "Blue"])]);

        let outcome = pipeline.run(&ExtractionRequest::new(image(), schema)).await.unwrap();

        let color = &outcome.attributes["color"];
        assert!(color.schema_value.is_none());
        assert_eq!(outcome.confidence, 0.0);
    }

    #[tokio::test]
    async fn unparseable_detail_keeps_fast_values() {
        let fast = Arc::new(MockProvider::new("fast").with_answer("color", "Red", 60.0));
        let detail = Arc::new(MockProvider::new("detail").with_raw_response("I cannot help"));
        let pipeline = StagedPipeline::new().with_fast(fast).with_detail(detail);

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        assert_eq!(outcome.path, ExtractionPath::Staged);
        assert_eq!(outcome.attributes["color"].schema_value, Some(AttributeValue::text("Red")));
        assert!(outcome.attributes["care"].is_null());
        assert_eq!(outcome.stages[1].status, StageStatus::Recovered);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn failing_stage_uses_first_working_fallback() {
        let fast = Arc::new(
            MockProvider::new("fast").with_failure(ProviderError::unavailable("fast", "connection refused")),
        );
        let first = Arc::new(MockProvider::new("first").with_raw_response("{not json"));
        let second = Arc::new(MockProvider::new("second").with_answer("care", "Dry clean", 70.0).with_cost(90));
        let third = Arc::new(MockProvider::new("third"));
        let pipeline = StagedPipeline::new()
            .with_fast(fast)
            .with_fallback_chain(vec![first.clone(), second.clone(), third.clone()]);

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        assert_eq!(outcome.path, ExtractionPath::Fallback);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 0);
        assert_eq!(second.recorded_calls()[0].keys.len(), 3);
        assert_eq!(outcome.attributes["care"].provenance.provider, "second");
        assert_eq!(outcome.resource_cost, 90);
    }

    #[tokio::test]
    async fn tokens_spent_before_a_failure_are_kept() {
        let fast = Arc::new(MockProvider::new("fast").with_answer("color", "Red", 40.0).with_cost(300));
        let detail = Arc::new(
            MockProvider::new("detail").with_failure(ProviderError::unavailable("detail", "reset")),
        );
        let garbled = Arc::new(MockProvider::new("garbled").with_raw_response("{oops").with_cost(25));
        let backup = Arc::new(MockProvider::new("backup").with_answer("care", "Dry clean", 70.0).with_cost(90));
        let pipeline = StagedPipeline::new()
            .with_fast(fast)
            .with_detail(detail)
            .with_fallback_chain(vec![garbled, backup]);

        let outcome = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap();

        assert_eq!(outcome.path, ExtractionPath::Fallback);
        assert_eq!(outcome.resource_cost, 300 + 25 + 90);

        let pipeline = StagedPipeline::new()
            .with_fast(Arc::new(MockProvider::new("fast").with_answer("color", "Red", 40.0).with_cost(300)))
            .with_detail(Arc::new(
                MockProvider::new("detail").with_failure(ProviderError::unavailable("detail", "reset")),
            ));
        let err = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AllProvidersFailed { attempts: 0, .. }));
        assert_eq!(err.resource_cost(), 300);
    }

    #[tokio::test]
    async fn all_fallbacks_failing_is_terminal() {
        let down = |id: &str| {
            Arc::new(MockProvider::new(id).with_failure(ProviderError::unavailable(id, "down")))
                as Arc<dyn ProviderAdapter>
        };
        let pipeline = StagedPipeline::new()
            .with_detail(down("detail"))
            .with_fallback_chain(vec![down("a"), down("b")]);

        let err = pipeline
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap_err();

        match err {
            PipelineError::AllProvidersFailed { attempts, last_error, .. } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("'b'"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn discovery_appends_without_touching_attributes() {
        let fast = Arc::new(MockProvider::new("fast").with_answer("color", "Red", 95.0).with_answer("fit", "Slim", 95.0));
        let detail = Arc::new(MockProvider::new("detail").with_answer("care", "Hand wash", 80.0));
        let scout = Arc::new(
            MockProvider::new("scout")
                .with_answer("color", "Blue", 99.0)
                .with_discovery(Discovery {
                    key: "neckline".into(),
                    raw_value: Some(AttributeValue::text("V-neck")),
                    normalized_value: Some("v_neck".into()),
                    confidence: 72.0,
                    suggested_type: AttributeType::Select,
                    possible_values: vec!["V-neck".into(), "Crew".into()],
                    frequency: 1,
                }),
        );
        let pipeline = StagedPipeline::new()
            .with_fast(fast)
            .with_detail(detail)
            .with_discovery(scout.clone());

        let request = ExtractionRequest::new(image(), apparel_schema())
            .with_context(ProductContext::new().with_category("Dresses"))
            .with_discovery(true);
        let outcome = pipeline.run(&request).await.unwrap();

        assert_eq!(scout.recorded_calls()[0].mode, ExtractionMode::Discovery);
        assert_eq!(outcome.discoveries.len(), 1);
        assert_eq!(outcome.discoveries[0].key, "neckline");
        assert_eq!(outcome.attributes["color"].schema_value, Some(AttributeValue::text("Red")));
    }

    #[tokio::test]
    async fn fused_request_runs_every_ensemble_member() {
        let a = Arc::new(MockProvider::new("a").with_answer("color", "Red", 90.0).with_cost(10));
        let b = Arc::new(MockProvider::new("b").with_answer("color", "Blue", 60.0).with_cost(10));
        let fast = Arc::new(MockProvider::new("fast"));
        let pipeline = StagedPipeline::new()
            .with_fast(fast.clone())
            .with_ensemble(vec![a.clone(), b.clone()]);

        let request = ExtractionRequest::new(image(), apparel_schema())
            .with_fusion(FusionStrategy::ConfidenceWeighted);
        let outcome = pipeline.run(&request).await.unwrap();

        assert_eq!(outcome.path, ExtractionPath::Fused);
        assert_eq!(fast.calls(), 0);
        assert_eq!((a.calls(), b.calls()), (1, 1));
        assert_eq!(outcome.attributes["color"].schema_value, Some(AttributeValue::text("Red")));
        assert_eq!(outcome.resource_cost, 20);
    }

    #[tokio::test]
    async fn discovery_runs_after_the_fused_route() {
        let a = Arc::new(MockProvider::new("a").with_answer("color", "Red", 90.0).with_cost(10));
        let b = Arc::new(MockProvider::new("b").with_answer("color", "Red", 80.0).with_cost(10));
        let scout = Arc::new(
            MockProvider::new("scout")
                .with_cost(5)
                .with_discovery(Discovery {
                    key: "pocket_style".into(),
                    raw_value: Some(AttributeValue::text("Patch")),
                    normalized_value: Some("patch".into()),
                    confidence: 64.0,
                    suggested_type: AttributeType::Select,
                    possible_values: vec!["Patch".into(), "Welt".into()],
                    frequency: 1,
                }),
        );
        let pipeline = StagedPipeline::new()
            .with_ensemble(vec![a, b])
            .with_discovery(scout.clone());

        let request = ExtractionRequest::new(image(), apparel_schema())
            .with_fusion(FusionStrategy::Voting)
            .with_discovery(true);
        let outcome = pipeline.run(&request).await.unwrap();

        assert_eq!(outcome.path, ExtractionPath::Fused);
        let calls = scout.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mode, ExtractionMode::Discovery);
        assert!(calls[0].had_partial);
        assert_eq!(outcome.discoveries.len(), 1);
        assert_eq!(outcome.discoveries[0].key, "pocket_style");
        assert_eq!(outcome.attributes["color"].schema_value, Some(AttributeValue::text("Red")));
        assert_eq!(outcome.resource_cost, 25);
        assert_eq!(outcome.stages.last().unwrap().stage, Stage::Discovery);
    }

    #[tokio::test]
    async fn empty_pipeline_reports_no_providers() {
        let err = StagedPipeline::new()
            .run(&ExtractionRequest::new(image(), apparel_schema()))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoProviders));
    }
}
