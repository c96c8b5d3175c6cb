//! Fusion engine: one attribute map out of many provider answers

use super::types::{FusedResult, FusionError, FusionStrategy, ProviderRun};
use crate::attributes::{
    fill_missing, mean_confidence, null_filled, Agreement, AgreementLevel, AttributeMap,
    AttributeResult, AttributeValue, Provenance,
};
use crate::provider::{
    ContextHints, ExtractionMode, ImagePayload, ProviderAdapter, ProviderError,
};
use crate::schema::AttributeSchema;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Provider recorded on keys nobody answered
pub const FUSION_PROVIDER: &str = "fusion";

/// A provider that answered, with its map restricted to the schema
struct Participant {
    provider: String,
    attributes: AttributeMap,
    confidence: f64,
}

/// Support gathered by one candidate value for one key
struct Tally<'a> {
    value: &'a AttributeValue,
    vote_key: String,
    count: usize,
    confidence_sum: f64,
    weight: f64,
    max_confidence: f64,
    supporters: Vec<&'a str>,
    first: &'a AttributeResult,
}

/// Combines provider runs under a [`FusionStrategy`]
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    strategy: FusionStrategy,
}

impl FusionEngine {
    pub fn new(strategy: FusionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    /// Call every provider concurrently, then fuse what came back.
    ///
    /// Unhealthy providers are not called; they count as failed runs.
    pub async fn run(
        &self,
        providers: &[Arc<dyn ProviderAdapter>],
        image: &ImagePayload,
        schema: &AttributeSchema,
        mode: ExtractionMode,
        hints: &ContextHints,
    ) -> Result<FusedResult, FusionError> {
        let calls = providers.iter().map(|provider| async move {
            let id = provider.id().to_string();
            if !provider.is_healthy() {
                return ProviderRun::failed(ProviderError::unavailable(id, "health check failed"));
            }
            match provider.extract_attributes(image, schema, mode, hints).await {
                Ok(output) => ProviderRun::ok(id, output),
                Err(e) => ProviderRun::failed(e),
            }
        });
        let runs = join_all(calls).await;
        self.fuse(&runs, schema)
    }

    /// Fuse finished runs. Output depends only on the runs, their order and
    /// the strategy.
    pub fn fuse(
        &self,
        runs: &[ProviderRun],
        schema: &AttributeSchema,
    ) -> Result<FusedResult, FusionError> {
        let mut participants = Vec::new();
        let mut excluded = Vec::new();
        let mut resource_cost = 0u64;

        for run in runs {
            match &run.outcome {
                Ok(output) => {
                    let mut attributes: AttributeMap = output
                        .attributes
                        .iter()
                        .filter(|(key, _)| schema.contains(key))
                        .map(|(key, r)| (key.clone(), r.clone()))
                        .collect();
                    fill_missing(&mut attributes, schema, &run.provider);
                    resource_cost += output.resource_cost;
                    participants.push(Participant {
                        provider: run.provider.clone(),
                        attributes,
                        confidence: output.confidence,
                    });
                }
                Err(e) if e.is_parse_failure() => {
                    debug!(provider = %run.provider, error = %e, "unparseable output fused as nulls");
                    resource_cost += e.resource_cost();
                    participants.push(Participant {
                        provider: run.provider.clone(),
                        attributes: null_filled(schema, &run.provider),
                        confidence: 0.0,
                    });
                }
                Err(e) => {
                    warn!(provider = %run.provider, error = %e, "provider excluded from fusion");
                    excluded.push(e.clone());
                }
            }
        }

        if participants.is_empty() {
            return Err(FusionError::AllProvidersFailed { errors: excluded });
        }

        let attributes = match self.strategy {
            FusionStrategy::Voting => tally_fuse(&participants, schema, false),
            FusionStrategy::ConfidenceWeighted => tally_fuse(&participants, schema, true),
            FusionStrategy::BestOnly => best_only(&participants, schema),
        };

        debug!(
            strategy = %self.strategy,
            participants = participants.len(),
            excluded = excluded.len(),
            "fused provider results"
        );

        Ok(FusedResult {
            strategy: self.strategy,
            confidence: mean_confidence(&attributes),
            attributes,
            resource_cost,
            participants: participants.into_iter().map(|p| p.provider).collect(),
            excluded,
        })
    }
}

fn tallies_for<'a>(participants: &'a [Participant], key: &str) -> Vec<Tally<'a>> {
    let mut tallies: Vec<Tally<'a>> = Vec::new();
    for participant in participants {
        let Some(result) = participant.attributes.get(key) else {
            continue;
        };
        let Some(value) = result.schema_value.as_ref() else {
            continue;
        };
        let vote_key = value.vote_key();
        let confidence = result.visual_confidence;
        match tallies.iter_mut().find(|t| t.vote_key == vote_key) {
            Some(tally) => {
                tally.count += 1;
                tally.confidence_sum += confidence;
                tally.weight += confidence / 100.0;
                tally.max_confidence = tally.max_confidence.max(confidence);
                tally.supporters.push(participant.provider.as_str());
            }
            None => tallies.push(Tally {
                value,
                vote_key,
                count: 1,
                confidence_sum: confidence,
                weight: confidence / 100.0,
                max_confidence: confidence,
                supporters: vec![participant.provider.as_str()],
                first: result,
            }),
        }
    }
    tallies
}

/// Voting and confidence-weighted fusion share the tally; they differ in
/// how a winner is ranked and which confidence it keeps.
fn tally_fuse(participants: &[Participant], schema: &AttributeSchema, weighted: bool) -> AttributeMap {
    let total = participants.len();
    let mut fused = AttributeMap::new();

    for def in schema {
        let tallies = tallies_for(participants, &def.key);

        // Tallies are in first-appearance order, so a strict comparison
        // keeps the earliest provider on exact ties.
        let mut winner: Option<&Tally> = None;
        for tally in &tallies {
            let better = match winner {
                None => true,
                Some(best) if weighted => tally.weight > best.weight,
                Some(best) => {
                    tally.count > best.count
                        || (tally.count == best.count && tally.confidence_sum > best.confidence_sum)
                }
            };
            if better {
                winner = Some(tally);
            }
        }

        let entry = match winner {
            None => AttributeResult::null(FUSION_PROVIDER),
            Some(tally) => {
                let ratio = tally.count as f64 / total as f64;
                let confidence = if weighted {
                    tally.max_confidence
                } else {
                    tally.confidence_sum / tally.count as f64
                };
                let provenance = Provenance {
                    provider: tally.supporters[0].to_string(),
                    reasoning: Some(format!(
                        "{} of {} providers agreed",
                        tally.count, total
                    )),
                    agreement: Some(Agreement {
                        ratio,
                        level: AgreementLevel::from_ratio(ratio),
                        supporters: tally.supporters.iter().map(|s| s.to_string()).collect(),
                    }),
                };
                AttributeResult::new(
                    tally.first.raw_value.clone(),
                    Some(tally.value.clone()),
                    confidence,
                    provenance,
                )
            }
        };
        fused.insert(def.key.clone(), entry);
    }

    fused
}

fn best_only(participants: &[Participant], schema: &AttributeSchema) -> AttributeMap {
    // Stable sort keeps invocation order among equal confidences.
    let mut ranked: Vec<&Participant> = participants.iter().collect();
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let primary = ranked[0];

    let mut fused = AttributeMap::new();
    for def in schema {
        let from_primary = primary
            .attributes
            .get(&def.key)
            .filter(|r| !r.is_null())
            .cloned();

        let entry = from_primary.unwrap_or_else(|| {
            ranked[1..]
                .iter()
                .find_map(|p| {
                    p.attributes
                        .get(&def.key)
                        .filter(|r| !r.is_null())
                        .map(|r| (p, r))
                })
                .map(|(supplier, r)| {
                    let mut result = r.clone();
                    result.provenance = Provenance::from_provider(&supplier.provider)
                        .with_reasoning(format!("fallback from provider {}", primary.provider));
                    result
                })
                .unwrap_or_else(|| AttributeResult::null(&primary.provider))
        });
        fused.insert(def.key.clone(), entry);
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderOutput;
    use crate::schema::AttributeDef;

    fn schema() -> AttributeSchema {
        AttributeSchema::new(vec![
            AttributeDef::select("size", "Size", ["S", "M", "L"]),
            AttributeDef::select("color", "Color", ["Red", "Blue"]),
        ])
    }

    fn output(answers: &[(&str, &str, f64)], provider: &str, cost: u64) -> ProviderOutput {
        let mut attributes = AttributeMap::new();
        for (key, value, confidence) in answers {
            attributes.insert(
                key.to_string(),
                AttributeResult::extracted(AttributeValue::text(*value), *confidence, provider),
            );
        }
        ProviderOutput {
            confidence: mean_confidence(&attributes),
            attributes,
            resource_cost: cost,
            discoveries: Vec::new(),
        }
    }

    fn run(provider: &str, answers: &[(&str, &str, f64)]) -> ProviderRun {
        ProviderRun::ok(provider, output(answers, provider, 100))
    }

    #[test]
    fn weighted_prefers_single_confident_provider() {
        let runs = vec![run("a", &[("size", "S", 90.0)]), run("b", &[("size", "M", 60.0)])];

        let fused = FusionEngine::new(FusionStrategy::ConfidenceWeighted)
            .fuse(&runs, &schema())
            .unwrap();

        let size = &fused.attributes["size"];
        assert_eq!(size.schema_value, Some(AttributeValue::text("S")));
        assert_eq!(size.visual_confidence, 90.0);
        assert_eq!(size.provenance.provider, "a");
    }

    #[test]
    fn weighted_confidence_is_max_not_mean() {
        let runs = vec![
            run("a", &[("size", "M", 50.0)]),
            run("b", &[("size", "M", 80.0)]),
            run("c", &[("size", "S", 95.0)]),
        ];

        let fused = FusionEngine::new(FusionStrategy::ConfidenceWeighted)
            .fuse(&runs, &schema())
            .unwrap();

        let size = &fused.attributes["size"];
        assert_eq!(size.schema_value, Some(AttributeValue::text("M")));
        assert_eq!(size.visual_confidence, 80.0);
    }

    #[test]
    fn voting_tie_goes_to_first_provider() {
        let runs = vec![run("a", &[("size", "S", 70.0)]), run("b", &[("size", "M", 70.0)])];

        let fused = FusionEngine::new(FusionStrategy::Voting).fuse(&runs, &schema()).unwrap();

        let size = &fused.attributes["size"];
        assert_eq!(size.schema_value, Some(AttributeValue::text("S")));
        let agreement = size.provenance.agreement.as_ref().unwrap();
        assert_eq!(agreement.ratio, 0.5);
        assert_eq!(agreement.level, AgreementLevel::Majority);
    }

    #[test]
    fn voting_count_tie_broken_by_confidence_sum() {
        let runs = vec![run("a", &[("size", "S", 60.0)]), run("b", &[("size", "M", 75.0)])];

        let fused = FusionEngine::new(FusionStrategy::Voting).fuse(&runs, &schema()).unwrap();

        assert_eq!(fused.attributes["size"].schema_value, Some(AttributeValue::text("M")));
    }

    #[test]
    fn voting_majority_and_mean_confidence() {
        let runs = vec![
            run("a", &[("size", "M", 80.0), ("color", "Red", 90.0)]),
            run("b", &[("size", "M", 60.0), ("color", "Red", 70.0)]),
            run("c", &[("size", "S", 99.0), ("color", "Red", 80.0)]),
        ];

        let fused = FusionEngine::new(FusionStrategy::Voting).fuse(&runs, &schema()).unwrap();

        let size = &fused.attributes["size"];
        assert_eq!(size.schema_value, Some(AttributeValue::text("M")));
        assert_eq!(size.visual_confidence, 70.0);
        assert_eq!(
            size.provenance.agreement.as_ref().unwrap().supporters,
            vec!["a", "b"]
        );

        let color = &fused.attributes["color"];
        assert_eq!(color.visual_confidence, 80.0);
        assert_eq!(
            color.provenance.agreement.as_ref().unwrap().level,
            AgreementLevel::Unanimous
        );
        assert_eq!(fused.resource_cost, 300);
    }

    #[test]
    fn best_only_fills_gaps_from_next_provider() {
        let runs = vec![
            run("low", &[("size", "L", 40.0), ("color", "Blue", 40.0)]),
            run("high", &[("size", "S", 95.0)]),
        ];

        let fused = FusionEngine::new(FusionStrategy::BestOnly).fuse(&runs, &schema()).unwrap();

        assert_eq!(fused.attributes["size"].schema_value, Some(AttributeValue::text("S")));
        assert_eq!(fused.attributes["size"].provenance.provider, "high");

        let color = &fused.attributes["color"];
        assert_eq!(color.schema_value, Some(AttributeValue::text("Blue")));
        assert_eq!(color.provenance.provider, "low");
        assert_eq!(
            color.provenance.reasoning.as_deref(),
            Some("fallback from provider high")
        );
    }

    #[test]
    fn failed_providers_are_excluded_and_parse_failures_count_as_null() {
        let runs = vec![
            ProviderRun::failed(ProviderError::unavailable("down", "no key")),
            ProviderRun::failed(ProviderError::parse("garbled", "not json").with_cost(40)),
            run("ok", &[("size", "S", 80.0)]),
        ];

        let fused = FusionEngine::new(FusionStrategy::Voting).fuse(&runs, &schema()).unwrap();

        assert_eq!(fused.participants, vec!["garbled", "ok"]);
        assert_eq!(fused.excluded.len(), 1);
        assert_eq!(fused.resource_cost, 140);
        let agreement = fused.attributes["size"].provenance.agreement.as_ref().unwrap();
        assert_eq!(agreement.ratio, 0.5);
        assert!(fused.attributes["color"].is_null());
    }

    #[test]
    fn every_schema_key_present_and_extra_keys_dropped() {
        let runs = vec![run("a", &[("size", "S", 80.0), ("sleeve", "Long", 90.0)])];

        let fused = FusionEngine::new(FusionStrategy::ConfidenceWeighted)
            .fuse(&runs, &schema())
            .unwrap();

        assert_eq!(fused.attributes.len(), 2);
        assert!(fused.attributes["color"].is_null());
        assert!(!fused.attributes.contains_key("sleeve"));
    }

    #[test]
    fn all_failed_is_an_error() {
        let runs = vec![
            ProviderRun::failed(ProviderError::unavailable("a", "down")),
            ProviderRun::failed(ProviderError::unavailable("b", "down")),
        ];

        let err = FusionEngine::new(FusionStrategy::Voting)
            .fuse(&runs, &schema())
            .unwrap_err();

        assert_eq!(err.to_string(), "all providers failed");
    }

    #[test]
    fn fusion_is_deterministic() {
        let runs = vec![
            run("a", &[("size", "S", 70.0), ("color", "Red", 55.0)]),
            run("b", &[("size", "M", 70.0), ("color", "Blue", 55.0)]),
        ];
        for strategy in [
            FusionStrategy::Voting,
            FusionStrategy::ConfidenceWeighted,
            FusionStrategy::BestOnly,
        ] {
            let engine = FusionEngine::new(strategy);
            let first = engine.fuse(&runs, &schema()).unwrap();
            let second = engine.fuse(&runs, &schema()).unwrap();
            assert_eq!(first.attributes, second.attributes);
        }
    }
}
