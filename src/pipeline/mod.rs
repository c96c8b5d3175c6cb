//! Staged extraction pipeline
//!
//! A request runs fast → detail → (optional) discovery, or through the fusion
//! ensemble when a strategy is requested. Any provider error escaping those
//! routes hands the request to the fallback chain, where the first provider
//! that answers wins.

mod staged;
mod types;

pub use staged::{StagedPipeline, PIPELINE_PROVIDER};
pub use types::{
    ExtractionOutcome, ExtractionPath, ExtractionRequest, PipelineError, PipelineSettings, Stage,
    StageReport, StageStatus, CORE_VOCABULARY, DEFAULT_CONFIDENCE_THRESHOLD,
};
