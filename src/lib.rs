//! Attrex: staged multi-provider attribute extraction from product images
//!
//! Given an image and an attribute schema, attrex asks vision-language model
//! providers for a value and a confidence per attribute, and returns a
//! normalized result map.
//!
//! # Core Concepts
//!
//! - **Providers**: adapters behind [`ProviderAdapter`], remote or mocked
//! - **Pipeline**: a cheap fast pass, a detail pass for low-confidence
//!   attributes, optional discovery, and a fallback chain
//! - **Fusion**: voting, confidence-weighted or best-only ensembles
//! - **Scheduler**: admission, priority and token budget control over a
//!   persistent [`JobStore`]
//!
//! # Example
//!
//! ```
//! use attrex::{MockProvider, StagedPipeline};
//! use std::sync::Arc;
//!
//! let pipeline = StagedPipeline::new()
//!     .with_fast(Arc::new(MockProvider::new("fast").with_answer("color", "Red", 95.0)));
//! // Pipeline is ready for use
//! ```

pub mod attributes;
pub mod config;
pub mod fusion;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod schema;
pub mod store;

pub use attributes::{AttributeMap, AttributeResult, AttributeValue, Provenance};
pub use config::{AppConfig, ConfigError};
pub use fusion::{FusedResult, FusionEngine, FusionError, FusionStrategy};
pub use pipeline::{ExtractionOutcome, ExtractionRequest, PipelineError, StagedPipeline};
pub use provider::{
    ExtractionMode, ImagePayload, MockProvider, ProviderAdapter, ProviderError, ProviderOutput,
    ProviderRegistry, RemoteAdapter,
};
pub use queue::{
    ExtractionScheduler, ImageRef, JobId, JobStatus, JobSubmission, Priority, SchedulerConfig,
};
pub use schema::{AttributeDef, AttributeSchema, ProductContext, SchemaProvider};
pub use store::{JobStore, MemoryJobStore, OpenStore, SqliteJobStore, StorageError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
