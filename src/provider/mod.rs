//! Provider adapters: uniform access to vision inference backends
//!
//! # Architecture
//!
//! - **ProviderAdapter trait**: the capability every backend implements
//!   (`extract_attributes`, `is_healthy`, `configure`)
//! - **RemoteAdapter**: HTTP adapter; `ProviderKind` selects the OpenAI,
//!   Anthropic, Gemini or Ollama wire format
//! - **MockProvider**: scripted adapter for tests and offline runs
//! - **parse**: the normalization every adapter applies to provider output
//!
//! The pipeline and fusion engine hold `Arc<dyn ProviderAdapter>` and never
//! look at the concrete type.

mod mock;
pub mod parse;
mod prompt;
mod remote;
mod traits;
mod types;

pub use mock::{MockProvider, RecordedCall};
pub use prompt::build_prompt;
pub use remote::{ProviderKind, RemoteAdapter};
pub use traits::{ProviderAdapter, ProviderRegistry};
pub use types::{
    ContextHints, ExtractionMode, ImagePayload, ProviderConfig, ProviderConfigPatch,
    ProviderError, ProviderOutput,
};
