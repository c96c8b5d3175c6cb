//! Fusion: combining several providers' answers for the same request
//!
//! Three strategies are available:
//!
//! - **Voting**: the value most providers agree on, ties broken by summed
//!   confidence, then by invocation order
//! - **Confidence-weighted**: each vote weighted by confidence; the winner
//!   keeps its single best confidence
//! - **Best-only**: the most confident provider overall, with its nulls
//!   filled from the next providers in rank order
//!
//! Failed providers are left out. Unparseable answers take part as
//! all-null results. When nobody answered, fusion fails.

mod engine;
mod types;

pub use engine::{FusionEngine, FUSION_PROVIDER};
pub use types::{FusedResult, FusionError, FusionStrategy, ProviderRun};
