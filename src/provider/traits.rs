//! The provider adapter contract and registry

use super::types::{
    ContextHints, ExtractionMode, ImagePayload, ProviderConfigPatch, ProviderError, ProviderOutput,
};
use crate::schema::AttributeSchema;
use async_trait::async_trait;
use std::sync::Arc;

/// A vision-capable inference backend behind a uniform interface.
///
/// Implementations must return an entry for every key of `schema` and apply
/// the normalization rules in [`crate::provider::parse`]: sentinels become
/// null, numbers are coerced, select values outside the allowed set become
/// null.
///
/// # Example
///
/// ```ignore
/// struct Fixed;
///
/// #[async_trait]
/// impl ProviderAdapter for Fixed {
///     fn id(&self) -> &str { "fixed" }
///     fn is_healthy(&self) -> bool { true }
///     fn configure(&self, _patch: &ProviderConfigPatch) {}
///     async fn extract_attributes(
///         &self,
///         _image: &ImagePayload,
///         schema: &AttributeSchema,
///         _mode: ExtractionMode,
///         _hints: &ContextHints,
///     ) -> Result<ProviderOutput, ProviderError> {
///         Ok(ProviderOutput { attributes: null_filled(schema, "fixed"), ..Default::default() })
///     }
/// }
/// ```
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique identifier, used in provenance and logs
    fn id(&self) -> &str;

    /// Cheap best-effort health check. Never blocks, never fails.
    fn is_healthy(&self) -> bool;

    /// Merge runtime configuration (model, timeout, temperature). Idempotent.
    fn configure(&self, patch: &ProviderConfigPatch);

    /// Extract the attributes in `schema` from `image`
    async fn extract_attributes(
        &self,
        image: &ImagePayload,
        schema: &AttributeSchema,
        mode: ExtractionMode,
        hints: &ContextHints,
    ) -> Result<ProviderOutput, ProviderError>;
}

/// Named set of provider adapters, in registration order
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter with the same id
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.providers.retain(|p| p.id() != adapter.id());
        self.providers.push(adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// Resolve names in order; returns the first unknown name on failure
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Arc<dyn ProviderAdapter>>, String> {
        ids.iter()
            .map(|id| self.get(id.as_ref()).ok_or_else(|| id.as_ref().to_string()))
            .collect()
    }

    pub fn providers(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.providers
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    /// Health of every registered provider
    pub fn health(&self) -> Vec<(String, bool)> {
        self.providers
            .iter()
            .map(|p| (p.id().to_string(), p.is_healthy()))
            .collect()
    }

    /// Apply a configuration patch to one provider; false if unknown
    pub fn configure(&self, id: &str, patch: &ProviderConfigPatch) -> bool {
        match self.get(id) {
            Some(provider) => {
                provider.configure(patch);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}
