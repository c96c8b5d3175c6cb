//! Schema providers: resolve a category to its attribute schema
//!
//! The catalog hierarchy lives outside this crate. The orchestration core
//! only ever sees the resolved `AttributeSchema`; it never fetches or caches
//! schemas itself.

use super::types::AttributeSchema;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors from schema resolution
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Schema file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Resolves a category identifier to an ordered attribute schema
pub trait SchemaProvider: Send + Sync {
    fn schema_for(&self, category: &str) -> Result<AttributeSchema, SchemaError>;
}

/// Fixed category → schema table, typically loaded from a YAML file:
///
/// ```yaml
/// dresses:
///   - key: color
///     label: Color
///     type: select
///     allowedValues: [Red, Blue]
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaProvider {
    schemas: HashMap<String, AttributeSchema>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, category: impl Into<String>, schema: AttributeSchema) -> Self {
        self.schemas.insert(category.into(), schema);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, SchemaError> {
        let schemas: HashMap<String, AttributeSchema> = serde_yaml::from_str(yaml)?;
        Ok(Self { schemas })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl SchemaProvider for StaticSchemaProvider {
    fn schema_for(&self, category: &str) -> Result<AttributeSchema, SchemaError> {
        self.schemas
            .get(category)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownCategory(category.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_category_from_yaml() {
        let provider = StaticSchemaProvider::from_yaml_str(
            r#"
dresses:
  - key: color
    label: Color
    type: select
    allowedValues: [Red, Blue]
  - key: length
    label: Length
"#,
        )
        .unwrap();

        let schema = provider.schema_for("dresses").unwrap();
        assert_eq!(schema.keys(), vec!["color", "length"]);
        assert_eq!(provider.categories(), vec!["dresses"]);
    }

    #[test]
    fn unknown_category_is_an_error() {
        let provider = StaticSchemaProvider::new();
        let err = provider.schema_for("shoes").unwrap_err();
        assert!(matches!(err, SchemaError::UnknownCategory(c) if c == "shoes"));
    }
}
