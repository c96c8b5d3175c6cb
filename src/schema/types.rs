//! Attribute schema types
//!
//! A schema is the caller-supplied, ordered list of attributes an extraction
//! should fill. Providers are never trusted to stay inside it: every value they
//! return is normalized against the definitions here.

use serde::{Deserialize, Serialize};

/// Value type of a schema attribute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// Free text
    #[default]
    Text,
    /// One of a fixed set of allowed values
    Select,
    /// Numeric value
    Number,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Select => "select",
            Self::Number => "number",
        }
    }
}

/// One allowed value of a select attribute.
///
/// Catalog values often carry a short code next to the display form
/// (`"S"` / `"Small"`). Either form matches; the full form is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AllowedValueRepr")]
pub struct AllowedValue {
    pub full: String,
    pub short: Option<String>,
}

impl AllowedValue {
    pub fn new(full: impl Into<String>) -> Self {
        Self {
            full: full.into(),
            short: None,
        }
    }

    pub fn with_short(full: impl Into<String>, short: impl Into<String>) -> Self {
        Self {
            full: full.into(),
            short: Some(short.into()),
        }
    }

    /// Case-insensitive exact match against the short or full form
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim().to_lowercase();
        self.full.to_lowercase() == candidate
            || self
                .short
                .as_deref()
                .is_some_and(|s| s.to_lowercase() == candidate)
    }
}

/// Schema files may list allowed values as bare strings or as `{full, short}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum AllowedValueRepr {
    Plain(String),
    Detailed { full: String, short: Option<String> },
}

impl From<AllowedValueRepr> for AllowedValue {
    fn from(repr: AllowedValueRepr) -> Self {
        match repr {
            AllowedValueRepr::Plain(full) => Self::new(full),
            AllowedValueRepr::Detailed { full, short } => Self { full, short },
        }
    }
}

/// Definition of a single attribute in a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub attr_type: AttributeType,
    #[serde(default)]
    pub allowed_values: Vec<AllowedValue>,
}

impl AttributeDef {
    pub fn text(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            attr_type: AttributeType::Text,
            allowed_values: Vec::new(),
        }
    }

    pub fn number(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            attr_type: AttributeType::Number,
            ..Self::text(key, label)
        }
    }

    pub fn select<I, S>(key: impl Into<String>, label: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attr_type: AttributeType::Select,
            allowed_values: values.into_iter().map(|v| AllowedValue::new(v)).collect(),
            ..Self::text(key, label)
        }
    }

    /// Add an allowed value with a short code
    pub fn with_value(mut self, value: AllowedValue) -> Self {
        self.allowed_values.push(value);
        self
    }

    /// Label if set, key otherwise
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.key
        } else {
            &self.label
        }
    }

    /// Find the allowed value matching a provider answer
    pub fn match_allowed(&self, candidate: &str) -> Option<&AllowedValue> {
        self.allowed_values.iter().find(|v| v.matches(candidate))
    }
}

/// Ordered list of attribute definitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSchema(Vec<AttributeDef>);

impl AttributeSchema {
    pub fn new(defs: Vec<AttributeDef>) -> Self {
        Self(defs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeDef> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&AttributeDef> {
        self.0.iter().find(|d| d.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.key.as_str()).collect()
    }

    /// Sub-schema of the definitions accepted by `keep`, order preserved
    pub fn filter(&self, mut keep: impl FnMut(&AttributeDef) -> bool) -> Self {
        Self(self.0.iter().filter(|d| keep(d)).cloned().collect())
    }

    /// Sub-schema restricted to `keys`, order preserved
    pub fn subset<S: AsRef<str>>(&self, keys: &[S]) -> Self {
        self.filter(|d| keys.iter().any(|k| k.as_ref() == d.key))
    }
}

impl From<Vec<AttributeDef>> for AttributeSchema {
    fn from(defs: Vec<AttributeDef>) -> Self {
        Self(defs)
    }
}

impl<'a> IntoIterator for &'a AttributeSchema {
    type Item = &'a AttributeDef;
    type IntoIter = std::slice::Iter<'a, AttributeDef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Catalog placement of the product being extracted.
///
/// Forwarded to providers as hints; richer context also raises the job's
/// estimated cost.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdepartment: Option<String>,
}

impl ProductContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_subdepartment(mut self, subdepartment: impl Into<String>) -> Self {
        self.subdepartment = Some(subdepartment.into());
        self
    }

    /// Department, category and subdepartment are all known
    pub fn is_complete(&self) -> bool {
        self.department.is_some() && self.category.is_some() && self.subdepartment.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.department.is_none() && self.category.is_none() && self.subdepartment.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_value_matches_short_and_full_ignoring_case() {
        let value = AllowedValue::with_short("Small", "S");
        assert!(value.matches("small"));
        assert!(value.matches(" s "));
        assert!(!value.matches("Sm"));
    }

    #[test]
    fn allowed_value_case_folding_covers_accented_letters() {
        let value = AllowedValue::with_short("Écru", "É");
        assert!(value.matches("ÉCRU"));
        assert!(value.matches("écru"));
        assert!(value.matches("é"));
        assert!(!value.matches("Ecru"));
    }

    #[test]
    fn schema_subset_preserves_order() {
        let schema = AttributeSchema::new(vec![
            AttributeDef::text("color", "Color"),
            AttributeDef::text("fabric", "Fabric"),
            AttributeDef::number("weight", "Weight"),
        ]);

        let subset = schema.subset(&["weight", "color"]);
        assert_eq!(subset.keys(), vec!["color", "weight"]);
    }

    #[test]
    fn schema_yaml_accepts_plain_and_detailed_values() {
        let yaml = r#"
- key: size
  label: Size
  type: select
  allowedValues:
    - Large
    - { full: Small, short: S }
"#;
        let schema: AttributeSchema = serde_yaml::from_str(yaml).unwrap();
        let size = schema.get("size").unwrap();
        assert_eq!(size.attr_type, AttributeType::Select);
        assert_eq!(size.match_allowed("s").unwrap().full, "Small");
        assert_eq!(size.match_allowed("LARGE").unwrap().full, "Large");
    }

    #[test]
    fn context_completeness() {
        let ctx = ProductContext::new()
            .with_department("Women")
            .with_category("Dresses");
        assert!(!ctx.is_complete());
        assert!(ctx.with_subdepartment("Casual").is_complete());
    }
}
