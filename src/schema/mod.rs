//! Attribute schemas and their resolution

mod provider;
mod types;

pub use provider::{SchemaError, SchemaProvider, StaticSchemaProvider};
pub use types::{AllowedValue, AttributeDef, AttributeSchema, AttributeType, ProductContext};
