//! Prompt assembly for remote providers
//!
//! The wording is deliberately plain. What matters to the rest of the crate is
//! the response contract: a JSON object whose `attributes` map holds
//! `{value, confidence, reasoning}` per requested key.

use super::types::{ContextHints, ExtractionMode};
use crate::schema::{AttributeSchema, AttributeType};
use std::fmt::Write;

pub fn build_prompt(schema: &AttributeSchema, mode: ExtractionMode, hints: &ContextHints) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are a product catalog specialist. Examine the product image and extract the attributes listed below."
    );

    let product = &hints.product;
    if !product.is_empty() {
        let placement: Vec<&str> = [&product.department, &product.subdepartment, &product.category]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect();
        let _ = writeln!(prompt, "Catalog placement: {}.", placement.join(" > "));
    }

    match mode {
        ExtractionMode::Fast => {
            let _ = writeln!(prompt, "Answer quickly; only the core visual attributes are requested.");
        }
        ExtractionMode::Detail => {
            let _ = writeln!(
                prompt,
                "These attributes were missing or uncertain in a first pass. Look closely at fine detail, labels and texture."
            );
        }
        ExtractionMode::Discovery => {
            let _ = writeln!(
                prompt,
                "Also list notable attributes that are NOT in the list under \"discoveries\", each with key, value, confidence, suggestedType (text|select|number) and possibleValues."
            );
        }
        ExtractionMode::Standard => {}
    }

    let _ = writeln!(prompt, "\nAttributes:");
    for def in schema {
        match def.attr_type {
            AttributeType::Select => {
                let values: Vec<String> = def
                    .allowed_values
                    .iter()
                    .map(|v| match &v.short {
                        Some(short) => format!("{} ({})", v.full, short),
                        None => v.full.clone(),
                    })
                    .collect();
                let _ = writeln!(
                    prompt,
                    "- {} [{}]: one of {}",
                    def.key,
                    def.display_name(),
                    values.join(", ")
                );
            }
            AttributeType::Number => {
                let _ = writeln!(prompt, "- {} [{}]: a number", def.key, def.display_name());
            }
            AttributeType::Text => {
                let _ = writeln!(prompt, "- {} [{}]: short text", def.key, def.display_name());
            }
        }
    }

    if let Some(partial) = &hints.partial {
        let known: Vec<String> = partial
            .iter()
            .filter_map(|(key, r)| r.schema_value.as_ref().map(|v| format!("{}={}", key, v)))
            .collect();
        if !known.is_empty() {
            let _ = writeln!(prompt, "\nAlready known: {}", known.join("; "));
        }
    }

    let _ = writeln!(
        prompt,
        "\nRespond with JSON only: {{\"attributes\": {{\"<key>\": {{\"value\": ..., \"confidence\": 0-100, \"reasoning\": \"...\"}}}}}}. \
         Use null when an attribute cannot be seen."
    );

    prompt
}
