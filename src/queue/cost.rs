//! Estimated job cost and priority assignment

use super::job::Priority;
use crate::schema::{AttributeSchema, ProductContext};
use serde::{Deserialize, Serialize};

/// Linear token estimate for a job, plus the priority overrides tied to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub base: u64,
    pub per_attribute: u64,
    /// Added when department, category and subdepartment are all known
    pub context_bonus: u64,
    /// Jobs estimated above this run at low priority
    pub high_cost_threshold: u64,
    /// Submitters whose jobs always run at high priority
    pub privileged: Vec<String>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            base: 800,
            per_attribute: 120,
            context_bonus: 300,
            high_cost_threshold: 6_000,
            privileged: Vec::new(),
        }
    }
}

impl CostModel {
    pub fn estimate(&self, schema: &AttributeSchema, context: &ProductContext) -> u64 {
        let bonus = if context.is_complete() {
            self.context_bonus
        } else {
            0
        };
        self.base + self.per_attribute * schema.len() as u64 + bonus
    }

    pub fn is_privileged(&self, submitter: Option<&str>) -> bool {
        submitter.is_some_and(|s| self.privileged.iter().any(|p| p == s))
    }

    /// The requested priority, unless the submitter is privileged (high)
    /// or the job is expensive (low). Privilege wins over cost.
    pub fn assign_priority(
        &self,
        requested: Priority,
        estimated_cost: u64,
        submitter: Option<&str>,
    ) -> Priority {
        if self.is_privileged(submitter) {
            Priority::High
        } else if estimated_cost > self.high_cost_threshold {
            Priority::Low
        } else {
            requested
        }
    }
}
