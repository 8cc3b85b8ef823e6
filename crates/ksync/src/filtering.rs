//! 🧹 Filtering: decides which extracted documents make it into the index.
//!
//! Two halves. The engine half ([`post_process_engine`], [`simple_rule`]) tags each document
//! include or exclude during a sync. The validation half ([`schema_validator`],
//! [`filter_validator`], [`simple_rules_validation`]) checks a draft filter before anyone
//! is allowed to activate it.

pub mod filter_validator;
pub mod post_process_engine;
pub mod schema_validator;
pub mod simple_rule;
pub mod simple_rules_validation;
pub mod validation;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use filter_validator::FilterValidator;
pub use post_process_engine::{PostProcessEngine, PostProcessResult};
pub use simple_rule::SimpleRule;
pub use validation::{ValidationResult, ValidationState};

/// The only filtering domain the engine reads.
pub const DEFAULT_DOMAIN: &str = "DEFAULT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedSnippet {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// 📜 One side of a filtering domain: the rules, the snippet, and what validation thought of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterDefinition {
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub advanced_snippet: AdvancedSnippet,
    #[serde(default)]
    pub validation: ValidationResult,
}

/// 🗂️ A domain keeps a draft (being edited) and an active (being applied) filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilteringDomain {
    pub domain: String,
    #[serde(default)]
    pub draft: FilterDefinition,
    #[serde(default)]
    pub active: FilterDefinition,
}

/// 🔎 The DEFAULT domain out of a connector's filtering list.
pub fn default_domain(filtering: &[FilteringDomain]) -> Option<&FilteringDomain> {
    filtering.iter().find(|domain| domain.domain == DEFAULT_DOMAIN)
}
