//! 🛂 FilterValidator: the border control every draft filter passes before it can go active.

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::schema_validator::{SchemaFields, SchemaValidator, is_blank};
use super::simple_rules_validation::{
    NoConflictingPoliciesRulesValidator, SimpleRulesValidator, SingleRuleAgainstSchemaValidator,
};
use super::validation::ValidationResult;
use super::FilterDefinition;

pub const ADVANCED_SNIPPET_ID: &str = "advanced_snippet";

/// 🧾 Validates the source-specific advanced snippet.
pub trait AdvancedSnippetValidator: Debug + Send + Sync {
    fn is_snippet_valid(&self, snippet: &Value) -> ValidationResult;
}

#[derive(Debug, Clone)]
pub struct AdvancedSnippetAgainstSchemaValidator {
    validator: SchemaValidator,
}

impl AdvancedSnippetAgainstSchemaValidator {
    pub fn new(schema: SchemaFields) -> Self {
        Self {
            validator: SchemaValidator::new(ADVANCED_SNIPPET_ID, schema),
        }
    }
}

impl AdvancedSnippetValidator for AdvancedSnippetAgainstSchemaValidator {
    fn is_snippet_valid(&self, snippet: &Value) -> ValidationResult {
        self.validator.validate(Some(snippet))
    }
}

#[derive(Debug, Clone)]
pub struct FilterValidator {
    snippet_validators: Vec<Arc<dyn AdvancedSnippetValidator>>,
    rules_validators: Vec<Arc<dyn SimpleRulesValidator>>,
}

impl Default for FilterValidator {
    fn default() -> Self {
        Self::with_schema(None)
    }
}

impl FilterValidator {
    pub fn new(
        snippet_validators: Vec<Arc<dyn AdvancedSnippetValidator>>,
        rules_validators: Vec<Arc<dyn SimpleRulesValidator>>,
    ) -> Self {
        Self {
            snippet_validators,
            rules_validators,
        }
    }

    /// 🧰 The standard simple-rule checks, plus a snippet schema if the connector has one.
    pub fn with_schema(advanced_snippet_schema: Option<SchemaFields>) -> Self {
        let snippet_validators: Vec<Arc<dyn AdvancedSnippetValidator>> = advanced_snippet_schema
            .map(|schema| Arc::new(AdvancedSnippetAgainstSchemaValidator::new(schema)) as Arc<dyn AdvancedSnippetValidator>)
            .into_iter()
            .collect();
        Self::new(
            snippet_validators,
            vec![
                Arc::new(SingleRuleAgainstSchemaValidator),
                Arc::new(NoConflictingPoliciesRulesValidator),
            ],
        )
    }

    pub fn is_filter_valid(&self, filter: &FilterDefinition) -> ValidationResult {
        let snippet = &filter.advanced_snippet.value;
        let snippet_results: Vec<ValidationResult> = if is_blank(snippet) {
            Vec::new()
        } else {
            self.snippet_validators
                .iter()
                .map(|validator| validator.is_snippet_valid(snippet))
                .collect()
        };

        let rules_results = self
            .rules_validators
            .iter()
            .map(|validator| validator.are_rules_valid(&filter.rules));

        let result = ValidationResult::merge(snippet_results.into_iter().chain(rules_results));
        debug!(
            "🛂 Filter validation finished: {:?} with {} error groups",
            result.state,
            result.errors.len()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::schema_validator::{FieldSchema, FieldType};
    use crate::filtering::validation::ValidationState;
    use serde_json::json;

    fn filter(value: Value) -> FilterDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn snippet_schema() -> SchemaFields {
        SchemaFields::new(vec![FieldSchema::required("query", FieldType::String)])
    }

    #[test]
    fn the_one_where_an_empty_filter_is_perfectly_valid() {
        let validator = FilterValidator::with_schema(Some(snippet_schema()));
        let result = validator.is_filter_valid(&FilterDefinition::default());
        assert_eq!(result.state, ValidationState::Valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn the_one_where_snippet_and_rule_errors_pile_up_together() {
        let validator = FilterValidator::with_schema(Some(snippet_schema()));
        let result = validator.is_filter_valid(&filter(json!({
            "advanced_snippet": {"value": {"querry": "typo"}},
            "rules": [
                {"id": "a", "order": 1, "policy": "include", "field": "ext", "rule": "equals", "value": "pdf"},
                {"id": "b", "order": 2, "policy": "exclude", "field": "ext", "rule": "equals", "value": "pdf"}
            ]
        })));
        assert_eq!(result.state, ValidationState::Invalid);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].ids, vec![ADVANCED_SNIPPET_ID]);
        assert_eq!(result.errors[1].ids, vec!["a", "b"]);
    }

    #[test]
    fn the_one_where_no_schema_means_no_snippet_opinions() {
        let validator = FilterValidator::default();
        let result = validator.is_filter_valid(&filter(json!({
            "advanced_snippet": {"value": {"anything": ["goes"]}},
            "rules": []
        })));
        assert!(result.is_valid());
    }
}
