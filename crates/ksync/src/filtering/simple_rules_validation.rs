//! 📏 Validators for the simple rule list of a filter.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde_json::Value;

use super::schema_validator::{FieldSchema, FieldType, SchemaFields, SchemaValidator, TypeCheck};
use super::simple_rule::{DEFAULT_RULE_ID, Policy, RuleKind, string_form};
use super::validation::{ValidationError, ValidationResult, ValidationState};

pub const SIMPLE_RULES_ID: &str = "simple_rules";

const MATCH_ALL_REGEXES: [&str; 2] = [".*", "(.*)"];

/// 📏 Looks at the whole rule list at once.
pub trait SimpleRulesValidator: Debug + Send + Sync {
    fn are_rules_valid(&self, rules: &[Value]) -> ValidationResult;
}

/// 🧬 Every rule, one by one, against the shape a simple rule must have.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRuleAgainstSchemaValidator;

fn single_rule_schema() -> SchemaFields {
    SchemaFields::new(vec![
        FieldSchema::required("id", FieldType::String),
        FieldSchema::required("field", FieldType::String),
        FieldSchema::required(
            "value",
            FieldType::custom("string, integer or boolean", |value| {
                (value.is_string() || value.is_i64() || value.is_u64() || value.is_boolean()).into()
            }),
        ),
        FieldSchema::required(
            "policy",
            FieldType::custom("policy", |value| {
                match value.as_str().filter(|policy| Policy::ALL.contains(policy)) {
                    Some(_) => TypeCheck::Valid,
                    None => TypeCheck::Invalid(Some(format!(
                        "Policy must be one of {:?}, got {value}.",
                        Policy::ALL
                    ))),
                }
            }),
        ),
        FieldSchema::required(
            "rule",
            FieldType::custom("rule", |value| {
                match value.as_str().filter(|rule| RuleKind::ALL.contains(rule)) {
                    Some(_) => TypeCheck::Valid,
                    None => TypeCheck::Invalid(Some(format!(
                        "Rule must be one of {:?}, got {value}.",
                        RuleKind::ALL
                    ))),
                }
            }),
        ),
        FieldSchema::required(
            "order",
            FieldType::custom("non-negative integer", |value| value.is_u64().into()),
        ),
        FieldSchema::optional("created_at", FieldType::String),
        FieldSchema::optional("updated_at", FieldType::String),
    ])
    .with_constraint(|rule| !is_match_all_regex(rule))
}

// ".*" on a regular rule makes every other rule pointless
fn is_match_all_regex(rule: Option<&Value>) -> bool {
    let Some(rule) = rule.and_then(Value::as_object) else {
        return false;
    };
    let is_default = rule.get("id").and_then(Value::as_str) == Some(DEFAULT_RULE_ID);
    let is_regex = rule.get("rule").and_then(Value::as_str) == Some(RuleKind::Regex.as_str());
    let is_match_all = rule
        .get("value")
        .and_then(Value::as_str)
        .is_some_and(|value| MATCH_ALL_REGEXES.contains(&value));
    !is_default && is_regex && is_match_all
}

impl SimpleRulesValidator for SingleRuleAgainstSchemaValidator {
    fn are_rules_valid(&self, rules: &[Value]) -> ValidationResult {
        let schema = single_rule_schema();
        ValidationResult::merge(rules.iter().map(|rule| {
            let rule_id = rule
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(SIMPLE_RULES_ID);
            SchemaValidator::new(rule_id, schema.clone()).validate(Some(rule))
        }))
    }
}

/// ⚔️ The same condition can't be both included and excluded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConflictingPoliciesRulesValidator;

impl SimpleRulesValidator for NoConflictingPoliciesRulesValidator {
    fn are_rules_valid(&self, rules: &[Value]) -> ValidationResult {
        // (rule, field, value) -> [(id, policy)]
        let mut conditions: BTreeMap<(String, String, String), Vec<(String, String)>> = BTreeMap::new();
        for rule in rules {
            let text = |key: &str| rule.get(key).map(string_form).unwrap_or_default();
            conditions
                .entry((text("rule"), text("field"), text("value")))
                .or_default()
                .push((text("id"), text("policy")));
        }

        ValidationResult::merge(conditions.into_iter().filter_map(|((rule, field, value), entries)| {
            let policies: Vec<&str> = entries.iter().map(|(_, policy)| policy.as_str()).collect();
            let conflicting = policies.contains(&"include") && policies.contains(&"exclude");
            conflicting.then(|| ValidationResult {
                state: ValidationState::Invalid,
                errors: vec![ValidationError {
                    ids: entries.into_iter().map(|(id, _)| id).collect(),
                    messages: vec![format!(
                        "Two simple rules with same rule ({rule}), field ({field}), value ({value}) and conflicting policies detected."
                    )],
                }],
            })
        }))
    }
}
