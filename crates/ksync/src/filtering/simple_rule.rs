//! 🎯 SimpleRule: one include/exclude condition over one document field.
//!
//! Rule values arrive as strings (or the odd integer/boolean) and documents carry whatever
//! types the source felt like sending. Matching coerces the rule value to the field's runtime
//! type first, and falls back to comparing strings when that coercion doesn't work out.

use std::cmp::Ordering;
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::common::Document;

pub const DEFAULT_RULE_ID: &str = "DEFAULT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Include,
    Exclude,
}

impl Policy {
    pub const ALL: [&'static str; 2] = ["include", "exclude"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "equals")]
    Equals,
    #[serde(rename = "regex")]
    Regex,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
}

impl RuleKind {
    pub const ALL: [&'static str; 7] = ["equals", "regex", "starts_with", "ends_with", "contains", "<", ">"];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Equals => "equals",
            RuleKind::Regex => "regex",
            RuleKind::StartsWith => "starts_with",
            RuleKind::EndsWith => "ends_with",
            RuleKind::Contains => "contains",
            RuleKind::LessThan => "<",
            RuleKind::GreaterThan => ">",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 📜 The rule as it is stored in the connector's filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleRuleDefinition {
    pub id: String,
    #[serde(default)]
    pub order: u64,
    pub policy: Policy,
    pub field: String,
    pub rule: RuleKind,
    pub value: Value,
}

/// 🎯 A rule ready to match, regex already compiled.
#[derive(Debug, Clone)]
pub struct SimpleRule {
    definition: SimpleRuleDefinition,
    value: String,
    regex: Option<Regex>,
}

impl SimpleRule {
    pub fn new(definition: SimpleRuleDefinition) -> Result<Self> {
        let value = string_form(&definition.value);
        let regex = match definition.rule {
            RuleKind::Regex => Some(Regex::new(&value).with_context(|| {
                format!(
                    "💀 Simple rule '{}' carries the regex '{}' and the regex engine refused to compile it",
                    definition.id, value
                )
            })?),
            _ => None,
        };
        Ok(Self {
            definition,
            value,
            regex,
        })
    }

    pub fn from_value(raw: &Value) -> Result<Self> {
        let definition: SimpleRuleDefinition = serde_json::from_value(raw.clone())
            .with_context(|| format!("💀 Could not read a simple rule out of {raw}"))?;
        Self::new(definition)
    }

    /// 🌐 Include everything. The rule you get when nobody configured one.
    pub fn default_rule() -> Self {
        Self {
            definition: SimpleRuleDefinition {
                id: DEFAULT_RULE_ID.to_string(),
                order: 0,
                policy: Policy::Include,
                field: "_".to_string(),
                rule: RuleKind::Regex,
                value: json!(".*"),
            },
            value: ".*".to_string(),
            regex: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn order(&self) -> u64 {
        self.definition.order
    }

    pub fn policy(&self) -> Policy {
        self.definition.policy
    }

    pub fn field(&self) -> &str {
        &self.definition.field
    }

    pub fn rule(&self) -> RuleKind {
        self.definition.rule
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_default(&self) -> bool {
        self.definition.id == DEFAULT_RULE_ID
    }

    pub fn is_include(&self) -> bool {
        self.definition.policy == Policy::Include
    }

    pub fn is_match(&self, document: &Document) -> bool {
        if self.is_default() {
            return true;
        }
        let Some(document_value) = document.get(&self.definition.field) else {
            return false;
        };
        if document_value.is_null() {
            return false;
        }

        match self.definition.rule {
            RuleKind::Equals => {
                let (document_side, rule_side) = coerce_pair(document_value, &self.value);
                document_side == rule_side
            }
            RuleKind::StartsWith => string_form(document_value).starts_with(&self.value),
            RuleKind::EndsWith => string_form(document_value).ends_with(&self.value),
            RuleKind::Contains => string_form(document_value).contains(&self.value),
            RuleKind::Regex => self
                .regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(&string_form(document_value))),
            RuleKind::LessThan => {
                let (document_side, rule_side) = coerce_pair(document_value, &self.value);
                document_side.partial_cmp(&rule_side) == Some(Ordering::Less)
            }
            RuleKind::GreaterThan => {
                let (document_side, rule_side) = coerce_pair(document_value, &self.value);
                document_side.partial_cmp(&rule_side) == Some(Ordering::Greater)
            }
        }
    }
}

impl fmt::Display for SimpleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Simple rule '{}' (order {}): {:?} when '{}' {} '{}'",
            self.definition.id,
            self.definition.order,
            self.definition.policy,
            self.definition.field,
            self.definition.rule,
            self.value
        )
    }
}

/// Both sides of a comparison, always the same variant.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
enum Coerced {
    Integer(i64),
    Float(f64),
    DateTime(DateTime<Utc>),
    Boolean(bool),
    Text(String),
}

fn coerce_pair(document_value: &Value, rule_value: &str) -> (Coerced, Coerced) {
    let trimmed = rule_value.trim();
    let coerced = match document_value {
        Value::Number(n) => match (n.as_i64(), trimmed.parse::<i64>()) {
            (Some(doc), Ok(rule)) => Some((Coerced::Integer(doc), Coerced::Integer(rule))),
            _ => n
                .as_f64()
                .zip(trimmed.parse::<f64>().ok())
                .map(|(doc, rule)| (Coerced::Float(doc), Coerced::Float(rule))),
        },
        Value::Bool(doc) => parse_bool(trimmed).map(|rule| (Coerced::Boolean(*doc), Coerced::Boolean(rule))),
        Value::String(doc) => parse_datetime(doc)
            .zip(parse_datetime(trimmed))
            .map(|(doc, rule)| (Coerced::DateTime(doc), Coerced::DateTime(rule))),
        _ => None,
    };

    coerced.unwrap_or_else(|| {
        (
            Coerced::Text(string_form(document_value)),
            Coerced::Text(rule_value.to_string()),
        )
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// 🧵 Strings stay themselves, everything else becomes its JSON text.
pub(crate) fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
