//! 🧬 SchemaValidator: checks a nested JSON payload against a declarative schema.
//!
//! A schema is a group of field descriptors `{name, type, optional, fields?}` plus a list of
//! constraints, predicates over the whole group (think "find and aggregate are mutually
//! exclusive"). Nested `fields` recurse.
//!
//! ⚠️ Recursion stops at depth [`MAX_RECURSION_DEPTH`]. Past it the payload is reported invalid
//! with a generic message. This is a cap on pathological input, not a proof of structure.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};

use super::validation::ValidationResult;

pub const MAX_RECURSION_DEPTH: usize = 50;

const UNEXPECTED_ERROR_MESSAGE: &str = "Unexpected error. Check logs for details.";
const CUSTOM_TYPE_FAILURE_MESSAGE: &str = "Custom type matcher validation failed.";

/// 🧪 What a custom type predicate has to say about a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeCheck {
    Valid,
    Invalid(Option<String>),
}

impl From<bool> for TypeCheck {
    fn from(ok: bool) -> Self {
        if ok {
            TypeCheck::Valid
        } else {
            TypeCheck::Invalid(None)
        }
    }
}

pub type TypePredicate = Arc<dyn Fn(&Value) -> TypeCheck + Send + Sync>;
pub type Constraint = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
    Custom { name: String, predicate: TypePredicate },
}

impl FieldType {
    pub fn custom(name: impl Into<String>, predicate: impl Fn(&Value) -> TypeCheck + Send + Sync + 'static) -> Self {
        FieldType::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    fn name(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Custom { name, .. } => name,
        }
    }

    fn check(&self, value: &Value) -> TypeCheck {
        let ok = match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Custom { predicate, .. } => return predicate(value),
        };
        ok.into()
    }
}

impl fmt::Debug for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub optional: bool,
    pub fields: Option<SchemaFields>,
}

impl FieldSchema {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: false,
            fields: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            optional: true,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_fields(mut self, fields: SchemaFields) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// 🧱 One level of a schema: field descriptors plus cross-field constraints.
#[derive(Clone, Default)]
pub struct SchemaFields {
    pub constraints: Vec<Constraint>,
    pub values: Vec<FieldSchema>,
}

impl SchemaFields {
    pub fn new(values: Vec<FieldSchema>) -> Self {
        Self {
            constraints: Vec::new(),
            values,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Fn(Option<&Value>) -> bool + Send + Sync + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.constraints.is_empty()
    }

    fn field_names(&self) -> Vec<&str> {
        self.values.iter().map(|field| field.name.as_str()).collect()
    }
}

impl fmt::Debug for SchemaFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaFields")
            .field("constraints", &self.constraints.len())
            .field("values", &self.values)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaValidator {
    validation_id: String,
    schema: SchemaFields,
}

impl SchemaValidator {
    pub fn new(validation_id: impl Into<String>, schema: SchemaFields) -> Self {
        Self {
            validation_id: validation_id.into(),
            schema,
        }
    }

    pub fn validate(&self, payload: Option<&Value>) -> ValidationResult {
        self.validate_fields(&self.schema, payload, 0)
    }

    fn validate_fields(&self, schema: &SchemaFields, payload: Option<&Value>, depth: usize) -> ValidationResult {
        if depth >= MAX_RECURSION_DEPTH {
            error!(
                "💀 Schema validation for '{}' went {} levels deep and gave up",
                self.validation_id, depth
            );
            return self.invalid(UNEXPECTED_ERROR_MESSAGE.to_string());
        }

        if schema.is_empty() {
            return ValidationResult::valid();
        }

        let expected = schema.field_names();
        let object = payload.and_then(Value::as_object);

        if let Some(object) = object {
            let unexpected: Vec<&str> = object
                .keys()
                .map(String::as_str)
                .filter(|key| !expected.contains(key))
                .collect();
            if !unexpected.is_empty() {
                warn!("🧬 Unexpected fields {:?} in '{}'", unexpected, self.validation_id);
                return self.invalid(format!(
                    "Encountered unexpected fields '{unexpected:?}'. Expected: '{expected:?}'."
                ));
            }
        }

        if schema.constraints.iter().any(|constraint| !constraint(payload)) {
            return self.invalid(format!(
                "A fields constraint was violated for fields: '{expected:?}'."
            ));
        }

        for field in &schema.values {
            let value = object.and_then(|object| object.get(&field.name));
            let Some(value) = value.filter(|value| !is_blank(value)) else {
                if field.optional {
                    continue;
                }
                return self.invalid(format!("Required value missing for field '{}'.", field.name));
            };

            if let TypeCheck::Invalid(message) = field.field_type.check(value) {
                let message = match (&field.field_type, message) {
                    (FieldType::Custom { .. }, Some(custom)) => custom,
                    (FieldType::Custom { .. }, None) => CUSTOM_TYPE_FAILURE_MESSAGE.to_string(),
                    (concrete, _) => format!(
                        "Expected field type '{}' for field '{}', but got value '{}' of type '{}'.",
                        concrete.name(),
                        field.name,
                        value,
                        json_type_name(value)
                    ),
                };
                return self.invalid(message);
            }

            if let Some(nested) = &field.fields {
                let nested_result = self.validate_fields(nested, Some(value), depth + 1);
                if !nested_result.is_valid() {
                    return nested_result;
                }
            }
        }

        ValidationResult::valid()
    }

    fn invalid(&self, message: String) -> ValidationResult {
        ValidationResult::invalid(self.validation_id.clone(), vec![message])
    }
}

/// 🫥 Missing, null, whitespace, or an empty container. `false` and `0` are real values.
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
