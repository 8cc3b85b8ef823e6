//! ✅❌ The uniform validation result every validator speaks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    #[default]
    Valid,
    Invalid,
    /// the draft changed and nobody has looked at it yet
    Edited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub ids: Vec<String>,
    pub messages: Vec<String>,
}

/// 📋 `{state, errors: [{ids, messages}]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub state: ValidationState,
    #[serde(default)]
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn invalid(id: impl Into<String>, messages: Vec<String>) -> Self {
        Self {
            state: ValidationState::Invalid,
            errors: vec![ValidationError {
                ids: vec![id.into()],
                messages,
            }],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == ValidationState::Valid
    }

    /// 🧩 Invalid if anyone says so, with every complaint kept.
    pub fn merge(results: impl IntoIterator<Item = ValidationResult>) -> Self {
        results
            .into_iter()
            .fold(ValidationResult::valid(), |mut merged, result| {
                if !result.is_valid() {
                    merged.state = ValidationState::Invalid;
                }
                merged.errors.extend(result.errors);
                merged
            })
    }
}
