//! 🎭 A connector that reads its lines from a script. Test-only.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use super::registry::ConnectorRegistration;
use super::{Connector, ExtractionError, SourceStatus};
use crate::common::{Document, DocumentChange};
use crate::connector_settings::{ConfigurableField, Configuration};

pub const SERVICE_TYPE: &str = "scripted";

/// One line of the script.
#[derive(Debug, Clone)]
pub enum Step {
    Change(DocumentChange),
    DocumentError(&'static str),
    Fatal(&'static str),
    Panic,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<Step>,
    pub status: Option<SourceStatus>,
    pub deleted_ids: Option<Vec<String>>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

pub fn upsert(id: &str) -> Step {
    Step::Change(DocumentChange::upsert(doc(json!({"id": id, "title": format!("title {id}")}))))
}

pub fn delete(id: &str) -> Step {
    Step::Change(DocumentChange::delete(id))
}

#[derive(Debug)]
pub struct ScriptedConnector {
    steps: VecDeque<Step>,
    status: SourceStatus,
    deleted_ids: Option<Vec<String>>,
    seen: u64,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn source_status(&self) -> SourceStatus {
        self.status.clone()
    }

    async fn next_change(&mut self) -> Result<Option<DocumentChange>, ExtractionError> {
        let Some(step) = self.steps.pop_front() else {
            return Ok(None);
        };
        self.seen += 1;
        match step {
            Step::Change(change) => Ok(Some(change)),
            Step::DocumentError(id) => Err(ExtractionError::document(Some(id), anyhow::anyhow!("broken document"))),
            Step::Fatal(message) => Err(ExtractionError::fatal(anyhow::anyhow!(message))),
            Step::Panic => panic!("the scripted connector was told to panic"),
        }
    }

    fn detects_deletions(&self) -> bool {
        self.deleted_ids.is_some()
    }

    async fn yield_deleted_ids(&mut self, _existing_ids: &[String]) -> Result<Vec<String>> {
        Ok(self.deleted_ids.clone().unwrap_or_default())
    }

    fn cursors(&self) -> Option<Value> {
        Some(json!({"seen": self.seen}))
    }
}

/// A registration whose connectors all play the same script.
pub fn registration(script: Script) -> ConnectorRegistration {
    let mut fields = Configuration::new();
    fields.insert("token".to_string(), ConfigurableField::new("Token", "secret"));
    let script = Arc::new(script);
    ConnectorRegistration::new(SERVICE_TYPE, "Scripted", fields, move |_settings| {
        Ok(Box::new(ScriptedConnector {
            steps: script.steps.iter().cloned().collect(),
            status: script.status.clone().unwrap_or(SourceStatus::Ok),
            deleted_ids: script.deleted_ids.clone(),
            seen: 0,
        }) as Box<dyn Connector>)
    })
}
