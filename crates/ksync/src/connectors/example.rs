//! 🧪 The example connector: a data source that is just a counter with ambitions.
//!
//! It produces `document_count` documents with fingerprint ids and, on a full sync,
//! asks for every id it no longer produces to be deleted. Handy for local runs against a
//! real cluster, and for proving the pipeline end to end without a third-party API.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use super::registry::ConnectorRegistration;
use super::{Connector, ExtractionError, SourceStatus, fingerprint_id, strip_fingerprint};
use crate::common::{Document, DocumentChange};
use crate::connector_settings::{ConfigurableField, Configuration, ConnectorSettings};
use crate::filtering::schema_validator::{FieldSchema, FieldType, SchemaFields};

pub const SERVICE_TYPE: &str = "example";

const DOCUMENT_COUNT: &str = "document_count";
const PREFIX: &str = "prefix";

pub fn registration() -> ConnectorRegistration {
    let mut fields = Configuration::new();
    fields.insert(DOCUMENT_COUNT.to_string(), ConfigurableField::new("Number of documents", "3"));
    fields.insert(PREFIX.to_string(), ConfigurableField::new("Document id prefix", "example"));

    ConnectorRegistration::new(SERVICE_TYPE, "Example Connector", fields, |settings| {
        Ok(Box::new(ExampleConnector::from_settings(settings)) as Box<dyn Connector>)
    })
    .with_advanced_snippet_schema(advanced_snippet_schema())
}

/// `{"find": {..}}` or `{"aggregate": {..}}`, never both.
fn advanced_snippet_schema() -> SchemaFields {
    SchemaFields::new(vec![
        FieldSchema::optional("find", FieldType::Object),
        FieldSchema::optional("aggregate", FieldType::Object),
    ])
    .with_constraint(|payload| {
        payload
            .and_then(Value::as_object)
            .is_none_or(|object| !(object.contains_key("find") && object.contains_key("aggregate")))
    })
}

fn configured(settings: &ConnectorSettings, key: &str) -> Option<Value> {
    settings
        .configuration
        .get(key)
        .filter(|field| field.has_value())
        .map(|field| field.value.clone())
}

#[derive(Debug)]
pub struct ExampleConnector {
    // None when the configured count is not a number
    document_count: Option<u64>,
    raw_document_count: Value,
    prefix: String,
    produced: u64,
}

impl ExampleConnector {
    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        let raw_document_count = configured(settings, DOCUMENT_COUNT).unwrap_or(json!("3"));
        let document_count = match &raw_document_count {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        let prefix = configured(settings, PREFIX)
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| SERVICE_TYPE.to_string());
        Self {
            document_count,
            raw_document_count,
            prefix,
            produced: 0,
        }
    }

    fn document(&self, n: u64) -> Document {
        let mut document = Document::new();
        document.insert("id".to_string(), json!(fingerprint_id(&self.prefix, &n.to_string())));
        document.insert("title".to_string(), json!(format!("Example document {n}")));
        document.insert("body".to_string(), json!(format!("This is example document number {n}.")));
        document.insert("number".to_string(), json!(n));
        document.insert("_timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        document
    }
}

#[async_trait]
impl Connector for ExampleConnector {
    async fn source_status(&self) -> SourceStatus {
        match self.document_count {
            Some(_) => SourceStatus::Ok,
            None => SourceStatus::failure(format!(
                "'{}' must be a non-negative integer, got {}",
                DOCUMENT_COUNT, self.raw_document_count
            )),
        }
    }

    async fn next_change(&mut self) -> Result<Option<DocumentChange>, ExtractionError> {
        let Some(total) = self.document_count else {
            return Err(ExtractionError::fatal(anyhow::anyhow!(
                "💀 '{}' is not a number, so there is nothing to count to",
                DOCUMENT_COUNT
            )));
        };
        if self.produced >= total {
            return Ok(None);
        }
        self.produced += 1;
        Ok(Some(DocumentChange::upsert(self.document(self.produced))))
    }

    fn detects_deletions(&self) -> bool {
        true
    }

    async fn yield_deleted_ids(&mut self, existing_ids: &[String]) -> Result<Vec<String>> {
        let live: BTreeSet<String> = (1..=self.document_count.unwrap_or_default())
            .map(|n| n.to_string())
            .collect();
        Ok(existing_ids
            .iter()
            .filter(|id| strip_fingerprint(&self.prefix, id).is_none_or(|source_id| !live.contains(source_id)))
            .cloned()
            .collect())
    }

    fn cursors(&self) -> Option<Value> {
        Some(json!({"produced": self.produced}))
    }
}
