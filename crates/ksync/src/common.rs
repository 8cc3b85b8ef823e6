//! 📦 Common data structures: the things that ride the pipeline from connector to index.
//!
//! 🎬 INT. SYNC JOB. 3:47 AM. A `DocumentChange` walks out of a connector. It doesn't know
//! if it will be indexed, deleted, or quietly excluded by a simple rule with a grudge.
//! None of them know. Relatable. 🦆

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 📄 A document is a JSON object. No schema, no promises, just keys and hope.
pub type Document = Map<String, Value>;

/// 🎯 What the connector wants done with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAction {
    CreateOrUpdate,
    Delete,
}

/// 📎 Where the binary content of a document lives, if it has any.
///
/// Connectors that already fetched and encoded the attachment hand it over inline.
/// The runner attaches it only when the pipeline asks for binary extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub name: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// base64 payload, ready for the ingest pipeline's attachment processor
    #[serde(default)]
    pub attachment: Option<String>,
}

/// 🚚 One item of a connector's change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub action: DocumentAction,
    /// For deletes only `id` is read.
    pub document: Document,
    pub download: Option<DownloadDescriptor>,
}

impl DocumentChange {
    pub fn upsert(document: Document) -> Self {
        Self {
            action: DocumentAction::CreateOrUpdate,
            document,
            download: None,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        let mut document = Document::new();
        document.insert("id".to_string(), Value::String(id.into()));
        Self {
            action: DocumentAction::Delete,
            document,
            download: None,
        }
    }

    pub fn with_download(mut self, download: DownloadDescriptor) -> Self {
        self.download = Some(download);
        self
    }

    /// 🪪 The document id in string form. Numbers are fine, objects are not.
    pub fn id(&self) -> Option<String> {
        document_id(&self.document)
    }
}

/// 🪪 Pull `id` out of a document, stringifying numbers because the index only speaks strings.
pub fn document_id(document: &Document) -> Option<String> {
    match document.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 📊 What the sink has actually written, cumulative since it was born.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub indexed_document_count: u64,
    /// bytes of serialized `_source`, not counting bulk action lines
    pub indexed_document_volume: u64,
    pub deleted_document_count: u64,
}

impl IngestionStats {
    pub(crate) fn absorb(&mut self, other: IngestionStats) {
        self.indexed_document_count += other.indexed_document_count;
        self.indexed_document_volume += other.indexed_document_volume;
        self.deleted_document_count += other.deleted_document_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_numeric_ids_become_strings() {
        let doc = json!({"id": 42, "title": "answer"});
        let change = DocumentChange::upsert(doc.as_object().cloned().unwrap_or_default());
        assert_eq!(change.id().as_deref(), Some("42"));
    }

    #[test]
    fn the_one_where_an_empty_or_object_id_is_no_id_at_all() {
        let empty = json!({"id": ""});
        let nested = json!({"id": {"oops": true}});
        assert_eq!(document_id(empty.as_object().unwrap()), None);
        assert_eq!(document_id(nested.as_object().unwrap()), None);
    }

    #[test]
    fn the_one_where_a_delete_only_carries_its_id() {
        let change = DocumentChange::delete("doc-7");
        assert_eq!(change.action, DocumentAction::Delete);
        assert_eq!(change.id().as_deref(), Some("doc-7"));
        assert_eq!(change.document.len(), 1);
    }
}
