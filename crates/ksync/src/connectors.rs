//! 🔌 Connectors: the things on the other side that actually have the data.
//!
//! A connector is a pull-based change stream. The runner keeps asking `next_change` until
//! it says `None`, and every answer is either a document to upsert, an id to delete,
//! a per-document hiccup, or the end of the world ([`ExtractionError::Fatal`]).
//!
//! Which connector serves which `service_type` is decided by the [`ConnectorRegistry`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::common::DocumentChange;

pub mod example;
pub mod fingerprint;
pub mod registry;
#[cfg(test)]
pub mod scripted;

pub use fingerprint::{fingerprint_id, strip_fingerprint};
pub use registry::{ConnectorFactory, ConnectorRegistration, ConnectorRegistry, default_registry};

/// 🩺 Can we reach the source right now?
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    Failure {
        status_code: Option<u16>,
        message: String,
    },
}

impl SourceStatus {
    pub fn failure(message: impl Into<String>) -> Self {
        SourceStatus::Failure {
            status_code: None,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SourceStatus::Ok)
    }
}

/// 💥 What can go wrong while pulling the next change.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// One document is broken, the stream goes on.
    #[error("💀 Could not extract document {}: {error:#}", .id.as_deref().unwrap_or("<unknown>"))]
    Document { id: Option<String>, error: anyhow::Error },
    /// The stream itself is broken. The job stops right here.
    #[error("💀 Extraction failed: {0:#}")]
    Fatal(anyhow::Error),
}

impl ExtractionError {
    pub fn document(id: Option<impl Into<String>>, error: impl Into<anyhow::Error>) -> Self {
        ExtractionError::Document {
            id: id.map(Into::into),
            error: error.into(),
        }
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        ExtractionError::Fatal(error.into())
    }
}

/// 🔌 One sync's worth of conversation with a data source.
///
/// # Contract
/// - `next_change` returns `Ok(None)` once, at the end. Calling it again is not defined.
/// - `yield_deleted_ids` is only called when `detects_deletions` is true, after the stream
///   is drained, with the ids currently in the content index.
/// - `cursors` is read at the end of the job and persisted on both the job and the connector.
#[async_trait]
pub trait Connector: std::fmt::Debug + Send {
    async fn source_status(&self) -> SourceStatus;

    async fn next_change(&mut self) -> Result<Option<DocumentChange>, ExtractionError>;

    fn detects_deletions(&self) -> bool {
        false
    }

    async fn yield_deleted_ids(&mut self, _existing_ids: &[String]) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn cursors(&self) -> Option<Value> {
        None
    }
}
