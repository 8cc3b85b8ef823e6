//! 🔌 Backends: where the real I/O happens.
//!
//! Two concerns, one backend. [`BulkWriter`] pushes NDJSON into a content index.
//! [`ConnectorStore`] reads and patches the control plane: connector records and sync jobs.
//! Both are pure I/O. Buffering lives in the sink, job semantics live in
//! [`crate::connector_actions`]. The backends just move bytes and report back. 🦆
//!
//! 🎭 [`StoreBackend`] is the casting agency. Elasticsearch for real life, in-memory for
//! tests and for the nights when you don't want to start a cluster.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::connector_settings::ConnectorSettings;
use crate::sync_job::SyncJob;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchConfig, ElasticsearchStore};
pub use in_mem::InMemoryStore;

/// 📬 What `_bulk` says back. Status 200 does not mean every item made it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: Option<u64>,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl BulkResponse {
    /// 🔎 The first item that carries an `error`, as `(id, error)`.
    pub fn first_failure(&self) -> Option<(Option<String>, Value)> {
        self.items.iter().find_map(|item| {
            let (_, outcome) = item.as_object()?.iter().next()?;
            let error = outcome.get("error")?.clone();
            let id = outcome.get("_id").and_then(Value::as_str).map(str::to_string);
            Some((id, error))
        })
    }
}

/// 🚰 One bulk request in, one bulk response out.
#[async_trait]
pub trait BulkWriter: std::fmt::Debug + Send + Sync {
    async fn bulk(&self, body: String, pipeline: Option<&str>) -> Result<BulkResponse>;
}

/// 🗄️ The persistence side: connectors, jobs, and a little index housekeeping.
///
/// # Contract
/// - `fetch_*` return `Ok(None)` / empty for things that don't exist. Errors are for I/O.
/// - `update_*` calls are partial updates: objects merge, everything else is replaced.
/// - `update_connector_if_unchanged` is a compare-and-swap on `seq_no`/`primary_term` and
///   returns `Ok(false)` when somebody else got there first.
#[async_trait]
pub trait ConnectorStore: std::fmt::Debug + Send + Sync {
    async fn fetch_connector(&self, connector_id: &str) -> Result<Option<ConnectorSettings>>;
    async fn fetch_native_connectors(&self) -> Result<Vec<ConnectorSettings>>;
    async fn update_connector(&self, connector_id: &str, doc: Value) -> Result<()>;
    async fn update_connector_if_unchanged(&self, connector: &ConnectorSettings, doc: Value) -> Result<bool>;

    async fn create_job(&self, job: &SyncJob) -> Result<String>;
    async fn fetch_job(&self, job_id: &str) -> Result<Option<SyncJob>>;
    async fn fetch_jobs(&self) -> Result<Vec<SyncJob>>;
    async fn update_job(&self, job_id: &str, doc: Value) -> Result<()>;
    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64>;

    async fn ensure_index_exists(&self, index_name: &str) -> Result<()>;
    async fn fetch_document_ids(&self, index_name: &str) -> Result<Vec<String>>;
}

/// 🎭 The many faces of a store. Dispatches to the concrete backend so nobody upstream
/// has to know whether the data lives in a cluster or in a `BTreeMap`.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Elasticsearch(ElasticsearchStore),
    InMemory(InMemoryStore),
}

#[async_trait]
impl BulkWriter for StoreBackend {
    async fn bulk(&self, body: String, pipeline: Option<&str>) -> Result<BulkResponse> {
        match self {
            StoreBackend::Elasticsearch(es) => es.bulk(body, pipeline).await,
            StoreBackend::InMemory(mem) => mem.bulk(body, pipeline).await,
        }
    }
}

#[async_trait]
impl ConnectorStore for StoreBackend {
    async fn fetch_connector(&self, connector_id: &str) -> Result<Option<ConnectorSettings>> {
        match self {
            StoreBackend::Elasticsearch(es) => es.fetch_connector(connector_id).await,
            StoreBackend::InMemory(mem) => mem.fetch_connector(connector_id).await,
        }
    }

    async fn fetch_native_connectors(&self) -> Result<Vec<ConnectorSettings>> {
        match self {
            StoreBackend::Elasticsearch(es) => es.fetch_native_connectors().await,
            StoreBackend::InMemory(mem) => mem.fetch_native_connectors().await,
        }
    }

    async fn update_connector(&self, connector_id: &str, doc: Value) -> Result<()> {
        match self {
            StoreBackend::Elasticsearch(es) => es.update_connector(connector_id, doc).await,
            StoreBackend::InMemory(mem) => mem.update_connector(connector_id, doc).await,
        }
    }

    async fn update_connector_if_unchanged(&self, connector: &ConnectorSettings, doc: Value) -> Result<bool> {
        match self {
            StoreBackend::Elasticsearch(es) => es.update_connector_if_unchanged(connector, doc).await,
            StoreBackend::InMemory(mem) => mem.update_connector_if_unchanged(connector, doc).await,
        }
    }

    async fn create_job(&self, job: &SyncJob) -> Result<String> {
        match self {
            StoreBackend::Elasticsearch(es) => es.create_job(job).await,
            StoreBackend::InMemory(mem) => mem.create_job(job).await,
        }
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        match self {
            StoreBackend::Elasticsearch(es) => es.fetch_job(job_id).await,
            StoreBackend::InMemory(mem) => mem.fetch_job(job_id).await,
        }
    }

    async fn fetch_jobs(&self) -> Result<Vec<SyncJob>> {
        match self {
            StoreBackend::Elasticsearch(es) => es.fetch_jobs().await,
            StoreBackend::InMemory(mem) => mem.fetch_jobs().await,
        }
    }

    async fn update_job(&self, job_id: &str, doc: Value) -> Result<()> {
        match self {
            StoreBackend::Elasticsearch(es) => es.update_job(job_id, doc).await,
            StoreBackend::InMemory(mem) => mem.update_job(job_id, doc).await,
        }
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64> {
        match self {
            StoreBackend::Elasticsearch(es) => es.delete_jobs(job_ids).await,
            StoreBackend::InMemory(mem) => mem.delete_jobs(job_ids).await,
        }
    }

    async fn ensure_index_exists(&self, index_name: &str) -> Result<()> {
        match self {
            StoreBackend::Elasticsearch(es) => es.ensure_index_exists(index_name).await,
            StoreBackend::InMemory(mem) => mem.ensure_index_exists(index_name).await,
        }
    }

    async fn fetch_document_ids(&self, index_name: &str) -> Result<Vec<String>> {
        match self {
            StoreBackend::Elasticsearch(es) => es.fetch_document_ids(index_name).await,
            StoreBackend::InMemory(mem) => mem.fetch_document_ids(index_name).await,
        }
    }
}
