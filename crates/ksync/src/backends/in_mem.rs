//! # Previously, on ksync...
//!
//! 🎬 A connector needed somewhere to sync to. The cluster was down for maintenance,
//! the laptop fan was already screaming, and the test suite wanted answers in milliseconds.
//! So we built a store that lives entirely in RAM and forgets everything when dropped.
//!
//! `InMemoryStore` plays both roles of a [`StoreBackend`](super::StoreBackend): it answers
//! `_bulk` by parsing the NDJSON and applying it to per-index maps, and it keeps connector
//! and job records the way the control-plane indices would, `seq_no` included.
//!
//! ⚠️ This is for tests and local tinkering. If you deploy this to prod, also deploy a therapist.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use super::{BulkResponse, BulkWriter, ConnectorStore};
use crate::connector_settings::ConnectorSettings;
use crate::sync_job::SyncJob;

/// 📬 One `_bulk` call as it arrived, kept for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBulk {
    pub body: String,
    pub pipeline: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredConnector {
    source: Value,
    seq_no: u64,
}

#[derive(Debug, Default)]
struct InMemoryState {
    connectors: BTreeMap<String, StoredConnector>,
    jobs: BTreeMap<String, Value>,
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    bulk_requests: Vec<RecordedBulk>,
    // the error object to report on every item of the next bulk call
    fail_next_bulk: Option<Value>,
    next_job_id: u64,
}

/// 🧠 Connectors, jobs and content indices behind one `Arc<Mutex<..>>`.
/// Clone it freely, every clone sees the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Seed or overwrite a connector record. Bumps its `seq_no` like a real write would.
    pub async fn put_connector(&self, connector_id: &str, source: Value) {
        let mut state = self.state.lock().await;
        let seq_no = state.connectors.get(connector_id).map_or(0, |c| c.seq_no + 1);
        state
            .connectors
            .insert(connector_id.to_string(), StoredConnector { source, seq_no });
    }

    /// The raw stored `_source` of a connector.
    pub async fn connector(&self, connector_id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.connectors.get(connector_id).map(|c| c.source.clone())
    }

    pub async fn jobs(&self) -> Vec<(String, Value)> {
        let state = self.state.lock().await;
        state.jobs.iter().map(|(id, job)| (id.clone(), job.clone())).collect()
    }

    pub async fn bulk_requests(&self) -> Vec<RecordedBulk> {
        self.state.lock().await.bulk_requests.clone()
    }

    pub async fn documents(&self, index_name: &str) -> BTreeMap<String, Value> {
        let state = self.state.lock().await;
        state.indices.get(index_name).cloned().unwrap_or_default()
    }

    pub async fn put_document(&self, index_name: &str, doc_id: &str, doc: Value) {
        let mut state = self.state.lock().await;
        state
            .indices
            .entry(index_name.to_string())
            .or_default()
            .insert(doc_id.to_string(), doc);
    }

    /// 💣 Every item of the next bulk call comes back with this error.
    pub async fn fail_next_bulk(&self, error: Value) {
        self.state.lock().await.fail_next_bulk = Some(error);
    }
}

/// 🔀 Partial update semantics: objects merge key by key, anything else is replaced.
fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

fn ndjson_lines(body: &str) -> impl Iterator<Item = &str> {
    let bytes = body.as_bytes();
    let mut start = 0;
    let mut ends: Vec<usize> = memchr::memchr_iter(b'\n', bytes).collect();
    if bytes.last().is_some_and(|b| *b != b'\n') {
        ends.push(bytes.len());
    }
    ends.into_iter()
        .map(move |end| {
            let line = &body[start..end];
            start = end + 1;
            line
        })
        .filter(|line| !line.trim().is_empty())
}

fn item(action: &str, id: &str, status: u16, error: Option<&Value>) -> Value {
    let mut outcome = Map::new();
    outcome.insert("_id".to_string(), json!(id));
    outcome.insert("status".to_string(), json!(status));
    if let Some(error) = error {
        outcome.insert("error".to_string(), error.clone());
    }
    let mut item = Map::new();
    item.insert(action.to_string(), Value::Object(outcome));
    Value::Object(item)
}

#[async_trait]
impl BulkWriter for InMemoryStore {
    async fn bulk(&self, body: String, pipeline: Option<&str>) -> Result<BulkResponse> {
        let mut state = self.state.lock().await;
        state.bulk_requests.push(RecordedBulk {
            body: body.clone(),
            pipeline: pipeline.map(str::to_string),
        });
        let forced_error = state.fail_next_bulk.take();

        let mut items = Vec::new();
        let mut lines = ndjson_lines(&body);
        while let Some(line) = lines.next() {
            let operation: Map<String, Value> =
                serde_json::from_str(line).context("💀 A bulk operation line is not a JSON object")?;
            let Some((action, meta)) = operation.into_iter().next() else {
                anyhow::bail!("💀 A bulk operation line was an empty object");
            };
            let index = meta.get("_index").and_then(Value::as_str).unwrap_or_default().to_string();
            let id = meta.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();

            match action.as_str() {
                "index" | "create" => {
                    let payload = lines
                        .next()
                        .with_context(|| format!("💀 Bulk '{action}' for '{id}' had no document line"))?;
                    let doc: Value = serde_json::from_str(payload)
                        .with_context(|| format!("💀 Document '{id}' in the bulk body is not JSON"))?;
                    if forced_error.is_none() {
                        state.indices.entry(index).or_default().insert(id.clone(), doc);
                    }
                    items.push(item(&action, &id, 201, forced_error.as_ref()));
                }
                "delete" => {
                    let status = if forced_error.is_some() {
                        500
                    } else if state.indices.get_mut(&index).and_then(|docs| docs.remove(&id)).is_some() {
                        200
                    } else {
                        404
                    };
                    items.push(item(&action, &id, status, forced_error.as_ref()));
                }
                other => anyhow::bail!("💀 The in-memory store doesn't speak bulk action '{}'", other),
            }
        }

        Ok(BulkResponse {
            took: Some(0),
            errors: forced_error.is_some(),
            items,
        })
    }
}

#[async_trait]
impl ConnectorStore for InMemoryStore {
    async fn fetch_connector(&self, connector_id: &str) -> Result<Option<ConnectorSettings>> {
        let state = self.state.lock().await;
        let Some(stored) = state.connectors.get(connector_id) else {
            return Ok(None);
        };
        let settings = ConnectorSettings::from_source(connector_id, stored.source.clone(), Some(stored.seq_no), Some(1))?;
        Ok(Some(settings))
    }

    async fn fetch_native_connectors(&self) -> Result<Vec<ConnectorSettings>> {
        let state = self.state.lock().await;
        let mut connectors = Vec::new();
        for (id, stored) in &state.connectors {
            if stored.source.get("is_native").and_then(Value::as_bool) == Some(true) {
                connectors.push(ConnectorSettings::from_source(
                    id,
                    stored.source.clone(),
                    Some(stored.seq_no),
                    Some(1),
                )?);
            }
        }
        Ok(connectors)
    }

    async fn update_connector(&self, connector_id: &str, doc: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .connectors
            .get_mut(connector_id)
            .with_context(|| format!("💀 Connector '{connector_id}' doesn't exist, so it can't be updated"))?;
        merge(&mut stored.source, doc);
        stored.seq_no += 1;
        Ok(())
    }

    async fn update_connector_if_unchanged(&self, connector: &ConnectorSettings, doc: Value) -> Result<bool> {
        let mut state = self.state.lock().await;
        let stored = state
            .connectors
            .get_mut(&connector.id)
            .with_context(|| format!("💀 Connector '{}' doesn't exist, so it can't be claimed", connector.id))?;
        if connector.seq_no.is_some_and(|seen| seen != stored.seq_no) {
            return Ok(false);
        }
        merge(&mut stored.source, doc);
        stored.seq_no += 1;
        Ok(true)
    }

    async fn create_job(&self, job: &SyncJob) -> Result<String> {
        let mut state = self.state.lock().await;
        state.next_job_id += 1;
        let job_id = format!("job-{}", state.next_job_id);
        state.jobs.insert(job_id.clone(), serde_json::to_value(job)?);
        Ok(job_id)
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(job_id)
            .map(|source| SyncJob::from_source(job_id, source.clone()))
            .transpose()
            .context("💀 A stored sync job no longer parses")
    }

    async fn fetch_jobs(&self) -> Result<Vec<SyncJob>> {
        let state = self.state.lock().await;
        state
            .jobs
            .iter()
            .map(|(id, source)| SyncJob::from_source(id, source.clone()).map_err(Into::into))
            .collect()
    }

    async fn update_job(&self, job_id: &str, doc: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(job_id)
            .with_context(|| format!("💀 Sync job '{job_id}' doesn't exist, so it can't be updated"))?;
        merge(stored, doc);
        Ok(())
    }

    async fn delete_jobs(&self, job_ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(job_ids.iter().filter(|id| state.jobs.remove(*id).is_some()).count() as u64)
    }

    async fn ensure_index_exists(&self, index_name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .indices
            .entry(index_name.to_string())
            .or_default();
        Ok(())
    }

    async fn fetch_document_ids(&self, index_name: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .indices
            .get(index_name)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_bulk_bodies_land_in_the_right_index() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_document("search-a", "old", json!({"id": "old"})).await;

        let body = concat!(
            "{\"index\":{\"_index\":\"search-a\",\"_id\":\"1\"}}\n",
            "{\"id\":\"1\",\"title\":\"hi\"}\n",
            "{\"delete\":{\"_index\":\"search-a\",\"_id\":\"old\"}}\n",
            "{\"delete\":{\"_index\":\"search-a\",\"_id\":\"never-existed\"}}\n",
        );
        let response = store.bulk(body.to_string(), Some("pipe")).await?;

        assert!(!response.errors);
        assert_eq!(response.items.len(), 3);
        assert_eq!(response.items[2]["delete"]["status"], json!(404));
        let docs = store.documents("search-a").await;
        assert_eq!(docs.keys().collect::<Vec<_>>(), vec!["1"]);
        assert_eq!(store.bulk_requests().await[0].pipeline.as_deref(), Some("pipe"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_forced_failure_touches_nothing() -> Result<()> {
        let store = InMemoryStore::new();
        store.fail_next_bulk(json!({"type": "mapper_parsing_exception"})).await;

        let body = "{\"index\":{\"_index\":\"search-a\",\"_id\":\"1\"}}\n{}\n";
        let response = store.bulk(body.to_string(), None).await?;
        assert!(response.errors);
        assert_eq!(response.first_failure().unwrap().0.as_deref(), Some("1"));
        assert!(store.documents("search-a").await.is_empty());

        // one-shot: the next call is clean
        assert!(!store.bulk(body.to_string(), None).await?.errors);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_second_claim_loses_the_race() -> Result<()> {
        let store = InMemoryStore::new();
        store
            .put_connector("conn-1", json!({"service_type": "example", "sync_now": true}))
            .await;

        let first = store.fetch_connector("conn-1").await?.unwrap();
        let second = store.fetch_connector("conn-1").await?.unwrap();

        assert!(store.update_connector_if_unchanged(&first, json!({"sync_now": false})).await?);
        assert!(!store.update_connector_if_unchanged(&second, json!({"sync_now": false})).await?);
        assert_eq!(store.connector("conn-1").await.unwrap()["sync_now"], json!(false));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_updates_merge_instead_of_replace() -> Result<()> {
        let store = InMemoryStore::new();
        store
            .put_connector("conn-1", json!({"configuration": {"a": {"label": "A", "value": 1}}}))
            .await;
        store
            .update_connector("conn-1", json!({"configuration": {"b": {"label": "B", "value": 2}}}))
            .await?;

        let stored = store.connector("conn-1").await.unwrap();
        assert_eq!(stored["configuration"]["a"]["value"], json!(1));
        assert_eq!(stored["configuration"]["b"]["value"], json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_jobs_get_ids_and_can_be_deleted() -> Result<()> {
        let store = InMemoryStore::new();
        let connector = ConnectorSettings {
            id: "conn-1".to_string(),
            ..Default::default()
        };
        let job = SyncJob::new(&connector, Default::default(), chrono::Utc::now());
        let first = store.create_job(&job).await?;
        let second = store.create_job(&job).await?;
        assert_ne!(first, second);

        store.update_job(&first, json!({"status": "running"})).await?;
        assert_eq!(
            store.fetch_job(&first).await?.unwrap().status,
            crate::sync_job::JobStatus::Running
        );

        assert_eq!(store.delete_jobs(&[first.clone(), "nope".to_string()]).await?, 1);
        assert!(store.fetch_job(&first).await?.is_none());
        assert_eq!(store.fetch_jobs().await?.len(), 1);
        Ok(())
    }
}
