//! # 🚰 THE OUTPUT SINK
//!
//! 🎬 The connector hands over documents one at a time, like a toddler handing you rocks.
//! The sink smiles, says "thank you", and quietly stacks them into a [`BulkQueue`] until
//! the queue is full, or the timer goes off, or somebody says `flush`. Then one `_bulk`
//! request goes out and the rocks become search results. 🦆
//!
//! ## Knobs
//! - `count_threshold` / `size_threshold_bytes`: when the queue says "no more", flush first
//! - `flush_interval_secs`: a background timer flushes even when nobody is pushing
//! - `max_allowed_document_size_bytes`: bigger documents are skipped with a warning
//!
//! ⚠️ No retries. A failed bulk is an error, the job decides what that means.
//! 📊 Stats only move once the bulk request that carried the operation succeeded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, trace, warn};

use crate::backends::{BulkWriter, StoreBackend};
use crate::common::{Document, IngestionStats, document_id};

pub mod bulk_queue;

pub use bulk_queue::{BulkQueue, QueueOverflow, QueueStats};

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SinkConfig {
    #[serde(default = "default_count_threshold")]
    pub count_threshold: usize,
    #[serde(default = "default_size_threshold_bytes")]
    pub size_threshold_bytes: usize,
    /// 0 turns the timer off
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_allowed_document_size_bytes")]
    pub max_allowed_document_size_bytes: usize,
}

fn default_count_threshold() -> usize {
    bulk_queue::DEFAULT_COUNT_THRESHOLD
}

fn default_size_threshold_bytes() -> usize {
    bulk_queue::DEFAULT_SIZE_THRESHOLD
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_max_allowed_document_size_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            count_threshold: default_count_threshold(),
            size_threshold_bytes: default_size_threshold_bytes(),
            flush_interval_secs: default_flush_interval_secs(),
            max_allowed_document_size_bytes: default_max_allowed_document_size_bytes(),
        }
    }
}

/// 💀 `_bulk` answered 200 but at least one item didn't make it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BulkWriteError {
    #[error("💀 Bulk write failed for document '{id}': {reason} (correlation id: {correlation_id})")]
    ItemFailed {
        id: String,
        reason: String,
        correlation_id: String,
    },
}

/// 🙅 A single document the sink refuses to queue. The job keeps going.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentRejected {
    #[error("🪪 Document has no usable 'id' field, so it has nowhere to go")]
    MissingId,
    #[error("🐘 Document '{id}' needs {encoded_bytes} bytes in a bulk request, but a request holds at most {size_threshold}")]
    TooLargeForBulk {
        id: String,
        encoded_bytes: usize,
        size_threshold: usize,
    },
}

#[derive(Debug, Default)]
struct SinkState {
    queue: BulkQueue,
    // what is sitting in the queue right now, promoted to `completed` after a good flush
    queued: IngestionStats,
    completed: IngestionStats,
    // the timer has nobody to return an error to, so it leaves it here
    deferred_error: Option<anyhow::Error>,
}

#[derive(Debug, Clone)]
struct BulkTarget {
    writer: StoreBackend,
    pipeline: Option<String>,
}

impl BulkTarget {
    async fn flush(&self, state: &mut SinkState) -> Result<()> {
        if state.queue.is_empty() {
            return Ok(());
        }
        let QueueStats {
            operation_count,
            buffer_size,
        } = state.queue.current_stats();
        let body = state.queue.pop_all();
        let pending = std::mem::take(&mut state.queued);
        debug!("🚀 Flushing {} operations ({} bytes)", operation_count, buffer_size);

        let response = self.writer.bulk(body, self.pipeline.as_deref()).await?;
        if response.errors {
            let (id, reason) = response.first_failure().unwrap_or_default();
            let failure = BulkWriteError::ItemFailed {
                id: id.unwrap_or_else(|| "<unknown>".to_string()),
                reason: reason.to_string(),
                correlation_id: uuid::Uuid::new_v4().to_string(),
            };
            error!("{}", failure);
            return Err(failure.into());
        }
        state.completed.absorb(pending);
        Ok(())
    }
}

/// 🚰 Buffers operations for one content index and writes them with `_bulk`.
///
/// Owned by exactly one sync job. The flush timer shares the state and dies with the sink.
#[derive(Debug)]
pub struct OutputSink {
    index_name: String,
    max_document_size: usize,
    size_threshold: usize,
    target: BulkTarget,
    state: Arc<Mutex<SinkState>>,
    timer: Option<JoinHandle<()>>,
}

impl OutputSink {
    /// Must be called inside a tokio runtime when the flush timer is on.
    pub fn new(writer: StoreBackend, index_name: impl Into<String>, pipeline: Option<String>, config: &SinkConfig) -> Self {
        let target = BulkTarget { writer, pipeline };
        let state = Arc::new(Mutex::new(SinkState {
            queue: BulkQueue::new(config.count_threshold, config.size_threshold_bytes),
            ..SinkState::default()
        }));
        let timer = (config.flush_interval_secs > 0).then(|| {
            spawn_flush_timer(
                target.clone(),
                state.clone(),
                Duration::from_secs(config.flush_interval_secs),
            )
        });
        Self {
            index_name: index_name.into(),
            max_document_size: config.max_allowed_document_size_bytes,
            size_threshold: config.size_threshold_bytes,
            target,
            state,
            timer,
        }
    }

    /// 📥 Queue one document for indexing. Empty documents are ignored, oversized ones skipped.
    pub async fn ingest(&self, document: Document) -> Result<()> {
        let mut state = self.lock_checked().await?;
        if document.is_empty() {
            warn!("⚠️ Received an empty document, there is nothing to index");
            return Ok(());
        }
        let id = document_id(&document).ok_or(DocumentRejected::MissingId)?;
        let payload = serde_json::to_string(&document)?;
        if payload.len() > self.max_document_size {
            warn!(
                "⚠️ Skipping document '{}': {} bytes is over the {} byte limit",
                id,
                payload.len(),
                self.max_document_size
            );
            return Ok(());
        }

        let operation = json!({"index": {"_index": self.index_name, "_id": id}}).to_string();
        if !state.queue.fits_in_empty_queue(&operation, Some(&payload)) {
            let rejected = DocumentRejected::TooLargeForBulk {
                id,
                encoded_bytes: operation.len() + payload.len() + 2,
                size_threshold: self.size_threshold,
            };
            warn!("⚠️ {}", rejected);
            return Err(rejected.into());
        }
        self.enqueue(&mut state, &operation, Some(&payload)).await?;
        state.queued.indexed_document_count += 1;
        state.queued.indexed_document_volume += payload.len() as u64;
        trace!("📥 Queued document '{}'", id);
        Ok(())
    }

    pub async fn ingest_multiple(&self, documents: impl IntoIterator<Item = Document>) -> Result<()> {
        for document in documents {
            self.ingest(document).await?;
        }
        Ok(())
    }

    /// 🗑️ Queue one delete. `None` is a no-op.
    pub async fn delete(&self, id: Option<&str>) -> Result<()> {
        let mut state = self.lock_checked().await?;
        let Some(id) = id else {
            return Ok(());
        };
        let operation = json!({"delete": {"_index": self.index_name, "_id": id}}).to_string();
        self.enqueue(&mut state, &operation, None).await?;
        state.queued.deleted_document_count += 1;
        Ok(())
    }

    pub async fn delete_multiple<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for id in ids {
            self.delete(Some(id)).await?;
        }
        Ok(())
    }

    /// 🚽 Send whatever is queued right now. Empty queue, no request.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.lock_checked().await?;
        self.target.flush(&mut state).await
    }

    /// 📊 Cumulative totals of operations that made it into the index.
    pub async fn ingestion_stats(&self) -> IngestionStats {
        self.state.lock().await.completed
    }

    /// 🏁 Stop the timer, flush the leftovers, hand back the totals.
    pub async fn close(mut self) -> Result<IngestionStats> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.flush().await?;
        Ok(self.ingestion_stats().await)
    }

    async fn lock_checked(&self) -> Result<tokio::sync::MutexGuard<'_, SinkState>> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.deferred_error.take() {
            return Err(err.context("💀 A background flush of the output sink failed"));
        }
        Ok(state)
    }

    async fn enqueue(&self, state: &mut SinkState, operation: &str, payload: Option<&str>) -> Result<()> {
        if !state.queue.will_fit(operation, payload) {
            self.target.flush(state).await?;
        }
        state.queue.add(operation, payload)?;
        Ok(())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn spawn_flush_timer(target: BulkTarget, state: Arc<Mutex<SinkState>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let mut state = state.lock().await;
            if state.deferred_error.is_some() {
                continue;
            }
            if let Err(err) = target.flush(&mut state).await {
                warn!("⏰ Timed flush failed, the next sink call will hear about it: {:#}", err);
                state.deferred_error = Some(err);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use serde_json::Value;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn sink_with(store: &InMemoryStore, config: SinkConfig) -> OutputSink {
        OutputSink::new(
            StoreBackend::InMemory(store.clone()),
            "search-test",
            Some("ent-search-generic-ingestion".to_string()),
            &config,
        )
    }

    fn no_timer() -> SinkConfig {
        SinkConfig {
            flush_interval_secs: 0,
            ..SinkConfig::default()
        }
    }

    #[tokio::test]
    async fn the_one_where_an_empty_document_changes_nothing() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(&store, no_timer());

        sink.ingest(Document::new()).await?;
        let stats = sink.close().await?;

        assert_eq!(stats, IngestionStats::default());
        assert!(store.bulk_requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_count_threshold_forces_a_flush() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(
            &store,
            SinkConfig {
                count_threshold: 2,
                ..no_timer()
            },
        );

        for id in 1..=3 {
            sink.ingest(doc(json!({"id": id.to_string(), "n": id}))).await?;
        }
        let requests = store.bulk_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body.lines().count(), 4);
        assert_eq!(requests[0].pipeline.as_deref(), Some("ent-search-generic-ingestion"));
        assert_eq!(sink.ingestion_stats().await.indexed_document_count, 2);

        let stats = sink.close().await?;
        assert_eq!(stats.indexed_document_count, 3);
        assert_eq!(store.bulk_requests().await.len(), 2);
        assert_eq!(store.documents("search-test").await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_deletes_count_and_none_is_ignored() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_document("search-test", "gone", json!({"id": "gone"})).await;
        let sink = sink_with(&store, no_timer());

        sink.delete(None).await?;
        sink.delete_multiple(["gone"]).await?;
        let stats = sink.close().await?;

        assert_eq!(stats.deleted_document_count, 1);
        assert!(store.documents("search-test").await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_document_without_id_is_rejected() {
        let store = InMemoryStore::new();
        let sink = sink_with(&store, no_timer());

        let err = sink.ingest(doc(json!({"title": "who am i"}))).await.unwrap_err();
        assert_eq!(err.downcast_ref::<DocumentRejected>(), Some(&DocumentRejected::MissingId));
    }

    #[tokio::test]
    async fn the_one_where_oversized_documents_are_skipped() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(
            &store,
            SinkConfig {
                max_allowed_document_size_bytes: 32,
                ..no_timer()
            },
        );

        sink.ingest(doc(json!({"id": "big", "body": "x".repeat(100)}))).await?;
        sink.ingest(doc(json!({"id": "small"}))).await?;
        let stats = sink.close().await?;

        assert_eq!(stats.indexed_document_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_document_too_big_for_any_request_is_rejected_alone() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(
            &store,
            SinkConfig {
                size_threshold_bytes: 300,
                max_allowed_document_size_bytes: 300,
                ..no_timer()
            },
        );

        sink.ingest(doc(json!({"id": "1"}))).await?;
        // under the document limit, over the request limit once the action line rides along
        let big = doc(json!({"id": "big", "body": "x".repeat(250)}));
        assert!(serde_json::to_string(&big)?.len() <= 300);
        let err = sink.ingest(big).await.unwrap_err();
        let Some(DocumentRejected::TooLargeForBulk { id, encoded_bytes, size_threshold }) =
            err.downcast_ref::<DocumentRejected>()
        else {
            panic!("expected the document to be rejected, got {err:?}");
        };
        assert_eq!(id, "big");
        assert!(*encoded_bytes > 300);
        assert_eq!(*size_threshold, 300);

        sink.ingest(doc(json!({"id": "2"}))).await?;
        let stats = sink.close().await?;
        assert_eq!(stats.indexed_document_count, 2);
        assert_eq!(store.bulk_requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_batch_bigger_than_the_queue_flushes_along_the_way() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(
            &store,
            SinkConfig {
                count_threshold: 3,
                ..no_timer()
            },
        );

        sink.ingest_multiple((1..=7).map(|id| doc(json!({"id": id.to_string()})))).await?;
        let requests = store.bulk_requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|request| request.body.lines().count() == 6));
        assert_eq!(sink.ingestion_stats().await.indexed_document_count, 6);

        let stats = sink.close().await?;
        assert_eq!(stats.indexed_document_count, 7);
        assert_eq!(store.documents("search-test").await.len(), 7);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_item_is_an_error_with_a_correlation_id() -> Result<()> {
        let store = InMemoryStore::new();
        store.fail_next_bulk(json!({"type": "mapper_parsing_exception"})).await;
        let sink = sink_with(&store, no_timer());

        sink.ingest(doc(json!({"id": "1"}))).await?;
        let err = sink.flush().await.unwrap_err();
        let Some(BulkWriteError::ItemFailed { id, correlation_id, .. }) = err.downcast_ref::<BulkWriteError>() else {
            panic!("expected a bulk item failure, got {err:?}");
        };
        assert_eq!(id, "1");
        assert!(!correlation_id.is_empty());
        assert_eq!(sink.ingestion_stats().await, IngestionStats::default());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_the_timer_flushes_on_its_own() -> Result<()> {
        let store = InMemoryStore::new();
        let sink = sink_with(
            &store,
            SinkConfig {
                flush_interval_secs: 10,
                ..SinkConfig::default()
            },
        );

        sink.ingest(doc(json!({"id": "1"}))).await?;
        assert!(store.bulk_requests().await.is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.bulk_requests().await.len(), 1);
        assert_eq!(sink.ingestion_stats().await.indexed_document_count, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn the_one_where_a_timer_failure_surfaces_on_the_next_call() -> Result<()> {
        let store = InMemoryStore::new();
        store.fail_next_bulk(json!({"type": "cluster_block_exception"})).await;
        let sink = sink_with(
            &store,
            SinkConfig {
                flush_interval_secs: 10,
                ..SinkConfig::default()
            },
        );

        sink.ingest(doc(json!({"id": "1"}))).await?;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let err = sink.ingest(doc(json!({"id": "2"}))).await.unwrap_err();
        assert!(err.downcast_ref::<BulkWriteError>().is_some());
        Ok(())
    }
}
