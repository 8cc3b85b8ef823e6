//! # 🏃 THE SYNC JOB RUNNER
//!
//! 🎬 *[INT. WORKER THREAD. A job has been claimed. There is no going back.]*
//!
//! One run, start to finish:
//! 1. start the job (`created` → `running`, or refuse)
//! 2. check the connector is who the registry thinks it is
//! 3. ask the source if it's alive, mark the connector `connected`
//! 4. make sure the content index exists
//! 5. pull changes, filter them, feed the sink, tell the error monitor how it went
//! 6. sweep deletions if the connector can tell us about them
//! 7. flush, finalize, and write down how it ended
//!
//! A per-document problem goes to the [`ErrorMonitor`]. A tripped monitor, a fatal extraction
//! error or an infrastructure error fails the job. A fatal extraction error does not even flush. 🦆

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::backends::ConnectorStore;
use crate::common::{DocumentAction, DocumentChange, IngestionStats};
use crate::connector_actions::JobCompletion;
use crate::connector_settings::{ConnectorSettings, ConnectorStatus, PipelineSettings};
use crate::connectors::{Connector, ConnectorRegistration, ExtractionError, SourceStatus};
use crate::error_monitor::ErrorMonitor;
use crate::filtering::PostProcessEngine;
use crate::sink::{DocumentRejected, OutputSink};
use crate::supervisors::ServiceContext;
use crate::sync_job::SyncJob;

/// 🧩 The stored configuration doesn't have the fields this connector kind expects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "🧩 Connector '{connector_id}' is configured with fields {actual:?}, but service type \
     '{service_type}' expects {expected:?}"
)]
pub struct IncompatibleConfigurableFields {
    pub connector_id: String,
    pub service_type: String,
    pub expected: BTreeSet<String>,
    pub actual: BTreeSet<String>,
}

#[derive(Debug)]
pub struct SyncJobRunner {
    ctx: ServiceContext,
    connector_id: String,
    job_id: String,
}

impl SyncJobRunner {
    pub fn new(ctx: ServiceContext, connector_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            ctx,
            connector_id: connector_id.into(),
            job_id: job_id.into(),
        }
    }

    /// ▶️ Run the job and record the outcome. `Err` only when the job couldn't be started
    /// or its end couldn't be written down.
    pub async fn execute(&self) -> Result<JobCompletion> {
        let job = self.ctx.actions.start_job(&self.job_id, Utc::now()).await?;
        info!("🏃 Sync job '{}' for connector '{}' is running", job.id, self.connector_id);

        let mut progress = IngestionStats::default();
        let completion = match self.sync(&job, &mut progress).await {
            Ok(completion) => completion,
            Err(err) => {
                warn!("💀 Sync job '{}' failed: {:#}", job.id, err);
                JobCompletion::failed(format!("{err:#}"), progress)
            }
        };

        self.ctx
            .actions
            .complete_job(&job, &completion, Utc::now())
            .await?;
        Ok(completion)
    }

    async fn sync(&self, job: &SyncJob, progress: &mut IngestionStats) -> Result<JobCompletion> {
        let store = self.ctx.actions.store();
        let settings = store
            .fetch_connector(&self.connector_id)
            .await?
            .with_context(|| format!("💀 Connector '{}' disappeared before its sync could start", self.connector_id))?;
        let service_type = settings
            .service_type
            .as_deref()
            .context("💀 Connector has no service_type")?;
        let registration = self
            .ctx
            .registry
            .registration(service_type)
            .with_context(|| format!("💀 No connector is registered for service type '{service_type}'"))?;

        check_configurable_fields(&settings, registration)?;
        if !settings.status.allows_sync() {
            anyhow::bail!("💀 Connector '{}' is {:?}, which doesn't allow syncing", settings.id, settings.status);
        }

        let mut connector = registration.build(&settings)?;
        if let SourceStatus::Failure { message, status_code } = connector.source_status().await {
            self.ctx
                .actions
                .update_connector_status(&settings.id, ConnectorStatus::Error, Some(&message))
                .await?;
            anyhow::bail!("💀 Source is not available ({:?}): {}", status_code, message);
        }
        self.ctx
            .actions
            .update_connector_status(&settings.id, ConnectorStatus::Connected, None)
            .await?;

        let index_name = settings
            .index_name
            .clone()
            .context("💀 Connector has no index_name to sync into")?;
        store.ensure_index_exists(&index_name).await?;

        let pipeline = settings.request_pipeline(&self.ctx.config.pipeline);
        let sink = OutputSink::new(store.clone(), &index_name, Some(pipeline.name.clone()), &self.ctx.config.sink);
        let engine = match settings.active_filter() {
            Some(filter) => PostProcessEngine::from_filter(filter)?,
            None => PostProcessEngine::default(),
        };

        let drained = self
            .drain(job, connector.as_mut(), &sink, &engine, &pipeline, &index_name)
            .await;
        // only flushed operations are counted, so this is right even when the drain failed
        *progress = sink.ingestion_stats().await;
        let Drained { canceled, monitor } = drained?;

        let stats = sink.close().await?;
        *progress = stats;
        if canceled {
            return Ok(JobCompletion::canceled(stats, connector.cursors()));
        }
        monitor.finalize()?;
        Ok(JobCompletion::finished(stats, connector.cursors()))
    }

    /// 🚿 Pull every change into the sink, then sweep deletions. Leaves the final flush to the caller.
    async fn drain(
        &self,
        job: &SyncJob,
        connector: &mut dyn Connector,
        sink: &OutputSink,
        engine: &PostProcessEngine,
        pipeline: &PipelineSettings,
        index_name: &str,
    ) -> Result<Drained> {
        let mut extraction = Extraction {
            sink,
            engine,
            pipeline,
            monitor: ErrorMonitor::new(self.ctx.config.error_monitor.clone()),
        };

        let heartbeat_every = Duration::from_secs(self.ctx.config.service.job_heartbeat_interval_secs);
        let mut last_heartbeat = Instant::now();
        let mut canceled = false;
        loop {
            if self.ctx.shutdown.is_triggered() {
                info!("🛑 Shutdown requested, wrapping up sync job '{}'", job.id);
                canceled = true;
                break;
            }
            match connector.next_change().await {
                Ok(Some(change)) => extraction.apply(change).await?,
                Ok(None) => break,
                Err(ExtractionError::Document { id, error }) => {
                    extraction.monitor.note_error(&error, id.as_deref())?;
                }
                Err(ExtractionError::Fatal(error)) => {
                    return Err(error.context("💀 The connector could not continue extracting"));
                }
            }

            if last_heartbeat.elapsed() >= heartbeat_every {
                let progress = sink.ingestion_stats().await;
                if let Err(err) = self.ctx.actions.heartbeat_job(&job.id, progress, Utc::now()).await {
                    warn!("💓 Could not record progress of sync job '{}': {:#}", job.id, err);
                }
                last_heartbeat = Instant::now();
            }
        }

        if !canceled && connector.detects_deletions() {
            sweep_deletions(connector, sink, index_name, self.ctx.actions.store()).await?;
        }
        Ok(Drained {
            canceled,
            monitor: extraction.monitor,
        })
    }
}

struct Drained {
    canceled: bool,
    monitor: ErrorMonitor,
}

fn check_configurable_fields(
    settings: &ConnectorSettings,
    registration: &ConnectorRegistration,
) -> Result<(), IncompatibleConfigurableFields> {
    let expected: BTreeSet<String> = registration.configurable_fields.keys().cloned().collect();
    let actual: BTreeSet<String> = settings.configuration.keys().cloned().collect();
    if expected == actual {
        return Ok(());
    }
    Err(IncompatibleConfigurableFields {
        connector_id: settings.id.clone(),
        service_type: registration.service_type.clone(),
        expected,
        actual,
    })
}

async fn sweep_deletions(
    connector: &mut dyn Connector,
    sink: &OutputSink,
    index_name: &str,
    store: &impl ConnectorStore,
) -> Result<()> {
    let existing = store.fetch_document_ids(index_name).await?;
    let deleted = connector.yield_deleted_ids(&existing).await?;
    debug!("🧹 Deletion sweep: {} of {} indexed documents are gone at the source", deleted.len(), existing.len());
    sink.delete_multiple(deleted.iter().map(String::as_str)).await
}

struct Extraction<'a> {
    sink: &'a OutputSink,
    engine: &'a PostProcessEngine,
    pipeline: &'a PipelineSettings,
    monitor: ErrorMonitor,
}

impl Extraction<'_> {
    async fn apply(&mut self, change: DocumentChange) -> Result<()> {
        match change.action {
            DocumentAction::Delete => {
                self.sink.delete(change.id().as_deref()).await?;
                self.monitor.note_success();
                Ok(())
            }
            DocumentAction::CreateOrUpdate => self.upsert(change).await,
        }
    }

    async fn upsert(&mut self, change: DocumentChange) -> Result<()> {
        let DocumentChange {
            mut document,
            download,
            ..
        } = change;
        if document.is_empty() {
            return self.sink.ingest(document).await;
        }
        if !self.engine.process(&document).is_include() {
            trace!("🚫 Filtered out document {:?}", document.get("id"));
            return Ok(());
        }

        document.insert(
            "_extract_binary_content".to_string(),
            Value::Bool(self.pipeline.extract_binary_content),
        );
        document.insert("_reduce_whitespace".to_string(), Value::Bool(self.pipeline.reduce_whitespace));
        document.insert("_run_ml_inference".to_string(), Value::Bool(self.pipeline.run_ml_inference));
        if self.pipeline.extract_binary_content {
            if let Some(attachment) = download.and_then(|download| download.attachment) {
                document.insert("_attachment".to_string(), Value::String(attachment));
            }
        }

        let id = crate::common::document_id(&document);
        match self.sink.ingest(document).await {
            Ok(()) => {
                self.monitor.note_success();
                Ok(())
            }
            Err(err) if err.downcast_ref::<DocumentRejected>().is_some() => {
                self.monitor.note_error(&err, id.as_deref())?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryStore, StoreBackend};
    use crate::common::DownloadDescriptor;
    use crate::connectors::scripted::{self, Script, Step, delete, doc, upsert};
    use crate::connectors::{ConnectorRegistry, default_registry};
    use crate::sink::SinkConfig;
    use crate::supervisors::test_context;
    use crate::sync_job::{JobStatus, JobTriggerMethod};
    use serde_json::json;
    use std::sync::Arc;

    async fn seed(store: &InMemoryStore, extra: Value) -> Result<String> {
        let mut source = json!({
            "service_type": scripted::SERVICE_TYPE,
            "index_name": "search-scripted",
            "status": "configured",
            "configuration": {"token": {"label": "Token", "value": "secret"}},
        });
        if let (Some(source), Some(extra)) = (source.as_object_mut(), extra.as_object()) {
            source.extend(extra.clone());
        }
        store.put_connector("conn-1", source).await;
        let connector = store.fetch_connector("conn-1").await?.unwrap();
        let job = SyncJob::new(&connector, JobTriggerMethod::OnDemand, Utc::now());
        store.create_job(&job).await
    }

    fn registry_with(script: Script) -> ConnectorRegistry {
        let mut registry = default_registry();
        registry.register(scripted::registration(script));
        registry
    }

    async fn run(store: &InMemoryStore, script: Script, job_id: &str) -> Result<JobCompletion> {
        run_with_sink(store, script, job_id, SinkConfig {
            flush_interval_secs: 0,
            ..SinkConfig::default()
        })
        .await
    }

    async fn run_with_sink(store: &InMemoryStore, script: Script, job_id: &str, sink: SinkConfig) -> Result<JobCompletion> {
        let mut ctx = test_context(StoreBackend::InMemory(store.clone()), registry_with(script));
        let mut config = (*ctx.config).clone();
        config.sink = sink;
        ctx.config = Arc::new(config);
        SyncJobRunner::new(ctx, "conn-1", job_id).execute().await
    }

    #[tokio::test]
    async fn the_one_where_three_upserts_and_a_delete_make_one_bulk_call() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_document("search-scripted", "old", json!({"id": "old"})).await;
        let job_id = seed(&store, json!({})).await?;

        let script = Script::new(vec![upsert("1"), upsert("2"), upsert("3"), delete("old")]);
        let completion = run(&store, script, &job_id).await?;

        assert_eq!(completion.status, JobStatus::Finished);
        assert_eq!(completion.stats.indexed_document_count, 3);
        assert_eq!(completion.stats.deleted_document_count, 1);
        assert_eq!(store.bulk_requests().await.len(), 1);

        let job = store.fetch_job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.indexed_document_count, 3);
        assert_eq!(job.cursors, Some(json!({"seen": 4})));

        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["status"], json!("connected"));
        assert_eq!(connector["last_sync_status"], json!("completed"));
        assert_eq!(connector["last_indexed_document_count"], json!(3));

        let docs = store.documents("search-scripted").await;
        assert_eq!(docs.len(), 3);
        assert_eq!(docs["1"]["_reduce_whitespace"], json!(true));
        assert_eq!(docs["1"]["_run_ml_inference"], json!(false));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_active_filter_excludes_a_document() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(
            &store,
            json!({"filtering": [{
                "domain": "DEFAULT",
                "active": {"rules": [
                    {"id": "skip-2", "order": 0, "policy": "exclude", "field": "id", "rule": "equals", "value": "2"},
                    {"id": "DEFAULT", "order": 1, "policy": "include", "field": "_", "rule": "regex", "value": ".*"}
                ]}
            }]}),
        )
        .await?;

        let completion = run(&store, Script::new(vec![upsert("1"), upsert("2"), upsert("3")]), &job_id).await?;

        assert_eq!(completion.stats.indexed_document_count, 2);
        assert!(!store.documents("search-scripted").await.contains_key("2"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_attachment_rides_along_only_when_asked() -> Result<()> {
        let with_attachment = || {
            Step::Change(
                DocumentChange::upsert(doc(json!({"id": "file"}))).with_download(DownloadDescriptor {
                    name: "file.txt".to_string(),
                    size_bytes: Some(5),
                    attachment: Some("aGVsbG8=".to_string()),
                }),
            )
        };

        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        run(&store, Script::new(vec![with_attachment()]), &job_id).await?;
        assert_eq!(store.documents("search-scripted").await["file"]["_attachment"], json!("aGVsbG8="));

        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({"pipeline": {"name": "p", "extract_binary_content": false}})).await?;
        run(&store, Script::new(vec![with_attachment()]), &job_id).await?;
        let docs = store.documents("search-scripted").await;
        assert!(docs["file"].get("_attachment").is_none());
        assert_eq!(store.bulk_requests().await[0].pipeline.as_deref(), Some("p"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_too_many_bad_documents_fail_the_job() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;

        let mut steps = vec![upsert("ok")];
        steps.extend((0..11).map(|_| Step::DocumentError("bad")));
        let completion = run(&store, Script::new(steps), &job_id).await?;

        assert_eq!(completion.status, JobStatus::Failed);
        let message = completion.error.unwrap_or_default();
        assert!(message.contains("consecutive errors"), "{message}");

        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["last_sync_status"], json!("error"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_fatal_error_skips_the_flush() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;

        let completion = run(&store, Script::new(vec![upsert("1"), Step::Fatal("token revoked")]), &job_id).await?;

        assert_eq!(completion.status, JobStatus::Failed);
        assert!(completion.error.unwrap_or_default().contains("token revoked"));
        assert!(store.bulk_requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_job_still_reports_what_was_flushed() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        let script = Script::new(vec![upsert("1"), upsert("2"), upsert("3"), Step::Fatal("token revoked")]);

        let completion = run_with_sink(&store, script, &job_id, SinkConfig {
            count_threshold: 2,
            flush_interval_secs: 0,
            ..SinkConfig::default()
        })
        .await?;

        assert_eq!(completion.status, JobStatus::Failed);
        assert_eq!(completion.stats.indexed_document_count, 2);
        assert_eq!(store.documents("search-scripted").await.len(), 2);
        let job = store.fetch_job(&job_id).await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.indexed_document_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_one_document_too_big_for_a_bulk_request_does_not_sink_the_job() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        let mut steps: Vec<Step> = (1..=8).map(|id| upsert(&id.to_string())).collect();
        steps.push(Step::Change(DocumentChange::upsert(doc(json!({"id": "big", "body": "x".repeat(180)})))));
        steps.push(upsert("9"));

        let completion = run_with_sink(&store, Script::new(steps), &job_id, SinkConfig {
            size_threshold_bytes: 300,
            max_allowed_document_size_bytes: 300,
            flush_interval_secs: 0,
            ..SinkConfig::default()
        })
        .await?;

        assert_eq!(completion.status, JobStatus::Finished, "{:?}", completion.error);
        assert_eq!(completion.stats.indexed_document_count, 9);
        let docs = store.documents("search-scripted").await;
        assert_eq!(docs.len(), 9);
        assert!(!docs.contains_key("big"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_source_marks_the_connector() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        let script = Script {
            status: Some(SourceStatus::failure("401 Unauthorized")),
            ..Script::new(vec![upsert("1")])
        };

        let completion = run(&store, script, &job_id).await?;

        assert_eq!(completion.status, JobStatus::Failed);
        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["status"], json!("error"));
        assert!(connector["error"].as_str().unwrap_or_default().contains("401 Unauthorized"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_mismatched_configuration_is_refused() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({"configuration": {"password": {"label": "P", "value": "x"}}})).await?;

        let completion = run(&store, Script::new(vec![upsert("1")]), &job_id).await?;

        assert_eq!(completion.status, JobStatus::Failed);
        assert!(completion.error.unwrap_or_default().contains("expects"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_sweep_deletes_what_the_source_lost() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_document("search-scripted", "stale", json!({"id": "stale"})).await;
        let job_id = seed(&store, json!({})).await?;
        let script = Script {
            deleted_ids: Some(vec!["stale".to_string()]),
            ..Script::new(vec![upsert("1")])
        };

        let completion = run(&store, script, &job_id).await?;

        assert_eq!(completion.stats.deleted_document_count, 1);
        assert_eq!(
            store.documents("search-scripted").await.keys().collect::<Vec<_>>(),
            vec!["1"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_shutdown_cancels_but_still_flushes() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        let ctx = test_context(
            StoreBackend::InMemory(store.clone()),
            registry_with(Script::new(vec![upsert("1")])),
        );
        ctx.shutdown.trigger();

        let completion = SyncJobRunner::new(ctx, "conn-1", &job_id).execute().await?;

        assert_eq!(completion.status, JobStatus::Canceled);
        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["last_sync_status"], json!("canceled"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_job_cannot_run_twice() -> Result<()> {
        let store = InMemoryStore::new();
        let job_id = seed(&store, json!({})).await?;
        run(&store, Script::new(vec![]), &job_id).await?;

        let err = run(&store, Script::new(vec![]), &job_id).await.unwrap_err();
        assert!(err.downcast_ref::<crate::connector_actions::JobNotRunnable>().is_some());
        Ok(())
    }
}
