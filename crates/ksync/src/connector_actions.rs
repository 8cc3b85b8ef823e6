//! 🗄️ Connector actions: every write the service makes to the control plane, in one place.
//!
//! The store only knows "patch this document". This module knows what a claim is, what a
//! finished job looks like, and which connector fields move when a sync ends.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::backends::{ConnectorStore, StoreBackend};
use crate::common::IngestionStats;
use crate::connector_settings::{Configuration, ConnectorSettings, ConnectorStatus, SyncStatus};
use crate::filtering::{DEFAULT_DOMAIN, ValidationResult};
use crate::sync_job::{JobStatus, JobTriggerMethod, SyncJob};

/// 🚫 Somebody tried to start a job that already started, or already ended.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("🚫 Sync job '{job_id}' is {status:?}, only created jobs can be started")]
pub struct JobNotRunnable {
    pub job_id: String,
    pub status: JobStatus,
}

/// 🏁 How a job ended, and what it has to show for it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub error: Option<String>,
    pub stats: IngestionStats,
    pub cursors: Option<Value>,
}

impl JobCompletion {
    pub fn finished(stats: IngestionStats, cursors: Option<Value>) -> Self {
        Self {
            status: JobStatus::Finished,
            error: None,
            stats,
            cursors,
        }
    }

    pub fn failed(error: impl Into<String>, stats: IngestionStats) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some(error.into()),
            stats,
            cursors: None,
        }
    }

    pub fn canceled(stats: IngestionStats, cursors: Option<Value>) -> Self {
        Self {
            status: JobStatus::Canceled,
            error: None,
            stats,
            cursors,
        }
    }

    fn sync_status(&self) -> SyncStatus {
        match self.status {
            JobStatus::Failed => SyncStatus::Error,
            JobStatus::Canceled => SyncStatus::Canceled,
            _ => SyncStatus::Completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorActions {
    store: StoreBackend,
}

impl ConnectorActions {
    pub fn new(store: StoreBackend) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StoreBackend {
        &self.store
    }

    /// 🏳️ Take the connector for a sync. `false` means another worker won the race.
    pub async fn claim_connector(&self, connector: &ConnectorSettings, now: DateTime<Utc>) -> Result<bool> {
        let claimed = self
            .store
            .update_connector_if_unchanged(
                connector,
                json!({
                    "sync_now": false,
                    "last_sync_status": SyncStatus::InProgress,
                    "last_synced": now,
                }),
            )
            .await
            .with_context(|| format!("💀 Failed to claim connector '{}' for a sync", connector.id))?;
        if !claimed {
            info!("🏃 Connector '{}' was claimed by someone else first, moving on", connector.id);
        }
        Ok(claimed)
    }

    pub async fn create_job(
        &self,
        connector: &ConnectorSettings,
        trigger_method: JobTriggerMethod,
        now: DateTime<Utc>,
    ) -> Result<SyncJob> {
        let mut job = SyncJob::new(connector, trigger_method, now);
        job.id = self
            .store
            .create_job(&job)
            .await
            .with_context(|| format!("💀 Failed to create a sync job for connector '{}'", connector.id))?;
        debug!("🧾 Created sync job '{}' for connector '{}'", job.id, connector.id);
        Ok(job)
    }

    /// ▶️ `created` → `running`. Anything else is [`JobNotRunnable`].
    pub async fn start_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<SyncJob> {
        let mut job = self
            .store
            .fetch_job(job_id)
            .await?
            .with_context(|| format!("💀 Sync job '{job_id}' vanished before it could start"))?;
        if job.status != JobStatus::Created {
            return Err(JobNotRunnable {
                job_id: job_id.to_string(),
                status: job.status,
            }
            .into());
        }
        self.store
            .update_job(
                job_id,
                json!({"status": JobStatus::Running, "started_at": now, "last_seen": now}),
            )
            .await?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.last_seen = Some(now);
        Ok(job)
    }

    /// 💓 The job is alive, and here is how far it got.
    pub async fn heartbeat_job(&self, job_id: &str, stats: IngestionStats, now: DateTime<Utc>) -> Result<()> {
        self.store
            .update_job(
                job_id,
                json!({
                    "last_seen": now,
                    "indexed_document_count": stats.indexed_document_count,
                    "indexed_document_volume": stats.indexed_document_volume,
                    "deleted_document_count": stats.deleted_document_count,
                }),
            )
            .await
    }

    /// 🏁 Write the end of the story on both the job and its connector.
    pub async fn complete_job(&self, job: &SyncJob, completion: &JobCompletion, now: DateTime<Utc>) -> Result<()> {
        let mut job_doc = json!({
            "status": completion.status,
            "completed_at": now,
            "last_seen": now,
            "error": completion.error,
            "indexed_document_count": completion.stats.indexed_document_count,
            "indexed_document_volume": completion.stats.indexed_document_volume,
            "deleted_document_count": completion.stats.deleted_document_count,
        });
        let mut connector_doc = json!({
            "last_sync_status": completion.sync_status(),
            "last_sync_error": completion.error,
            "last_synced": now,
            "last_indexed_document_count": completion.stats.indexed_document_count,
            "last_deleted_document_count": completion.stats.deleted_document_count,
            "error": completion.error,
        });
        if let Some(cursors) = &completion.cursors {
            job_doc["cursors"] = cursors.clone();
            connector_doc["cursors"] = cursors.clone();
        }

        self.store
            .update_job(&job.id, job_doc)
            .await
            .with_context(|| format!("💀 Failed to record the end of sync job '{}'", job.id))?;
        self.store
            .update_connector(&job.connector_id, connector_doc)
            .await
            .with_context(|| format!("💀 Failed to record the last sync on connector '{}'", job.connector_id))?;
        info!(
            "🏁 Sync job '{}' is {:?}: {} indexed, {} deleted",
            job.id, completion.status, completion.stats.indexed_document_count, completion.stats.deleted_document_count
        );
        Ok(())
    }

    /// ⚰️ Fail a job that nobody is running anymore.
    pub async fn fail_abandoned_job(&self, job: &SyncJob, message: &str, now: DateTime<Utc>) -> Result<()> {
        self.store
            .update_job(
                &job.id,
                json!({"status": JobStatus::Failed, "error": message, "completed_at": now}),
            )
            .await?;
        if self.store.fetch_connector(&job.connector_id).await?.is_some() {
            self.store
                .update_connector(
                    &job.connector_id,
                    json!({"last_sync_status": SyncStatus::Error, "last_sync_error": message, "error": message}),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn update_connector_status(
        &self,
        connector_id: &str,
        status: ConnectorStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.store
            .update_connector(connector_id, json!({"status": status, "error": error}))
            .await
            .with_context(|| format!("💀 Failed to set connector '{connector_id}' to {status:?}"))
    }

    pub async fn update_last_seen(&self, connector_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.store
            .update_connector(connector_id, json!({"last_seen": now}))
            .await
    }

    pub async fn update_configuration(
        &self,
        connector_id: &str,
        configuration: &Configuration,
        status: ConnectorStatus,
        service_type: Option<&str>,
    ) -> Result<()> {
        let mut doc = json!({"configuration": configuration, "status": status});
        if let Some(service_type) = service_type {
            doc["service_type"] = json!(service_type);
        }
        self.store.update_connector(connector_id, doc).await
    }

    /// 🛂 Store a validation result on the DEFAULT domain's draft. Arrays don't merge,
    /// so the whole filtering list goes back.
    pub async fn update_filtering_validation(
        &self,
        connector: &ConnectorSettings,
        result: &ValidationResult,
    ) -> Result<()> {
        let mut filtering = connector.filtering.clone();
        for domain in filtering.iter_mut().filter(|domain| domain.domain == DEFAULT_DOMAIN) {
            domain.draft.validation = result.clone();
        }
        self.store
            .update_connector(&connector.id, json!({"filtering": filtering}))
            .await
            .with_context(|| format!("💀 Failed to store the filtering validation of connector '{}'", connector.id))
    }
}
