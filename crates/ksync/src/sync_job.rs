//! 🧾 SyncJob: one attempt at pulling one connector's changes into its index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::IngestionStats;
use crate::connector_settings::ConnectorSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTriggerMethod {
    OnDemand,
    #[default]
    Scheduled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    #[serde(skip)]
    pub id: String,
    pub connector_id: String,
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub trigger_method: JobTriggerMethod,
    #[serde(default)]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub indexed_document_count: u64,
    #[serde(default)]
    pub indexed_document_volume: u64,
    #[serde(default)]
    pub deleted_document_count: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cursors: Option<Value>,
}

impl SyncJob {
    pub fn new(connector: &ConnectorSettings, trigger_method: JobTriggerMethod, now: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            connector_id: connector.id.clone(),
            index_name: connector.index_name.clone(),
            service_type: connector.service_type.clone(),
            trigger_method,
            status: JobStatus::Created,
            created_at: now,
            ..Default::default()
        }
    }

    pub fn from_source(id: impl Into<String>, source: Value) -> serde_json::Result<Self> {
        let mut job: SyncJob = serde_json::from_value(source)?;
        job.id = id.into();
        Ok(job)
    }

    pub fn stats(&self) -> IngestionStats {
        IngestionStats {
            indexed_document_count: self.indexed_document_count,
            indexed_document_volume: self.indexed_document_volume,
            deleted_document_count: self.deleted_document_count,
        }
    }

    /// 🕰️ The most recent sign of life: heartbeat, start, or creation.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_seen
            .or(self.completed_at)
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn the_one_where_a_job_inherits_its_connector_details() {
        let connector = ConnectorSettings {
            id: "conn-1".to_string(),
            index_name: Some("search-docs".to_string()),
            service_type: Some("example".to_string()),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = SyncJob::new(&connector, JobTriggerMethod::OnDemand, now);

        assert_eq!(job.connector_id, "conn-1");
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.last_activity(), now);

        let stored = serde_json::to_value(&job).unwrap();
        assert_eq!(stored["trigger_method"], json!("on_demand"));
        assert_eq!(stored["status"], json!("created"));
        assert!(stored.get("id").is_none());
    }

    #[test]
    fn the_one_where_terminal_means_terminal() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }
}
