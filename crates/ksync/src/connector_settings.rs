//! 🗄️ ConnectorSettings: the control-plane record of one connector, as stored in the
//! connectors index. Loaded every poll, patched at claim, heartbeat and job completion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::filtering::{FilterDefinition, FilteringDomain, default_domain};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    #[default]
    Created,
    NeedsConfiguration,
    Configured,
    Connected,
    Error,
}

impl ConnectorStatus {
    pub fn allows_sync(&self) -> bool {
        matches!(
            self,
            ConnectorStatus::Configured | ConnectorStatus::Connected | ConnectorStatus::Error
        )
    }
}

/// How the connector's last sync went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Error,
    Canceled,
}

/// 🔧 One configurable field: what the UI shows and what the user typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurableField {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value: Value,
}

impl ConfigurableField {
    pub fn new(label: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }

    pub fn has_value(&self) -> bool {
        match &self.value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        }
    }
}

pub type Configuration = BTreeMap<String, ConfigurableField>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulingSettings {
    #[serde(default)]
    pub enabled: bool,
    /// quartz or unix cron expression
    #[serde(default)]
    pub interval: Option<String>,
}

/// 🏭 Ingest pipeline knobs. Also the global defaults in `AppConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub extract_binary_content: bool,
    #[serde(default = "default_true")]
    pub reduce_whitespace: bool,
    #[serde(default)]
    pub run_ml_inference: bool,
}

fn default_pipeline_name() -> String {
    "ent-search-generic-ingestion".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            extract_binary_content: true,
            reduce_whitespace: true,
            run_ml_inference: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSettings {
    /// document `_id`, not part of `_source`
    #[serde(skip)]
    pub id: String,
    #[serde(skip)]
    pub seq_no: Option<u64>,
    #[serde(skip)]
    pub primary_term: Option<u64>,

    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub status: ConnectorStatus,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub scheduling: SchedulingSettings,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_now: bool,
    #[serde(default)]
    pub last_sync_status: Option<SyncStatus>,
    #[serde(default)]
    pub last_sync_error: Option<String>,
    #[serde(default)]
    pub last_indexed_document_count: Option<u64>,
    #[serde(default)]
    pub last_deleted_document_count: Option<u64>,
    #[serde(default)]
    pub filtering: Vec<FilteringDomain>,
    #[serde(default)]
    pub pipeline: Option<PipelineSettings>,
    #[serde(default)]
    pub cursors: Option<Value>,
    #[serde(default)]
    pub is_native: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// a timestamp nobody can parse is treated like no timestamp at all
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|parsed| parsed.with_timezone(&Utc)))
}

impl ConnectorSettings {
    /// 📥 Build from a stored `_source` plus the store's metadata.
    pub fn from_source(
        id: impl Into<String>,
        source: Value,
        seq_no: Option<u64>,
        primary_term: Option<u64>,
    ) -> serde_json::Result<Self> {
        let mut settings: ConnectorSettings = serde_json::from_value(source)?;
        settings.id = id.into();
        settings.seq_no = seq_no;
        settings.primary_term = primary_term;
        Ok(settings)
    }

    pub fn active_filter(&self) -> Option<&FilterDefinition> {
        default_domain(&self.filtering).map(|domain| &domain.active)
    }

    pub fn draft_filter(&self) -> Option<&FilterDefinition> {
        default_domain(&self.filtering).map(|domain| &domain.draft)
    }

    pub fn request_pipeline(&self, defaults: &PipelineSettings) -> PipelineSettings {
        self.pipeline.clone().unwrap_or_else(|| defaults.clone())
    }

    pub fn is_configured(&self) -> bool {
        !self.configuration.is_empty()
    }

    /// 🏷️ Elasticsearch index name rules: lowercase, no forbidden characters, no leading `-_+`.
    pub fn has_valid_index_name(&self) -> bool {
        self.index_name.as_deref().is_some_and(is_valid_index_name)
    }
}

pub fn is_valid_index_name(name: &str) -> bool {
    const FORBIDDEN: [char; 11] = ['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#'];
    !name.is_empty()
        && name != "."
        && name != ".."
        && name.len() <= 255
        && !name.starts_with(['-', '_', '+'])
        && !name.contains(FORBIDDEN)
        && !name.contains(':')
        && name.chars().all(|c| !c.is_uppercase())
}
