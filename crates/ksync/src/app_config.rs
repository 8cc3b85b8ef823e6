//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. Environment variables (`KSYNC_*`, nested with `__`) are the base
//! layer, an optional TOML file goes on top. Every section has defaults, so an empty
//! config gives you a service that talks to `localhost:9200` and manages native connectors.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::ElasticsearchConfig;
use crate::connector_settings::PipelineSettings;
use crate::error_monitor::ErrorMonitorConfig;
use crate::sink::SinkConfig;
use crate::supervisors::worker_pool::PoolConfig;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub thread_pool: PoolConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub error_monitor: ErrorMonitorConfig,
    /// 🏭 defaults for connectors that don't carry their own pipeline settings
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// 🕰️ How the service polls, heartbeats, and cleans up after itself.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    /// true: manage every native connector. false: manage `connector_id` only.
    #[serde(default = "default_native_mode")]
    pub native_mode: bool,
    #[serde(default)]
    pub connector_id: Option<String>,
    /// filled into the connector record in single-connector mode when it has none
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default = "default_poll_interval_secs", alias = "idling")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs", alias = "heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_termination_timeout_secs")]
    pub termination_timeout_secs: u64,
    #[serde(default = "default_job_cleanup_interval_secs")]
    pub job_cleanup_interval_secs: u64,
    #[serde(default = "default_stuck_job_threshold_secs")]
    pub stuck_job_threshold_secs: u64,
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    #[serde(default = "default_job_heartbeat_interval_secs")]
    pub job_heartbeat_interval_secs: u64,
}

fn default_native_mode() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    3
}

// every 30 minutes a connector gets to say "still here"
fn default_heartbeat_interval_secs() -> u64 {
    1800
}

fn default_termination_timeout_secs() -> u64 {
    60
}

fn default_job_cleanup_interval_secs() -> u64 {
    300
}

fn default_stuck_job_threshold_secs() -> u64 {
    600
}

fn default_job_retention_secs() -> u64 {
    86_400
}

fn default_job_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            native_mode: default_native_mode(),
            connector_id: None,
            service_type: None,
            poll_interval_secs: default_poll_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            termination_timeout_secs: default_termination_timeout_secs(),
            job_cleanup_interval_secs: default_job_cleanup_interval_secs(),
            stuck_job_threshold_secs: default_stuck_job_threshold_secs(),
            job_retention_secs: default_job_retention_secs(),
            job_heartbeat_interval_secs: default_job_heartbeat_interval_secs(),
        }
    }
}

/// 🚀 Load the config from env vars, plus a TOML file if you name one.
///
/// 📐 No file means env vars only. A named file that doesn't exist is simply skipped by
/// figment, so a typo in the path gives you defaults, not an error. Check the log line.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("KSYNC_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (KSYNC_*). \
             The file exists in our hearts, and apparently also with a typo in it.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (KSYNC_*). \
                 No file was provided, so this one's all on the environment. Classic."
            .to_string(),
    };

    let config: AppConfig = config.extract().context(context_msg)?;
    if !config.service.native_mode && config.service.connector_id.is_none() {
        anyhow::bail!(
            "💀 native_mode is off but no service.connector_id was given. Which connector are we supposed to run? We can't guess. We tried."
        );
    }
    Ok(config)
}
