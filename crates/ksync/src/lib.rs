//! 🔄 ksync: keeps Elasticsearch indices in step with third-party data sources.
//!
//! The [`supervisors::Supervisor`] polls the connectors index, the [`sync_job_runner`] moves
//! documents from a [`connectors::Connector`] through [`filtering`] into the [`sink`], and the
//! [`error_monitor`] pulls the plug when too much goes wrong. 🦆

pub mod app_config;
pub mod backends;
pub mod common;
pub mod connector_actions;
pub mod connector_settings;
pub mod connectors;
pub mod cron_schedule;
pub mod error_monitor;
pub mod filtering;
pub mod sink;
pub mod supervisors;
pub mod sync_job;
pub mod sync_job_runner;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::backends::{ConnectorStore, ElasticsearchStore, StoreBackend};
use crate::connectors::default_registry;
use crate::supervisors::{ServiceContext, ShutdownSignal, Supervisor};

/// 🚀 Connect, make sure the control-plane indices exist, then supervise until Ctrl-C.
pub async fn run(app_config: AppConfig) -> Result<()> {
    let store = ElasticsearchStore::new(app_config.elasticsearch.clone())?;
    store
        .ping()
        .await
        .context("💀 Elasticsearch didn't answer the door. Is it running, and is the url right?")?;

    let store = StoreBackend::Elasticsearch(store);
    for index_name in [
        &app_config.elasticsearch.connectors_index,
        &app_config.elasticsearch.jobs_index,
    ] {
        store
            .ensure_index_exists(index_name)
            .await
            .with_context(|| format!("💀 Couldn't make sure the '{index_name}' index exists"))?;
    }

    let registry = default_registry();
    info!("🧰 Registered connectors: {}", registry.registered_service_types().join(", "));

    let shutdown = ShutdownSignal::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("🛑 Ctrl-C received, finishing what we started"),
            Err(err) => warn!("🛑 Can't listen for Ctrl-C ({}), shutting down", err),
        }
        on_ctrl_c.trigger();
    });

    let ctx = ServiceContext::new(store, registry, app_config, shutdown);
    Supervisor::new(ctx).run().await
}
