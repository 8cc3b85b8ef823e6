//! 📋 The work orders. Each one is a self-contained errand the pool can run on any worker.

pub mod configuration;
pub mod filter_validation;
pub mod heartbeat;
pub mod job_cleanup;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::ServiceContext;
use super::worker_pool::PoolTask;
use crate::connector_settings::ConnectorSettings;
use crate::sync_job_runner::SyncJobRunner;

#[derive(Debug)]
pub enum ServiceTask {
    Sync {
        ctx: ServiceContext,
        connector_id: String,
        job_id: String,
    },
    Heartbeat {
        ctx: ServiceContext,
        connector_id: String,
    },
    Configuration {
        ctx: ServiceContext,
        connector_id: String,
    },
    FilterValidation {
        ctx: ServiceContext,
        connector: Box<ConnectorSettings>,
    },
    Cleanup {
        ctx: ServiceContext,
    },
}

#[async_trait]
impl PoolTask for ServiceTask {
    fn describe(&self) -> String {
        match self {
            ServiceTask::Sync { connector_id, job_id, .. } => {
                format!("sync job '{job_id}' of connector '{connector_id}'")
            }
            ServiceTask::Heartbeat { connector_id, .. } => format!("heartbeat of connector '{connector_id}'"),
            ServiceTask::Configuration { connector_id, .. } => {
                format!("configuration of connector '{connector_id}'")
            }
            ServiceTask::FilterValidation { connector, .. } => {
                format!("filtering validation of connector '{}'", connector.id)
            }
            ServiceTask::Cleanup { .. } => "job cleanup".to_string(),
        }
    }

    async fn run(self) -> Result<()> {
        match self {
            ServiceTask::Sync {
                ctx,
                connector_id,
                job_id,
            } => SyncJobRunner::new(ctx, connector_id, job_id).execute().await.map(drop),
            ServiceTask::Heartbeat { ctx, connector_id } => heartbeat::heartbeat(&ctx, &connector_id, Utc::now()).await,
            ServiceTask::Configuration { ctx, connector_id } => configuration::configure(&ctx, &connector_id).await,
            ServiceTask::FilterValidation { ctx, connector } => {
                filter_validation::validate_draft_filtering(&ctx, &connector).await
            }
            ServiceTask::Cleanup { ctx } => job_cleanup::cleanup_jobs(&ctx, Utc::now()).await,
        }
    }
}
