//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where connectors need syncing..."
//! 🎬 "One supervisor dared to schedule them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor: polls the connectors index, asks the [`Scheduler`] what's due, claims
//! connectors that need a sync and hands everything to the [`WorkerPool`]. Part middle
//! manager, part dispatcher, fully allergic to doing the work itself.
//!
//! ⚠️ The pool workers stay private. Like Fight Club, but for async tasks.

mod workers;
pub mod scheduler;
pub mod shutdown;
pub mod tasks;
pub mod worker_pool;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::StoreBackend;
use crate::connector_actions::ConnectorActions;
use crate::connectors::ConnectorRegistry;
use crate::sync_job::JobTriggerMethod;

pub use scheduler::{Due, Scheduler, TriggeredTask};
pub use shutdown::ShutdownSignal;
pub use tasks::ServiceTask;
pub use worker_pool::{PoolConfig, PoolSaturated, PoolTask, WorkerPool};

/// 🧳 Everything a task needs, cheap to clone into every one of them.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub actions: ConnectorActions,
    pub registry: Arc<ConnectorRegistry>,
    pub config: Arc<AppConfig>,
    pub shutdown: ShutdownSignal,
}

impl ServiceContext {
    pub fn new(store: StoreBackend, registry: ConnectorRegistry, config: AppConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            actions: ConnectorActions::new(store),
            registry: Arc::new(registry),
            config: Arc::new(config),
            shutdown,
        }
    }
}

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?" every `poll_interval_secs`.
#[derive(Debug)]
pub struct Supervisor {
    ctx: ServiceContext,
    scheduler: Scheduler,
    pool: WorkerPool<ServiceTask>,
    last_cleanup: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(ctx: ServiceContext) -> Self {
        let scheduler = Scheduler::new(
            ctx.actions.store().clone(),
            ctx.registry.clone(),
            ctx.config.service.clone(),
        );
        let pool = WorkerPool::new(ctx.config.thread_pool.clone());
        Self {
            ctx,
            scheduler,
            pool,
            last_cleanup: None,
        }
    }

    pub fn pool(&self) -> &WorkerPool<ServiceTask> {
        &self.pool
    }

    /// 🔄 Poll until somebody pulls the shutdown lever, then give the workers
    /// `termination_timeout_secs` to wrap up.
    pub async fn run(mut self) -> Result<()> {
        let service = self.ctx.config.service.clone();
        info!(
            "🚀 Supervisor polling every {}s in {} mode",
            service.poll_interval_secs,
            if service.native_mode { "native" } else { "single-connector" }
        );

        let poll_interval = Duration::from_secs(service.poll_interval_secs);
        let shutdown = self.ctx.shutdown.clone();
        while !shutdown.is_triggered() {
            if let Err(err) = self.tick(Utc::now()).await {
                // an unreachable cluster is a bad tick, not a dead service
                error!("💀 Poll failed, trying again next tick: {:#}", err);
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.wait() => {}
            }
        }

        info!("🛑 Shutting down, waiting for running tasks");
        self.pool
            .shutdown(Duration::from_secs(service.termination_timeout_secs))
            .await
    }

    /// 🎯 One poll: dispatch whatever is due, plus the janitor when it's time.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let due = self.scheduler.poll(now).await?;
        for entry in due {
            let connector_id = entry.connector.id.clone();
            if let Err(err) = self.dispatch(entry, now).await {
                error!("💀 Could not dispatch work for connector '{}': {:#}", connector_id, err);
            }
        }

        let cleanup_every = chrono::Duration::seconds(self.ctx.config.service.job_cleanup_interval_secs as i64);
        if self.last_cleanup.is_none_or(|last| now - last >= cleanup_every)
            && self.submit(ServiceTask::Cleanup { ctx: self.ctx.clone() })
        {
            self.last_cleanup = Some(now);
        }
        Ok(())
    }

    async fn dispatch(&self, due: Due, now: DateTime<Utc>) -> Result<()> {
        let Due { connector, mut tasks } = due;
        // a sync always brings a heartbeat along
        if tasks.contains(&TriggeredTask::Sync) && !tasks.contains(&TriggeredTask::Heartbeat) {
            tasks.push(TriggeredTask::Heartbeat);
        }
        for task in tasks {
            match task {
                TriggeredTask::Sync => {
                    // room first, so a saturated pool never leaves a claimed connector behind
                    let slot = match self.pool.try_reserve() {
                        Ok(slot) => slot,
                        Err(saturated) => {
                            warn!("🚦 {}, connector '{}' will sync on a later tick", saturated, connector.id);
                            continue;
                        }
                    };
                    if !self.ctx.actions.claim_connector(&connector, now).await? {
                        continue;
                    }
                    let trigger = if connector.sync_now {
                        JobTriggerMethod::OnDemand
                    } else {
                        JobTriggerMethod::Scheduled
                    };
                    let job = self.ctx.actions.create_job(&connector, trigger, now).await?;
                    slot.submit(ServiceTask::Sync {
                        ctx: self.ctx.clone(),
                        connector_id: connector.id.clone(),
                        job_id: job.id,
                    })?;
                }
                TriggeredTask::Heartbeat => {
                    self.submit(ServiceTask::Heartbeat {
                        ctx: self.ctx.clone(),
                        connector_id: connector.id.clone(),
                    });
                }
                TriggeredTask::Configuration => {
                    self.submit(ServiceTask::Configuration {
                        ctx: self.ctx.clone(),
                        connector_id: connector.id.clone(),
                    });
                }
                TriggeredTask::FilterValidation => {
                    self.submit(ServiceTask::FilterValidation {
                        ctx: self.ctx.clone(),
                        connector: Box::new(connector.clone()),
                    });
                }
            }
        }
        Ok(())
    }

    // true when the task made it into the pool
    fn submit(&self, task: ServiceTask) -> bool {
        let slot = match self.pool.try_reserve() {
            Ok(slot) => slot,
            Err(saturated) => {
                debug!("🚦 {}, skipping {} this tick", saturated, task.describe());
                return false;
            }
        };
        match slot.submit(task) {
            Ok(()) => true,
            Err(err) => {
                warn!("{:#}", err);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(store: StoreBackend, registry: ConnectorRegistry) -> ServiceContext {
    let mut config = AppConfig::default();
    config.sink.flush_interval_secs = 0;
    ServiceContext::new(store, registry, config, ShutdownSignal::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ConnectorStore, InMemoryStore};
    use crate::connectors::default_registry;
    use crate::sync_job::JobStatus;
    use serde_json::json;

    fn example_connector() -> serde_json::Value {
        json!({
            "service_type": "example",
            "index_name": "search-example",
            "status": "configured",
            "is_native": true,
            "sync_now": true,
            "last_seen": Utc::now(),
            "configuration": {
                "document_count": {"label": "Number of documents", "value": "2"},
                "prefix": {"label": "Document id prefix", "value": "ex"}
            }
        })
    }

    #[tokio::test]
    async fn the_one_where_a_sync_now_runs_end_to_end() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_connector("conn-1", example_connector()).await;
        let mut supervisor = Supervisor::new(test_context(StoreBackend::InMemory(store.clone()), default_registry()));

        supervisor.tick(Utc::now()).await?;
        supervisor.pool().shutdown(Duration::from_secs(10)).await?;

        let jobs = store.fetch_jobs().await?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Finished);
        assert_eq!(jobs[0].trigger_method, JobTriggerMethod::OnDemand);

        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["sync_now"], json!(false));
        assert_eq!(connector["last_sync_status"], json!("completed"));
        assert_eq!(store.documents("search-example").await.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_saturated_pool_leaves_the_connector_unclaimed() -> Result<()> {
        let store = InMemoryStore::new();
        store.put_connector("conn-1", example_connector()).await;
        let mut ctx = test_context(StoreBackend::InMemory(store.clone()), default_registry());
        let mut config = (*ctx.config).clone();
        config.thread_pool = PoolConfig {
            max_threads: 0,
            max_queue: 0,
            ..PoolConfig::default()
        };
        ctx.config = Arc::new(config);
        let mut supervisor = Supervisor::new(ctx);

        supervisor.tick(Utc::now()).await?;

        assert!(store.fetch_jobs().await?.is_empty());
        let connector = store.connector("conn-1").await.unwrap();
        assert_eq!(connector["sync_now"], json!(true));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_run_stops_when_told() -> Result<()> {
        let store = InMemoryStore::new();
        let ctx = test_context(StoreBackend::InMemory(store), default_registry());
        let shutdown = ctx.shutdown.clone();
        let running = tokio::spawn(Supervisor::new(ctx).run());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), running).await???;
        Ok(())
    }
}
