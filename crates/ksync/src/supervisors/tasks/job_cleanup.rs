//! 🧹 The janitor. Sweeps the jobs index so it doesn't turn into an archaeological site:
//! jobs whose connector is gone, jobs nobody has touched in ages, and old finished jobs.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::backends::ConnectorStore;
use crate::sync_job::{JobStatus, SyncJob};
use crate::supervisors::ServiceContext;

pub const STUCK_JOB_MESSAGE: &str = "The job has not seen any update for some time.";

/// 🧾 What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub orphaned_deleted: u64,
    pub stuck_failed: u64,
    pub expired_deleted: u64,
}

pub async fn cleanup_jobs(ctx: &ServiceContext, now: DateTime<Utc>) -> Result<()> {
    let report = sweep(ctx, now).await?;
    if report != CleanupReport::default() {
        info!(
            "🧹 Job cleanup: {} orphaned deleted, {} stuck failed, {} expired deleted",
            report.orphaned_deleted, report.stuck_failed, report.expired_deleted
        );
    }
    Ok(())
}

pub async fn sweep(ctx: &ServiceContext, now: DateTime<Utc>) -> Result<CleanupReport> {
    let store = ctx.actions.store();
    let service = &ctx.config.service;
    let mut jobs = store.fetch_jobs().await?;
    if !service.native_mode {
        // single-connector mode only cleans up after its own connector
        jobs.retain(|job| Some(job.connector_id.as_str()) == service.connector_id.as_deref());
    }

    let mut by_connector: BTreeMap<String, Vec<SyncJob>> = BTreeMap::new();
    for job in jobs {
        by_connector.entry(job.connector_id.clone()).or_default().push(job);
    }

    let mut report = CleanupReport::default();
    let mut orphaned = Vec::new();
    let mut survivors = Vec::new();
    for (connector_id, jobs) in by_connector {
        if store.fetch_connector(&connector_id).await?.is_none() {
            orphaned.extend(jobs.into_iter().map(|job| job.id));
        } else {
            survivors.extend(jobs);
        }
    }
    if !orphaned.is_empty() {
        report.orphaned_deleted = store.delete_jobs(&orphaned).await?;
    }

    let stuck_after = Duration::seconds(service.stuck_job_threshold_secs as i64);
    let retention = Duration::seconds(service.job_retention_secs as i64);
    let mut expired = BTreeSet::new();
    for job in &survivors {
        if job.status == JobStatus::Running && now - job.last_activity() > stuck_after {
            debug!("⚰️ Sync job '{}' was last heard from at {}", job.id, job.last_activity());
            ctx.actions.fail_abandoned_job(job, STUCK_JOB_MESSAGE, now).await?;
            report.stuck_failed += 1;
        } else if job.status.is_terminal() && now - job.completed_at.unwrap_or_else(|| job.last_activity()) > retention {
            expired.insert(job.id.clone());
        }
    }
    if !expired.is_empty() {
        let expired: Vec<String> = expired.into_iter().collect();
        report.expired_deleted = store.delete_jobs(&expired).await?;
    }
    Ok(report)
}
