//! ⏰ The scheduler: every poll, look at every connector and decide what it needs.
//!
//! Deciding is a pure function of the connector record and the clock, so the interesting
//! part ([`triggered_tasks`]) is testable without a store. [`Scheduler::poll`] only adds
//! the fetching.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::app_config::ServiceConfig;
use crate::backends::{ConnectorStore, StoreBackend};
use crate::connector_settings::{ConnectorSettings, ConnectorStatus};
use crate::connectors::ConnectorRegistry;
use crate::cron_schedule::next_fire_after;
use crate::filtering::ValidationState;

/// 🎯 What a connector is due for on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggeredTask {
    Configuration,
    FilterValidation,
    Heartbeat,
    Sync,
}

/// 🗓️ One connector and what it's due for.
#[derive(Debug, Clone)]
pub struct Due {
    pub connector: ConnectorSettings,
    pub tasks: Vec<TriggeredTask>,
}

pub fn triggered_tasks(
    connector: &ConnectorSettings,
    registry: &ConnectorRegistry,
    heartbeat_interval: Duration,
    now: DateTime<Utc>,
) -> Vec<TriggeredTask> {
    let registered = connector
        .service_type
        .as_deref()
        .is_some_and(|service_type| registry.is_registered(service_type));

    let mut tasks = Vec::new();
    if connector.status == ConnectorStatus::Created {
        tasks.push(TriggeredTask::Configuration);
    }
    if connector
        .draft_filter()
        .is_some_and(|draft| draft.validation.state == ValidationState::Edited)
    {
        tasks.push(TriggeredTask::FilterValidation);
    }
    if registered && connector.last_seen.is_none_or(|last_seen| now - last_seen > heartbeat_interval) {
        tasks.push(TriggeredTask::Heartbeat);
    }
    if registered && sync_due(connector, now) {
        tasks.push(TriggeredTask::Sync);
    }
    tasks
}

fn sync_due(connector: &ConnectorSettings, now: DateTime<Utc>) -> bool {
    if !connector.has_valid_index_name() {
        debug!("🏷️ Connector '{}' has no usable index name, not syncing", connector.id);
        return false;
    }
    if !connector.status.allows_sync() {
        return false;
    }
    if connector.sync_now {
        return true;
    }
    if !connector.scheduling.enabled {
        return false;
    }
    let Some(last_synced) = connector.last_synced else {
        return true;
    };
    let Some(interval) = connector.scheduling.interval.as_deref().filter(|i| !i.trim().is_empty()) else {
        return false;
    };
    match next_fire_after(interval, last_synced) {
        Ok(Some(next)) => next <= now,
        Ok(None) => false,
        Err(err) => {
            warn!("⏰ Connector '{}' has a schedule we can't read: {:#}", connector.id, err);
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    store: StoreBackend,
    registry: Arc<ConnectorRegistry>,
    service: ServiceConfig,
}

impl Scheduler {
    pub fn new(store: StoreBackend, registry: Arc<ConnectorRegistry>, service: ServiceConfig) -> Self {
        Self {
            store,
            registry,
            service,
        }
    }

    /// 🔄 Fetch the connectors this service manages and work out what each is due for.
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<Vec<Due>> {
        let connectors = if self.service.native_mode {
            self.store.fetch_native_connectors().await?
        } else {
            let connector_id = self.service.connector_id.as_deref().unwrap_or_default();
            match self.store.fetch_connector(connector_id).await? {
                Some(connector) => vec![connector],
                None => {
                    warn!("🔍 Connector '{}' doesn't exist (yet?), nothing to do", connector_id);
                    Vec::new()
                }
            }
        };

        let heartbeat_interval = Duration::seconds(self.service.heartbeat_interval_secs as i64);
        let due: Vec<Due> = connectors
            .into_iter()
            .filter_map(|connector| {
                let tasks = triggered_tasks(&connector, &self.registry, heartbeat_interval, now);
                (!tasks.is_empty()).then_some(Due { connector, tasks })
            })
            .collect();
        debug!("⏰ Poll found {} connectors with something to do", due.len());
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::connector_settings::SchedulingSettings;
    use crate::connectors::default_registry;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap()
    }

    fn connector() -> ConnectorSettings {
        ConnectorSettings {
            id: "conn-1".to_string(),
            service_type: Some("example".to_string()),
            index_name: Some("search-example".to_string()),
            status: ConnectorStatus::Connected,
            last_seen: Some(now()),
            last_synced: Some(now() - Duration::minutes(90)),
            scheduling: SchedulingSettings {
                enabled: true,
                interval: Some("0 0 * * * ?".to_string()),
            },
            ..Default::default()
        }
    }

    fn tasks_for(connector: &ConnectorSettings) -> Vec<TriggeredTask> {
        triggered_tasks(connector, &default_registry(), Duration::minutes(30), now())
    }

    #[test]
    fn the_one_where_the_hourly_schedule_is_overdue() {
        assert_eq!(tasks_for(&connector()), vec![TriggeredTask::Sync]);
    }

    #[test]
    fn the_one_where_the_schedule_is_not_due_yet() {
        let mut c = connector();
        c.last_synced = Some(now() - Duration::minutes(1));
        assert!(tasks_for(&c).is_empty());
    }

    #[test]
    fn the_one_where_sync_now_beats_a_disabled_schedule() {
        let mut c = connector();
        c.scheduling.enabled = false;
        assert!(tasks_for(&c).is_empty());
        c.sync_now = true;
        assert_eq!(tasks_for(&c), vec![TriggeredTask::Sync]);
    }

    #[test]
    fn the_one_where_never_synced_means_sync() {
        let mut c = connector();
        c.last_synced = None;
        c.scheduling.interval = None;
        assert_eq!(tasks_for(&c), vec![TriggeredTask::Sync]);
    }

    #[test]
    fn the_one_where_a_bad_cron_or_empty_interval_means_no() {
        let mut c = connector();
        c.scheduling.interval = Some("whenever".to_string());
        assert!(tasks_for(&c).is_empty());
        c.scheduling.interval = Some("  ".to_string());
        assert!(tasks_for(&c).is_empty());
    }

    #[test]
    fn the_one_where_unsyncable_connectors_stay_put() {
        let mut bad_index = connector();
        bad_index.sync_now = true;
        bad_index.index_name = Some("Not Valid".to_string());
        assert!(tasks_for(&bad_index).is_empty());

        let mut unregistered = connector();
        unregistered.sync_now = true;
        unregistered.service_type = Some("mainframe".to_string());
        assert!(tasks_for(&unregistered).is_empty());

        let mut needs_config = connector();
        needs_config.sync_now = true;
        needs_config.status = ConnectorStatus::NeedsConfiguration;
        assert!(tasks_for(&needs_config).is_empty());
    }

    #[test]
    fn the_one_where_stale_heartbeats_and_new_connectors_get_attention() {
        let mut c = connector();
        c.last_synced = Some(now());
        c.last_seen = Some(now() - Duration::hours(1));
        c.status = ConnectorStatus::Created;
        assert_eq!(
            tasks_for(&c),
            vec![TriggeredTask::Configuration, TriggeredTask::Heartbeat]
        );
    }

    #[test]
    fn the_one_where_an_edited_draft_gets_validated() {
        let c = ConnectorSettings::from_source(
            "conn-1",
            json!({"filtering": [{"domain": "DEFAULT", "draft": {"validation": {"state": "edited"}}}]}),
            None,
            None,
        )
        .unwrap();
        assert_eq!(tasks_for(&c), vec![TriggeredTask::Configuration, TriggeredTask::FilterValidation]);
    }

    #[tokio::test]
    async fn the_one_where_single_mode_polls_only_its_connector() -> Result<()> {
        let store = InMemoryStore::new();
        store
            .put_connector("mine", json!({"service_type": "example", "status": "created", "is_native": false}))
            .await;
        store
            .put_connector("theirs", json!({"service_type": "example", "status": "created", "is_native": true}))
            .await;

        let single = Scheduler::new(
            StoreBackend::InMemory(store.clone()),
            Arc::new(default_registry()),
            ServiceConfig {
                native_mode: false,
                connector_id: Some("mine".to_string()),
                ..ServiceConfig::default()
            },
        );
        let due = single.poll(now()).await?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].connector.id, "mine");

        let native = Scheduler::new(StoreBackend::InMemory(store), Arc::new(default_registry()), ServiceConfig::default());
        let due = native.poll(now()).await?;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].connector.id, "theirs");
        Ok(())
    }
}
