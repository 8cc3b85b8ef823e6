//! 💓 "Still here." Stamps `last_seen` and, for connectors that could sync, checks the
//! source is still reachable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::configuration::configure_connector;
use crate::backends::ConnectorStore;
use crate::connector_settings::ConnectorStatus;
use crate::connectors::SourceStatus;
use crate::supervisors::ServiceContext;

pub async fn heartbeat(ctx: &ServiceContext, connector_id: &str, now: DateTime<Utc>) -> Result<()> {
    let connector = ctx
        .actions
        .store()
        .fetch_connector(connector_id)
        .await?
        .with_context(|| format!("💀 Connector '{connector_id}' is gone, nobody to heartbeat"))?;
    ctx.actions.update_last_seen(connector_id, now).await?;
    debug!("💓 Connector '{}' checked in", connector_id);

    if connector.status == ConnectorStatus::Created {
        return configure_connector(ctx, &connector).await;
    }
    if !connector.status.allows_sync() {
        return Ok(());
    }

    let status = match ctx.registry.connector(&connector) {
        Ok(source) => source.source_status().await,
        Err(err) => SourceStatus::failure(format!("{err:#}")),
    };
    match status {
        SourceStatus::Ok => {
            if connector.status != ConnectorStatus::Connected {
                ctx.actions
                    .update_connector_status(connector_id, ConnectorStatus::Connected, None)
                    .await?;
            }
        }
        SourceStatus::Failure { message, .. } => {
            warn!("🩺 Connector '{}' can't reach its source: {}", connector_id, message);
            ctx.actions
                .update_connector_status(connector_id, ConnectorStatus::Error, Some(&message))
                .await?;
        }
    }
    Ok(())
}
