//! 🔧 First contact: a `created` connector gets its registration's configurable fields.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backends::ConnectorStore;
use crate::connector_settings::{ConnectorSettings, ConnectorStatus};
use crate::supervisors::ServiceContext;

pub async fn configure(ctx: &ServiceContext, connector_id: &str) -> Result<()> {
    let connector = ctx
        .actions
        .store()
        .fetch_connector(connector_id)
        .await?
        .with_context(|| format!("💀 Connector '{connector_id}' is gone, nothing to configure"))?;
    configure_connector(ctx, &connector).await
}

pub(crate) async fn configure_connector(ctx: &ServiceContext, connector: &ConnectorSettings) -> Result<()> {
    if connector.status != ConnectorStatus::Created {
        // somebody beat us to it
        return Ok(());
    }

    let filled_service_type = match (&connector.service_type, ctx.config.service.native_mode) {
        (None, false) => ctx.config.service.service_type.as_deref(),
        _ => None,
    };
    let Some(service_type) = connector.service_type.as_deref().or(filled_service_type) else {
        warn!("🔧 Connector '{}' has no service_type, can't configure it yet", connector.id);
        return Ok(());
    };
    let Some(registration) = ctx.registry.registration(service_type) else {
        warn!("🔧 Connector '{}' wants service type '{}', which isn't registered", connector.id, service_type);
        return Ok(());
    };

    let mut configuration = registration.configurable_fields.clone();
    for (key, field) in configuration.iter_mut() {
        if let Some(existing) = connector.configuration.get(key).filter(|existing| existing.has_value()) {
            field.value = existing.value.clone();
        }
    }
    let status = if configuration.values().all(|field| field.has_value()) {
        ConnectorStatus::Configured
    } else {
        ConnectorStatus::NeedsConfiguration
    };

    ctx.actions
        .update_configuration(&connector.id, &configuration, status, filled_service_type)
        .await?;
    info!("🔧 Connector '{}' ({}) is now {:?}", connector.id, service_type, status);
    Ok(())
}
