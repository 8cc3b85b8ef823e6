//! 🛂 Someone edited the draft filtering. Check it and write the verdict back.

use anyhow::Result;
use tracing::{info, warn};

use crate::connector_settings::ConnectorSettings;
use crate::supervisors::ServiceContext;

pub async fn validate_draft_filtering(ctx: &ServiceContext, connector: &ConnectorSettings) -> Result<()> {
    let Some(draft) = connector.draft_filter() else {
        return Ok(());
    };
    let Some(service_type) = connector.service_type.as_deref() else {
        warn!("🛂 Connector '{}' has no service_type, can't pick its filter validators", connector.id);
        return Ok(());
    };

    let result = ctx.registry.validate_filtering(service_type, draft);
    info!(
        "🛂 Draft filtering of connector '{}' is {:?} ({} errors)",
        connector.id,
        result.state,
        result.errors.len()
    );
    ctx.actions.update_filtering_validation(connector, &result).await
}
