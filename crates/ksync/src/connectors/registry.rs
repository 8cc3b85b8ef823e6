//! 📇 Which `service_type` is served by which connector.
//!
//! Built once at start-up, shared behind an `Arc`, never mutated after that.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::Connector;
use crate::connector_settings::{Configuration, ConnectorSettings};
use crate::filtering::schema_validator::SchemaFields;
use crate::filtering::{FilterDefinition, FilterValidator, ValidationResult};

pub type ConnectorFactory = Arc<dyn Fn(&ConnectorSettings) -> Result<Box<dyn Connector>> + Send + Sync>;

/// 🧾 Everything the service knows about a connector kind before it ever runs one.
#[derive(Clone)]
pub struct ConnectorRegistration {
    pub service_type: String,
    pub display_name: String,
    /// Field keys with their labels and default values.
    pub configurable_fields: Configuration,
    pub advanced_snippet_schema: Option<SchemaFields>,
    factory: ConnectorFactory,
}

impl ConnectorRegistration {
    pub fn new(
        service_type: impl Into<String>,
        display_name: impl Into<String>,
        configurable_fields: Configuration,
        factory: impl Fn(&ConnectorSettings) -> Result<Box<dyn Connector>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            display_name: display_name.into(),
            configurable_fields,
            advanced_snippet_schema: None,
            factory: Arc::new(factory),
        }
    }

    pub fn with_advanced_snippet_schema(mut self, schema: SchemaFields) -> Self {
        self.advanced_snippet_schema = Some(schema);
        self
    }

    pub fn build(&self, settings: &ConnectorSettings) -> Result<Box<dyn Connector>> {
        (self.factory)(settings)
    }

    pub fn filter_validator(&self) -> FilterValidator {
        FilterValidator::with_schema(self.advanced_snippet_schema.clone())
    }
}

impl fmt::Debug for ConnectorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistration")
            .field("service_type", &self.service_type)
            .field("display_name", &self.display_name)
            .field("configurable_fields", &self.configurable_fields)
            .field("advanced_snippet_schema", &self.advanced_snippet_schema)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    registrations: BTreeMap<String, ConnectorRegistration>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📌 Last one in wins if a service type is registered twice.
    pub fn register(&mut self, registration: ConnectorRegistration) -> &mut Self {
        self.registrations
            .insert(registration.service_type.clone(), registration);
        self
    }

    pub fn is_registered(&self, service_type: &str) -> bool {
        self.registrations.contains_key(service_type)
    }

    pub fn registration(&self, service_type: &str) -> Option<&ConnectorRegistration> {
        self.registrations.get(service_type)
    }

    /// 🏭 Build a connector for this record, using its `service_type`.
    pub fn connector(&self, settings: &ConnectorSettings) -> Result<Box<dyn Connector>> {
        let service_type = settings
            .service_type
            .as_deref()
            .with_context(|| format!("💀 Connector '{}' has no service_type, so we don't know who to call", settings.id))?;
        let registration = self
            .registration(service_type)
            .with_context(|| format!("💀 No connector is registered for service type '{service_type}'"))?;
        registration.build(settings)
    }

    /// Sorted, because `BTreeMap`.
    pub fn registered_service_types(&self) -> Vec<&str> {
        self.registrations.keys().map(String::as_str).collect()
    }

    pub fn registrations(&self) -> impl Iterator<Item = &ConnectorRegistration> {
        self.registrations.values()
    }

    /// 🛂 Validate a filter with the service type's validators. Unknown types get the generic ones.
    pub fn validate_filtering(&self, service_type: &str, filter: &FilterDefinition) -> ValidationResult {
        let validator = self
            .registration(service_type)
            .map(ConnectorRegistration::filter_validator)
            .unwrap_or_default();
        validator.is_filter_valid(filter)
    }
}

/// 🧰 The registry the service ships with.
pub fn default_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register(super::example::registration());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::example::SERVICE_TYPE;
    use serde_json::json;

    #[test]
    fn the_one_where_the_default_registry_knows_the_example() {
        let registry = default_registry();
        assert!(registry.is_registered(SERVICE_TYPE));
        assert!(!registry.is_registered("sharepoint"));
        assert_eq!(registry.registered_service_types(), vec![SERVICE_TYPE]);
    }

    #[test]
    fn the_one_where_an_unknown_service_type_cannot_be_built() {
        let registry = default_registry();
        let settings = ConnectorSettings {
            id: "c".to_string(),
            service_type: Some("mainframe".to_string()),
            ..Default::default()
        };
        let err = registry.connector(&settings).unwrap_err();
        assert!(err.to_string().contains("mainframe"));

        let nameless = ConnectorSettings::default();
        assert!(registry.connector(&nameless).is_err());
    }

    #[test]
    fn the_one_where_filtering_uses_the_connector_schema() {
        let registry = default_registry();
        let mut filter = FilterDefinition::default();
        filter.advanced_snippet.value = json!({"find": {}, "aggregate": {}});

        let with_schema = registry.validate_filtering(SERVICE_TYPE, &filter);
        assert!(!with_schema.is_valid());

        let generic = registry.validate_filtering("unknown", &filter);
        assert!(generic.is_valid());
    }
}
