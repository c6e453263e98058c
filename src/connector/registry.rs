// src/connector/registry.rs

use std::sync::Arc;
use connector_plugin::{Connector, ConnectorContext, ConnectorError, ConnectorFactory};
use dashmap::DashMap;
use tracing::info;

use crate::{
    catalog::PASS_THROUGH_CONNECTOR,
    connector::builtin::{
        HeartbeatFactory, NoopFactory, PassThroughFactory, HEARTBEAT_CONNECTOR, NOOP_CONNECTOR,
    },
};

/// Connector identifier -> factory.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: Arc<DashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `default`, `noop` and `heartbeat`.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(PASS_THROUGH_CONNECTOR, Arc::new(PassThroughFactory));
        registry.register(NOOP_CONNECTOR, Arc::new(NoopFactory));
        registry.register(HEARTBEAT_CONNECTOR, Arc::new(HeartbeatFactory));
        registry
    }

    /// Register (or replace) the factory for `identifier`.
    pub fn register(&self, identifier: &str, factory: Arc<dyn ConnectorFactory>) {
        if self.factories.insert(identifier.to_string(), factory).is_some() {
            info!("Replaced connector factory `{}`", identifier);
        }
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.factories.contains_key(identifier)
    }

    /// Sorted identifiers.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.iter().map(|kv| kv.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn create(
        &self,
        identifier: &str,
        ctx: ConnectorContext,
    ) -> Result<Arc<dyn Connector>, ConnectorError> {
        // clone out of the map so no shard lock is held across the await
        let factory = self
            .factories
            .get(identifier)
            .map(|kv| kv.value().clone())
            .ok_or_else(|| ConnectorError::Unknown(identifier.to_string()))?;
        factory.create(ctx).await
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("factories", &self.identifiers())
            .finish()
    }
}
