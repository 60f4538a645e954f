//! Connector manager (C8): a unified factory registry over the C7 poller
//! lifecycle, with config-store rollback on registration failure.

use crate::adapter::{ActionHandler, TableAdapter};
use crate::error::{GatewayError, Result};
use crate::model::RowDelta;
use crate::poller::SourcePoller;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Deltas produced by a connector are injected here as if from a synthetic
/// client. Implemented by the sync gateway (C5).
#[async_trait]
pub trait PushTarget: Send + Sync {
    async fn ingest(&self, deltas: Vec<RowDelta>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestTableConfig {
    pub table: String,
    pub query: String,
    pub row_id_column: String,
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub interval_ms: u64,
    pub tables: Vec<IngestTableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub ingest: Option<IngestConfig>,
}

/// What a running connector instance exposes back to the manager: lifecycle
/// control, and optionally a table adapter and/or action handler.
pub trait ConnectorHandle: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_running(&self) -> bool;
    fn table_adapter(&self) -> Option<Arc<dyn TableAdapter>> {
        None
    }
    fn action_handler(&self) -> Option<Arc<dyn ActionHandler>> {
        None
    }
}

/// `type -> factory(config, push_target) -> handle`.
pub trait ConnectorFactory: Send + Sync {
    fn create(
        &self,
        config: &ConnectorConfig,
        push_target: Arc<dyn PushTarget>,
    ) -> Result<Arc<dyn ConnectorHandle>>;
}

struct Registered {
    config: ConnectorConfig,
    handle: Arc<dyn ConnectorHandle>,
}

#[derive(Default)]
pub struct ConnectorManager {
    factories: DashMap<String, Arc<dyn ConnectorFactory>>,
    connectors: DashMap<String, Registered>,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&self, connector_type: impl Into<String>, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(connector_type.into(), factory);
    }

    /// Validates, persists to the config store, invokes the factory, and
    /// starts it; any failure rolls back the config-store entry.
    pub fn register(
        &self,
        config: ConnectorConfig,
        push_target: Arc<dyn PushTarget>,
    ) -> Result<()> {
        if config.name.is_empty() {
            return Err(GatewayError::BadRequest("connector name required".to_string()));
        }
        if self.connectors.contains_key(&config.name) {
            return Err(GatewayError::BadRequest(format!(
                "connector already registered: {}",
                config.name
            )));
        }
        let factory = self
            .factories
            .get(&config.connector_type)
            .ok_or_else(|| {
                GatewayError::BadRequest(format!("unknown connector type: {}", config.connector_type))
            })?
            .clone();

        match factory.create(&config, push_target) {
            Ok(handle) => {
                handle.start();
                self.connectors.insert(
                    config.name.clone(),
                    Registered {
                        config,
                        handle,
                    },
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let (_, registered) = self
            .connectors
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound(format!("connector {name}")))?;
        registered.handle.stop();
        Ok(())
    }

    pub fn get_table_adapter(&self, name: &str) -> Option<Arc<dyn TableAdapter>> {
        self.connectors.get(name).and_then(|r| r.handle.table_adapter())
    }

    pub fn get_action_handler(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.connectors.get(name).and_then(|r| r.handle.action_handler())
    }

    /// Names of registered connector factory types, for the unauthenticated
    /// `/v1/connectors/types` catalog endpoint.
    pub fn registered_types(&self) -> Vec<String> {
        self.factories.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops every running connector, for graceful shutdown. Entries stay
    /// registered; the process is exiting, not reconfiguring.
    pub fn stop_all(&self) {
        for entry in self.connectors.iter() {
            entry.handle.stop();
        }
    }

    pub fn list(&self) -> Vec<ConnectorListEntry> {
        self.connectors
            .iter()
            .map(|entry| ConnectorListEntry {
                name: entry.config.name.clone(),
                connector_type: entry.config.connector_type.clone(),
                is_running: entry.handle.is_running(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorListEntry {
    pub name: String,
    pub connector_type: String,
    pub is_running: bool,
}

/// Wraps a `SourcePoller` (and optionally a `TableAdapter`) as a
/// `ConnectorHandle`, for connector types that are API-polled or
/// table-diff-backed rather than relying on a bespoke implementation.
pub struct PollerConnectorHandle {
    poller: Arc<SourcePoller>,
    adapter: Option<Arc<dyn TableAdapter>>,
}

impl PollerConnectorHandle {
    pub fn new(poller: Arc<SourcePoller>, adapter: Option<Arc<dyn TableAdapter>>) -> Self {
        Self { poller, adapter }
    }
}

impl ConnectorHandle for PollerConnectorHandle {
    fn start(&self) {
        self.poller.start();
    }

    fn stop(&self) {
        self.poller.stop();
    }

    fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    fn table_adapter(&self) -> Option<Arc<dyn TableAdapter>> {
        self.adapter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopHandle {
        running: AtomicBool,
    }

    impl ConnectorHandle for NoopHandle {
        fn start(&self) {
            self.running.store(true, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    struct NoopFactory;
    impl ConnectorFactory for NoopFactory {
        fn create(
            &self,
            _config: &ConnectorConfig,
            _push_target: Arc<dyn PushTarget>,
        ) -> Result<Arc<dyn ConnectorHandle>> {
            Ok(Arc::new(NoopHandle {
                running: AtomicBool::new(false),
            }))
        }
    }

    struct FailingFactory;
    impl ConnectorFactory for FailingFactory {
        fn create(
            &self,
            _config: &ConnectorConfig,
            _push_target: Arc<dyn PushTarget>,
        ) -> Result<Arc<dyn ConnectorHandle>> {
            Err(GatewayError::Internal("boom".to_string()))
        }
    }

    struct NoopPushTarget;
    #[async_trait]
    impl PushTarget for NoopPushTarget {
        async fn ingest(&self, _deltas: Vec<RowDelta>) {}
    }

    fn config(name: &str, connector_type: &str) -> ConnectorConfig {
        ConnectorConfig {
            name: name.to_string(),
            connector_type: connector_type.to_string(),
            config: serde_json::json!({}),
            ingest: None,
        }
    }

    #[test]
    fn register_then_list_shows_running_connector() {
        let manager = ConnectorManager::new();
        manager.register_factory("noop", Arc::new(NoopFactory));
        manager
            .register(config("c1", "noop"), Arc::new(NoopPushTarget))
            .unwrap();
        let list = manager.list();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_running);
    }

    #[test]
    fn unknown_connector_type_is_rejected() {
        let manager = ConnectorManager::new();
        let err = manager
            .register(config("c1", "missing"), Arc::new(NoopPushTarget))
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn failed_factory_does_not_leave_a_registered_connector() {
        let manager = ConnectorManager::new();
        manager.register_factory("failing", Arc::new(FailingFactory));
        let result = manager.register(config("c1", "failing"), Arc::new(NoopPushTarget));
        assert!(result.is_err());
        assert!(manager.list().is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let manager = ConnectorManager::new();
        manager.register_factory("noop", Arc::new(NoopFactory));
        manager
            .register(config("c1", "noop"), Arc::new(NoopPushTarget))
            .unwrap();
        let result = manager.register(config("c1", "noop"), Arc::new(NoopPushTarget));
        assert!(result.is_err());
    }

    #[test]
    fn unregister_stops_and_removes_connector() {
        let manager = ConnectorManager::new();
        manager.register_factory("noop", Arc::new(NoopFactory));
        manager
            .register(config("c1", "noop"), Arc::new(NoopPushTarget))
            .unwrap();
        manager.unregister("c1").unwrap();
        assert!(manager.list().is_empty());
    }
}
