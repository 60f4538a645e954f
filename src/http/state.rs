//! Shared application state handed to every HTTP handler and middleware.

use crate::config::GatewayConfig;
use crate::connector::ConnectorManager;
use crate::gateway::SyncGateway;
use crate::http::middleware::RateLimiter;
use crate::lock::LockStore;
use crate::metrics::Metrics;
use crate::ws::WsManager;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One gateway instance per configured `gatewayId`, keyed by id.
pub struct AppState {
    pub config: GatewayConfig,
    pub gateways: DashMap<String, Arc<SyncGateway>>,
    pub ws: WsManager,
    pub connectors: Arc<ConnectorManager>,
    pub lock_store: Arc<dyn LockStore>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: RateLimiter,
    pub draining: AtomicBool,
    pub http_in_flight: AtomicU64,
    instance_id: String,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        ws: WsManager,
        connectors: Arc<ConnectorManager>,
        lock_store: Arc<dyn LockStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.http_max_requests_per_minute, Duration::from_secs(60));
        Self {
            config,
            gateways: DashMap::new(),
            ws,
            connectors,
            lock_store,
            metrics,
            rate_limiter,
            draining: AtomicBool::new(false),
            http_in_flight: AtomicU64::new(0),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn register_gateway(&self, gateway: Arc<SyncGateway>) {
        self.gateways.insert(gateway.gateway_id.clone(), gateway);
    }

    pub fn gateway(&self, id: &str) -> Option<Arc<SyncGateway>> {
        self.gateways.get(id).map(|e| e.clone())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

pub type SharedState = Arc<AppState>;
