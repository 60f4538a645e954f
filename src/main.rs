use lakesync_gateway::config::GatewayConfig;
use lakesync_gateway::connector::ConnectorManager;
use lakesync_gateway::gateway::SyncGateway;
use lakesync_gateway::hlc::HlcClock;
use lakesync_gateway::http::state::AppState;
use lakesync_gateway::lock::InMemoryLockStore;
use lakesync_gateway::metrics::Metrics;
use lakesync_gateway::persistence::FilePersistence;
use lakesync_gateway::buffer::DeltaBuffer;
use lakesync_gateway::ws::WsManager;
use lakesync_gateway::{logging, server, Result, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("LAKESYNC_CONFIG_FILE").ok().map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref())?;

    logging::init(&config.log_level);
    info!(version = VERSION, "starting lakesync gateway");

    let metrics = Arc::new(Metrics::new());
    let ws = WsManager::new(config.ws_max_connections, metrics.clone());
    let connectors = Arc::new(ConnectorManager::new());
    let lock_store: Arc<dyn lakesync_gateway::lock::LockStore> = Arc::new(InMemoryLockStore::new());

    let gateway_ids = if config.gateway_ids.is_empty() {
        vec!["default".to_string()]
    } else {
        config.gateway_ids.clone()
    };

    let state = Arc::new(AppState::new(config.clone(), ws, connectors, lock_store, metrics.clone()));

    for gateway_id in gateway_ids {
        let clock = Arc::new(HlcClock::new());
        let persistence = Arc::new(FilePersistence::new(&config.data_dir.join(&gateway_id))?);
        let buffer = Arc::new(DeltaBuffer::new(
            clock.clone(),
            config.max_buffer_bytes,
            config.max_buffer_age.as_millis() as u64,
        ));
        let gateway = Arc::new(SyncGateway::new(
            gateway_id.clone(),
            buffer,
            persistence,
            clock,
            config.cluster.clone(),
            metrics.clone(),
        ));
        state.ws.bind_gateway(&gateway);
        gateway.set_broadcaster(Arc::new(state.ws.clone()));
        info!(gateway_id = %gateway_id, "registered gateway");
        state.register_gateway(gateway);
    }

    server::run(state).await
}
