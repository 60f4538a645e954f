//! Server lifecycle (C13): WAL rehydration, listener bind, periodic flush,
//! readiness/draining, and graceful shutdown.

use crate::error::Result;
use crate::gateway::SyncGateway;
use crate::http::state::SharedState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Replays the persisted WAL for every registered gateway into its buffer.
/// Run once at startup, before the listener accepts traffic.
pub async fn rehydrate(gateways: &[Arc<SyncGateway>]) -> Result<()> {
    for gateway in gateways {
        let replayed = gateway.rehydrate().await?;
        if replayed > 0 {
            info!(gateway_id = %gateway.gateway_id, deltas = replayed, "replayed WAL into buffer");
        }
    }
    Ok(())
}

/// Spawns the periodic flush loop for one gateway. Each tick attempts a
/// lock-coordinated flush, bounded by `flush_timeout`; failures are logged
/// and retried on the next tick rather than aborting the loop.
fn spawn_flush_loop(state: SharedState, gateway: Arc<SyncGateway>) -> tokio::task::JoinHandle<()> {
    let interval = state.config.flush_interval;
    let timeout = state.config.flush_timeout;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if state.is_draining() {
                continue;
            }
            let attempt = tokio::time::timeout(
                timeout,
                gateway.flush_with_lock(state.lock_store.as_ref(), state.instance_id()),
            )
            .await;
            match attempt {
                Ok(Ok(Some(count))) => info!(gateway_id = %gateway.gateway_id, flushed = count, "periodic flush"),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(gateway_id = %gateway.gateway_id, error = %e, "periodic flush failed"),
                Err(_) => warn!(gateway_id = %gateway.gateway_id, "periodic flush timed out"),
            }
        }
    })
}

/// Runs the gateway to completion: binds the listener, serves the HTTP/WS
/// router, and blocks until a shutdown signal, then drains.
pub async fn run(state: SharedState) -> Result<()> {
    let gateways: Vec<Arc<SyncGateway>> = state.gateways.iter().map(|e| e.value().clone()).collect();
    rehydrate(&gateways).await?;

    let flush_handles: Vec<_> = gateways
        .iter()
        .cloned()
        .map(|gw| spawn_flush_loop(state.clone(), gw))
        .collect();

    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .map_err(|e| crate::error::GatewayError::Internal(format!("bind {}: {e}", state.config.listen_addr)))?;
    info!(addr = %state.config.listen_addr, "lakesync gateway listening");

    let drain_timeout = state.config.drain_timeout;
    let router = crate::http::build_router(state.clone());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| crate::error::GatewayError::Internal(format!("server error: {e}")))?;

    info!("draining in-flight requests");
    state.set_draining(true);
    let drained = tokio::time::timeout(drain_timeout, wait_for_drain(&state)).await;
    if drained.is_err() {
        warn!("drain timeout elapsed with requests still in flight");
    }

    for handle in flush_handles {
        handle.abort();
    }
    state.connectors.stop_all();

    for gateway in &gateways {
        if let Err(e) = gateway.flush().await {
            error!(gateway_id = %gateway.gateway_id, error = %e, "final flush on shutdown failed");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_drain(state: &SharedState) {
    while state.http_in_flight.load(std::sync::atomic::Ordering::SeqCst) > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
