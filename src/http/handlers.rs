//! Sync, admin, and unauthenticated meta HTTP handlers (C11).

use super::middleware::AuthContext;
use super::state::SharedState;
use crate::connector::ConnectorConfig;
use crate::error::{GatewayError, Result};
use crate::hlc::HlcTimestamp;
use crate::metrics::GatewayMetricsSnapshot;
use crate::model::{ActionBatch, ActionBatchResponse, PullResponse, PushRequest, PushResponse};
use crate::rules::SyncRules;
use axum::{
    extract::{Extension, Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

fn gateway_or_404(state: &SharedState, gw: &str) -> Result<Arc<crate::gateway::SyncGateway>> {
    state.gateway(gw).ok_or_else(|| GatewayError::NotFound(format!("gateway {gw}")))
}

// ---- Sync surface -------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/sync/{gw}/push",
    tag = "sync",
    params(("gw" = String, Path, description = "Gateway id")),
    responses(
        (status = 200, description = "Batch accepted"),
        (status = 400, description = "Malformed push"),
        (status = 413, description = "Batch too large"),
    )
)]
pub async fn push(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Extension(auth): Extension<AuthContext>,
    body: axum::body::Bytes,
) -> Result<Json<PushResponse>> {
    if body.len() > state.config.max_push_payload_bytes {
        return Err(GatewayError::TooLarge);
    }
    let request: PushRequest =
        serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    if !is_anonymous(&auth) && request.client_id != auth.0.client_id {
        return Err(GatewayError::Forbidden("clientId does not match authenticated client".to_string()));
    }
    let gateway = gateway_or_404(&state, &gw)?;
    let response = gateway.handle_push(&request.client_id, request.deltas).await?;
    Ok(Json(response))
}

/// The no-JWT-secret deployment mode authenticates every request as this
/// synthetic identity; clientId checks are skipped for it since there is no
/// real `sub` to compare against.
fn is_anonymous(auth: &AuthContext) -> bool {
    auth.0.client_id == "anonymous"
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub since: u64,
    pub client_id: Option<String>,
    pub limit: Option<usize>,
    pub source: Option<String>,
}

#[utoipa::path(
    get,
    path = "/v1/sync/{gw}/pull",
    tag = "sync",
    params(
        ("gw" = String, Path, description = "Gateway id"),
        ("since" = u64, Query, description = "Exclusive HLC lower bound"),
        ("limit" = Option<usize>, Query, description = "Max deltas to return"),
        ("source" = Option<String>, Query, description = "Named source adapter override"),
    ),
    responses((status = 200, description = "Deltas since the given HLC"))
)]
pub async fn pull(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Query(params): Query<PullParams>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<PullResponse>> {
    if !is_anonymous(&auth) && params.client_id.as_deref().unwrap_or("").is_empty() {
        return Err(GatewayError::BadRequest("clientId is required".to_string()));
    }
    let gateway = gateway_or_404(&state, &gw)?;
    let limit = params.limit.unwrap_or(10_000).min(10_000);
    let response = gateway
        .handle_pull(HlcTimestamp::from(params.since), limit, params.source.as_deref(), &auth.0)
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/sync/{gw}/action",
    tag = "sync",
    params(("gw" = String, Path, description = "Gateway id")),
    responses((status = 200, description = "Per-action results; the envelope itself is always 200"))
)]
pub async fn action(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Json(batch): Json<ActionBatch>,
) -> Result<Json<ActionBatchResponse>> {
    let gateway = gateway_or_404(&state, &gw)?;
    Ok(Json(gateway.handle_action(batch).await))
}

pub async fn actions(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
) -> Result<Json<HashMap<String, Vec<crate::model::ActionDescriptor>>>> {
    let gateway = gateway_or_404(&state, &gw)?;
    Ok(Json(gateway.describe_actions()))
}

pub async fn ws_upgrade(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Extension(auth): Extension<AuthContext>,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> Result<Response> {
    let gateway = gateway_or_404(&state, &gw)?;
    let ws_manager = state.ws.clone();
    let claims = auth.0;
    let messages_per_second = state.config.ws_max_messages_per_second;
    Ok(ws.on_upgrade(move |socket| async move {
        let client_id = claims.client_id.clone();
        ws_manager
            .handle_socket(socket, gateway, client_id, claims, messages_per_second)
            .await;
    }))
}

// ---- Admin surface -------------------------------------------------------

pub async fn flush(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let gateway = gateway_or_404(&state, &gw)?;
    match gateway.flush_with_lock(state.lock_store.as_ref(), state.instance_id()).await? {
        Some(_) => Ok(Json(serde_json::json!({ "flushed": true }))),
        None => Ok(Json(serde_json::json!({ "flushed": false, "reason": "lock held elsewhere" }))),
    }
}

pub async fn save_schema(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Json(_schema): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>> {
    let gateway = gateway_or_404(&state, &gw)?;
    gateway.ensure_schema().await?;
    Ok(Json(serde_json::json!({ "saved": true })))
}

pub async fn save_sync_rules(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Json(rules): Json<SyncRules>,
) -> Result<Json<serde_json::Value>> {
    let gateway = gateway_or_404(&state, &gw)?;
    gateway.set_sync_rules(rules);
    Ok(Json(serde_json::json!({ "saved": true })))
}

pub async fn register_connector(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
    Json(config): Json<ConnectorConfig>,
) -> Result<Json<serde_json::Value>> {
    let gateway = gateway_or_404(&state, &gw)?;
    state.connectors.register(config, gateway)?;
    Ok(Json(serde_json::json!({ "registered": true })))
}

pub async fn list_connectors(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
) -> Result<Json<Vec<crate::connector::ConnectorListEntry>>> {
    let _ = gateway_or_404(&state, &gw)?;
    Ok(Json(state.connectors.list()))
}

pub async fn unregister_connector(
    State(state): State<SharedState>,
    Path((gw, name)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let _ = gateway_or_404(&state, &gw)?;
    state.connectors.unregister(&name)?;
    Ok(Json(serde_json::json!({ "unregistered": true })))
}

pub async fn admin_metrics(
    State(state): State<SharedState>,
    Path(gw): Path<String>,
) -> Result<Json<GatewayMetricsSnapshot>> {
    let gateway = gateway_or_404(&state, &gw)?;
    let stats = gateway.stats().await;
    Ok(Json(GatewayMetricsSnapshot {
        buffer_log_size: stats.log_size,
        buffer_byte_size: stats.byte_size,
        buffer_oldest_age_ms: stats.oldest_age_ms,
        ws_connections: state.ws.connection_count() as u64,
        http_in_flight: state.http_in_flight.load(std::sync::atomic::Ordering::SeqCst),
        push_total_ok: state.metrics.push_total_ok.get() as u64,
        push_total_error: state.metrics.push_total_error.get() as u64,
    }))
}

// ---- Unauthenticated meta surface ---------------------------------------

#[utoipa::path(get, path = "/health", tag = "meta", responses((status = 200, description = "Liveness probe")))]
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(
    get,
    path = "/ready",
    tag = "meta",
    responses(
        (status = 200, description = "Ready to serve"),
        (status = 503, description = "Draining or not yet ready"),
    )
)]
pub async fn ready(State(state): State<SharedState>) -> Response {
    if state.is_draining() {
        return GatewayError::Draining.into_response();
    }
    let timeout = state.config.readiness_probe_timeout;
    for entry in state.gateways.iter() {
        if !entry.value().check_ready(timeout).await {
            return GatewayError::Draining.into_response();
        }
    }
    Json(serde_json::json!({ "status": "ready" })).into_response()
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

pub async fn connector_types(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.connectors.registered_types())
}

pub async fn openapi_json() -> impl IntoResponse {
    Json(super::openapi::ApiDoc::document())
}
