//! HTTP pipeline middleware (C11): security headers, drain guard, in-flight
//! counter, auth, and per-client rate limiting.

use super::state::SharedState;
use crate::auth::verify_token;
use crate::error::GatewayError;
use crate::model::{Claims, Role};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Request-scoped claims, inserted by `auth_middleware` once validated so
/// downstream handlers can pull them out of extensions.
#[derive(Clone)]
pub struct AuthContext(pub Claims);

/// `/v1/sync/*` and `/v1/admin/*` responses must never be cached by an
/// intermediary; every other response is unaffected.
fn requires_no_store(path: &str) -> bool {
    path.starts_with("/v1/sync/") || path.starts_with("/v1/admin/")
}

pub async fn security_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let no_store = requires_no_store(req.uri().path());
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        header::HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    if no_store {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

/// Opens the per-request span that carries `request_id`/`gateway_id`/
/// `client_id` for the lifetime of the request, so every log line emitted
/// downstream (auth, handlers, the gateway itself) inherits them without
/// having to thread the values through call signatures. `gateway_id` and
/// `client_id` start empty and are filled in by `auth_middleware` once the
/// token (or its absence) is resolved.
pub async fn request_logger_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = Uuid::new_v4().to_string();
    let start = Instant::now();

    let span = info_span!(
        "http_request",
        request_id = %request_id,
        gateway_id = tracing::field::Empty,
        client_id = tracing::field::Empty,
    );

    let response = next.run(req).instrument(span).await;

    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

/// Rejects new requests with 503 while the server is draining for shutdown.
pub async fn drain_guard_middleware(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    if state.is_draining() {
        return Err(GatewayError::Draining);
    }
    Ok(next.run(req).await)
}

/// Tracks concurrent in-flight requests for the admin metrics endpoint.
pub async fn in_flight_middleware(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    state.http_in_flight.fetch_add(1, Ordering::SeqCst);
    state.metrics.http_in_flight.inc();
    let response = next.run(req).await;
    state.http_in_flight.fetch_sub(1, Ordering::SeqCst);
    state.metrics.http_in_flight.dec();
    response
}

/// Validates the bearer token against the configured gateway id path
/// segment, inserting `AuthContext` into request extensions. When no JWT
/// secret is configured every route is unauthenticated, per spec.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let gw_in_path = path_gateway_id(req.uri().path());

    let Some(secret) = state.config.jwt_secret.as_deref() else {
        let claims = anonymous_claims();
        record_request_identity(&claims, gw_in_path.as_deref());
        req.extensions_mut().insert(AuthContext(claims));
        return Ok(next.run(req).await);
    };

    let token = bearer_token(&req).ok_or(GatewayError::Unauthenticated)?;
    let claims = verify_token(&token, secret)?;

    if let Some(gw) = &gw_in_path {
        if &claims.gateway_id != gw {
            return Err(GatewayError::Forbidden("gateway mismatch".to_string()));
        }
    }

    if req.uri().path().starts_with("/v1/admin/") && !claims.is_admin() {
        return Err(GatewayError::Forbidden("admin role required".to_string()));
    }

    record_request_identity(&claims, gw_in_path.as_deref());
    req.extensions_mut().insert(AuthContext(claims));
    Ok(next.run(req).await)
}

fn record_request_identity(claims: &Claims, gw_in_path: Option<&str>) {
    let span = tracing::Span::current();
    span.record("client_id", claims.client_id.as_str());
    let gateway_id = gw_in_path.unwrap_or(claims.gateway_id.as_str());
    if !gateway_id.is_empty() {
        span.record("gateway_id", gateway_id);
    }
}

fn anonymous_claims() -> Claims {
    Claims {
        client_id: "anonymous".to_string(),
        gateway_id: String::new(),
        role: Role::Admin,
        custom: Default::default(),
    }
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    if let Some(header) = req.headers().get(header::AUTHORIZATION) {
        let value = header.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    req.uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| *k == "token")
                .map(|(_, v)| v.to_string())
        })
}

fn path_gateway_id(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("v1"), Some("sync")) | (Some("v1"), Some("admin")) => {
            segments.next().map(|s| s.to_string())
        }
        _ => None,
    }
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window per-client rate limiter, default 100 requests / 60 s.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, RateWindow>>,
    max_per_window: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_per_window,
            window,
        }
    }

    fn check(&self, key: &str) -> Result<(), u64> {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| RateWindow {
            window_start: Instant::now(),
            count: 0,
        });
        if entry.window_start.elapsed() >= self.window {
            entry.window_start = Instant::now();
            entry.count = 0;
        }
        if entry.count >= self.max_per_window {
            let retry_after = self.window.saturating_sub(entry.window_start.elapsed()).as_secs() + 1;
            return Err(retry_after);
        }
        entry.count += 1;
        Ok(())
    }
}

pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let key = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.0.client_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());

    if let Err(retry_after_secs) = state.rate_limiter.check(&key) {
        return Err(GatewayError::RateLimited { retry_after_secs });
    }
    Ok(next.run(req).await)
}
