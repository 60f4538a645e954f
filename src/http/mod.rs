//! HTTP pipeline (C11): route table and the ordered middleware chain.

pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod state;

use self::state::SharedState;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    middleware::from_fn,
    middleware::from_fn_with_state,
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Builds the full router: unauthenticated static routes, then the
/// authenticated `/v1/sync` and `/v1/admin` surfaces, wrapped in the
/// documented middleware order (outermost first): security headers → CORS
/// → drain guard → request timeout → in-flight counter → auth → rate limit.
pub fn build_router(state: SharedState) -> Router {
    let sync_routes = Router::new()
        .route("/push", post(handlers::push))
        .route("/pull", get(handlers::pull))
        .route("/action", post(handlers::action))
        .route("/actions", get(handlers::actions))
        .route("/ws", get(handlers::ws_upgrade));

    let admin_routes = Router::new()
        .route("/flush/{gw}", post(handlers::flush))
        .route("/schema/{gw}", post(handlers::save_schema))
        .route("/sync-rules/{gw}", post(handlers::save_sync_rules))
        .route(
            "/connectors/{gw}",
            post(handlers::register_connector).get(handlers::list_connectors),
        )
        .route("/connectors/{gw}/{name}", delete(handlers::unregister_connector))
        .route("/metrics/{gw}", get(handlers::admin_metrics));

    let authenticated = Router::new()
        .nest("/v1/sync/{gw}", sync_routes)
        .nest("/v1/admin", admin_routes)
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let static_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/openapi.json", get(handlers::openapi_json))
        .route("/v1/connectors/types", get(handlers::connector_types))
        .route("/sync/{gw}/push", post(legacy_redirect))
        .route("/sync/{gw}/pull", get(legacy_redirect))
        .route("/sync/{gw}/action", post(legacy_redirect));

    let cors = cors_layer(&state.config.cors_allowed_origins);
    let request_timeout = state.config.request_timeout;

    Router::new()
        .merge(authenticated)
        .merge(static_routes)
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(middleware::security_headers_middleware))
                .layer(from_fn(middleware::request_logger_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(from_fn_with_state(state.clone(), middleware::drain_guard_middleware))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(from_fn_with_state(state.clone(), middleware::in_flight_middleware)),
        )
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let parsed: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Unversioned legacy routes respond with a permanent redirect to the `/v1`
/// surface and a `Sunset` header advertising their retirement.
async fn legacy_redirect(State(_state): State<SharedState>, uri: Uri) -> Response {
    let target = format!("/v1{}", uri.path());
    let mut response = Redirect::permanent(&target).into_response();
    response.headers_mut().insert(
        header::HeaderName::from_static("sunset"),
        header::HeaderValue::from_static("Wed, 31 Dec 2026 00:00:00 GMT"),
    );
    response
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
