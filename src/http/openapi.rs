//! OpenAPI document (served at `GET /v1/openapi.json`).

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "LakeSync Gateway API",
        version = "1.0.0",
        description = "Multi-tenant HLC-ordered sync gateway: push/pull/flush/action over HTTP and WebSocket."
    ),
    tags(
        (name = "sync", description = "Push, pull, and action endpoints"),
        (name = "admin", description = "Flush, schema, sync-rules, and connector administration"),
        (name = "meta", description = "Unauthenticated health, readiness, and metrics"),
    ),
    paths(
        super::handlers::push,
        super::handlers::pull,
        super::handlers::action,
        super::handlers::health,
        super::handlers::ready,
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    pub fn document() -> utoipa::openapi::OpenApi {
        Self::openapi()
    }
}
