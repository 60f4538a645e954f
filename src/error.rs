//! Crate-wide error taxonomy and its mapping onto the HTTP error envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// The five error classes from the design doc: validation, auth, backpressure,
/// internal, and background. Background errors never reach this type; they
/// are logged and swallowed at the task boundary instead.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("payload too large")]
    TooLarge,

    #[error("server is draining")]
    Draining,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("action not supported: {0}")]
    ActionNotSupported(String),

    #[error("clock overflow: more than 65536 ticks in one millisecond")]
    ClockOverflow,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Unauthenticated | GatewayError::Forbidden(_) => "AUTH_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::TooLarge => "PAYLOAD_TOO_LARGE",
            GatewayError::Draining => "DRAINING",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
            GatewayError::ActionNotSupported(_) => "ACTION_NOT_SUPPORTED",
            GatewayError::ClockOverflow => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) | GatewayError::ClockOverflow => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::ActionNotSupported(_) => StatusCode::OK,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: &'static str,
    pub request_id: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorEnvelope {
                error: self.to_string(),
                code: self.code(),
                request_id,
            }),
        )
            .into_response();

        if let GatewayError::RateLimited { retry_after_secs } = &self {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                retry_after_secs.to_string().parse().unwrap(),
            );
        }

        response
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::BadRequest(e.to_string())
    }
}
