//! HTTP error responses.
//!
//! The publish API answers with `{"error": "...", "code": "..."}` bodies;
//! the live-connection endpoint answers with plain text since browsers only
//! surface the status of a failed upgrade.

use air_core::{AccessError, AdmitError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Publish API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Only POST allowed")]
    MethodNotAllowed,

    #[error("Authorization token required")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Invalid or inactive room")]
    RoomNotFound,

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Internal server error")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
}

impl ApiError {
    /// Status and classification code.
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED"),
            ApiError::MissingToken => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN"),
            ApiError::InvalidJson => (StatusCode::BAD_REQUEST, "INVALID_JSON"),
            ApiError::RoomNotFound => (StatusCode::NOT_FOUND, "ROOM_NOT_FOUND"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::TokenNotFound | AccessError::TokenExpired => ApiError::InvalidToken,
            AccessError::RoomNotFound(_) => ApiError::RoomNotFound,
            AccessError::Store(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        match &self {
            ApiError::Internal(detail) => {
                tracing::error!(code, status = status.as_u16(), error = %detail, "API error");
            }
            _ => tracing::debug!(code, status = status.as_u16(), error = %self, "API error"),
        }

        let body = ErrorBody {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

/// Live-connection rejections, answered before the upgrade.
#[derive(Debug)]
pub struct ConnectError(pub AdmitError);

impl From<AdmitError> for ConnectError {
    fn from(e: AdmitError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ConnectError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AdmitError::MissingChannel | AdmitError::MissingIdentity => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            AdmitError::OriginNotAllowed => (StatusCode::FORBIDDEN, self.0.to_string()),
            AdmitError::Access(AccessError::Store(e)) => {
                tracing::error!(error = %e, "Store unavailable during connect");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AdmitError::Access(_) => (StatusCode::NOT_FOUND, "Invalid or inactive room".to_string()),
        };
        (status, message).into_response()
    }
}
