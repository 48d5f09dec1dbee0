//! API error type with IntoResponse
//!
//! Unavailability is reported as 503 with the retriable hint so callers can
//! tell "try again shortly" from "writes are frozen". Everything else is a
//! logged 500 with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use dbroute_core::DbError;

#[derive(Debug)]
pub enum ApiError {
    /// No backend, degraded read-only, or primary required (503)
    ServiceUnavailable { message: String, retriable: bool },

    /// Database error (500, logged)
    Database(DbError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::ServiceUnavailable { message, retriable } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "service_unavailable",
                    "message": message,
                    "retriable": retriable
                }),
            ),
            Self::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": "internal_error",
                        "message": "an internal error occurred"
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ServiceUnavailable { reason, retriable } => Self::ServiceUnavailable {
                message: reason,
                retriable,
            },
            other => Self::Database(other),
        }
    }
}
