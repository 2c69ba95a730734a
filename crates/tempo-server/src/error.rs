use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use tempo_core::error::AppError;
use tempo_core::models::ScrapeKind;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError {
    pub error: AppError,
    /// The figure the failed request asked for, if any.
    pub kind: Option<ScrapeKind>,
}

impl ApiError {
    pub fn scrape(kind: ScrapeKind, error: AppError) -> Self {
        Self {
            error,
            kind: Some(kind),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        Self { error, kind: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match (&self.error, self.kind) {
            (AppError::InvalidIdentifier(_), _) => {
                (StatusCode::BAD_REQUEST, "invalid_identifier".to_string())
            }
            (AppError::QueueFull { .. }, _) => {
                (StatusCode::SERVICE_UNAVAILABLE, "queue_full".to_string())
            }
            (_, Some(kind)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to scrape {}", kind.label()),
            ),
            (_, None) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::warn!(error = %self.error.sanitized(), "Request failed");
        }

        let body = ErrorResponse {
            error: error_type,
            message: self.error.sanitized(),
        };

        (status, axum::Json(body)).into_response()
    }
}
