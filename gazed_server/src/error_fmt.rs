//! Engine-error to HTTP mapping with stable error-code strings.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gazed_core::EngineError;
use serde_json::json;

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SessionAlreadyRunning(_) | EngineError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            EngineError::InvalidSample(_) | EngineError::CalibrationFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::PersistenceFailed(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // No internals leak past the code string.
            tracing::error!(error = %self.0, "internal error");
            return (
                status,
                Json(json!({"status": "error", "error": self.0.code()})),
            )
                .into_response();
        }
        (
            status,
            Json(json!({
                "status": "error",
                "error": self.0.code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
