//! Uniform API error envelope.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::{IntoResponse, Json};
use serde_json::{json, Value};

/// Typed rejection rendered as `{success: false, error: {...}}`.
#[derive(Debug)]
pub struct ApiRejection {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiRejection {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiRejection {
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl From<AppError> for ApiRejection {
    fn from(error: AppError) -> Self {
        let (status, code) = match error.category {
            ErrorCategory::InvalidUrl => (StatusCode::BAD_REQUEST, "INVALID_URL"),
            ErrorCategory::UnsupportedFormat => (StatusCode::BAD_REQUEST, "UNSUPPORTED_FORMAT"),
            ErrorCategory::OversizedDocument => (StatusCode::BAD_REQUEST, "INVALID_DOCUMENT"),
            ErrorCategory::ValidationError
            | ErrorCategory::SchemaMismatch
            | ErrorCategory::InvalidWorkflowDefinition => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            ErrorCategory::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ErrorCategory::TimeoutError => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT"),
            ErrorCategory::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ErrorCategory::FetchError | ErrorCategory::UpstreamServerError => {
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!("api error: {}", error);
        }
        ApiRejection::new(status, code, error.message)
    }
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response<Body> {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        let mut response = Json(json!({
            "success": false,
            "error": error,
        }))
        .into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// `{success: true, data}` wrapper for API payloads.
pub fn success<T: serde::Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data,
    }))
}
