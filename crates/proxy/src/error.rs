//! Unified error handling with Sentry integration.
//!
//! Every pipeline stage returns `Result<T, AppError>`. Converting an
//! `AppError` into a response captures server errors to Sentry and replies
//! with `{ "error": "<message>" }`, never with internal detail.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Application-level error type for the proxy.
#[derive(Debug, Error)]
pub enum AppError {
    /// Body was not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Body was JSON but not a valid chat request.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The webhook rejected our credentials.
    #[error("Webhook returned 401")]
    WebhookUnauthorized,

    /// The webhook returned another non-success status.
    #[error("Webhook returned {0}")]
    WebhookStatus(reqwest::StatusCode),

    /// The webhook did not answer in time.
    #[error("Webhook timed out")]
    Timeout,

    /// The webhook could not be reached.
    #[error("Webhook network error: {0}")]
    Network(String),

    /// The webhook answered with something we cannot normalize.
    #[error("Invalid webhook response: {0}")]
    InvalidResponse(String),
}

impl AppError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::WebhookUnauthorized => StatusCode::UNAUTHORIZED,
            Self::WebhookStatus(_) | Self::Network(_) | Self::InvalidResponse(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message returned to the client.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidJson(_) => "Invalid JSON in request body".to_string(),
            Self::Validation(reason) => reason.clone(),
            Self::WebhookUnauthorized => "Authentication failed".to_string(),
            Self::WebhookStatus(_) => "Chatbot service error".to_string(),
            Self::Timeout => "Request timeout".to_string(),
            Self::Network(_) => "Network error occurred".to_string(),
            Self::InvalidResponse(_) => "Invalid response from chatbot service".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Capture server errors to Sentry
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;
