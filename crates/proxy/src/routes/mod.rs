//! HTTP route handlers for the proxy.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health        - Liveness check
//! GET  /health/ready  - Readiness check
//! POST /api/chat      - Forward a chat turn to the webhook
//! ```

pub mod chat;

use axum::{
    Router,
    routing::{get, post},
};

use crate::middleware::chat_rate_limiter;
use crate::state::AppState;

/// Create the API routes router. Rate limited per client IP.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chat", post(chat::chat))
        .layer(chat_rate_limiter())
}

/// Create the health check router.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// The proxy holds no connections of its own, so it is ready once the
/// configuration has loaded.
async fn readiness() -> &'static str {
    "ok"
}
