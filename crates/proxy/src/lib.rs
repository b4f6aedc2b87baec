//! Storechat Proxy - Chat backend for the storechat widget.
//!
//! Validates each chat turn, forwards it to the automation webhook and
//! normalizes the webhook's answer into a [`ChatResponse`](storechat_core::ChatResponse).
//!
//! # Modules
//!
//! - [`config`] - Environment configuration
//! - [`pipeline`] - `validate_request`, `forward_to_webhook`, `parse_response`
//! - [`routes`] - `POST /api/chat` and health checks
//! - [`middleware`] - Request IDs and rate limiting
//! - [`error`] - Error to HTTP response mapping

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod state;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header, request::Parts},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultOnResponse, OnResponse, TraceLayer};
use tracing::Span;

use storechat_core::OriginPolicy;

pub use config::{ConfigError, ProxyConfig, WebhookConfig};
pub use error::AppError;
pub use state::AppState;

/// Largest accepted request body. Voice turns carry base64 audio.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Build the proxy router with its full middleware stack.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(state.config().allowed_origins.clone());

    Router::new()
        .merge(routes::health_routes())
        .nest("/api", routes::api_routes())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(
            middleware::request_id_middleware,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = tracing::field::Empty,
                        status = tracing::field::Empty,
                        latency_ms = tracing::field::Empty,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &Span| {
                        span.record("status", response.status().as_u16());
                        span.record(
                            "latency_ms",
                            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        );
                        DefaultOnResponse::default().on_response(response, latency, span);
                    },
                ),
        )
        .layer(cors)
        .with_state(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction())
}

/// CORS restricted to the configured origin allow-list.
fn cors_layer(policy: OriginPolicy) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| policy.is_allowed(origin, None))
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(middleware::REQUEST_ID_HEADER)])
}
