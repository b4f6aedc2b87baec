//! HTTP middleware stack for the proxy.
//!
//! # Middleware Order (outermost first)
//!
//! 1. Sentry layers (capture errors)
//! 2. CORS (origin allow-list)
//! 3. `TraceLayer` (request tracing)
//! 4. Request ID (add unique ID to each request)
//! 5. Rate limiting (governor, `/api/chat` only)

pub mod rate_limit;
pub mod request_id;

pub use rate_limit::{ClientIpKeyExtractor, RateLimiterLayer, chat_rate_limiter};
pub use request_id::{REQUEST_ID_HEADER, request_id_middleware};
