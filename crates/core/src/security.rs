//! Security policy for cross-origin bridge messages.
//!
//! Both ends of the bridge (host page and widget frame) validate inbound
//! messages with the same [`SecurityValidator`] and the same
//! [`OriginPolicy`], so there is exactly one allow-list to maintain.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. data is a JSON object
//! 2. `type` is present
//! 3. `type` is on the allow-list
//! 4. serialized size is within `max_message_size`
//! 5. origin is allowed
//! 6. origin is not rate limited
//!
//! Only accepted messages count toward the rate limit.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::clock::Clock;
use crate::types::{BridgeMessage, CartUpdates, MessageEvent, MessageType};

/// Largest integer a JavaScript number represents exactly.
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Largest quantity accepted for a single cart line.
pub const MAX_QUANTITY: u64 = 999;

// =============================================================================
// Configuration
// =============================================================================

/// Origins allowed to talk to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::new([
            "http://localhost:3000",
            "https://localhost:3000",
            "https://myshopify.com",
        ])
    }
}

impl OriginPolicy {
    /// Create a policy from explicit allow-list entries.
    #[must_use]
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Parse a comma separated list (as found in `ALLOWED_ORIGINS`).
    #[must_use]
    pub fn from_csv(value: &str) -> Self {
        Self::new(value.split(','))
    }

    /// Allow-list entries.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.allowed
    }

    /// Decide whether `origin` may talk to a context running on `own_origin`.
    ///
    /// An origin is allowed when it is the context's own origin, equals an
    /// allow-list entry, is a subdomain of an allow-listed host, or when both
    /// the origin and an entry refer to `localhost`.
    #[must_use]
    pub fn is_allowed(&self, origin: &str, own_origin: Option<&str>) -> bool {
        let origin = origin.trim_end_matches('/');
        if origin.is_empty() || origin == "null" {
            return false;
        }
        if own_origin.is_some_and(|own| own.trim_end_matches('/') == origin) {
            return true;
        }

        let hostname = Url::parse(origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase));

        self.allowed.iter().any(|entry| {
            if entry == origin {
                return true;
            }
            if let Some(hostname) = &hostname
                && let Some(allowed_host) = Url::parse(entry)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
                && hostname.ends_with(&format!(".{allowed_host}"))
            {
                return true;
            }
            origin.contains("localhost") && entry.contains("localhost")
        })
    }
}

/// Tunables for [`SecurityValidator`].
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Maximum serialized message size in bytes.
    pub max_message_size: usize,
    /// Accepted messages per origin per window.
    pub max_requests_per_minute: usize,
    /// Sliding window length.
    pub rate_limit_window: Duration,
    /// HTML-escape string leaves of accepted payloads.
    pub sanitize: bool,
    /// Allowed origins.
    pub origins: OriginPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024,
            max_requests_per_minute: 60,
            rate_limit_window: Duration::from_secs(60),
            sanitize: true,
            origins: OriginPolicy::default(),
        }
    }
}

// =============================================================================
// Validation results
// =============================================================================

/// Why a message was rejected. Never sent back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    NotAnObject,
    MissingType,
    UnknownType(String),
    TooLarge { size: usize, max: usize },
    OriginNotAllowed(String),
    RateLimited(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("message data must be a non-null object"),
            Self::MissingType => f.write_str("message type is missing"),
            Self::UnknownType(t) => write!(f, "message type {t} is not allowed"),
            Self::TooLarge { size, max } => {
                write!(f, "message size {size} exceeds limit of {max} bytes")
            }
            Self::OriginNotAllowed(o) => write!(f, "origin {o} is not allowed"),
            Self::RateLimited(o) => write!(f, "origin {o} is rate limited"),
        }
    }
}

/// Result of [`SecurityValidator::validate_message_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub reason: Option<RejectionReason>,
    pub sanitized_payload: Option<Value>,
}

impl ValidationOutcome {
    fn accepted(payload: Value) -> Self {
        Self {
            is_valid: true,
            reason: None,
            sanitized_payload: Some(payload),
        }
    }

    fn rejected(reason: RejectionReason) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
            sanitized_payload: None,
        }
    }

    /// Convert into a `Result`, decoding the accepted payload as a
    /// [`BridgeMessage`].
    ///
    /// # Errors
    ///
    /// Returns the rejection reason, or [`RejectionReason::NotAnObject`] when
    /// the accepted payload does not decode as an envelope.
    pub fn into_message(self) -> Result<BridgeMessage, RejectionReason> {
        match (self.is_valid, self.sanitized_payload, self.reason) {
            (true, Some(payload), _) => {
                serde_json::from_value(payload).map_err(|_| RejectionReason::NotAnObject)
            }
            (_, _, Some(reason)) => Err(reason),
            _ => Err(RejectionReason::NotAnObject),
        }
    }
}

/// Errors from the cart payload guards.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("invalid variant id: {0}")]
    InvalidVariantId(String),
    #[error("invalid quantity: {0} (must be an integer between 1 and {MAX_QUANTITY})")]
    InvalidQuantity(String),
    #[error("invalid cart updates: {0}")]
    InvalidUpdates(String),
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Sliding-window request log per origin.
///
/// Owned by one validator instance. Entries are pruned lazily when an origin
/// is checked.
#[derive(Debug)]
struct RateLimiter {
    max_requests: usize,
    window_ms: i64,
    hits: Mutex<HashMap<String, Vec<i64>>>,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn is_limited(&self, origin: &str, now_ms: i64) -> bool {
        let mut hits = self
            .hits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(log) = hits.get_mut(origin) else {
            return false;
        };
        log.retain(|&t| now_ms - t < self.window_ms);
        let limited = log.len() >= self.max_requests;
        if log.is_empty() {
            hits.remove(origin);
        }
        limited
    }

    fn record(&self, origin: &str, now_ms: i64) {
        self.hits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(origin.to_string())
            .or_default()
            .push(now_ms);
    }

    fn reset(&self) {
        self.hits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Validates inbound bridge messages for one execution context.
#[derive(Debug)]
pub struct SecurityValidator {
    config: SecurityConfig,
    own_origin: Option<String>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
}

impl SecurityValidator {
    /// Create a validator for a context running on `own_origin`.
    #[must_use]
    pub fn new(config: SecurityConfig, own_origin: Option<String>, clock: Arc<dyn Clock>) -> Self {
        let limiter = RateLimiter::new(config.max_requests_per_minute, config.rate_limit_window);
        Self {
            config,
            own_origin,
            clock,
            limiter,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Whether `origin` passes the origin policy for this context.
    #[must_use]
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.config
            .origins
            .is_allowed(origin, self.own_origin.as_deref())
    }

    /// Validate one inbound event.
    ///
    /// On acceptance the (optionally sanitized) data is returned and the
    /// request is counted against the origin's rate limit. Rejections have no
    /// side effects.
    pub fn validate_message_event(&self, event: &MessageEvent) -> ValidationOutcome {
        self.validate(event, true)
    }

    /// Validate a reply to a request this context sent itself.
    ///
    /// Same checks as [`Self::validate_message_event`] minus the rate limit:
    /// replies are bounded by our own requests. Nothing is recorded.
    pub fn validate_reply_event(&self, event: &MessageEvent) -> ValidationOutcome {
        self.validate(event, false)
    }

    fn validate(&self, event: &MessageEvent, rate_limited: bool) -> ValidationOutcome {
        let Value::Object(fields) = &event.data else {
            return ValidationOutcome::rejected(RejectionReason::NotAnObject);
        };

        match fields.get("type") {
            None | Some(Value::Null) => {
                return ValidationOutcome::rejected(RejectionReason::MissingType);
            }
            Some(Value::String(t)) if t.is_empty() => {
                return ValidationOutcome::rejected(RejectionReason::MissingType);
            }
            Some(Value::String(t)) => {
                if MessageType::parse(t).is_none() {
                    return ValidationOutcome::rejected(RejectionReason::UnknownType(t.clone()));
                }
            }
            Some(other) => {
                return ValidationOutcome::rejected(RejectionReason::UnknownType(
                    other.to_string(),
                ));
            }
        }

        let size = serde_json::to_string(&event.data).map_or(usize::MAX, |s| s.len());
        if size > self.config.max_message_size {
            return ValidationOutcome::rejected(RejectionReason::TooLarge {
                size,
                max: self.config.max_message_size,
            });
        }

        if !self.is_origin_allowed(&event.origin) {
            return ValidationOutcome::rejected(RejectionReason::OriginNotAllowed(
                event.origin.clone(),
            ));
        }

        let now = self.clock.now_ms();
        if rate_limited && self.limiter.is_limited(&event.origin, now) {
            return ValidationOutcome::rejected(RejectionReason::RateLimited(
                event.origin.clone(),
            ));
        }

        let payload = if self.config.sanitize {
            sanitize_value(event.data.clone())
        } else {
            event.data.clone()
        };
        if rate_limited {
            self.limiter.record(&event.origin, now);
        }

        ValidationOutcome::accepted(payload)
    }

    /// Forget all rate-limit history.
    pub fn reset_rate_limits(&self) {
        self.limiter.reset();
    }
}

// =============================================================================
// Sanitization and guards
// =============================================================================

/// HTML-escape every string leaf, recursing through arrays and objects.
#[must_use]
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(escape_html(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Read a positive integer from a JSON number or numeric string.
fn positive_integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f > 0.0 && *f <= MAX_SAFE_INTEGER as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
}

/// Validate a Shopify variant id: a positive integer below `MAX_SAFE_INTEGER`.
///
/// # Errors
///
/// Returns [`GuardError::InvalidVariantId`] otherwise.
pub fn validate_variant_id(value: &Value) -> Result<u64, GuardError> {
    positive_integer(value)
        .filter(|n| *n < MAX_SAFE_INTEGER)
        .ok_or_else(|| GuardError::InvalidVariantId(value.to_string()))
}

/// Validate a cart quantity: a positive integer no greater than 999.
///
/// # Errors
///
/// Returns [`GuardError::InvalidQuantity`] otherwise.
pub fn validate_quantity(value: &Value) -> Result<u32, GuardError> {
    positive_integer(value)
        .filter(|n| *n <= MAX_QUANTITY)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| GuardError::InvalidQuantity(value.to_string()))
}

/// Validate a `{ updates: { line: quantity } }` payload.
///
/// Quantities are 0 (remove the line) up to 999.
///
/// # Errors
///
/// Returns [`GuardError::InvalidUpdates`] when `updates` is missing or has an
/// empty key, or [`GuardError::InvalidQuantity`] for a bad quantity.
pub fn validate_cart_updates(payload: &Value) -> Result<CartUpdates, GuardError> {
    let Some(map) = payload.get("updates").and_then(Value::as_object) else {
        return Err(GuardError::InvalidUpdates(
            "updates must be an object of line to quantity".to_string(),
        ));
    };

    map.iter()
        .map(|(key, qty)| {
            if key.trim().is_empty() {
                return Err(GuardError::InvalidUpdates("empty line key".to_string()));
            }
            let qty = match qty {
                Value::Number(n) if n.as_u64() == Some(0) => 0,
                Value::String(s) if s.trim() == "0" => 0,
                other => validate_quantity(other)?,
            };
            Ok((key.clone(), qty))
        })
        .collect()
}
