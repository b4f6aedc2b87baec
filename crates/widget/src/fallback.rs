//! Degraded-mode cart operations.
//!
//! When a bridge round-trip fails the caller hands the operation to
//! [`FallbackHandler::handle_fallback`], which talks to the store's cart
//! endpoints directly and keeps a short-lived copy of the last cart it saw.
//! The handler never loops on its own; it tells the caller what to do next
//! through [`FallbackOutcome`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use storechat_bridge::{CartApiClient, CartError};
use storechat_core::{
    CartResponse, Clock, GuardError, MessageType, validate_cart_updates, validate_quantity,
    validate_variant_id,
};

use crate::broker::BridgeError;
use crate::storage::Storage;

/// Storage key of the cached cart.
pub const CART_CACHE_KEY: &str = "storechat_cart_cache";

/// Errors that end a fallback sequence.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback disabled; bridge error: {0}")]
    Disabled(#[source] BridgeError),

    #[error("no fallback for {0}")]
    Unsupported(MessageType),

    #[error(transparent)]
    InvalidPayload(#[from] GuardError),

    #[error("fallback failed after {attempts} attempts: {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: CartError,
    },
}

/// Fallback configuration.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub enable_fallback: bool,
    /// Attempt number at which a failure becomes terminal.
    pub max_retry_attempts: u32,
    /// How long a cached cart may be served.
    pub cache_ttl: Duration,
    /// Minimum gap between bridge health checks while degraded.
    pub probe_interval: Duration,
    /// How long a health check waits for the bridge.
    pub probe_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enable_fallback: true,
            max_retry_attempts: 3,
            cache_ttl: Duration::from_secs(5 * 60),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// One fallback invocation.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub operation: MessageType,
    pub payload: Value,
    /// Why the bridge path failed.
    pub error: BridgeError,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What the caller should do after a fallback attempt.
#[derive(Debug)]
pub enum FallbackOutcome {
    /// The operation succeeded; the value has the same shape as the bridge
    /// response data.
    Completed(Value),
    /// The attempt failed but another may succeed.
    Retry { original: BridgeError },
    /// Give up.
    Terminal { error: FallbackError },
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedCart {
    cart: CartResponse,
    cached_at: i64,
}

enum AttemptError {
    Cart(CartError),
    Fatal(FallbackError),
}

impl From<CartError> for AttemptError {
    fn from(e: CartError) -> Self {
        Self::Cart(e)
    }
}

impl From<GuardError> for AttemptError {
    fn from(e: GuardError) -> Self {
        Self::Fatal(e.into())
    }
}

/// Performs cart operations without the bridge.
pub struct FallbackHandler {
    client: CartApiClient,
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    config: FallbackConfig,
    active: AtomicBool,
    last_probe_ms: AtomicI64,
}

impl FallbackHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(
        client: CartApiClient,
        storage: Option<Arc<dyn Storage>>,
        clock: Arc<dyn Clock>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            client,
            storage,
            clock,
            config,
            active: AtomicBool::new(false),
            last_probe_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Whether the widget has switched to degraded mode.
    ///
    /// Set once a direct attempt was made because the bridge did not answer.
    /// A bridge that answers with a failure never sets it.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Return to normal mode once the bridge is healthy again.
    pub fn reset(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            info!("Bridge reachable again; leaving cart fallback");
        }
    }

    /// Whether a bridge health check is due, recording it as started if so.
    #[must_use]
    pub fn begin_probe(&self) -> bool {
        let now = self.clock.now_ms();
        let interval = i64::try_from(self.config.probe_interval.as_millis()).unwrap_or(i64::MAX);
        let last = self.last_probe_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < interval {
            return false;
        }
        self.last_probe_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempt `request.operation` directly against the store.
    #[instrument(skip(self, request), fields(operation = %request.operation, attempt = request.attempt))]
    pub async fn handle_fallback(&self, request: FallbackRequest) -> FallbackOutcome {
        if !self.config.enable_fallback {
            return FallbackOutcome::Terminal {
                error: FallbackError::Disabled(request.error),
            };
        }

        info!(bridge_error = %request.error, "Using cart fallback");

        let result = self.perform(request.operation, &request.payload).await;
        if request.error.is_unreachable() && !matches!(result, Err(AttemptError::Fatal(_))) {
            self.active.store(true, Ordering::Relaxed);
        }

        match result {
            Ok(value) => FallbackOutcome::Completed(value),
            Err(AttemptError::Fatal(error)) => FallbackOutcome::Terminal { error },
            Err(AttemptError::Cart(e)) => {
                if request.operation == MessageType::CartGet
                    && let Some(cart) = self.cached_cart()
                {
                    debug!(error = %e, "Serving cached cart");
                    return FallbackOutcome::Completed(json!({ "cart": cart, "cached": true }));
                }

                if request.attempt < self.config.max_retry_attempts {
                    warn!(error = %e, "Fallback attempt failed");
                    FallbackOutcome::Retry {
                        original: request.error,
                    }
                } else {
                    FallbackOutcome::Terminal {
                        error: FallbackError::Failed {
                            attempts: request.attempt,
                            source: e,
                        },
                    }
                }
            }
        }
    }

    async fn perform(&self, operation: MessageType, payload: &Value) -> Result<Value, AttemptError> {
        match operation {
            MessageType::CartAddItem => {
                let variant_id =
                    validate_variant_id(payload.get("variantId").unwrap_or(&Value::Null))?;
                let quantity = match payload.get("quantity") {
                    None | Some(Value::Null) => 1,
                    Some(q) => validate_quantity(q)?,
                };
                let cart = self.client.add_to_cart(variant_id, quantity).await?;
                self.cache_cart(&cart);
                Ok(json!({
                    "cart": cart,
                    "added": { "variantId": variant_id, "quantity": quantity },
                }))
            }
            MessageType::CartGet => {
                let cart = self.client.get_cart().await?;
                self.cache_cart(&cart);
                Ok(json!({ "cart": cart }))
            }
            MessageType::CartUpdate => {
                let updates = validate_cart_updates(payload)?;
                let cart = self.client.update_cart(&updates).await?;
                self.cache_cart(&cart);
                Ok(json!({ "cart": cart }))
            }
            MessageType::CartClear => {
                let cart = self.client.clear_cart().await?;
                self.cache_cart(&cart);
                Ok(json!({ "cart": cart }))
            }
            MessageType::NavigateToCart => Ok(json!({ "url": self.client.url("/cart")?.as_str() })),
            MessageType::NavigateToCheckout => {
                Ok(json!({ "url": self.client.url("/checkout")?.as_str() }))
            }
            other => Err(AttemptError::Fatal(FallbackError::Unsupported(other))),
        }
    }

    // =========================================================================
    // Cache
    // =========================================================================

    /// Cached cart, if one is stored and still fresh.
    #[must_use]
    pub fn cached_cart(&self) -> Option<CartResponse> {
        let storage = self.storage.as_ref()?;
        let raw = storage.get(CART_CACHE_KEY).ok().flatten()?;
        let cached: CachedCart = serde_json::from_str(&raw).ok()?;
        let ttl = i64::try_from(self.config.cache_ttl.as_millis()).unwrap_or(i64::MAX);
        if self.clock.now_ms().saturating_sub(cached.cached_at) > ttl {
            debug!("Cached cart expired");
            return None;
        }
        Some(cached.cart)
    }

    fn cache_cart(&self, cart: &CartResponse) {
        let Some(storage) = &self.storage else {
            return;
        };
        let cached = CachedCart {
            cart: cart.clone(),
            cached_at: self.clock.now_ms(),
        };
        let result = serde_json::to_string(&cached)
            .map_err(|e| e.to_string())
            .and_then(|raw| storage.set(CART_CACHE_KEY, &raw).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(error = %e, "Failed to cache cart");
        }
    }

    /// Drop the cached cart.
    pub fn clear_cache(&self) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.remove(CART_CACHE_KEY)
        {
            warn!(error = %e, "Failed to clear cart cache");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use storechat_bridge::CartClientConfig;
    use storechat_core::ManualClock;

    fn bridge_timeout() -> BridgeError {
        BridgeError::Timeout {
            kind: MessageType::CartGet,
            timeout: Duration::from_secs(10),
        }
    }

    fn handler(config: FallbackConfig) -> (FallbackHandler, Arc<MemoryStorage>, Arc<ManualClock>) {
        let mut cart = CartClientConfig::new("http://127.0.0.1:9");
        cart.max_retries = 0;
        cart.timeout = Duration::from_millis(200);
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let handler = FallbackHandler::new(
            CartApiClient::new(cart).unwrap(),
            Some(storage.clone()),
            clock.clone(),
            config,
        );
        (handler, storage, clock)
    }

    fn request(operation: MessageType, payload: Value, attempt: u32) -> FallbackRequest {
        FallbackRequest {
            operation,
            payload,
            error: bridge_timeout(),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_disabled_fallback_surfaces_bridge_error() {
        let (handler, _, _) = handler(FallbackConfig {
            enable_fallback: false,
            ..FallbackConfig::default()
        });
        let outcome = handler
            .handle_fallback(request(MessageType::CartGet, Value::Null, 1))
            .await;
        assert!(matches!(
            outcome,
            FallbackOutcome::Terminal {
                error: FallbackError::Disabled(BridgeError::Timeout { .. })
            }
        ));
        assert!(!handler.is_active());
    }

    #[tokio::test]
    async fn test_network_failure_retries_then_terminates() {
        let (handler, _, _) = handler(FallbackConfig::default());

        let outcome = handler
            .handle_fallback(request(MessageType::CartClear, Value::Null, 1))
            .await;
        assert!(matches!(outcome, FallbackOutcome::Retry { .. }));
        assert!(handler.is_active());

        let outcome = handler
            .handle_fallback(request(MessageType::CartClear, Value::Null, 3))
            .await;
        assert!(matches!(
            outcome,
            FallbackOutcome::Terminal {
                error: FallbackError::Failed { attempts: 3, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_cart_get_serves_fresh_cache() {
        let (handler, _, clock) = handler(FallbackConfig::default());
        handler.cache_cart(&CartResponse::empty("USD"));

        let outcome = handler
            .handle_fallback(request(MessageType::CartGet, Value::Null, 3))
            .await;
        match outcome {
            FallbackOutcome::Completed(value) => {
                assert_eq!(value["cached"], true);
                assert_eq!(value["cart"]["currency"], "USD");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert!(handler.cached_cart().is_none());
        let outcome = handler
            .handle_fallback(request(MessageType::CartGet, Value::Null, 3))
            .await;
        assert!(matches!(outcome, FallbackOutcome::Terminal { .. }));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_terminal_without_network() {
        let (handler, _, _) = handler(FallbackConfig::default());
        let outcome = handler
            .handle_fallback(request(
                MessageType::CartAddItem,
                json!({ "variantId": "nope" }),
                1,
            ))
            .await;
        assert!(matches!(
            outcome,
            FallbackOutcome::Terminal {
                error: FallbackError::InvalidPayload(GuardError::InvalidVariantId(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_bridge_rejection_does_not_latch() {
        let (handler, _, _) = handler(FallbackConfig::default());
        let rejected = BridgeError::Rejected {
            kind: MessageType::CartClear,
            message: "sold out".to_string(),
            code: "CART_REJECTED".to_string(),
        };
        let outcome = handler
            .handle_fallback(FallbackRequest {
                operation: MessageType::CartClear,
                payload: Value::Null,
                error: rejected,
                attempt: 1,
            })
            .await;
        assert!(matches!(outcome, FallbackOutcome::Retry { .. }));
        assert!(!handler.is_active());
    }

    #[tokio::test]
    async fn test_guard_failure_does_not_latch() {
        let (handler, _, _) = handler(FallbackConfig::default());
        handler
            .handle_fallback(request(MessageType::CartAddItem, json!({ "variantId": -4 }), 1))
            .await;
        assert!(!handler.is_active());
    }

    #[test]
    fn test_probe_is_rate_limited() {
        let (handler, _, clock) = handler(FallbackConfig::default());
        assert!(handler.begin_probe());
        assert!(!handler.begin_probe());
        clock.advance(Duration::from_secs(29));
        assert!(!handler.begin_probe());
        clock.advance(Duration::from_secs(1));
        assert!(handler.begin_probe());
    }

    #[tokio::test]
    async fn test_navigation_returns_url() {
        let (handler, _, _) = handler(FallbackConfig::default());
        let outcome = handler
            .handle_fallback(request(MessageType::NavigateToCheckout, Value::Null, 1))
            .await;
        match outcome {
            FallbackOutcome::Completed(value) => {
                assert_eq!(value["url"], "http://127.0.0.1:9/checkout");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let (handler, _, _) = handler(FallbackConfig::default());
        let outcome = handler
            .handle_fallback(request(MessageType::GetStoreInfo, Value::Null, 1))
            .await;
        assert!(matches!(
            outcome,
            FallbackOutcome::Terminal {
                error: FallbackError::Unsupported(MessageType::GetStoreInfo)
            }
        ));
    }
}
