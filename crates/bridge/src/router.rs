//! Bridge message router.
//!
//! Runs on the merchant's storefront origin. Each inbound message moves
//! through `received → validated → dispatched → responded`:
//!
//! - messages failing validation are dropped without a reply, so an
//!   unauthorized sender learns nothing about the configuration
//! - accepted requests are dispatched by type to a handler
//! - handler errors become `{ success: false, error: { message, code } }`
//! - every reply carries the request's `messageId`
//!
//! The router does not time requests out; the requester owns that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use storechat_core::{
    BridgeMessage, BridgeResponse, Clock, GuardError, MessageEvent, MessageType,
    SecurityConfig, SecurityValidator, validate_cart_updates, validate_quantity,
    validate_variant_id,
};

use crate::cart::{CartApiClient, CartError};
use crate::frame::{FrameId, FrameSink, HostPage};

/// Crate version reported by `BRIDGE_STATUS_REQUEST`.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised by message handlers. Converted into failure responses.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Cart(#[from] CartError),

    #[error("message type {0} is not handled by the bridge")]
    Unsupported(MessageType),
}

impl RouterError {
    /// Stable error code for the failure response.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Guard(_) => "INVALID_PAYLOAD",
            Self::Cart(e) => e.code(),
            Self::Unsupported(_) => "UNSUPPORTED_MESSAGE",
        }
    }
}

/// Store details exposed through `GET_STORE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub shop: String,
    pub currency: String,
    pub locale: String,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Origin of the host page the router runs on.
    pub origin: String,
    pub store: StoreInfo,
    pub security: SecurityConfig,
    /// Delay before broadcasting `CART_UPDATED` after cart activity.
    pub settle_delay: Duration,
}

impl BridgeConfig {
    /// Defaults for a storefront at `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>, store: StoreInfo) -> Self {
        Self {
            origin: origin.into(),
            store,
            security: SecurityConfig::default(),
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Lifecycle state reported by a chatbot frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameState {
    pub ready: bool,
    pub open: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

struct RegisteredFrame {
    origin: String,
    sink: Arc<dyn FrameSink>,
}

/// Routes validated bridge messages to cart and host-page handlers.
///
/// Cheap to clone; all clones share one validator, one cart client and one
/// frame registry.
#[derive(Clone)]
pub struct BridgeRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    config: BridgeConfig,
    validator: SecurityValidator,
    cart: CartApiClient,
    host: Arc<dyn HostPage>,
    clock: Arc<dyn Clock>,
    frames: Mutex<HashMap<FrameId, RegisteredFrame>>,
    frame_states: Mutex<HashMap<String, FrameState>>,
    next_frame: AtomicU64,
}

impl BridgeRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        cart: CartApiClient,
        host: Arc<dyn HostPage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let validator = SecurityValidator::new(
            config.security.clone(),
            Some(config.origin.clone()),
            clock.clone(),
        );

        Self {
            inner: Arc::new(RouterInner {
                config,
                validator,
                cart,
                host,
                clock,
                frames: Mutex::new(HashMap::new()),
                frame_states: Mutex::new(HashMap::new()),
                next_frame: AtomicU64::new(1),
            }),
        }
    }

    /// Router configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Cart client used by the handlers.
    #[must_use]
    pub fn cart(&self) -> &CartApiClient {
        &self.inner.cart
    }

    /// Handle one inbound message.
    ///
    /// Returns the response that was posted back to `source`, or `None` when
    /// the message was dropped or needed no reply.
    #[instrument(skip_all, fields(origin = %event.origin))]
    pub async fn handle_event(
        &self,
        event: MessageEvent,
        source: &dyn FrameSink,
    ) -> Option<BridgeResponse> {
        let outcome = self.inner.validator.validate_message_event(&event);
        let message = match outcome.into_message() {
            Ok(message) => message,
            Err(reason) => {
                debug!(%reason, "Dropping bridge message");
                return None;
            }
        };

        let kind = message.kind;
        let message_id = message.message_id.clone();
        debug!(%kind, message_id = ?message_id, "Dispatching bridge message");

        let result = match kind {
            MessageType::ChatbotReady
            | MessageType::ChatbotStateChanged
            | MessageType::ChatbotResize => {
                self.record_frame_state(&event.origin, kind, &message.payload);
                if message_id.is_none() {
                    return None;
                }
                Ok(json!({ "acknowledged": true }))
            }
            _ => self.dispatch(message).await,
        };

        let timestamp = self.inner.clock.now_ms();
        let response = match result {
            Ok(data) => BridgeResponse::ok(kind, data, message_id, timestamp),
            Err(e) => {
                warn!(error = %e, %kind, "Bridge handler failed");
                BridgeResponse::failure(kind, e.to_string(), e.code(), message_id, timestamp)
            }
        };

        match serde_json::to_value(&response) {
            Ok(value) => source.post_message(value, &event.origin),
            Err(e) => warn!(error = %e, "Failed to serialize bridge response"),
        }
        Some(response)
    }

    async fn dispatch(&self, message: BridgeMessage) -> Result<Value, RouterError> {
        let payload = &message.payload;
        match message.kind {
            MessageType::CartAddItem => self.add_to_cart(payload).await,
            MessageType::CartGet => {
                let cart = self.inner.cart.get_cart().await?;
                Ok(json!({ "cart": cart }))
            }
            MessageType::CartUpdate => {
                let updates = validate_cart_updates(payload)?;
                let cart = self.inner.cart.update_cart(&updates).await?;
                drop(self.schedule_cart_broadcast());
                Ok(json!({ "cart": cart }))
            }
            MessageType::CartClear => {
                let cart = self.inner.cart.clear_cart().await?;
                drop(self.schedule_cart_broadcast());
                Ok(json!({ "cart": cart }))
            }
            MessageType::NavigateToCart => self.navigate("/cart"),
            MessageType::NavigateToCheckout => self.navigate("/checkout"),
            MessageType::GetStoreInfo => {
                let store = &self.inner.config.store;
                Ok(json!({
                    "shop": store.shop,
                    "currency": store.currency,
                    "locale": store.locale,
                    "origin": self.inner.config.origin,
                }))
            }
            MessageType::BridgeStatusRequest => Ok(json!({
                "ready": true,
                "version": BRIDGE_VERSION,
                "origin": self.inner.config.origin,
                "frames": self.frame_count(),
            })),
            other => Err(RouterError::Unsupported(other)),
        }
    }

    async fn add_to_cart(&self, payload: &Value) -> Result<Value, RouterError> {
        let variant_id = validate_variant_id(payload.get("variantId").unwrap_or(&Value::Null))?;
        let quantity = match payload.get("quantity") {
            None | Some(Value::Null) => 1,
            Some(q) => validate_quantity(q)?,
        };

        info!(variant_id, quantity, "Adding item to cart");
        let cart = self.inner.cart.add_to_cart(variant_id, quantity).await?;
        drop(self.schedule_cart_broadcast());

        Ok(json!({
            "cart": cart,
            "added": { "variantId": variant_id, "quantity": quantity },
        }))
    }

    fn navigate(&self, path: &str) -> Result<Value, RouterError> {
        let url = self.inner.cart.url(path)?;
        self.inner.host.navigate(url.as_str());
        Ok(json!({ "url": url.as_str() }))
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Register a chatbot frame for broadcasts.
    pub fn register_frame(&self, origin: impl Into<String>, sink: Arc<dyn FrameSink>) -> FrameId {
        let id = FrameId::new(self.inner.next_frame.fetch_add(1, Ordering::Relaxed));
        self.frames().insert(
            id,
            RegisteredFrame {
                origin: origin.into(),
                sink,
            },
        );
        id
    }

    /// Stop broadcasting to a frame.
    pub fn unregister_frame(&self, id: FrameId) -> bool {
        self.frames().remove(&id).is_some()
    }

    /// Number of registered frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames().len()
    }

    /// Post a message to every registered frame.
    pub fn broadcast(&self, message: &Value) -> usize {
        let frames = self.frames();
        for frame in frames.values() {
            frame.sink.post_message(message.clone(), &frame.origin);
        }
        frames.len()
    }

    /// Ask every frame to open, close, toggle, or clear its history.
    pub fn send_control(&self, kind: MessageType) -> usize {
        match serde_json::to_value(BridgeMessage::notification(kind, Value::Null)) {
            Ok(value) => self.broadcast(&value),
            Err(_) => 0,
        }
    }

    /// Last lifecycle state reported by frames on `origin`.
    #[must_use]
    pub fn frame_state(&self, origin: &str) -> Option<FrameState> {
        self.inner
            .frame_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned()
    }

    fn record_frame_state(&self, origin: &str, kind: MessageType, payload: &Value) {
        let mut states = self
            .inner
            .frame_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(origin.to_string()).or_default();
        match kind {
            MessageType::ChatbotReady => state.ready = true,
            MessageType::ChatbotStateChanged => {
                if let Some(open) = payload.get("isOpen").and_then(Value::as_bool) {
                    state.open = open;
                }
            }
            MessageType::ChatbotResize => {
                let dimension = |key: &str| {
                    payload
                        .get(key)
                        .and_then(Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                };
                state.width = dimension("width").or(state.width);
                state.height = dimension("height").or(state.height);
            }
            _ => {}
        }
    }

    fn frames(&self) -> std::sync::MutexGuard<'_, HashMap<FrameId, RegisteredFrame>> {
        self.inner
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Cart activity
    // =========================================================================

    /// Report an HTTP request made by the host page.
    ///
    /// Cart requests (URLs containing `/cart/` or `cart.js`) schedule a
    /// `CART_UPDATED` broadcast once the store has settled, so frames stay in
    /// sync with changes made outside the bridge (theme buttons, other apps).
    pub fn observe_request(&self, url: &str) -> Option<tokio::task::JoinHandle<()>> {
        if is_cart_request(url) {
            Some(self.schedule_cart_broadcast())
        } else {
            None
        }
    }

    fn schedule_cart_broadcast(&self) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(router.inner.config.settle_delay).await;
            if router.frame_count() == 0 {
                return;
            }
            match router.inner.cart.get_cart().await {
                Ok(cart) => {
                    let update = BridgeResponse::ok(
                        MessageType::CartUpdated,
                        json!({ "cart": cart }),
                        None,
                        router.inner.clock.now_ms(),
                    );
                    if let Ok(value) = serde_json::to_value(&update) {
                        let sent = router.broadcast(&value);
                        debug!(frames = sent, "Broadcast CART_UPDATED");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to refresh cart for CART_UPDATED"),
            }
        })
    }
}

/// Whether a request URL touches the cart.
#[must_use]
pub fn is_cart_request(url: &str) -> bool {
    url.contains("/cart/") || url.contains("cart.js")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cart::CartClientConfig;
    use crate::frame::RecordingSink;
    use storechat_core::{ManualClock, OriginPolicy};

    const SHOP: &str = "https://shop.example.com";
    const WIDGET: &str = "https://chat.storechat.app";

    struct NoopHost;

    impl HostPage for NoopHost {
        fn navigate(&self, _url: &str) {}
    }

    fn router() -> BridgeRouter {
        let mut config = BridgeConfig::new(
            SHOP,
            StoreInfo {
                shop: "shop.example.com".to_string(),
                currency: "USD".to_string(),
                locale: "en".to_string(),
            },
        );
        config.security.origins = OriginPolicy::new([WIDGET]);
        // Unroutable store so no test here reaches the network
        let cart = CartApiClient::new(CartClientConfig::new("http://127.0.0.1:9")).unwrap();
        BridgeRouter::new(config, cart, Arc::new(NoopHost), Arc::new(ManualClock::new(0)))
    }

    #[tokio::test]
    async fn test_unauthorized_origin_gets_no_reply() {
        let router = router();
        let sink = RecordingSink::default();
        let event = MessageEvent::new(
            "https://attacker.example",
            json!({ "type": "GET_STORE_INFO", "messageId": "x" }),
        );
        assert!(router.handle_event(event, &sink).await.is_none());
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_store_info_is_correlated() {
        let router = router();
        let sink = RecordingSink::default();
        let event = MessageEvent::new(
            WIDGET,
            json!({ "type": "GET_STORE_INFO", "messageId": "abc" }),
        );
        let response = router.handle_event(event, &sink).await.unwrap();
        assert!(response.success);
        assert_eq!(response.message_id.unwrap().as_str(), "abc");
        assert_eq!(response.data.unwrap()["currency"], "USD");

        let posted = sink.messages();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].1, WIDGET);
        assert_eq!(posted[0].0["messageId"], "abc");
    }

    #[tokio::test]
    async fn test_invalid_variant_is_reported_as_failure() {
        let router = router();
        let sink = RecordingSink::default();
        let event = MessageEvent::new(
            WIDGET,
            json!({ "type": "CART_ADD_ITEM", "payload": { "variantId": "abc" }, "messageId": "m1" }),
        );
        let response = router.handle_event(event, &sink).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "INVALID_PAYLOAD");
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_control_messages_from_widget_are_unsupported() {
        let router = router();
        let sink = RecordingSink::default();
        let event = MessageEvent::new(WIDGET, json!({ "type": "OPEN_CHATBOT", "messageId": "m" }));
        let response = router.handle_event(event, &sink).await.unwrap();
        assert_eq!(response.error.unwrap().code, "UNSUPPORTED_MESSAGE");
    }

    #[tokio::test]
    async fn test_lifecycle_messages_update_frame_state() {
        let router = router();
        let sink = RecordingSink::default();

        let ready = MessageEvent::new(WIDGET, json!({ "type": "CHATBOT_READY" }));
        assert!(router.handle_event(ready, &sink).await.is_none());

        let resize = MessageEvent::new(
            WIDGET,
            json!({ "type": "CHATBOT_RESIZE", "payload": { "width": 400, "height": 600 } }),
        );
        router.handle_event(resize, &sink).await;

        let changed = MessageEvent::new(
            WIDGET,
            json!({ "type": "CHATBOT_STATE_CHANGED", "payload": { "isOpen": true }, "messageId": "s" }),
        );
        let ack = router.handle_event(changed, &sink).await.unwrap();
        assert!(ack.success);

        let state = router.frame_state(WIDGET).unwrap();
        assert!(state.ready);
        assert!(state.open);
        assert_eq!(state.width, Some(400));
        assert_eq!(state.height, Some(600));
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_frames() {
        let router = router();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let id_a = router.register_frame(WIDGET, a.clone());
        router.register_frame(WIDGET, b.clone());

        assert_eq!(router.send_control(MessageType::OpenChatbot), 2);
        assert_eq!(a.messages()[0].0["type"], "OPEN_CHATBOT");

        assert!(router.unregister_frame(id_a));
        assert_eq!(router.send_control(MessageType::CloseChatbot), 1);
        assert_eq!(a.messages().len(), 1);
        assert_eq!(b.messages().len(), 2);
    }

    #[test]
    fn test_is_cart_request() {
        assert!(is_cart_request("https://shop.example.com/cart/add.js"));
        assert!(is_cart_request("/cart.js"));
        assert!(is_cart_request("/cart/change"));
        assert!(!is_cart_request("/products/tee.js"));
    }
}
