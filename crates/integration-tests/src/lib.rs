//! Integration tests for storechat.
//!
//! Every test runs in-process: a fake Shopify store and a fake automation
//! webhook listen on `127.0.0.1:0`, and the widget and bridge talk through a
//! loopback channel instead of a browser.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p storechat-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `bridge_cart` - Host-page router against the store
//! - `widget_cart` - Widget broker, bridge and fallback together
//! - `proxy_webhook` - Proxy status mapping against the webhook
//! - `chat_delivery` - Widget delivery through the proxy

#![allow(clippy::missing_panics_doc, clippy::unwrap_used)]

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use storechat_bridge::{
    BridgeConfig, BridgeRouter, CartApiClient, CartClientConfig, FrameSink, RecordingHost,
    StoreInfo,
};
use storechat_core::{
    BridgeMessage, Clock, MessageEvent, OriginPolicy, SecurityConfig, SystemClock,
};
use storechat_proxy::{AppState, ProxyConfig};
use storechat_widget::{BridgeClient, BridgeClientConfig, BridgeError, BridgeTransport};

/// Origin the widget frame is served from.
pub const WIDGET_ORIGIN: &str = "https://widget.storechat.test";

/// Unit price of every fake product, in cents.
pub const UNIT_PRICE: i64 = 1_000;

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

// =============================================================================
// Fake Shopify store
// =============================================================================

#[derive(Default)]
struct StoreState {
    lines: Mutex<BTreeMap<u64, u32>>,
    available: AtomicBool,
    requests: AtomicUsize,
}

/// In-memory Shopify Ajax Cart API.
#[derive(Clone)]
pub struct FakeStore {
    pub url: String,
    state: Arc<StoreState>,
}

impl FakeStore {
    /// Start a store with an empty cart.
    pub async fn start() -> Self {
        let state = Arc::new(StoreState {
            available: AtomicBool::new(true),
            ..StoreState::default()
        });
        let router = Router::new()
            .route("/cart.js", get(store_cart))
            .route("/cart/add.js", post(store_add))
            .route("/cart/update.js", post(store_update))
            .route("/cart/clear.js", post(store_clear))
            .with_state(state.clone());
        let addr = serve(router).await;
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Make every endpoint answer 503 (or recover).
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Requests served so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Quantity of `variant_id` in the cart.
    #[must_use]
    pub fn quantity(&self, variant_id: u64) -> u32 {
        lines(&self.state).get(&variant_id).copied().unwrap_or(0)
    }

    /// Cart client for this store with retries disabled.
    #[must_use]
    pub fn client(&self) -> CartApiClient {
        let mut config = CartClientConfig::new(&self.url);
        config.max_retries = 0;
        config.timeout = Duration::from_secs(2);
        CartApiClient::new(config).unwrap()
    }
}

fn lines(state: &StoreState) -> std::sync::MutexGuard<'_, BTreeMap<u64, u32>> {
    state.lines.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gate(state: &StoreState) -> Result<(), Response> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.available.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE.into_response())
    }
}

fn cart_json(state: &StoreState) -> Value {
    let lines = lines(state);
    let items: Vec<Value> = lines
        .iter()
        .map(|(variant_id, quantity)| {
            json!({
                "id": variant_id,
                "key": format!("{variant_id}:key"),
                "variant_id": variant_id,
                "quantity": quantity,
                "product_title": format!("Product {variant_id}"),
                "price": UNIT_PRICE,
            })
        })
        .collect();
    let item_count: u32 = lines.values().sum();
    json!({
        "token": "cart-token",
        "items": items,
        "item_count": item_count,
        "total_price": i64::from(item_count) * UNIT_PRICE,
        "currency": "USD",
    })
}

async fn store_cart(State(state): State<Arc<StoreState>>) -> Response {
    if let Err(response) = gate(&state) {
        return response;
    }
    Json(cart_json(&state)).into_response()
}

#[derive(Deserialize)]
struct AddBody {
    items: Vec<AddItem>,
}

#[derive(Deserialize)]
struct AddItem {
    id: u64,
    quantity: u32,
}

async fn store_add(State(state): State<Arc<StoreState>>, Json(body): Json<AddBody>) -> Response {
    if let Err(response) = gate(&state) {
        return response;
    }
    let mut added = Vec::new();
    {
        let mut lines = lines(&state);
        for item in body.items {
            *lines.entry(item.id).or_insert(0) += item.quantity;
            added.push(json!({ "id": item.id, "quantity": item.quantity }));
        }
    }
    // Shopify only echoes the added lines
    Json(json!({ "items": added })).into_response()
}

#[derive(Deserialize)]
struct UpdateBody {
    updates: BTreeMap<String, u32>,
}

async fn store_update(
    State(state): State<Arc<StoreState>>,
    Json(body): Json<UpdateBody>,
) -> Response {
    if let Err(response) = gate(&state) {
        return response;
    }
    {
        let mut lines = lines(&state);
        for (key, quantity) in body.updates {
            let Some(id) = key.split(':').next().and_then(|k| k.parse::<u64>().ok()) else {
                continue;
            };
            if quantity == 0 {
                lines.remove(&id);
            } else {
                lines.insert(id, quantity);
            }
        }
    }
    Json(cart_json(&state)).into_response()
}

async fn store_clear(State(state): State<Arc<StoreState>>) -> Response {
    if let Err(response) = gate(&state) {
        return response;
    }
    lines(&state).clear();
    Json(cart_json(&state)).into_response()
}

// =============================================================================
// Fake webhook
// =============================================================================

/// Canned answer for the fake webhook.
#[derive(Clone)]
pub struct WebhookReply {
    pub status: StatusCode,
    pub body: String,
    pub delay: Duration,
}

impl WebhookReply {
    /// A 200 with a JSON body.
    #[must_use]
    pub fn json(body: &Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// An empty response with `status`.
    #[must_use]
    pub const fn status(status: StatusCode) -> Self {
        Self {
            status,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }
}

/// A request seen by the fake webhook.
#[derive(Debug, Clone)]
pub struct WebhookCall {
    pub request_id: Option<String>,
    pub authorization: Option<String>,
    pub body: Value,
}

struct WebhookState {
    reply: Mutex<WebhookReply>,
    queued: Mutex<VecDeque<WebhookReply>>,
    calls: Mutex<Vec<WebhookCall>>,
}

/// Automation webhook double that records every call.
#[derive(Clone)]
pub struct FakeWebhook {
    pub url: String,
    state: Arc<WebhookState>,
}

impl FakeWebhook {
    /// Start a webhook answering with `reply`.
    pub async fn start(reply: WebhookReply) -> Self {
        let state = Arc::new(WebhookState {
            reply: Mutex::new(reply),
            queued: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route("/hook", post(webhook))
            .with_state(state.clone());
        let addr = serve(router).await;
        Self {
            url: format!("http://{addr}/hook"),
            state,
        }
    }

    /// Change the canned answer.
    pub fn set_reply(&self, reply: WebhookReply) {
        *self
            .state
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reply;
    }

    /// Answer the next call with `reply`, then fall back to the canned one.
    pub fn queue(&self, reply: WebhookReply) {
        self.state
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<WebhookCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    state
        .calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(WebhookCall {
            request_id: header("x-request-id"),
            authorization: header("authorization"),
            body,
        });

    let queued = state
        .queued
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front();
    let reply = queued.unwrap_or_else(|| {
        state
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    });
    tokio::time::sleep(reply.delay).await;
    (
        reply.status,
        [("content-type", "application/json")],
        reply.body,
    )
        .into_response()
}

// =============================================================================
// Proxy
// =============================================================================

/// Start the proxy in front of `webhook_url`; returns the `/api/chat` URL.
pub async fn start_proxy(webhook_url: &str, extra: &[(&str, &str)]) -> String {
    let mut vars: BTreeMap<String, String> = extra
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    vars.insert("CHATBOT_WEBHOOK_URL".to_string(), webhook_url.to_string());
    let config = ProxyConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let addr = serve(storechat_proxy::app(AppState::new(config))).await;
    format!("http://{addr}/api/chat")
}

// =============================================================================
// Bridge wiring
// =============================================================================

/// Router on the store's origin accepting the widget origin.
#[must_use]
pub fn bridge_router(store: &FakeStore, host: Arc<RecordingHost>) -> BridgeRouter {
    let mut config = BridgeConfig::new(
        store.url.clone(),
        StoreInfo {
            shop: "fake-shop.myshopify.com".to_string(),
            currency: "USD".to_string(),
            locale: "en".to_string(),
        },
    );
    config.security.origins = OriginPolicy::new([WIDGET_ORIGIN]);
    config.settle_delay = Duration::from_millis(20);
    BridgeRouter::new(config, store.client(), host, clock())
}

/// The widget frame as seen by the host page: delivers posted messages to
/// the widget's [`BridgeClient`].
pub struct WidgetFrame {
    client: OnceLock<BridgeClient>,
    host_origin: String,
}

impl FrameSink for WidgetFrame {
    fn post_message(&self, message: Value, _target_origin: &str) {
        if let Some(client) = self.client.get() {
            client.handle_incoming(&MessageEvent::new(self.host_origin.clone(), message));
        }
    }
}

/// Widget-to-host channel: posts go straight to the router.
pub struct LoopbackTransport {
    router: BridgeRouter,
    frame: Arc<WidgetFrame>,
}

impl BridgeTransport for LoopbackTransport {
    fn post(&self, message: &BridgeMessage) -> Result<(), BridgeError> {
        let data =
            serde_json::to_value(message).map_err(|e| BridgeError::Transport(e.to_string()))?;
        let router = self.router.clone();
        let frame = self.frame.clone();
        tokio::spawn(async move {
            router
                .handle_event(MessageEvent::new(WIDGET_ORIGIN, data), frame.as_ref())
                .await;
        });
        Ok(())
    }
}

/// A widget bridge client connected to `router`. The frame is returned so
/// tests can register it for broadcasts.
#[must_use]
pub fn connect_widget(router: &BridgeRouter, timeout: Duration) -> (BridgeClient, Arc<WidgetFrame>) {
    let host_origin = router.config().origin.clone();
    let frame = Arc::new(WidgetFrame {
        client: OnceLock::new(),
        host_origin: host_origin.clone(),
    });
    let transport = Arc::new(LoopbackTransport {
        router: router.clone(),
        frame: frame.clone(),
    });
    let config = BridgeClientConfig {
        timeout,
        security: SecurityConfig {
            sanitize: false,
            origins: OriginPolicy::new([host_origin]),
            ..SecurityConfig::default()
        },
        own_origin: Some(WIDGET_ORIGIN.to_string()),
    };
    let client = BridgeClient::new(transport, config, clock());
    let _ = frame.client.set(client.clone());
    (client, frame)
}

/// Transport for a widget that is not embedded in a store page.
pub struct Unplugged;

impl BridgeTransport for Unplugged {
    fn post(&self, _message: &BridgeMessage) -> Result<(), BridgeError> {
        Err(BridgeError::Transport("no host page".to_string()))
    }
}

/// Shared wall clock.
#[must_use]
pub fn clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
