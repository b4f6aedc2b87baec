//! Widget cart operations over the bridge, with the fallback path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use storechat_bridge::RecordingHost;
use storechat_core::{CartUpdates, MessageType};
use storechat_integration_tests::{
    FakeStore, Unplugged, WIDGET_ORIGIN, bridge_router, clock, connect_widget,
};
use storechat_widget::{
    BridgeClient, BridgeClientConfig, BridgeEvent, CART_CACHE_KEY, CartService, CartServiceError,
    FallbackConfig, FallbackError, FallbackHandler, MemoryStorage, Storage,
};

fn fallback(store: &FakeStore, storage: Arc<MemoryStorage>) -> Arc<FallbackHandler> {
    Arc::new(FallbackHandler::new(
        store.client(),
        Some(storage as Arc<dyn Storage>),
        clock(),
        FallbackConfig::default(),
    ))
}

fn unplugged_client() -> BridgeClient {
    BridgeClient::new(Arc::new(Unplugged), BridgeClientConfig::default(), clock())
}

#[tokio::test]
async fn test_round_trip_through_bridge() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, _frame) = connect_widget(&router, Duration::from_secs(5));
    let storage = Arc::new(MemoryStorage::new());
    let handler = fallback(&store, storage.clone());
    let cart = CartService::new(client.clone(), handler.clone());

    let added = cart.add_item(123, 2).await.unwrap();
    assert_eq!(added.item_count, 2);
    assert_eq!(added.items[0].variant_id, 123);
    assert_eq!(added.items[0].price, "$10.00");

    let mut updates = CartUpdates::new();
    updates.insert("123".to_string(), 4);
    assert_eq!(cart.update_cart(&updates).await.unwrap().item_count, 4);

    assert!(!handler.is_active());
    assert_eq!(client.pending_count(), 0);
    // The bridge path never touches the fallback cache
    assert!(storage.get(CART_CACHE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_store_info_through_broker() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, _frame) = connect_widget(&router, Duration::from_secs(5));

    let data = client
        .call(MessageType::BridgeStatusRequest, json!({}))
        .await
        .unwrap();
    assert_eq!(data["ready"], true);
    assert_eq!(data["origin"], store.url.as_str());
}

#[tokio::test]
async fn test_bridge_rejection_is_reported() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, _frame) = connect_widget(&router, Duration::from_secs(5));

    let err = client
        .call(MessageType::CartAddItem, json!({ "variantId": -4 }))
        .await
        .unwrap_err();
    assert!(
        matches!(err, storechat_widget::BridgeError::Rejected { ref code, .. } if code == "INVALID_PAYLOAD"),
        "{err}"
    );
    assert_eq!(store.request_count(), 0);
}

#[tokio::test]
async fn test_fallback_when_not_embedded() {
    let store = FakeStore::start().await;
    let storage = Arc::new(MemoryStorage::new());
    let handler = fallback(&store, storage.clone());
    let cart = CartService::new(unplugged_client(), handler.clone());

    let added = cart.add_item(9, 1).await.unwrap();
    assert_eq!(added.item_count, 1);
    assert!(handler.is_active());
    assert_eq!(handler.cached_cart().unwrap(), added);
    assert_eq!(store.quantity(9), 1);
}

#[tokio::test]
async fn test_bridge_rejection_keeps_bridge_path() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, _frame) = connect_widget(&router, Duration::from_secs(5));
    let storage = Arc::new(MemoryStorage::new());
    let handler = fallback(&store, storage.clone());
    let cart = CartService::new(client, handler.clone());

    let err = cart
        .execute(MessageType::CartAddItem, json!({ "variantId": -4 }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CartServiceError::Fallback(FallbackError::InvalidPayload(_))
    ));
    assert!(!handler.is_active());
    assert_eq!(store.request_count(), 0);

    // The next call still goes through the bridge, not the direct path
    cart.get_cart().await.unwrap();
    assert!(!handler.is_active());
    assert!(storage.get(CART_CACHE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_reconnected_bridge_ends_fallback() {
    let store = FakeStore::start().await;
    let storage = Arc::new(MemoryStorage::new());
    let handler = Arc::new(FallbackHandler::new(
        store.client(),
        Some(storage.clone() as Arc<dyn Storage>),
        clock(),
        FallbackConfig {
            probe_interval: Duration::ZERO,
            ..FallbackConfig::default()
        },
    ));

    // No host page yet: the widget degrades
    let degraded = CartService::new(unplugged_client(), handler.clone());
    degraded.add_item(5, 1).await.unwrap();
    assert!(handler.is_active());
    assert!(!degraded.probe_bridge().await);
    assert!(handler.is_active());

    // The host page comes up; the next call checks it and switches back
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, _frame) = connect_widget(&router, Duration::from_secs(5));
    let cart = CartService::new(client.clone(), handler.clone());
    handler.clear_cache();

    let current = cart.get_cart().await.unwrap();
    assert_eq!(current.item_count, 1);
    assert!(!handler.is_active());
    assert_eq!(client.pending_count(), 0);
    assert!(storage.get(CART_CACHE_KEY).unwrap().is_none());
}

#[tokio::test]
async fn test_cached_cart_masks_store_outage() {
    let store = FakeStore::start().await;
    let storage = Arc::new(MemoryStorage::new());
    let handler = fallback(&store, storage);
    let cart = CartService::new(unplugged_client(), handler.clone());

    let before = cart.add_item(9, 2).await.unwrap();
    store.set_available(false);

    let data = cart.execute(MessageType::CartGet, json!(null)).await.unwrap();
    assert_eq!(data["cached"], true);
    assert_eq!(cart.get_cart().await.unwrap(), before);
}

#[tokio::test]
async fn test_fallback_gives_up_after_max_attempts() {
    let store = FakeStore::start().await;
    store.set_available(false);
    let handler = fallback(&store, Arc::new(MemoryStorage::new()));
    let cart = CartService::new(unplugged_client(), handler.clone());

    let err = cart.clear_cart().await.unwrap_err();
    let CartServiceError::Fallback(FallbackError::Failed { attempts, .. }) = err else {
        panic!("expected terminal fallback failure, got {err:?}");
    };
    assert_eq!(attempts, handler.config().max_retry_attempts);
    assert_eq!(
        store.request_count(),
        usize::try_from(handler.config().max_retry_attempts).unwrap()
    );
}

#[tokio::test]
async fn test_disabled_fallback_surfaces_bridge_error() {
    let store = FakeStore::start().await;
    let handler = Arc::new(FallbackHandler::new(
        store.client(),
        None,
        clock(),
        FallbackConfig {
            enable_fallback: false,
            ..FallbackConfig::default()
        },
    ));
    let cart = CartService::new(unplugged_client(), handler);

    let err = cart.get_cart().await.unwrap_err();
    assert!(matches!(
        err,
        CartServiceError::Fallback(FallbackError::Disabled(_))
    ));
    assert_eq!(store.request_count(), 0);
}

#[tokio::test]
async fn test_cart_updated_reaches_subscriber() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, frame) = connect_widget(&router, Duration::from_secs(5));
    router.register_frame(WIDGET_ORIGIN, frame);
    let mut events = client.subscribe();

    store.client().add_to_cart(77, 1).await.unwrap();
    router.observe_request("/cart/add.js").unwrap().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let BridgeEvent::CartUpdated(cart) = event else {
        panic!("expected CART_UPDATED, got {event:?}");
    };
    assert_eq!(cart.item_count, 1);
    assert_eq!(cart.items[0].variant_id, 77);
}

#[tokio::test]
async fn test_host_controls_reach_subscriber() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let (client, frame) = connect_widget(&router, Duration::from_secs(5));
    router.register_frame(WIDGET_ORIGIN, frame);
    let mut events = client.subscribe();

    assert_eq!(router.send_control(MessageType::OpenChatbot), 1);
    assert_eq!(
        events.recv().await.unwrap(),
        BridgeEvent::Control(MessageType::OpenChatbot)
    );
}
