//! Host-page bridge against a fake Shopify store.

use std::sync::Arc;

use axum::{Router, routing::get};
use serde_json::{Value, json};

use storechat_bridge::{BridgeConfig, BridgeRouter, RecordingHost, RecordingSink, StoreInfo};
use storechat_core::{MessageEvent, OriginPolicy};
use storechat_integration_tests::{FakeStore, WIDGET_ORIGIN, bridge_router, clock, serve};

fn event(data: Value) -> MessageEvent {
    MessageEvent::new(WIDGET_ORIGIN, data)
}

#[tokio::test]
async fn test_add_item_returns_cart_fetched_after_add() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let sink = RecordingSink::default();

    let response = router
        .handle_event(
            event(json!({
                "type": "CART_ADD_ITEM",
                "payload": { "variantId": "123", "quantity": 2 },
                "messageId": "abc",
            })),
            &sink,
        )
        .await
        .unwrap();

    assert!(response.success);
    let posted = sink.messages();
    assert_eq!(posted.len(), 1);
    let (message, target) = &posted[0];
    assert_eq!(target, WIDGET_ORIGIN);
    assert_eq!(message["messageId"], "abc");
    assert_eq!(message["success"], true);
    assert_eq!(message["type"], "CART_ADD_ITEM");
    assert_eq!(message["data"]["cart"]["item_count"], 2);
    assert_eq!(message["data"]["cart"]["total_price"], 2_000);
    assert_eq!(message["data"]["added"]["variantId"], 123);
    assert_eq!(store.quantity(123), 2);
}

#[tokio::test]
async fn test_unauthorized_origin_never_reaches_store() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let sink = RecordingSink::default();

    let response = router
        .handle_event(
            MessageEvent::new(
                "https://attacker.example",
                json!({ "type": "CART_CLEAR", "messageId": "x" }),
            ),
            &sink,
        )
        .await;

    assert!(response.is_none());
    assert!(sink.messages().is_empty());
    assert_eq!(store.request_count(), 0);
}

#[tokio::test]
async fn test_update_and_clear() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let sink = RecordingSink::default();

    router
        .handle_event(
            event(json!({ "type": "CART_ADD_ITEM", "payload": { "variantId": 7, "quantity": 1 }, "messageId": "1" })),
            &sink,
        )
        .await
        .unwrap();

    let updated = router
        .handle_event(
            event(json!({ "type": "CART_UPDATE", "payload": { "updates": { "7": 5 } }, "messageId": "2" })),
            &sink,
        )
        .await
        .unwrap();
    assert_eq!(updated.data.unwrap()["cart"]["item_count"], 5);

    let cleared = router
        .handle_event(event(json!({ "type": "CART_CLEAR", "messageId": "3" })), &sink)
        .await
        .unwrap();
    assert_eq!(cleared.data.unwrap()["cart"]["items"], json!([]));
    assert_eq!(store.quantity(7), 0);
}

#[tokio::test]
async fn test_store_failure_becomes_error_response() {
    let store = FakeStore::start().await;
    store.set_available(false);
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let sink = RecordingSink::default();

    let response = router
        .handle_event(event(json!({ "type": "CART_GET", "messageId": "g" })), &sink)
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, "HTTP_ERROR");
    assert_eq!(sink.messages()[0].0["messageId"], "g");
}

#[tokio::test]
async fn test_method_not_allowed_is_configuration_error() {
    // Wrong store URL: the cart path exists but only answers GET
    let addr = serve(Router::new().route("/cart/add.js", get(|| async { "{}" }))).await;
    let store_url = format!("http://{addr}");
    let mut config = BridgeConfig::new(
        store_url.clone(),
        StoreInfo {
            shop: "wrong".to_string(),
            currency: "USD".to_string(),
            locale: "en".to_string(),
        },
    );
    config.security.origins = OriginPolicy::new([WIDGET_ORIGIN]);
    let client = storechat_bridge::CartApiClient::new(storechat_bridge::CartClientConfig::new(
        store_url,
    ))
    .unwrap();
    let router = BridgeRouter::new(config, client, Arc::new(RecordingHost::default()), clock());
    let sink = RecordingSink::default();

    let response = router
        .handle_event(
            event(json!({ "type": "CART_ADD_ITEM", "payload": { "variantId": 1 }, "messageId": "m" })),
            &sink,
        )
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, "CONFIGURATION_ERROR");
}

#[tokio::test]
async fn test_navigation_and_store_info() {
    let store = FakeStore::start().await;
    let host = Arc::new(RecordingHost::default());
    let router = bridge_router(&store, host.clone());
    let sink = RecordingSink::default();

    let response = router
        .handle_event(event(json!({ "type": "NAVIGATE_TO_CHECKOUT", "messageId": "n" })), &sink)
        .await
        .unwrap();
    let expected = format!("{}/checkout", store.url);
    assert_eq!(response.data.unwrap()["url"], expected.as_str());
    assert_eq!(host.visited(), vec![expected]);

    let response = router
        .handle_event(event(json!({ "type": "GET_STORE_INFO", "messageId": "s" })), &sink)
        .await
        .unwrap();
    let data = response.data.unwrap();
    assert_eq!(data["shop"], "fake-shop.myshopify.com");
    assert_eq!(data["origin"], store.url.as_str());
}

#[tokio::test]
async fn test_cart_activity_broadcasts_cart_updated() {
    let store = FakeStore::start().await;
    let router = bridge_router(&store, Arc::new(RecordingHost::default()));
    let frame = Arc::new(RecordingSink::default());
    router.register_frame(WIDGET_ORIGIN, frame.clone());

    // A theme button added to the cart outside the bridge
    store.client().add_to_cart(55, 3).await.unwrap();
    router.observe_request("/cart/add.js").unwrap().await.unwrap();

    let posted = frame.messages();
    assert_eq!(posted.len(), 1);
    let (message, target) = &posted[0];
    assert_eq!(target, WIDGET_ORIGIN);
    assert_eq!(message["type"], "CART_UPDATED");
    assert!(message.get("messageId").is_none());
    assert_eq!(message["data"]["cart"]["item_count"], 3);

    assert!(router.observe_request("/products/tee.js").is_none());
}
