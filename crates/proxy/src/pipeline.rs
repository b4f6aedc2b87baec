//! Chat request pipeline.
//!
//! `POST /api/chat` runs three stages, each short-circuiting with an
//! [`AppError`]:
//!
//! 1. [`validate_request`] - parse and check the widget's body
//! 2. [`forward_to_webhook`] - POST it upstream with a timeout
//! 3. [`parse_response`] - normalize the webhook's answer into [`ChatResponse`]
//!
//! The webhook is an automation tool whose output drifts: it may answer with
//! an object or a one-element array, and names the same value several ways.
//! [`WebhookPayload`] lists every accepted shape; anything else is rejected.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use storechat_core::{
    CardVariant, ChatRequest, ChatResponse, Order, OrderItem, ProductCard, RequestKind,
};

use crate::config::WebhookConfig;
use crate::error::{AppError, Result};
use crate::middleware::REQUEST_ID_HEADER;

/// Default reply when the webhook sent no text.
pub const NO_RESPONSE_MESSAGE: &str = "No response received";

/// Default event type.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Apparel and numeric sizes found in variant options.
static SIZE_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(xxs|xs|s|m|l|xl|xxl|xxxl|[2-5]xl|one size|os|\d{1,2}(\.5)?|\d{2}/\d{2})$").ok()
});

// =============================================================================
// Stage 1: validate
// =============================================================================

/// Parse and validate the request body.
///
/// # Errors
///
/// - 400 when the body is not JSON
/// - 422 when `type` is missing or unknown, a text turn has no `message`, or
///   a voice turn lacks `audioData` or `timestamp`
pub fn validate_request(body: &[u8]) -> Result<ChatRequest> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| AppError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(RequestKind::parse)
        .ok_or_else(|| {
            AppError::Validation("Invalid or missing message type".to_string())
        })?;

    let present = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    };

    match kind {
        RequestKind::Text if !present("message") => {
            return Err(AppError::Validation(
                "Message is required for text requests".to_string(),
            ));
        }
        RequestKind::Voice if !present("audioData") || !present("timestamp") => {
            return Err(AppError::Validation(
                "Audio data and timestamp are required for voice requests".to_string(),
            ));
        }
        _ => {}
    }

    serde_json::from_value(value).map_err(|e| AppError::Validation(e.to_string()))
}

// =============================================================================
// Stage 2: forward
// =============================================================================

/// POST the request to the webhook and return the raw response body.
///
/// # Errors
///
/// - 401 when the webhook returns 401
/// - 500 for any other non-success status or a network failure
/// - 504 when the webhook does not answer within the configured timeout
#[instrument(skip(client, webhook, request), fields(kind = ?request.kind))]
pub async fn forward_to_webhook(
    client: &reqwest::Client,
    webhook: &WebhookConfig,
    request: &ChatRequest,
    request_id: &str,
) -> Result<String> {
    let mut builder = client
        .post(webhook.url.clone())
        .timeout(webhook.timeout)
        .header(REQUEST_ID_HEADER, request_id)
        .json(request);
    if let Some(token) = webhook.bearer() {
        builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(map_transport)?;
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        warn!(request_id, "Webhook rejected credentials");
        return Err(AppError::WebhookUnauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(request_id, %status, body = %body.chars().take(200).collect::<String>(), "Webhook error");
        return Err(AppError::WebhookStatus(status));
    }

    response.text().await.map_err(map_transport)
}

fn map_transport(error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::Timeout
    } else {
        AppError::Network(error.to_string())
    }
}

// =============================================================================
// Stage 3: parse
// =============================================================================

/// Every shape the webhook is known to answer with.
///
/// Dispatched on the JSON value; derived structs also accept sequences
/// positionally.
#[derive(Debug)]
pub enum WebhookPayload {
    Single(WebhookReply),
    Batch(Vec<WebhookReply>),
}

impl<'de> Deserialize<'de> for WebhookPayload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            value @ Value::Object(_) => WebhookReply::from_object(value)
                .map(Self::Single)
                .map_err(D::Error::custom),
            Value::Array(items) => items
                .into_iter()
                .map(WebhookReply::from_object)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::Batch)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "expected an object or array, found {}",
                json_kind(&other)
            ))),
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl WebhookPayload {
    /// The reply to use: the object itself, or the first array element.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty array.
    pub fn into_reply(self) -> Result<WebhookReply> {
        match self {
            Self::Single(reply) => Ok(reply),
            Self::Batch(replies) => {
                if replies.len() > 1 {
                    debug!(count = replies.len(), "Webhook returned several replies; using the first");
                }
                replies
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::InvalidResponse("empty response array".to_string()))
            }
        }
    }
}

/// One webhook reply, before normalization.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookReply {
    #[serde(default)]
    output: Option<WebhookOutput>,
    #[serde(default, deserialize_with = "lenient_string")]
    response: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    message: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    event_type: Option<String>,
    #[serde(default)]
    cards: Option<Vec<RawProduct>>,
    #[serde(default)]
    products: Option<Vec<RawProduct>>,
    #[serde(default)]
    order: Option<RawOrder>,
    #[serde(default, deserialize_with = "lenient_string")]
    currency: Option<String>,
}

impl WebhookReply {
    fn from_object(value: Value) -> std::result::Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected reply object, found {}", json_kind(&value)));
        }
        Self::deserialize(value).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct WebhookOutput {
    #[serde(default, deserialize_with = "lenient_string")]
    response: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProduct {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    price: Option<String>,
    #[serde(default)]
    image: Option<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    handle: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(default)]
    variants: Vec<RawVariant>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVariant {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, alias = "variantId", deserialize_with = "lenient_string")]
    variant_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    variant_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    color: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    size: Option<String>,
    #[serde(default)]
    options: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_string")]
    price: Option<String>,
    #[serde(default, alias = "compareAtPrice", deserialize_with = "lenient_string")]
    compare_at_price: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOrder {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    order_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default)]
    customer: Option<RawCustomer>,
    #[serde(default, deserialize_with = "lenient_string")]
    customer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    total_price: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    financial_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    fulfillment_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    created_at: Option<String>,
    #[serde(default)]
    fulfillments: Vec<RawFulfillment>,
    #[serde(default, alias = "items")]
    line_items: Vec<RawLineItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCustomer {
    #[serde(default, deserialize_with = "lenient_string")]
    first_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    last_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFulfillment {
    #[serde(default, deserialize_with = "lenient_string")]
    tracking_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    tracking_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    tracking_company: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLineItem {
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default, deserialize_with = "lenient_string")]
    price: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    variant_title: Option<String>,
    #[serde(default)]
    image: Option<Value>,
}

/// Accept strings, numbers and booleans as text; treat everything else as absent.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Normalize the webhook body into a [`ChatResponse`].
///
/// # Errors
///
/// Returns a 500 error when the body is not JSON, not an object or array,
/// or an empty array.
pub fn parse_response(body: &str) -> Result<ChatResponse> {
    let payload: WebhookPayload =
        serde_json::from_str(body).map_err(|e| AppError::InvalidResponse(e.to_string()))?;
    Ok(normalize(payload.into_reply()?))
}

fn normalize(reply: WebhookReply) -> ChatResponse {
    let message = reply
        .output
        .and_then(|o| o.response)
        .or(reply.response)
        .or(reply.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| NO_RESPONSE_MESSAGE.to_string());

    let cards = reply
        .cards
        .or(reply.products)
        .unwrap_or_default()
        .into_iter()
        .map(normalize_product)
        .collect();

    ChatResponse {
        message,
        event_type: reply
            .event_type
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
        cards,
        order: reply.order.map(normalize_order),
        currency: reply.currency,
    }
}

fn normalize_product(product: RawProduct) -> ProductCard {
    let price = product.price.unwrap_or_default();
    let variants = product
        .variants
        .into_iter()
        .map(|v| normalize_variant(v, &price))
        .collect();

    ProductCard {
        id: product.id.unwrap_or_default(),
        title: product.title.unwrap_or_default(),
        image: product.image.as_ref().and_then(image_url),
        url: product
            .url
            .or_else(|| product.handle.map(|h| format!("/products/{h}"))),
        description: product.description,
        variants,
        price,
    }
}

/// Variant prices fall back to the parent product's price.
fn normalize_variant(variant: RawVariant, product_price: &str) -> CardVariant {
    let (color, size) = variant_attributes(&variant);
    CardVariant {
        color,
        size,
        variant_id: variant.variant_id.or(variant.id).unwrap_or_default(),
        price: variant
            .price
            .unwrap_or_else(|| product_price.to_string()),
        compare_at_price: variant.compare_at_price,
    }
}

/// Derive `(color, size)` from explicit fields, a `"Color / Size"` title, or
/// an options list.
fn variant_attributes(variant: &RawVariant) -> (String, String) {
    if variant.color.is_some() || variant.size.is_some() {
        return (
            variant.color.clone().unwrap_or_default(),
            variant.size.clone().unwrap_or_default(),
        );
    }

    let title = variant
        .variant_title
        .as_deref()
        .or(variant.title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "Default Title");
    if let Some(title) = title {
        if let Some((color, size)) = title.split_once('/') {
            return (color.trim().to_string(), size.trim().to_string());
        }
        if variant.options.is_empty() {
            return if is_size_token(title) {
                (String::new(), title.to_string())
            } else {
                (title.to_string(), String::new())
            };
        }
    }

    let options: Vec<String> = variant
        .options
        .iter()
        .filter_map(|o| match o {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(map) => map.get("value").and_then(Value::as_str).map(String::from),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();

    let size = options.iter().find(|o| is_size_token(o)).cloned();
    let color = options
        .iter()
        .find(|o| Some(*o) != size.as_ref())
        .cloned();
    (color.unwrap_or_default(), size.unwrap_or_default())
}

fn is_size_token(value: &str) -> bool {
    SIZE_TOKEN
        .as_ref()
        .is_some_and(|re| re.is_match(value.trim()))
}

fn image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["src", "url"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(String::from),
        _ => None,
    }
}

/// Map a raw Shopify order. Tracking comes from the first fulfillment only.
fn normalize_order(order: RawOrder) -> Order {
    let customer_name = order
        .customer
        .as_ref()
        .map(|c| {
            [c.first_name.as_deref(), c.last_name.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string()
        })
        .filter(|n| !n.is_empty())
        .or(order.customer_name)
        .unwrap_or_default();

    let tracking = order.fulfillments.into_iter().next().unwrap_or_default();

    Order {
        id: order.id.unwrap_or_default(),
        order_number: order.order_number.or(order.name).unwrap_or_default(),
        customer_name,
        email: order
            .email
            .or_else(|| order.customer.and_then(|c| c.email)),
        total_price: order.total_price.unwrap_or_default(),
        currency: order.currency,
        financial_status: order.financial_status,
        fulfillment_status: order.fulfillment_status,
        created_at: order.created_at,
        tracking_number: tracking.tracking_number,
        tracking_url: tracking.tracking_url,
        tracking_company: tracking.tracking_company,
        items: order
            .line_items
            .into_iter()
            .map(|item| OrderItem {
                name: item.name.or(item.title).unwrap_or_default(),
                quantity: item.quantity.unwrap_or(1),
                price: item.price.unwrap_or_default(),
                variant_title: item.variant_title,
                image: item.image.as_ref().and_then(image_url),
            })
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status(err: &AppError) -> StatusCode {
        err.status()
    }

    #[test]
    fn test_validate_text_request() {
        let request = validate_request(br#"{"type":"text","message":"hi","shopify_y":"abc"}"#).unwrap();
        assert_eq!(request.kind, RequestKind::Text);
        assert_eq!(request.message.as_deref(), Some("hi"));
        assert_eq!(request.shopify_y.as_deref(), Some("abc"));
    }

    #[test]
    fn test_validate_rejects_bad_json_with_400() {
        let err = validate_request(b"{not json").unwrap_err();
        assert_eq!(status(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validate_rejects_missing_fields_with_422() {
        for body in [
            &br#"{"message":"hi"}"#[..],
            br#"{"type":"video","message":"hi"}"#,
            br#"{"type":"text"}"#,
            br#"{"type":"text","message":"   "}"#,
            br#"{"type":"voice","audioData":"x"}"#,
            br#"{"type":"voice","timestamp":"2026-01-01T00:00:00Z"}"#,
            br#"[1,2]"#,
        ] {
            let err = validate_request(body).unwrap_err();
            assert_eq!(status(&err), StatusCode::UNPROCESSABLE_ENTITY, "{err}");
        }
    }

    #[test]
    fn test_validate_voice_request() {
        let request = validate_request(
            br#"{"type":"voice","audioData":"UklGRg==","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, RequestKind::Voice);
        assert_eq!(request.audio_data.as_deref(), Some("UklGRg=="));
    }

    #[test]
    fn test_parse_array_with_title_split_variant() {
        let body = r#"[{"response":"hi","cards":[{"id":"1","title":"T","price":"10","variants":[{"variant_title":"Red / M"}]}]}]"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.message, "hi");
        assert_eq!(
            response.cards[0].variants[0],
            CardVariant {
                color: "Red".to_string(),
                size: "M".to_string(),
                variant_id: String::new(),
                price: "10".to_string(),
                compare_at_price: None,
            }
        );
    }

    #[test]
    fn test_parse_array_keeps_every_field() {
        let body = r#"[{"output":{"response":"Found two"},"event_type":"product_search",
            "products":[{"id":1,"title":"Tee","price":"25.00"},{"id":2,"title":"Cap","price":"12"}]},
            {"response":"ignored"}]"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.message, "Found two");
        assert_eq!(response.event_type, "product_search");
        assert_eq!(response.cards.len(), 2);
        assert_eq!(response.cards[1].title, "Cap");
    }

    #[test]
    fn test_parse_empty_object_uses_defaults() {
        let response = parse_response("{}").unwrap();
        assert_eq!(response.message, NO_RESPONSE_MESSAGE);
        assert_eq!(response.event_type, "message");
        assert!(response.cards.is_empty());
        assert!(response.order.is_none());
    }

    #[test]
    fn test_parse_message_aliases() {
        let response = parse_response(r#"{"output":{"response":"from output"},"response":"r"}"#).unwrap();
        assert_eq!(response.message, "from output");
        let response = parse_response(r#"{"message":"plain","event_type":"order_status"}"#).unwrap();
        assert_eq!(response.message, "plain");
        assert_eq!(response.event_type, "order_status");
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for body in ["[]", "[1]", "[[\"hi\"]]", "\"hello\"", "42", "not json", "null"] {
            let err = parse_response(body).unwrap_err();
            assert_eq!(status(&err), StatusCode::INTERNAL_SERVER_ERROR, "{body}");
            assert_eq!(err.public_message(), "Invalid response from chatbot service");
        }
    }

    #[test]
    fn test_products_alias_and_numeric_prices() {
        let body = r#"{"products":[{"id":42,"title":"Tee","price":19.5,"handle":"tee","image":{"src":"https://cdn/x.png"},
            "variants":[{"id":7,"color":"Blue","price":"18","compare_at_price":"25"}]}]}"#;
        let response = parse_response(body).unwrap();
        let card = &response.cards[0];
        assert_eq!(card.id, "42");
        assert_eq!(card.price, "19.5");
        assert_eq!(card.url.as_deref(), Some("/products/tee"));
        assert_eq!(card.image.as_deref(), Some("https://cdn/x.png"));
        let variant = &card.variants[0];
        assert_eq!(variant.color, "Blue");
        assert_eq!(variant.size, "");
        assert_eq!(variant.variant_id, "7");
        assert_eq!(variant.compare_at_price.as_deref(), Some("25"));
    }

    #[test]
    fn test_variant_options_matched_against_size_tokens() {
        let body = r#"{"cards":[{"id":"1","title":"T","price":"10","variants":[
            {"variant_id":"9","options":["XL","Forest Green"]},
            {"variant_id":"10","title":"Large"},
            {"variant_id":"11","title":"XS"}
        ]}]}"#;
        let response = parse_response(body).unwrap();
        let variants = &response.cards[0].variants;
        assert_eq!((variants[0].color.as_str(), variants[0].size.as_str()), ("Forest Green", "XL"));
        assert_eq!((variants[1].color.as_str(), variants[1].size.as_str()), ("Large", ""));
        assert_eq!((variants[2].color.as_str(), variants[2].size.as_str()), ("", "XS"));
    }

    #[test]
    fn test_order_uses_first_fulfillment_only() {
        let body = r##"{"event_type":"order","order":{
            "id":1001,"name":"#1001","customer":{"first_name":"Ada","last_name":"Lovelace","email":"ada@example.com"},
            "total_price":"42.00","currency":"USD","fulfillment_status":"fulfilled",
            "fulfillments":[
                {"tracking_number":"1Z1","tracking_url":"https://track/1Z1","tracking_company":"UPS"},
                {"tracking_number":"1Z2"}
            ],
            "line_items":[{"title":"Tee","quantity":2,"price":"21.00","variant_title":"Red / M"}]
        }}"##;
        let order = parse_response(body).unwrap().order.unwrap();
        assert_eq!(order.id, "1001");
        assert_eq!(order.order_number, "#1001");
        assert_eq!(order.customer_name, "Ada Lovelace");
        assert_eq!(order.email.as_deref(), Some("ada@example.com"));
        assert_eq!(order.tracking_number.as_deref(), Some("1Z1"));
        assert_eq!(order.tracking_company.as_deref(), Some("UPS"));
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].name, "Tee");
        assert_eq!(order.items[0].quantity, 2);
    }

    #[test]
    fn test_size_tokens() {
        for size in ["S", "m", "XXL", "3XL", "One Size", "42", "9.5"] {
            assert!(is_size_token(size), "{size}");
        }
        for other in ["Red", "Large", "Forest Green"] {
            assert!(!is_size_token(other), "{other}");
        }
    }
}
