//! Chat types shared by the widget and the proxy.
//!
//! - [`Message`] and [`ChatState`] make up the widget's conversation log and
//!   its persisted UI state.
//! - [`ChatRequest`] and [`ChatResponse`] are the contracts at the proxy's
//!   HTTP boundary (`POST /api/chat`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::id::ChatMessageId;

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Bot,
}

/// A single entry of the conversation log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: ChatMessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<ProductCard>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl Message {
    /// A message typed by the shopper.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    /// A message authored by the assistant.
    #[must_use]
    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Bot, content)
    }

    fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: ChatMessageId::generate(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            cards: None,
            order: None,
            event_type: None,
        }
    }

    /// Build the bot message for a normalized proxy response.
    ///
    /// Empty card lists are dropped so plain text answers stay plain.
    #[must_use]
    pub fn from_response(response: ChatResponse) -> Self {
        let mut message = Self::bot(response.message);
        message.cards = Some(response.cards).filter(|cards| !cards.is_empty());
        message.order = response.order;
        message.event_type = Some(response.event_type);
        message
    }
}

/// Widget UI state persisted between page loads.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub is_open: bool,
    /// Epoch milliseconds of the last save.
    #[serde(default)]
    pub last_activity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manually_closed: Option<bool>,
}

/// Kind of chat turn sent to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Text,
    Voice,
}

impl RequestKind {
    /// Parse the wire value (`"text"` / `"voice"`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }
}

/// Onboarding details the shopper chose to share (stored without expiry).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /api/chat`, forwarded unchanged to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        rename = "audioData",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Shopify's `_shopify_y` visitor cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shopify_y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl ChatRequest {
    /// A text turn.
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Text,
            message: Some(message.into()),
            audio_data: None,
            timestamp: None,
            shopify_y: None,
            cart_currency: None,
            localization: None,
            user: None,
        }
    }

    /// A voice turn carrying base64 audio.
    #[must_use]
    pub fn voice(audio_data: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: RequestKind::Voice,
            message: None,
            audio_data: Some(audio_data.into()),
            timestamp: Some(timestamp.to_rfc3339()),
            shopify_y: None,
            cart_currency: None,
            localization: None,
            user: None,
        }
    }
}

/// Normalized proxy response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub event_type: String,
    #[serde(default)]
    pub cards: Vec<ProductCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Product suggestion rendered as a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCard {
    pub id: String,
    pub title: String,
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub variants: Vec<CardVariant>,
}

/// Purchasable variant of a [`ProductCard`].
///
/// `price` falls back to the parent card's price when the webhook omits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardVariant {
    pub color: String,
    pub size: String,
    pub variant_id: String,
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_at_price: Option<String>,
}

/// Order status summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub total_price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfillment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_company: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// Line of an [`Order`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}
