//! Cross-frame bridge protocol.
//!
//! The widget frame and the host page exchange JSON envelopes over an untyped
//! message channel:
//!
//! - requests: `{ type, payload, messageId }`
//! - responses: `{ success, type, data | error, messageId, timestamp }`
//!
//! Every request carrying a `messageId` gets exactly one correlated response.
//! Unsolicited notifications (`CART_UPDATED`) carry no `messageId`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::MessageId;

/// Every message type either side is allowed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    CartAddItem,
    CartGet,
    CartUpdate,
    CartClear,
    NavigateToCart,
    NavigateToCheckout,
    GetStoreInfo,
    BridgeStatusRequest,
    CartUpdated,
    OpenChatbot,
    CloseChatbot,
    ToggleChat,
    ClearHistory,
    ChatbotReady,
    ChatbotStateChanged,
    ChatbotResize,
}

impl MessageType {
    /// The complete allow-list.
    pub const ALL: [Self; 16] = [
        Self::CartAddItem,
        Self::CartGet,
        Self::CartUpdate,
        Self::CartClear,
        Self::NavigateToCart,
        Self::NavigateToCheckout,
        Self::GetStoreInfo,
        Self::BridgeStatusRequest,
        Self::CartUpdated,
        Self::OpenChatbot,
        Self::CloseChatbot,
        Self::ToggleChat,
        Self::ClearHistory,
        Self::ChatbotReady,
        Self::ChatbotStateChanged,
        Self::ChatbotResize,
    ];

    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CartAddItem => "CART_ADD_ITEM",
            Self::CartGet => "CART_GET",
            Self::CartUpdate => "CART_UPDATE",
            Self::CartClear => "CART_CLEAR",
            Self::NavigateToCart => "NAVIGATE_TO_CART",
            Self::NavigateToCheckout => "NAVIGATE_TO_CHECKOUT",
            Self::GetStoreInfo => "GET_STORE_INFO",
            Self::BridgeStatusRequest => "BRIDGE_STATUS_REQUEST",
            Self::CartUpdated => "CART_UPDATED",
            Self::OpenChatbot => "OPEN_CHATBOT",
            Self::CloseChatbot => "CLOSE_CHATBOT",
            Self::ToggleChat => "TOGGLE_CHAT",
            Self::ClearHistory => "CLEAR_HISTORY",
            Self::ChatbotReady => "CHATBOT_READY",
            Self::ChatbotStateChanged => "CHATBOT_STATE_CHANGED",
            Self::ChatbotResize => "CHATBOT_RESIZE",
        }
    }

    /// Look up a wire name in the allow-list.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Whether this type is a cart operation the bridge performs.
    #[must_use]
    pub const fn is_cart_operation(self) -> bool {
        matches!(
            self,
            Self::CartAddItem | Self::CartGet | Self::CartUpdate | Self::CartClear
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(
        default,
        rename = "messageId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<MessageId>,
}

impl BridgeMessage {
    /// A correlated request with a freshly generated id.
    #[must_use]
    pub fn request(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            message_id: Some(MessageId::generate()),
        }
    }

    /// A fire-and-forget notification.
    #[must_use]
    pub const fn notification(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            message_id: None,
        }
    }
}

/// Error detail carried by a failed [`BridgeResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeErrorBody {
    pub message: String,
    pub code: String,
}

/// Inbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeErrorBody>,
    #[serde(
        default,
        rename = "messageId",
        skip_serializing_if = "Option::is_none"
    )]
    pub message_id: Option<MessageId>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl BridgeResponse {
    /// A successful response.
    #[must_use]
    pub const fn ok(
        kind: MessageType,
        data: Value,
        message_id: Option<MessageId>,
        timestamp: i64,
    ) -> Self {
        Self {
            success: true,
            kind,
            data: Some(data),
            error: None,
            message_id,
            timestamp,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(
        kind: MessageType,
        message: impl Into<String>,
        code: impl Into<String>,
        message_id: Option<MessageId>,
        timestamp: i64,
    ) -> Self {
        Self {
            success: false,
            kind,
            data: None,
            error: Some(BridgeErrorBody {
                message: message.into(),
                code: code.into(),
            }),
            message_id,
            timestamp,
        }
    }
}

/// A raw message as received from the channel, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Origin of the sending window, e.g. `https://widget.example.com`.
    pub origin: String,
    /// Untrusted payload.
    pub data: Value,
}

impl MessageEvent {
    /// Create an event.
    #[must_use]
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
        }
    }
}
