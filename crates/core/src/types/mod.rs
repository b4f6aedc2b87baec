//! Core types for storechat.
//!
//! This module provides the data model shared across the bridge, the widget
//! and the proxy.

pub mod bridge;
pub mod cart;
pub mod chat;
pub mod id;
pub mod price;

pub use bridge::{BridgeErrorBody, BridgeMessage, BridgeResponse, MessageEvent, MessageType};
pub use cart::{CartItem, CartResponse, CartUpdates, ShopifyCart, ShopifyLineItem};
pub use chat::{
    CardVariant, ChatRequest, ChatResponse, ChatState, Message, MessageKind, Order, OrderItem,
    ProductCard, RequestKind, UserProfile,
};
pub use id::*;
pub use price::{PriceFormatError, format_price};
