//! Storechat Bridge - Cart operations on the merchant's storefront origin.
//!
//! The chat widget lives in a frame on another origin, so it cannot call the
//! store's cart endpoints itself. The bridge runs on the store page, accepts
//! validated requests from the widget and answers each one with a correlated
//! response.
//!
//! # Modules
//!
//! - [`cart`] - Shopify Ajax Cart API client
//! - [`router`] - Inbound message validation, dispatch and `CART_UPDATED` broadcasts
//! - [`frame`] - Traits for the frames and host page the router talks to

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cart;
pub mod frame;
pub mod router;

pub use cart::{CartApiClient, CartClientConfig, CartError};
pub use frame::{ChannelSink, FrameId, FrameSink, HostPage, RecordingHost, RecordingSink};
pub use router::{BRIDGE_VERSION, BridgeConfig, BridgeRouter, FrameState, RouterError, StoreInfo};
