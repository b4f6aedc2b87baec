//! Storechat Core - Shared types and policy library.
//!
//! This crate provides the types and rules shared by every storechat component:
//! - `bridge` - Host-page bridge running on the merchant's storefront origin
//! - `widget` - Chat widget running inside the embedded frame
//! - `proxy` - Backend proxy forwarding chat turns to the automation webhook
//!
//! # Architecture
//!
//! The core crate contains only types, traits and pure decision logic - no
//! HTTP clients, no storage. The security policy lives here so the bridge and
//! the widget validate messages against one allow-list instead of two.
//!
//! # Modules
//!
//! - [`types`] - Cart, chat, bridge wire envelopes, ids and prices
//! - [`security`] - Message validation, origin policy and per-origin rate limiting
//! - [`clock`] - Injectable wall clock for time-based policy

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod clock;
pub mod security;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use security::{
    GuardError, OriginPolicy, RejectionReason, SecurityConfig, SecurityValidator,
    ValidationOutcome, validate_cart_updates, validate_quantity, validate_variant_id,
};
pub use types::*;
