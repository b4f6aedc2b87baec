//! Storechat Widget - Services behind the embedded chat frame.
//!
//! # Modules
//!
//! - [`storage`] - Key-value persistence (memory or files)
//! - [`state`] - Persisted widget state with a 24 hour expiry
//! - [`delivery`] - Chat turns with retry, error classification and toasts
//! - [`broker`] - Correlated requests to the host-page bridge
//! - [`fallback`] - Direct cart calls when the bridge is unavailable
//! - [`cart`] - Bridge-first cart operations with fallback

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod broker;
pub mod cart;
pub mod delivery;
pub mod fallback;
pub mod state;
pub mod storage;

pub use broker::{BridgeClient, BridgeClientConfig, BridgeError, BridgeEvent, BridgeTransport};
pub use cart::{CartService, CartServiceError};
pub use delivery::{
    ChatDeliveryService, DeliveryConfig, DeliveryError, LogNotifier, Notifier, RecordingNotifier,
    RetryPolicy, Toast, ToastLevel,
};
pub use fallback::{
    CART_CACHE_KEY, FallbackConfig, FallbackError, FallbackHandler, FallbackOutcome,
    FallbackRequest,
};
pub use state::{ChatStateService, STATE_KEY, STATE_TTL, StateError, USER_KEY};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
