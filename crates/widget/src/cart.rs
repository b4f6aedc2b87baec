//! Widget-side cart operations: bridge first, fallback second.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, instrument};

use storechat_core::{CartResponse, CartUpdates, MessageType};

use crate::broker::{BridgeClient, BridgeError};
use crate::fallback::{FallbackError, FallbackHandler, FallbackOutcome, FallbackRequest};

/// Errors from [`CartService`].
#[derive(Debug, thiserror::Error)]
pub enum CartServiceError {
    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error("unexpected cart payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Runs cart operations through the bridge, handing failures to the
/// fallback until it completes or gives up.
#[derive(Clone)]
pub struct CartService {
    bridge: BridgeClient,
    fallback: Arc<FallbackHandler>,
}

impl CartService {
    #[must_use]
    pub const fn new(bridge: BridgeClient, fallback: Arc<FallbackHandler>) -> Self {
        Self { bridge, fallback }
    }

    /// Add a variant to the cart.
    ///
    /// # Errors
    ///
    /// Returns an error if both the bridge and the fallback fail.
    pub async fn add_item(&self, variant_id: u64, quantity: u32) -> Result<CartResponse, CartServiceError> {
        let payload = json!({ "variantId": variant_id, "quantity": quantity });
        let data = self.execute(MessageType::CartAddItem, payload).await?;
        decode_cart(data)
    }

    /// Fetch the cart.
    ///
    /// # Errors
    ///
    /// Returns an error if both the bridge and the fallback fail.
    pub async fn get_cart(&self) -> Result<CartResponse, CartServiceError> {
        let data = self.execute(MessageType::CartGet, Value::Null).await?;
        decode_cart(data)
    }

    /// Set line quantities.
    ///
    /// # Errors
    ///
    /// Returns an error if both the bridge and the fallback fail.
    pub async fn update_cart(&self, updates: &CartUpdates) -> Result<CartResponse, CartServiceError> {
        let data = self
            .execute(MessageType::CartUpdate, json!({ "updates": updates }))
            .await?;
        decode_cart(data)
    }

    /// Empty the cart.
    ///
    /// # Errors
    ///
    /// Returns an error if both the bridge and the fallback fail.
    pub async fn clear_cart(&self) -> Result<CartResponse, CartServiceError> {
        let data = self.execute(MessageType::CartClear, Value::Null).await?;
        decode_cart(data)
    }

    /// Run one bridge operation and return its `data`.
    ///
    /// # Errors
    ///
    /// Returns the fallback's terminal error.
    #[instrument(skip(self, payload))]
    pub async fn execute(&self, operation: MessageType, payload: Value) -> Result<Value, CartServiceError> {
        if self.fallback.is_active() && self.fallback.begin_probe() {
            self.probe_bridge().await;
        }

        let error = if self.fallback.is_active() {
            // Already degraded; skip straight to the direct path
            BridgeError::Transport("fallback mode active".to_string())
        } else {
            match self.bridge.call(operation, payload.clone()).await {
                Ok(data) => return Ok(data),
                Err(e) => e,
            }
        };

        let mut attempt = 1;
        loop {
            let request = FallbackRequest {
                operation,
                payload: payload.clone(),
                error: error.clone(),
                attempt,
            };
            match self.fallback.handle_fallback(request).await {
                FallbackOutcome::Completed(data) => return Ok(data),
                FallbackOutcome::Retry { original } => {
                    debug!(attempt, error = %original, "Retrying cart fallback");
                    attempt += 1;
                }
                FallbackOutcome::Terminal { error } => return Err(error.into()),
            }
        }
    }

    /// Ask the host page for its status and leave fallback mode if it answers.
    ///
    /// Returns whether the bridge answered.
    pub async fn probe_bridge(&self) -> bool {
        let timeout = self.fallback.config().probe_timeout;
        match self
            .bridge
            .request_within(MessageType::BridgeStatusRequest, json!({}), timeout)
            .await
        {
            Ok(response) if response.success => {
                self.fallback.reset();
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Bridge still unreachable");
                false
            }
        }
    }
}

fn decode_cart(mut data: Value) -> Result<CartResponse, CartServiceError> {
    let cart = data.get_mut("cart").map_or(Value::Null, Value::take);
    Ok(serde_json::from_value(cart)?)
}
