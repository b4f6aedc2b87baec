//! Request/response broker over the cross-frame channel.
//!
//! The channel only carries one-way messages. [`BridgeClient::request`]
//! turns it into an RPC: it registers a pending entry keyed by `messageId`,
//! posts the request and waits for the matching response or its own
//! timeout. Responses arrive separately through
//! [`BridgeClient::handle_incoming`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, instrument, warn};

use storechat_core::{
    BridgeMessage, BridgeResponse, CartResponse, Clock, MessageEvent, MessageId, MessageType,
    SecurityConfig, SecurityValidator,
};

/// Errors from a bridge round-trip.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge request {kind} timed out after {timeout:?}")]
    Timeout { kind: MessageType, timeout: Duration },

    #[error("failed to post bridge message: {0}")]
    Transport(String),

    #[error("bridge request {kind} failed: {message} ({code})")]
    Rejected {
        kind: MessageType,
        message: String,
        code: String,
    },

    #[error("bridge client shut down before {0} was answered")]
    Cancelled(MessageType),
}

impl BridgeError {
    /// Whether the host page never answered, as opposed to answering with a
    /// failure.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// The outbound half of the channel to the host page.
pub trait BridgeTransport: Send + Sync {
    /// Post a request to the host page.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be handed to the channel.
    fn post(&self, message: &BridgeMessage) -> Result<(), BridgeError>;
}

/// Unsolicited messages from the host page.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The cart changed outside the widget.
    CartUpdated(CartResponse),
    /// The host asked the widget to open, close, toggle, or clear history.
    Control(MessageType),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BridgeClientConfig {
    /// How long a request waits for its response.
    pub timeout: Duration,
    /// Policy for inbound messages. Responses come from the trusted host,
    /// so payloads are not HTML-escaped by default.
    pub security: SecurityConfig,
    /// Origin of the widget frame itself.
    pub own_origin: Option<String>,
}

impl Default for BridgeClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            security: SecurityConfig {
                sanitize: false,
                ..SecurityConfig::default()
            },
            own_origin: None,
        }
    }
}

type Pending = Mutex<HashMap<MessageId, (MessageType, oneshot::Sender<BridgeResponse>)>>;

/// Widget-side bridge client. Cheap to clone.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<BridgeClientInner>,
}

struct BridgeClientInner {
    transport: Arc<dyn BridgeTransport>,
    validator: SecurityValidator,
    timeout: Duration,
    pending: Pending,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeClient {
    /// Create a client posting through `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BridgeTransport>,
        config: BridgeClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(BridgeClientInner {
                transport,
                validator: SecurityValidator::new(config.security, config.own_origin, clock),
                timeout: config.timeout,
                pending: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// Returns an error if posting fails or no response arrives in time. A
    /// response with `success: false` is returned as-is.
    pub async fn request(
        &self,
        kind: MessageType,
        payload: Value,
    ) -> Result<BridgeResponse, BridgeError> {
        self.request_within(kind, payload, self.inner.timeout).await
    }

    /// [`Self::request`] with its own timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if posting fails or no response arrives in time.
    #[instrument(skip(self, payload))]
    pub async fn request_within(
        &self,
        kind: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> Result<BridgeResponse, BridgeError> {
        let message = BridgeMessage::request(kind, payload);
        let id = message
            .message_id
            .clone()
            .unwrap_or_else(MessageId::generate);

        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), (kind, tx));
        let _guard = PendingGuard {
            client: self,
            id: &id,
        };

        self.inner.transport.post(&message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Cancelled(kind)),
            Err(_) => {
                warn!(%kind, message_id = %id, "Bridge request timed out");
                Err(BridgeError::Timeout { kind, timeout })
            }
        }
    }

    /// Send a request and return its `data`, turning failures into errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the round-trip fails or the host reports failure.
    pub async fn call(&self, kind: MessageType, payload: Value) -> Result<Value, BridgeError> {
        let response = self.request(kind, payload).await?;
        if response.success {
            return Ok(response.data.unwrap_or(Value::Null));
        }
        let (message, code) = response.error.map_or_else(
            || ("unknown error".to_string(), "UNKNOWN".to_string()),
            |e| (e.message, e.code),
        );
        Err(BridgeError::Rejected {
            kind,
            message,
            code,
        })
    }

    /// Route a message received from the host page.
    ///
    /// Returns `false` when the message was rejected by the security policy
    /// or matched nothing.
    pub fn handle_incoming(&self, event: &MessageEvent) -> bool {
        // Replies to our own requests are not counted against the host's budget
        let outcome = if self.is_pending_reply(&event.data) {
            self.inner.validator.validate_reply_event(event)
        } else {
            self.inner.validator.validate_message_event(event)
        };
        let Some(data) = outcome.sanitized_payload else {
            debug!(reason = ?outcome.reason, origin = %event.origin, "Dropping inbound message");
            return false;
        };

        // Responses carry `success`; host-initiated messages do not
        if data.get("success").is_some() {
            return match serde_json::from_value::<BridgeResponse>(data) {
                Ok(response) => self.resolve(response),
                Err(e) => {
                    debug!(error = %e, "Malformed bridge response");
                    false
                }
            };
        }

        match serde_json::from_value::<BridgeMessage>(data) {
            Ok(message) => match message.kind {
                MessageType::OpenChatbot
                | MessageType::CloseChatbot
                | MessageType::ToggleChat
                | MessageType::ClearHistory => {
                    let _ = self.inner.events.send(BridgeEvent::Control(message.kind));
                    true
                }
                other => {
                    debug!(kind = %other, "Ignoring host message");
                    false
                }
            },
            Err(e) => {
                debug!(error = %e, "Malformed host message");
                false
            }
        }
    }

    fn is_pending_reply(&self, data: &Value) -> bool {
        data.get("success").is_some()
            && data
                .get("messageId")
                .and_then(Value::as_str)
                .is_some_and(|id| self.pending().contains_key(&MessageId::new(id)))
    }

    fn resolve(&self, response: BridgeResponse) -> bool {
        let Some(id) = response.message_id.clone() else {
            if response.kind == MessageType::CartUpdated {
                return self.publish_cart(&response);
            }
            debug!(kind = %response.kind, "Uncorrelated response ignored");
            return false;
        };

        let Some((_, tx)) = self.pending().remove(&id) else {
            debug!(message_id = %id, "No pending request for response");
            return false;
        };
        // The requester may have given up already
        tx.send(response).is_ok()
    }

    fn publish_cart(&self, response: &BridgeResponse) -> bool {
        let cart = response
            .data
            .as_ref()
            .and_then(|d| d.get("cart"))
            .cloned()
            .and_then(|c| serde_json::from_value::<CartResponse>(c).ok());
        match cart {
            Some(cart) => {
                let _ = self.inner.events.send(BridgeEvent::CartUpdated(cart));
                true
            }
            None => {
                debug!("CART_UPDATED without a cart");
                false
            }
        }
    }

    /// Subscribe to unsolicited host messages.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<MessageId, (MessageType, oneshot::Sender<BridgeResponse>)>>
    {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a pending entry however the request future ends.
struct PendingGuard<'a> {
    client: &'a BridgeClient,
    id: &'a MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.pending().remove(self.id);
    }
}
