//! Outbound chat turns.
//!
//! A turn moves `composing → sent → awaiting-response` and ends
//! `delivered` or `failed`, retrying in between:
//!
//! - the shopper's message is appended before any network I/O
//! - attempt `n` waits up to `n × base_timeout`; retries back off `n × base_backoff`
//! - intermediate failures are only logged
//! - after the last failed attempt exactly one bot error message is appended
//!   and exactly one toast is shown
//!
//! Turns are delivered in send order: a fair async gate lets one round-trip
//! run at a time, so replies are appended in the order messages were sent.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::seq::IndexedRandom;
use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};
use url::Url;

use storechat_core::{ChatRequest, ChatResponse, ChatState, Message, RequestId};

use crate::state::ChatStateService;

/// Header carrying the per-turn correlation id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Content of the log entry recorded for a voice turn.
pub const VOICE_PLACEHOLDER: &str = "[voice message]";

const PREVIEW_REPLIES: [&str; 4] = [
    "Thanks for your message! This is a preview, so I can't look anything up yet.",
    "Great question! Once the store is connected I'll be able to help with that.",
    "I'm running in preview mode. Live product answers appear after setup.",
    "Hello! This preview shows how conversations will look on your store.",
];

/// Errors from delivering a chat turn.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("invalid chat endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP 401: {0}")]
    Unauthorized(String),

    #[error("HTTP 422: {0}")]
    InvalidFormat(String),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid chat response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::Decode(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::EmptyMessage
            | Self::InvalidEndpoint(_)
            | Self::Unauthorized(_)
            | Self::InvalidFormat(_) => false,
        }
    }

    /// Text shown to the shopper when this error ends a turn.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout => "The request timed out. Please try again.",
            Self::Unauthorized(_) => {
                "Authentication error. Please refresh the page and try again."
            }
            Self::InvalidFormat(_) | Self::EmptyMessage => {
                "Invalid message format. Please try rephrasing your message."
            }
            _ => "Sorry, I'm having trouble connecting right now. Please try again in a moment.",
        }
    }
}

/// Attempt count and per-attempt timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` times out after `n × base_timeout`.
    pub base_timeout: Duration,
    /// The wait after attempt `n` is `n × base_backoff`.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout: Duration::from_secs(15),
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.base_timeout * attempt
    }

    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff * attempt
    }
}

/// Delivery configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Absolute URL of the proxy's chat endpoint.
    pub endpoint: String,
    pub retry: RetryPolicy,
    /// Answer locally with canned replies instead of calling the proxy.
    pub preview_mode: bool,
    pub preview_delay: Duration,
    /// Shopify visitor cookie forwarded with each turn.
    pub shopify_y: Option<String>,
    pub cart_currency: Option<String>,
    pub localization: Option<String>,
}

impl DeliveryConfig {
    /// Defaults for a proxy at `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
            preview_mode: false,
            preview_delay: Duration::from_millis(1500),
            shopify_y: None,
            cart_currency: None,
            localization: None,
        }
    }
}

// =============================================================================
// Toasts
// =============================================================================

/// Severity of a toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Error,
}

/// A transient notification for the shopper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }
}

/// Displays toasts.
pub trait Notifier: Send + Sync {
    fn notify(&self, toast: Toast);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, toast: Toast) {
        info!(level = ?toast.level, message = %toast.message, "Toast");
    }
}

/// Notifier that keeps every toast in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<Toast>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, toast: Toast) {
        self.toasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(toast);
    }
}

// =============================================================================
// Service
// =============================================================================

/// Sends chat turns and keeps the conversation log. Cheap to clone.
#[derive(Clone)]
pub struct ChatDeliveryService {
    inner: Arc<DeliveryInner>,
}

struct DeliveryInner {
    client: reqwest::Client,
    endpoint: Url,
    config: DeliveryConfig,
    state: ChatStateService,
    notifier: Arc<dyn Notifier>,
    conversation: Mutex<ChatState>,
    gate: tokio::sync::Mutex<()>,
}

impl ChatDeliveryService {
    /// Create a service, restoring any persisted conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(
        config: DeliveryConfig,
        state: ChatStateService,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, DeliveryError> {
        let endpoint = Url::parse(&config.endpoint)?;
        let client = reqwest::Client::builder().build()?;
        let conversation = state.load_state().unwrap_or_default();
        if !conversation.messages.is_empty() {
            debug!(messages = conversation.messages.len(), "Restored conversation");
        }

        Ok(Self {
            inner: Arc::new(DeliveryInner {
                client,
                endpoint,
                config,
                state,
                notifier,
                conversation: Mutex::new(conversation),
                gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Snapshot of the conversation log.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.conversation().messages.clone()
    }

    /// Snapshot of the widget state.
    #[must_use]
    pub fn state(&self) -> ChatState {
        self.conversation().clone()
    }

    /// Open or close the widget. Closing this way counts as a manual close.
    pub fn set_open(&self, open: bool) {
        {
            let mut conversation = self.conversation();
            conversation.is_open = open;
            conversation.manually_closed = Some(!open);
        }
        self.persist();
    }

    /// Empty the conversation log.
    pub fn clear_history(&self) {
        self.conversation().messages.clear();
        self.persist_messages();
    }

    /// Send a text turn.
    ///
    /// The shopper's message is in the log before this returns, whatever the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the turn. The failure has already been
    /// reported to the shopper.
    #[instrument(skip(self, text))]
    pub async fn send_message(&self, text: &str) -> Result<Message, DeliveryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }

        self.append(Message::user(text));
        if self.inner.config.preview_mode {
            return Ok(self.preview_reply().await);
        }

        let request = self.with_context(ChatRequest::text(text));
        self.deliver(&request).await
    }

    /// Send a voice turn carrying base64 audio.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the turn.
    #[instrument(skip(self, audio_data))]
    pub async fn send_voice(&self, audio_data: &str) -> Result<Message, DeliveryError> {
        if audio_data.is_empty() {
            return Err(DeliveryError::EmptyMessage);
        }

        self.append(Message::user(VOICE_PLACEHOLDER));
        if self.inner.config.preview_mode {
            return Ok(self.preview_reply().await);
        }

        let request = self.with_context(ChatRequest::voice(audio_data, Utc::now()));
        self.deliver(&request).await
    }

    async fn deliver(&self, request: &ChatRequest) -> Result<Message, DeliveryError> {
        let _turn = self.inner.gate.lock().await;

        let policy = self.inner.config.retry;
        let request_id = RequestId::generate();
        let mut attempt = 1;

        let error = loop {
            match self.attempt(request, &request_id, policy.timeout_for(attempt)).await {
                Ok(response) => {
                    let message = Message::from_response(response);
                    self.append(message.clone());
                    return Ok(message);
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    warn!(error = %e, attempt, request_id = %request_id, "Chat attempt failed, retrying");
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        warn!(error = %error, attempt, request_id = %request_id, "Chat turn failed");
        let user_message = error.user_message();
        self.append(Message::bot(user_message));
        self.inner.notifier.notify(Toast::error(user_message));
        Err(error)
    }

    async fn attempt(
        &self,
        request: &ChatRequest,
        request_id: &RequestId,
        timeout: Duration,
    ) -> Result<ChatResponse, DeliveryError> {
        let response = self
            .inner
            .client
            .post(self.inner.endpoint.clone())
            .header(REQUEST_ID_HEADER, request_id.as_str())
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        match status {
            StatusCode::UNAUTHORIZED => Err(DeliveryError::Unauthorized(body)),
            StatusCode::UNPROCESSABLE_ENTITY => Err(DeliveryError::InvalidFormat(body)),
            s if !s.is_success() => Err(DeliveryError::Status { status: s, body }),
            _ => Ok(serde_json::from_str(&body)?),
        }
    }

    async fn preview_reply(&self) -> Message {
        tokio::time::sleep(self.inner.config.preview_delay).await;
        let reply = {
            let mut rng = rand::rng();
            PREVIEW_REPLIES
                .choose(&mut rng)
                .copied()
                .unwrap_or(PREVIEW_REPLIES[0])
        };
        let message = Message::bot(reply);
        self.append(message.clone());
        message
    }

    fn with_context(&self, mut request: ChatRequest) -> ChatRequest {
        let config = &self.inner.config;
        request.shopify_y.clone_from(&config.shopify_y);
        request.cart_currency.clone_from(&config.cart_currency);
        request.localization.clone_from(&config.localization);
        request.user = self.inner.state.load_user();
        request
    }

    fn append(&self, message: Message) {
        self.conversation().messages.push(message);
        self.persist_messages();
    }

    /// Save the log, taking the open and closed flags from storage. Another
    /// component may have recorded a close since this service last wrote.
    fn persist_messages(&self) {
        if let Some(stored) = self.inner.state.load_state() {
            let mut conversation = self.conversation();
            conversation.is_open = stored.is_open;
            conversation.manually_closed = stored.manually_closed;
        }
        self.persist();
    }

    fn persist(&self) {
        let snapshot = self.conversation().clone();
        if let Err(e) = self.inner.state.save_state(&snapshot) {
            warn!(error = %e, "Failed to persist chat state");
        }
    }

    fn conversation(&self) -> std::sync::MutexGuard<'_, ChatState> {
        self.inner
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn classify_transport(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Network(error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use storechat_core::{ManualClock, MessageKind};

    fn service(config: DeliveryConfig) -> (ChatDeliveryService, Arc<RecordingNotifier>) {
        let state = ChatStateService::new(
            Some(Arc::new(MemoryStorage::new())),
            Arc::new(ManualClock::new(1_000)),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let service = ChatDeliveryService::new(config, state, notifier.clone()).unwrap();
        (service, notifier)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_timeout: Duration::from_millis(200),
            base_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_retry_policy_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_for(1), Duration::from_secs(15));
        assert_eq!(policy.timeout_for(3), Duration::from_secs(45));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
    }

    #[test]
    fn test_error_classification() {
        assert!(DeliveryError::Timeout.user_message().contains("timed out"));
        assert!(
            DeliveryError::Unauthorized(String::new())
                .user_message()
                .contains("refresh")
        );
        assert!(
            DeliveryError::InvalidFormat(String::new())
                .user_message()
                .contains("Invalid message format")
        );
        assert!(!DeliveryError::Unauthorized(String::new()).is_retryable());
        assert!(
            DeliveryError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: String::new()
            }
            .is_retryable()
        );
    }

    #[tokio::test]
    async fn test_persistent_network_failure_reports_once() {
        let mut config = DeliveryConfig::new("http://127.0.0.1:9/api/chat");
        config.retry = fast_policy();
        let (service, notifier) = service(config);

        let err = service.send_message("hello").await.unwrap_err();
        assert!(err.is_retryable());

        let messages = service.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].kind, MessageKind::Bot);
        assert_eq!(messages[1].content, err.user_message());
        assert_eq!(notifier.toasts().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_without_side_effects() {
        let (service, notifier) = service(DeliveryConfig::new("http://127.0.0.1:9/api/chat"));
        assert!(matches!(
            service.send_message("   ").await,
            Err(DeliveryError::EmptyMessage)
        ));
        assert!(service.messages().is_empty());
        assert!(notifier.toasts().is_empty());
    }

    #[tokio::test]
    async fn test_preview_mode_answers_locally() {
        let mut config = DeliveryConfig::new("http://127.0.0.1:9/api/chat");
        config.preview_mode = true;
        config.preview_delay = Duration::from_millis(1);
        let (service, notifier) = service(config);

        let reply = service.send_message("hi").await.unwrap();
        assert_eq!(reply.kind, MessageKind::Bot);
        assert!(PREVIEW_REPLIES.contains(&reply.content.as_str()));
        assert_eq!(service.messages().len(), 2);
        assert!(notifier.toasts().is_empty());
    }

    #[tokio::test]
    async fn test_clear_history_and_open_flag_are_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let state = ChatStateService::new(Some(storage.clone()), clock.clone());
        let mut config = DeliveryConfig::new("http://127.0.0.1:9/api/chat");
        config.preview_mode = true;
        config.preview_delay = Duration::from_millis(1);

        let service =
            ChatDeliveryService::new(config.clone(), state.clone(), Arc::new(LogNotifier)).unwrap();
        service.send_message("hi").await.unwrap();
        service.set_open(true);

        // A new page load restores the conversation
        let restored = ChatDeliveryService::new(config, state.clone(), Arc::new(LogNotifier)).unwrap();
        assert_eq!(restored.messages().len(), 2);
        assert!(state.should_auto_reopen());

        restored.clear_history();
        restored.set_open(false);
        let saved = state.load_state().unwrap();
        assert!(saved.messages.is_empty());
        assert_eq!(saved.manually_closed, Some(true));
        assert!(!state.should_auto_reopen());
    }

    #[tokio::test]
    async fn test_new_message_keeps_close_recorded_elsewhere() {
        let storage = Arc::new(MemoryStorage::new());
        let state = ChatStateService::new(Some(storage), Arc::new(ManualClock::new(1_000)));
        let mut config = DeliveryConfig::new("http://127.0.0.1:9/api/chat");
        config.preview_mode = true;
        config.preview_delay = Duration::from_millis(1);
        let service = ChatDeliveryService::new(config, state.clone(), Arc::new(LogNotifier)).unwrap();

        service.set_open(true);
        assert!(state.should_auto_reopen());

        // The launcher records the close without going through this service
        state.mark_manually_closed().unwrap();
        service.send_message("hi").await.unwrap();

        assert!(!state.should_auto_reopen());
        let saved = state.load_state().unwrap();
        assert_eq!(saved.messages.len(), 2);
        assert_eq!(saved.manually_closed, Some(true));
        assert!(!service.state().is_open);
    }
}
