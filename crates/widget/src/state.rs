//! Persisted widget state.
//!
//! One JSON blob under [`STATE_KEY`] survives page navigation and reloads.
//! Expiry is enforced on read: a blob older than [`STATE_TTL`] is deleted
//! the next time anyone loads it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use storechat_core::{ChatState, Clock, Message, UserProfile};

use crate::storage::{Storage, StorageError};

/// Storage key of the chat state blob.
pub const STATE_KEY: &str = "storechat_state";

/// Storage key of the onboarding profile. Never expires.
pub const USER_KEY: &str = "storechat_user";

/// Inactivity after which stored state is discarded.
pub const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from saving widget state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reads and writes [`ChatState`].
///
/// Without a storage backend every operation is a no-op and loads return
/// `None`.
#[derive(Clone)]
pub struct ChatStateService {
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
}

impl ChatStateService {
    /// Create a service over `storage`.
    #[must_use]
    pub fn new(storage: Option<Arc<dyn Storage>>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Whether a storage backend is attached.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.storage.is_some()
    }

    /// Persist `state`, stamping `last_activity` with the current time.
    ///
    /// A stored `manually_closed` flag is carried over when `state` has none,
    /// so an auto-save from a stale render cannot undo an explicit close.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized or written.
    pub fn save_state(&self, state: &ChatState) -> Result<(), StateError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        let mut stamped = state.clone();
        stamped.last_activity = self.clock.now_ms();
        if stamped.manually_closed.is_none() {
            stamped.manually_closed = self.read_state().and_then(|s| s.manually_closed);
        }

        storage.set(STATE_KEY, &serde_json::to_string(&stamped)?)?;
        Ok(())
    }

    /// Load the stored state.
    ///
    /// Returns `None` when nothing is stored, the blob is unreadable, or it
    /// has expired (in which case it is also removed). Malformed `messages`
    /// and `isOpen` fields are coerced to empty and `false`.
    #[must_use]
    pub fn load_state(&self) -> Option<ChatState> {
        let state = self.read_state()?;
        let age = self.clock.now_ms().saturating_sub(state.last_activity);
        if age > i64::try_from(STATE_TTL.as_millis()).unwrap_or(i64::MAX) {
            debug!(age_ms = age, "Chat state expired");
            self.clear_state();
            return None;
        }
        Some(state)
    }

    /// Whether the widget should reopen on mount.
    #[must_use]
    pub fn should_auto_reopen(&self) -> bool {
        self.load_state()
            .is_some_and(|s| s.is_open && s.manually_closed != Some(true))
    }

    /// Delete the stored state.
    pub fn clear_state(&self) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.remove(STATE_KEY)
        {
            warn!(error = %e, "Failed to remove chat state");
        }
    }

    /// Record that the shopper closed the widget.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn mark_manually_closed(&self) -> Result<(), StateError> {
        let mut state = self.load_state().unwrap_or_default();
        state.is_open = false;
        state.manually_closed = Some(true);
        self.save_state(&state)
    }

    /// Record that the shopper opened the widget.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    pub fn mark_opened(&self) -> Result<(), StateError> {
        let mut state = self.load_state().unwrap_or_default();
        state.is_open = true;
        state.manually_closed = Some(false);
        self.save_state(&state)
    }

    // =========================================================================
    // Onboarding profile
    // =========================================================================

    /// Persist the onboarding profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be serialized or written.
    pub fn save_user(&self, user: &UserProfile) -> Result<(), StateError> {
        if let Some(storage) = &self.storage {
            storage.set(USER_KEY, &serde_json::to_string(user)?)?;
        }
        Ok(())
    }

    /// Load the onboarding profile.
    #[must_use]
    pub fn load_user(&self) -> Option<UserProfile> {
        let raw = self.read_raw(USER_KEY)?;
        serde_json::from_str(&raw)
            .inspect_err(|e| warn!(error = %e, "Discarding unreadable user profile"))
            .ok()
    }

    /// Delete the onboarding profile.
    pub fn clear_user(&self) {
        if let Some(storage) = &self.storage
            && let Err(e) = storage.remove(USER_KEY)
        {
            warn!(error = %e, "Failed to remove user profile");
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn read_raw(&self, key: &str) -> Option<String> {
        let storage = self.storage.as_ref()?;
        storage
            .get(key)
            .inspect_err(|e| warn!(error = %e, key, "Failed to read storage"))
            .ok()
            .flatten()
    }

    /// Read the blob without expiry, coercing malformed fields.
    fn read_state(&self) -> Option<ChatState> {
        let raw = self.read_raw(STATE_KEY)?;
        let value: Value = match serde_json::from_str(&raw) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => {
                warn!("Discarding unreadable chat state");
                return None;
            }
        };

        let messages = match value.get("messages") {
            Some(Value::Array(entries)) => decode_messages(entries),
            _ => Vec::new(),
        };

        Some(ChatState {
            messages,
            is_open: value.get("isOpen").and_then(Value::as_bool).unwrap_or(false),
            // A blob without a timestamp counts as expired
            last_activity: value.get("lastActivity").and_then(Value::as_i64).unwrap_or(0),
            manually_closed: value.get("manuallyClosed").and_then(Value::as_bool),
        })
    }
}

/// Decode each entry on its own, skipping the ones that no longer parse.
fn decode_messages(entries: &[Value]) -> Vec<Message> {
    let messages: Vec<Message> = entries
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect();
    if messages.len() < entries.len() {
        warn!(
            skipped = entries.len() - messages.len(),
            "Dropped unreadable chat messages"
        );
    }
    messages
}
