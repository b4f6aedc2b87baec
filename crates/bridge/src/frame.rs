//! Handles to the windows the bridge talks to.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

/// Identifier of a registered chatbot frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame-{}", self.0)
    }
}

/// A window that can receive posted messages.
pub trait FrameSink: Send + Sync {
    /// Deliver `message` to the window, restricted to `target_origin`.
    fn post_message(&self, message: Value, target_origin: &str);
}

/// The page the bridge is embedded in.
pub trait HostPage: Send + Sync {
    /// Send the shopper to an absolute storefront URL.
    fn navigate(&self, url: &str);
}

/// A sink that forwards posted messages into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(Value, String)>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Value, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn post_message(&self, message: Value, target_origin: &str) {
        // A closed receiver means the frame is gone
        let _ = self.tx.send((message, target_origin.to_string()));
    }
}

/// A sink that keeps every posted message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    posted: Mutex<Vec<(Value, String)>>,
}

impl RecordingSink {
    /// Messages posted so far with their target origin.
    #[must_use]
    pub fn messages(&self) -> Vec<(Value, String)> {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FrameSink for RecordingSink {
    fn post_message(&self, message: Value, target_origin: &str) {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((message, target_origin.to_string()));
    }
}

/// A host page that records navigation requests.
#[derive(Debug, Default)]
pub struct RecordingHost {
    visited: Mutex<Vec<String>>,
}

impl RecordingHost {
    /// URLs navigated to so far.
    #[must_use]
    pub fn visited(&self) -> Vec<String> {
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HostPage for RecordingHost {
    fn navigate(&self, url: &str) {
        self.visited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
    }
}
