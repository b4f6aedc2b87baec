//! Application state shared across handlers.

use std::sync::Arc;

use crate::config::ProxyConfig;

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`; holds the configuration and one pooled
/// HTTP client for the webhook.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ProxyConfig,
    http: reqwest::Client,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Create a state around an existing HTTP client.
    #[must_use]
    pub fn with_client(config: ProxyConfig, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, http }),
        }
    }

    /// Get a reference to the proxy configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Get the HTTP client used for webhook calls.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }
}
