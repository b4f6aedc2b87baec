//! Shopify Ajax Cart API client.
//!
//! Talks to the storefront's own cart endpoints:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | add | `POST /cart/add.js` |
//! | get | `GET /cart.js` |
//! | update | `POST /cart/update.js` |
//! | clear | `POST /cart/clear.js` |
//!
//! Every mutation finishes with a fresh `GET /cart.js` so callers always see
//! server-confirmed state. Shopify's add endpoint only echoes the added lines,
//! never the cart totals.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use storechat_core::{CartResponse, CartUpdates, ShopifyCart, format_price};

/// Errors that can occur when calling the cart endpoints.
#[derive(Debug, thiserror::Error)]
pub enum CartError {
    /// The store URL could not be parsed or joined.
    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request did not complete within the configured timeout.
    #[error("cart request timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint rejected the HTTP method. Almost always a wrong store URL.
    #[error("cart endpoint {0} returned 405; check the store URL configuration")]
    MethodNotAllowed(String),

    /// The store refused the change (e.g. sold out).
    #[error("cart rejected the request: {0}")]
    Rejected(String),

    /// Any other non-success status.
    #[error("cart endpoint returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: StatusCode,
        /// Truncated response body.
        body: String,
    },

    /// Transport failure.
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response body was not the expected JSON.
    #[error("failed to parse cart response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CartError {
    /// Stable code reported back across the bridge.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) | Self::MethodNotAllowed(_) => "CONFIGURATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Rejected(_) => "CART_REJECTED",
            Self::Status { .. } => "HTTP_ERROR",
            Self::Http(_) => "NETWORK_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
        }
    }

    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Http(_) => true,
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Cart client configuration.
#[derive(Debug, Clone)]
pub struct CartClientConfig {
    /// Storefront base URL, e.g. `https://shop.example.com`.
    pub store_url: String,
    /// Hard timeout per request.
    pub timeout: Duration,
    /// Extra attempts for transient failures.
    pub max_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number.
    pub retry_delay: Duration,
    /// Currency assumed when the cart does not report one.
    pub currency: String,
}

impl CartClientConfig {
    /// Defaults for a store at `store_url`.
    #[must_use]
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
            currency: "USD".to_string(),
        }
    }
}

/// Client for the storefront cart endpoints.
#[derive(Clone, Debug)]
pub struct CartApiClient {
    inner: Arc<CartApiClientInner>,
}

#[derive(Debug)]
struct CartApiClientInner {
    client: reqwest::Client,
    base: Url,
    config: CartClientConfig,
}

impl CartApiClient {
    /// Create a new cart client.
    ///
    /// # Errors
    ///
    /// Returns an error if the store URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: CartClientConfig) -> Result<Self, CartError> {
        let base = Url::parse(&config.store_url)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(CartApiClientInner {
                client,
                base,
                config,
            }),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CartClientConfig {
        &self.inner.config
    }

    /// Add a variant to the cart and return the updated cart.
    ///
    /// # Errors
    ///
    /// Returns an error if either the add or the follow-up fetch fails.
    #[instrument(skip(self))]
    pub async fn add_to_cart(&self, variant_id: u64, quantity: u32) -> Result<CartResponse, CartError> {
        let body = json!({ "items": [{ "id": variant_id, "quantity": quantity }] });
        self.send(Method::POST, "cart/add.js", Some(body)).await?;
        self.get_cart().await
    }

    /// Fetch the current cart.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a cart.
    #[instrument(skip(self))]
    pub async fn get_cart(&self) -> Result<CartResponse, CartError> {
        let raw = self.send(Method::GET, "cart.js", None).await?;
        let cart: ShopifyCart = serde_json::from_value(raw)?;
        let cart = CartResponse::from_shopify(&cart, &self.inner.config.currency);
        if cart.has_count_drift() {
            debug!(
                item_count = cart.item_count,
                line_total = cart.line_item_count(),
                "Cart item_count differs from line quantities"
            );
        }
        Ok(cart)
    }

    /// Set line quantities (0 removes a line) and return the updated cart.
    ///
    /// # Errors
    ///
    /// Returns an error if either the update or the follow-up fetch fails.
    #[instrument(skip(self, updates), fields(lines = updates.len()))]
    pub async fn update_cart(&self, updates: &CartUpdates) -> Result<CartResponse, CartError> {
        let body = json!({ "updates": updates });
        self.send(Method::POST, "cart/update.js", Some(body)).await?;
        self.get_cart().await
    }

    /// Empty the cart and return the (empty) cart.
    ///
    /// # Errors
    ///
    /// Returns an error if either the clear or the follow-up fetch fails.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self) -> Result<CartResponse, CartError> {
        self.send(Method::POST, "cart/clear.js", Some(json!({}))).await?;
        self.get_cart().await
    }

    /// Format minor units in the client's default currency.
    #[must_use]
    pub fn format_price(&self, minor_units: i64) -> String {
        format_price(minor_units, &self.inner.config.currency)
    }

    /// Absolute URL for a storefront path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined onto the store URL.
    pub fn url(&self, path: &str) -> Result<Url, CartError> {
        Ok(self.inner.base.join(path.trim_start_matches('/'))?)
    }

    /// Send a request, retrying transient failures with linear back-off.
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, CartError> {
        let url = self.url(path)?;
        let max_retries = self.inner.config.max_retries;
        let mut attempt = 0;

        loop {
            match self.send_once(method.clone(), url.clone(), body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, url = %url, "Cart request failed, retrying");
                    tokio::time::sleep(self.inner.config.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, CartError> {
        let mut request = self
            .inner
            .client
            .request(method, url.clone())
            .header("Accept", "application/json")
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_transport(e))?;

        if status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(CartError::MethodNotAllowed(url.to_string()));
        }

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let description = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| {
                    v.get("description")
                        .or_else(|| v.get("message"))
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or_else(|| "Cart Error".to_string());
            return Err(CartError::Rejected(description));
        }

        if !status.is_success() {
            return Err(CartError::Status {
                status,
                body: text.chars().take(200).collect(),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn map_transport(&self, error: reqwest::Error) -> CartError {
        if error.is_timeout() {
            CartError::Timeout(self.inner.config.timeout)
        } else {
            CartError::Http(error)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls_join_onto_store() {
        let client = CartApiClient::new(CartClientConfig::new("https://shop.example.com")).unwrap();
        assert_eq!(
            client.url("cart/add.js").unwrap().as_str(),
            "https://shop.example.com/cart/add.js"
        );
        assert_eq!(
            client.url("/cart.js").unwrap().as_str(),
            "https://shop.example.com/cart.js"
        );
    }

    #[test]
    fn test_invalid_store_url() {
        let err = CartApiClient::new(CartClientConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, CartError::InvalidUrl(_)));
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CartError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(
            CartError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!CartError::MethodNotAllowed("x".to_string()).is_transient());
        assert!(!CartError::Rejected("sold out".to_string()).is_transient());
        assert!(
            !CartError::Status {
                status: StatusCode::NOT_FOUND,
                body: String::new()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_format_price_uses_default_currency() {
        let mut config = CartClientConfig::new("https://shop.example.com");
        config.currency = "GBP".to_string();
        let client = CartApiClient::new(config).unwrap();
        assert_eq!(client.format_price(1000), "£10.00");
    }
}
