//! Proxy configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CHATBOT_WEBHOOK_URL` - Automation webhook receiving chat turns
//!
//! ## Optional
//! - `CHATBOT_WEBHOOK_TOKEN` - Bearer token sent to the webhook
//! - `PROXY_HOST` - Bind address (default: 127.0.0.1)
//! - `PROXY_PORT` - Listen port (default: 3000)
//! - `WEBHOOK_TIMEOUT_SECS` - Webhook timeout in seconds (default: 15)
//! - `ALLOWED_ORIGINS` - Comma-separated origins allowed to call the proxy
//!   (default: deploy domains and localhost)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use storechat_core::OriginPolicy;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.0;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "xxx",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Proxy application configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Upstream webhook
    pub webhook: WebhookConfig,
    /// Origins allowed by CORS
    pub allowed_origins: OriginPolicy,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Webhook endpoint configuration.
///
/// Implements `Debug` manually to redact the token.
#[derive(Clone)]
pub struct WebhookConfig {
    pub url: Url,
    pub token: Option<SecretString>,
    pub timeout: Duration,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WebhookConfig {
    /// Webhook at `url` with no token and the default timeout.
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            token: None,
            timeout: Duration::from_secs(15),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);

        let host = env
            .or_default("PROXY_HOST", "127.0.0.1")
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidEnvVar("PROXY_HOST".to_string(), e.to_string()))?;
        let port = env
            .or_default("PROXY_PORT", "3000")
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidEnvVar("PROXY_PORT".to_string(), e.to_string()))?;

        let webhook = WebhookConfig::from_env(&env)?;

        let allowed_origins = env
            .optional("ALLOWED_ORIGINS")
            .map(|csv| OriginPolicy::from_csv(&csv))
            .filter(|policy| !policy.entries().is_empty())
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            webhook,
            allowed_origins,
            sentry_dsn: env.optional("SENTRY_DSN"),
            sentry_environment: env.optional("SENTRY_ENVIRONMENT"),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl WebhookConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self, ConfigError> {
        let raw = env.required("CHATBOT_WEBHOOK_URL")?;
        let url = Url::parse(&raw).map_err(|e| {
            ConfigError::InvalidEnvVar("CHATBOT_WEBHOOK_URL".to_string(), e.to_string())
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEnvVar(
                "CHATBOT_WEBHOOK_URL".to_string(),
                format!("unsupported scheme {}", url.scheme()),
            ));
        }

        let token = match env.optional("CHATBOT_WEBHOOK_TOKEN") {
            Some(value) => {
                validate_secret_strength(&value, "CHATBOT_WEBHOOK_TOKEN")?;
                Some(SecretString::from(value))
            }
            None => None,
        };

        let timeout = env
            .or_default("WEBHOOK_TIMEOUT_SECS", "15")
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ConfigError::InvalidEnvVar(
                    "WEBHOOK_TIMEOUT_SECS".to_string(),
                    "must be a positive number of seconds".to_string(),
                )
            })?;

        Ok(Self {
            url,
            token,
            timeout,
        })
    }

    /// Bearer token value, if configured.
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.token.as_ref().map(ExposeSecret::expose_secret)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Get a required variable. Empty values count as missing.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get an optional variable.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    /// Get a variable with a default value.
    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.len() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated token."
            ),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ProxyConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("CHATBOT_WEBHOOK_URL", "https://hooks.example.com/chat")]).unwrap();
        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:3000");
        assert_eq!(config.webhook.timeout, Duration::from_secs(15));
        assert!(config.webhook.token.is_none());
        assert!(config.allowed_origins.is_allowed("http://localhost:3000", None));
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_missing_webhook_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "CHATBOT_WEBHOOK_URL"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("CHATBOT_WEBHOOK_URL", "ftp://hooks.example.com")]),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
        assert!(matches!(
            load(&[
                ("CHATBOT_WEBHOOK_URL", "https://hooks.example.com"),
                ("PROXY_PORT", "http")
            ]),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
        assert!(matches!(
            load(&[
                ("CHATBOT_WEBHOOK_URL", "https://hooks.example.com"),
                ("WEBHOOK_TIMEOUT_SECS", "0")
            ]),
            Err(ConfigError::InvalidEnvVar(_, _))
        ));
    }

    #[test]
    fn test_allowed_origins_from_csv() {
        let config = load(&[
            ("CHATBOT_WEBHOOK_URL", "https://hooks.example.com"),
            ("ALLOWED_ORIGINS", "https://shop.example.com, https://chat.example.com"),
        ])
        .unwrap();
        assert_eq!(config.allowed_origins.entries().len(), 2);
        assert!(config.allowed_origins.is_allowed("https://chat.example.com", None));
        assert!(!config.allowed_origins.is_allowed("https://evil.example.com", None));
    }

    #[test]
    fn test_placeholder_token_is_rejected() {
        let err = load(&[
            ("CHATBOT_WEBHOOK_URL", "https://hooks.example.com"),
            ("CHATBOT_WEBHOOK_TOKEN", "your-token-here"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InsecureSecret(_, _)));
    }

    #[test]
    fn test_shannon_entropy() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("ab") - 1.0).abs() < 0.01);
        assert!(shannon_entropy("aB3$xY9!mK2@nL5#") > 3.3);
    }

    #[test]
    fn test_webhook_debug_redacts_token() {
        let config = load(&[
            ("CHATBOT_WEBHOOK_URL", "https://hooks.example.com/chat"),
            ("CHATBOT_WEBHOOK_TOKEN", "q8Zr2LmX7vKp4TnW9sYd"),
        ])
        .unwrap();

        let debug_output = format!("{:?}", config.webhook);
        assert!(debug_output.contains("hooks.example.com"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("q8Zr2LmX7vKp4TnW9sYd"));
        assert_eq!(config.webhook.bearer(), Some("q8Zr2LmX7vKp4TnW9sYd"));
    }
}
