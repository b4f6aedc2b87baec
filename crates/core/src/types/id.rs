//! Newtype IDs for type-safe correlation.
//!
//! Use the `define_id!` macro to create string-backed ID wrappers that prevent
//! accidentally mixing a bridge correlation id with a chat message id.

/// Macro to define a type-safe, string-backed ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`
/// - `generate()` producing `<prefix>_<uuid>` identifiers
/// - `From<String>` and `From<&str>` implementations
///
/// # Example
///
/// ```rust
/// # use storechat_core::define_id;
/// define_id!(TicketId, "tkt");
///
/// let id = TicketId::generate();
/// assert!(id.as_str().starts_with("tkt_"));
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh, random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}_{}", $prefix, ::uuid::Uuid::new_v4().simple()))
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

// Bridge request/response correlation
define_id!(MessageId, "msg");
// Chat turn correlation (X-Request-ID)
define_id!(RequestId, "req");
// Conversation log entries
define_id!(ChatMessageId, "chat");
