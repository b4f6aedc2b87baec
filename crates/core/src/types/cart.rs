//! Cart types.
//!
//! [`ShopifyCart`] mirrors the JSON returned by the storefront's Ajax Cart
//! API (`/cart.js`). [`CartResponse`] is the normalized shape handed to the
//! widget. It is recomputed on every fetch and never stored as a source of
//! truth.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::price::format_price;

/// Quantity updates keyed by variant id or line item key (`/cart/update.js`).
pub type CartUpdates = BTreeMap<String, u32>;

/// Raw cart as returned by `GET /cart.js`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShopifyCart {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub items: Vec<ShopifyLineItem>,
    #[serde(default)]
    pub item_count: u32,
    /// Total in minor currency units.
    #[serde(default)]
    pub total_price: i64,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Raw line item inside a [`ShopifyCart`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShopifyLineItem {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub variant_id: u64,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub product_title: Option<String>,
    /// Unit price in minor currency units.
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub featured_image: Option<FeaturedImage>,
}

/// Featured image attached to a line item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturedImage {
    #[serde(default)]
    pub url: Option<String>,
}

/// A normalized cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: String,
    pub variant_id: u64,
    pub quantity: u32,
    pub name: String,
    /// Unit price, already formatted for display.
    pub price: String,
    pub image: Option<String>,
}

/// Normalized cart returned by every cart operation.
///
/// `item_count` is reported by the store and is expected to equal the sum of
/// line quantities. Callers must tolerate drift; see [`Self::has_count_drift`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartResponse {
    pub items: Vec<CartItem>,
    /// Total in minor currency units.
    pub total_price: i64,
    pub item_count: u32,
    pub currency: String,
}

impl CartResponse {
    /// An empty cart in the given currency.
    #[must_use]
    pub fn empty(currency: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            total_price: 0,
            item_count: 0,
            currency: currency.into(),
        }
    }

    /// Normalize a raw Shopify cart.
    #[must_use]
    pub fn from_shopify(cart: &ShopifyCart, default_currency: &str) -> Self {
        let currency = cart
            .currency
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| default_currency.to_string());

        Self {
            items: cart
                .items
                .iter()
                .map(|item| CartItem::from_shopify(item, &currency))
                .collect(),
            total_price: cart.total_price,
            item_count: cart.item_count,
            currency,
        }
    }

    /// Sum of line quantities.
    #[must_use]
    pub fn line_item_count(&self) -> u32 {
        self.items.iter().map(|i| i.quantity).sum()
    }

    /// Whether the store-reported `item_count` disagrees with the lines.
    #[must_use]
    pub fn has_count_drift(&self) -> bool {
        self.line_item_count() != self.item_count
    }

    /// Formatted cart total.
    #[must_use]
    pub fn formatted_total(&self) -> String {
        format_price(self.total_price, &self.currency)
    }
}

impl CartItem {
    /// Normalize a raw Shopify line item.
    #[must_use]
    pub fn from_shopify(item: &ShopifyLineItem, currency: &str) -> Self {
        let id = item
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| item.id.to_string());
        let name = item
            .product_title
            .clone()
            .or_else(|| item.title.clone())
            .unwrap_or_default();
        let image = item
            .image
            .clone()
            .or_else(|| item.featured_image.as_ref().and_then(|f| f.url.clone()));

        Self {
            id,
            variant_id: if item.variant_id == 0 {
                item.id
            } else {
                item.variant_id
            },
            quantity: item.quantity,
            name,
            price: format_price(item.price, currency),
            image,
        }
    }
}
