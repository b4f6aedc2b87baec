//! Price representation and display formatting.
//!
//! Shopify's Ajax Cart API reports every amount as an integer in minor
//! currency units (cents for USD). [`format_price`] turns that into the
//! grouped major-unit string shown in the widget.

use rust_decimal::Decimal;

/// Errors produced by locale-aware price formatting.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceFormatError {
    /// The currency is not a three-letter ISO 4217 code.
    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),
}

/// Format an amount in minor units as a display string.
///
/// Uses en-US conventions: currency symbol prefix, comma thousands separator.
/// Falls back to a plain `$X.XX` rendering when the currency code cannot be
/// formatted.
///
/// ```
/// use storechat_core::format_price;
///
/// assert_eq!(format_price(1000, "USD"), "$10.00");
/// assert_eq!(format_price(123_456, "usd"), "$1,234.56");
/// assert_eq!(format_price(1000, "not-a-code"), "$10.00");
/// ```
#[must_use]
pub fn format_price(minor_units: i64, currency: &str) -> String {
    locale_format(minor_units, currency).unwrap_or_else(|_| manual_format(minor_units))
}

/// Locale-aware formatting. Fails on anything that is not an ISO 4217 code.
///
/// # Errors
///
/// Returns [`PriceFormatError::InvalidCurrency`] for malformed codes.
pub fn locale_format(minor_units: i64, currency: &str) -> Result<String, PriceFormatError> {
    let code = currency.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(PriceFormatError::InvalidCurrency(currency.to_string()));
    }

    let digits = fraction_digits(&code);
    let amount = Decimal::new(minor_units, 2).round_dp(digits);
    let number = group_digits(&format!("{:.prec$}", amount.abs(), prec = digits as usize));
    let sign = if amount.is_sign_negative() && !amount.is_zero() {
        "-"
    } else {
        ""
    };

    Ok(match symbol(&code) {
        Some(symbol) => format!("{sign}{symbol}{number}"),
        None => format!("{sign}{code} {number}"),
    })
}

/// Plain `$X.XX` rendering that cannot fail.
fn manual_format(minor_units: i64) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let abs = minor_units.unsigned_abs();
    format!("{sign}${}.{:02}", abs / 100, abs % 100)
}

fn fraction_digits(code: &str) -> u32 {
    match code {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        _ => 2,
    }
}

fn symbol(code: &str) -> Option<&'static str> {
    match code {
        "USD" => Some("$"),
        "CAD" => Some("CA$"),
        "AUD" => Some("A$"),
        "NZD" => Some("NZ$"),
        "MXN" => Some("MX$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        "JPY" => Some("¥"),
        "INR" => Some("₹"),
        "KRW" => Some("₩"),
        "ILS" => Some("₪"),
        "VND" => Some("₫"),
        _ => None,
    }
}

/// Insert thousands separators into the integer part of a decimal string.
fn group_digits(number: &str) -> String {
    let (int_part, frac_part) = number
        .split_once('.')
        .map_or((number, None), |(i, f)| (i, Some(f)));

    let len = int_part.len();
    let mut grouped = String::with_capacity(len + len / 3 + 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if let Some(frac) = frac_part {
        grouped.push('.');
        grouped.push_str(frac);
    }
    grouped
}
