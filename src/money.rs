//! Money Module
//!
//! All monetary amounts are integer minor units (cents) tagged with an
//! explicit [`Currency`]. Currency is never inferred: parsing an unknown
//! code is an error.
//!
//! ## Internal Representation
//! - Amounts are `i64` cents and must be `>= 0` when persisted; the sign of
//!   a ledger movement is carried by its direction, not the amount.
//! - Display conversion goes through `rust_decimal` so no float is ever
//!   involved.
//!
//! ## Usage
//! ```rust
//! use escrow_ledger::money::{Currency, format_cents, parse_cents};
//!
//! let cents = parse_cents("250.00", Currency::Usd).unwrap();
//! assert_eq!(cents, 25_000);
//! assert_eq!(format_cents(cents, Currency::Usd), "250.00");
//! ```

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Money conversion errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must not be negative")]
    NegativeAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),
}

/// Settlement currencies the marketplace operates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Cad,
}

impl Currency {
    /// Processor wire code (ISO 4217, lowercase)
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "usd",
            Currency::Cad => "cad",
        }
    }

    /// Minor-unit exponent
    pub fn decimals(&self) -> u32 {
        match self {
            Currency::Usd | Currency::Cad => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "usd" => Ok(Currency::Usd),
            "cad" => Ok(Currency::Cad),
            other => Err(MoneyError::UnsupportedCurrency(other.to_string())),
        }
    }
}

/// Reject negative amounts before they reach the ledger
pub fn ensure_non_negative(cents: i64) -> Result<i64, MoneyError> {
    if cents < 0 {
        Err(MoneyError::NegativeAmount)
    } else {
        Ok(cents)
    }
}

/// Parse a client-facing amount string ("250.00") into cents.
///
/// Rejects more fractional digits than the currency allows instead of
/// truncating.
pub fn parse_cents(amount_str: &str, currency: Currency) -> Result<i64, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if amount_str.starts_with('-') {
        return Err(MoneyError::NegativeAmount);
    }

    let decimal =
        Decimal::from_str(amount_str).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;

    let decimals = currency.decimals();
    if decimal.scale() > decimals {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimal.scale(),
            max: decimals,
        });
    }

    let scaled = decimal * Decimal::from(10i64.pow(decimals));
    scaled.to_i64().ok_or(MoneyError::Overflow)
}

/// Format cents for display ("-12.50" for signed totals)
pub fn format_cents(cents: i64, currency: Currency) -> String {
    let decimals = currency.decimals();
    let value = Decimal::from(cents) / Decimal::from(10i64.pow(decimals));
    format!("{:.prec$}", value, prec = decimals as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cents_normal_cases() {
        assert_eq!(parse_cents("250.00", Currency::Usd), Ok(25_000));
        assert_eq!(parse_cents("250", Currency::Usd), Ok(25_000));
        assert_eq!(parse_cents("0.05", Currency::Cad), Ok(5));
        assert_eq!(parse_cents("0", Currency::Usd), Ok(0));
    }

    #[test]
    fn test_parse_cents_rejects_extra_precision() {
        assert_eq!(
            parse_cents("1.005", Currency::Usd),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: 2
            })
        );
    }

    #[test]
    fn test_parse_cents_rejects_negative_and_garbage() {
        assert_eq!(
            parse_cents("-1.00", Currency::Usd),
            Err(MoneyError::NegativeAmount)
        );
        assert!(matches!(
            parse_cents("abc", Currency::Usd),
            Err(MoneyError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_cents("  ", Currency::Usd),
            Err(MoneyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(25_000, Currency::Usd), "250.00");
        assert_eq!(format_cents(5, Currency::Usd), "0.05");
        assert_eq!(format_cents(-1_250, Currency::Cad), "-12.50");
    }

    #[test]
    fn test_currency_parse_is_strict() {
        assert_eq!("USD".parse::<Currency>(), Ok(Currency::Usd));
        assert_eq!("cad".parse::<Currency>(), Ok(Currency::Cad));
        assert_eq!(
            "eur".parse::<Currency>(),
            Err(MoneyError::UnsupportedCurrency("eur".into()))
        );
    }

    #[test]
    fn test_ensure_non_negative() {
        assert_eq!(ensure_non_negative(0), Ok(0));
        assert_eq!(ensure_non_negative(-1), Err(MoneyError::NegativeAmount));
    }
}
