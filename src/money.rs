//! Money Helpers
//!
//! Payment amounts are `rust_decimal::Decimal` with two fractional digits.
//! Gateways disagree on representation (WeChat/Stripe/Paddle want integer
//! minor units, PayPal/Alipay want a fixed 2-place string), so every
//! conversion goes through this module.
//!
//! ## Usage
//! ```rust
//! use billing_payments::money::{amounts_match, to_minor_units, format_amount};
//! use rust_decimal_macros::dec;
//!
//! assert!(amounts_match(dec!(99.99), dec!(100.00)));
//! assert_eq!(to_minor_units(dec!(99.99)).unwrap(), 9999);
//! assert_eq!(format_amount(dec!(5)), "5.00");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Number of fractional digits stored for every amount
pub const AMOUNT_SCALE: u32 = 2;

/// Money conversion errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Absolute tolerance allowed between a payment amount and its order amount
#[inline]
pub fn amount_tolerance() -> Decimal {
    Decimal::new(1, AMOUNT_SCALE)
}

/// `|a - b| <= 0.01`
#[inline]
pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= amount_tolerance()
}

/// Round to the stored 2-place scale (banker's rounding is NOT used; gateways
/// round half away from zero).
pub fn normalize(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert to integer minor units (cents / fen)
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    let scaled = normalize(amount)
        .checked_mul(Decimal::from(100))
        .ok_or(MoneyError::Overflow)?;
    scaled.to_i64().ok_or(MoneyError::Overflow)
}

/// Convert integer minor units back to a 2-place amount
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, AMOUNT_SCALE)
}

/// Fixed 2-place string, e.g. `"99.99"`
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", normalize(amount))
}

/// Parse a gateway-provided decimal string
pub fn parse_amount(s: &str) -> Result<Decimal, MoneyError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(MoneyError::InvalidFormat("empty amount".to_string()));
    }
    Decimal::from_str(trimmed)
        .map(normalize)
        .map_err(|_| MoneyError::InvalidFormat(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tolerance_boundary() {
        assert!(amounts_match(dec!(99.99), dec!(99.99)));
        assert!(amounts_match(dec!(99.99), dec!(100.00)));
        assert!(amounts_match(dec!(100.00), dec!(99.99)));
        assert!(!amounts_match(dec!(99.98), dec!(100.00)));
        assert!(!amounts_match(dec!(150), dec!(99.99)));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(99.99)), Ok(9999));
        assert_eq!(to_minor_units(dec!(0.01)), Ok(1));
        assert_eq!(to_minor_units(dec!(10.005)), Ok(1001));
        assert_eq!(to_minor_units(Decimal::ZERO), Err(MoneyError::InvalidAmount));
        assert_eq!(to_minor_units(dec!(-1)), Err(MoneyError::InvalidAmount));
        assert_eq!(from_minor_units(9999), dec!(99.99));
    }

    #[test]
    fn test_format_and_parse() {
        assert_eq!(format_amount(dec!(5)), "5.00");
        assert_eq!(format_amount(dec!(99.999)), "100.00");
        assert_eq!(parse_amount(" 12.5 "), Ok(dec!(12.50)));
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("").is_err());
    }
}
