//! Shared helpers for Decimal ↔ f64 conversions and quantisation.
//!
//! Two quantisation strategies exist because raw weather values and reduced
//! statistics have different precision requirements:
//!
//! - `f64_to_decimal_1dp`: rounds to 1 decimal place (collected values:
//!   temperature, wind speed)
//! - `quantize_4dp`: rounds to 4 decimal places (statistical outputs, to
//!   eliminate round-trip drift across storage)
//!
//! f64 bridges return `Decimal::ZERO` for non-finite inputs (NaN, ±Inf).

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// Convert an f64 to Decimal, rounded half-up to 1 decimal place.
///
/// Used for collected weather values where 0.1 precision is sufficient and
/// consistent rounding keeps the staging unique constraints meaningful.
pub(crate) fn f64_to_decimal_1dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_1dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_f64(v)
        .unwrap_or_default()
        .round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert an f64 to Decimal, rounded half-up to the nearest whole number.
///
/// Used for wind direction (1° resolution).
pub(crate) fn f64_to_decimal_0dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_0dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_f64(v)
        .unwrap_or_default()
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Quantise a statistical output to 4 decimal places.
pub(crate) fn quantize_4dp(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// Quantise an f64 statistical output to a 4-decimal-place Decimal.
pub(crate) fn f64_to_decimal_4dp(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_4dp received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    quantize_4dp(Decimal::from_f64(v).unwrap_or_default())
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be
/// represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_f64_to_decimal_1dp_normal() {
        assert_eq!(f64_to_decimal_1dp(3.14), Decimal::from_str("3.1").unwrap());
    }

    #[test]
    fn test_f64_to_decimal_1dp_rounds_half_up() {
        // 3.15 → 3.2 with midpoint-away-from-zero
        assert_eq!(f64_to_decimal_1dp(3.15), Decimal::from_str("3.2").unwrap());
    }

    #[test]
    fn test_f64_to_decimal_1dp_negative() {
        assert_eq!(
            f64_to_decimal_1dp(-4.75),
            Decimal::from_str("-4.8").unwrap()
        );
    }

    #[test]
    fn test_f64_to_decimal_1dp_nan() {
        assert_eq!(f64_to_decimal_1dp(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn test_f64_to_decimal_1dp_infinity() {
        assert_eq!(f64_to_decimal_1dp(f64::INFINITY), Decimal::ZERO);
        assert_eq!(f64_to_decimal_1dp(f64::NEG_INFINITY), Decimal::ZERO);
    }

    #[test]
    fn test_f64_to_decimal_0dp_rounds() {
        assert_eq!(f64_to_decimal_0dp(224.5), Decimal::from(225));
        assert_eq!(f64_to_decimal_0dp(224.4), Decimal::from(224));
    }

    #[test]
    fn test_quantize_4dp() {
        let d = Decimal::from_str("1.23456789").unwrap();
        assert_eq!(quantize_4dp(d), Decimal::from_str("1.2346").unwrap());
    }

    #[test]
    fn test_f64_to_decimal_4dp_nan() {
        assert_eq!(f64_to_decimal_4dp(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn test_dec_to_f64_round_trip() {
        let d = Decimal::from_str("3.14").unwrap();
        assert!((dec_to_f64(d) - 3.14).abs() < 1e-10);
    }
}
