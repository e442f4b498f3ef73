use ethers::types::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

// Decimal keeps at most 28 fractional digits
const MAX_DECIMAL_SCALE: u8 = 28;

/// Converts a raw on-chain integer with `decimals` fractional digits into a `Decimal`.
///
/// Feeds and balances above `Decimal::MAX` are rejected instead of being saturated.
pub fn u256_to_decimal(value: U256, decimals: u8) -> Result<Decimal, ConversionError> {
    // Drop digits Decimal cannot represent before parsing
    let (value, scale) = if decimals > MAX_DECIMAL_SCALE {
        let excess = u32::from(decimals - MAX_DECIMAL_SCALE);
        let divisor = U256::from(10u8)
            .checked_pow(U256::from(excess))
            .ok_or(ConversionError::Overflow)?;
        (value / divisor, MAX_DECIMAL_SCALE)
    } else {
        (value, decimals)
    };

    let value_str = value.to_string();
    let decimal_value = Decimal::from_str(&value_str)
        .map_err(|e| ConversionError::InvalidDecimal(e.to_string()))?;

    let divisor = Decimal::from(10u128.pow(u32::from(scale)));
    decimal_value
        .checked_div(divisor)
        .ok_or(ConversionError::Overflow)
}

/// Floors a non-negative `Decimal` into an on-chain integer.
pub fn decimal_to_u256_floor(value: Decimal) -> Result<U256, ConversionError> {
    if value.is_sign_negative() {
        return Err(ConversionError::Negative(value.to_string()));
    }
    let floored = value.floor().to_u128().ok_or(ConversionError::Overflow)?;
    Ok(U256::from(floored))
}

/// Keeps two decimal places, dropping the rest (prices are quoted in cents).
pub fn truncate_to_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Lossy view of a wei amount as whole tokens, for logs and gauges only.
pub fn wei_to_f64(value: U256) -> f64 {
    u256_to_decimal(value, 18)
        .ok()
        .and_then(|d| d.to_f64())
        .unwrap_or(f64::NAN)
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid decimal: {0}")]
    InvalidDecimal(String),
    #[error("Overflow in conversion")]
    Overflow,
    #[error("Negative value cannot be written on-chain: {0}")]
    Negative(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_u256_to_decimal_scales_by_decimals() {
        let raw = U256::from(150_000_000u64);
        assert_eq!(u256_to_decimal(raw, 8).unwrap(), dec("1.5"));
        assert_eq!(u256_to_decimal(U256::from(42u64), 0).unwrap(), dec("42"));
    }

    #[test]
    fn test_u256_to_decimal_handles_wide_scales() {
        // 3 * 10^30 with 30 decimals is exactly 3
        let raw = U256::from(3u64) * U256::exp10(30);
        assert_eq!(u256_to_decimal(raw, 30).unwrap(), dec("3"));
    }

    #[test]
    fn test_u256_to_decimal_rejects_overflowing_scale() {
        assert!(matches!(
            u256_to_decimal(U256::one(), 200),
            Err(ConversionError::Overflow)
        ));
        assert!(u256_to_decimal(U256::MAX, u8::MAX).is_err());
    }

    #[test]
    fn test_decimal_to_u256_floor() {
        assert_eq!(decimal_to_u256_floor(dec("200.99")).unwrap(), U256::from(200u64));
        assert!(decimal_to_u256_floor(dec("-1")).is_err());
    }

    #[test]
    fn test_truncate_to_cents_never_rounds_up() {
        assert_eq!(truncate_to_cents(dec("1.5099")), dec("1.50"));
        assert_eq!(truncate_to_cents(dec("0.759")), dec("0.75"));
    }
}
