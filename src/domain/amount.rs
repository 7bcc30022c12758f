use std::str::FromStr;

use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use num_traits::Signed;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid atomic amount: {0:?}")]
    InvalidAtomic(String),
    #[error("Negative amount: {0}")]
    Negative(String),
    #[error("Amount {value} has more than {precision} fractional digits")]
    PrecisionLoss { value: String, precision: u32 },
}

/// Parses an atomic (integer) amount as returned by providers. Accepts plain decimal strings
/// and `0x`-prefixed hex quantities.
pub fn parse_atomic(raw: &str) -> Result<BigInt, AmountError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => BigInt::parse_bytes(hex.as_bytes(), 16),
        None => BigInt::from_str(trimmed).ok(),
    };
    let amount = parsed.ok_or_else(|| AmountError::InvalidAtomic(raw.to_string()))?;
    if amount.is_negative() {
        return Err(AmountError::Negative(raw.to_string()));
    }
    Ok(amount)
}

/// Exact conversion from atomic units to display units: `atomic / 10^precision`.
pub fn from_unit(atomic: &BigInt, precision: u32) -> BigDecimal {
    BigDecimal::new(atomic.clone(), i64::from(precision))
}

/// Exact conversion from display units back to atomic units. Fails instead of rounding when the
/// value carries more fractional digits than the chain supports.
pub fn to_unit(value: &BigDecimal, precision: u32) -> Result<BigInt, AmountError> {
    if value.is_negative() {
        return Err(AmountError::Negative(value.to_string()));
    }
    let scaled = value.with_scale(i64::from(precision));
    if &scaled != value {
        return Err(AmountError::PrecisionLoss {
            value: value.to_string(),
            precision,
        });
    }
    let (digits, _) = scaled.into_bigint_and_exponent();
    Ok(digits)
}

/// Parses a decimal-coin string (e.g. Cosmos `DecCoin` amounts such as `"12.5"`) that is still
/// denominated in atomic units, and converts it to display units.
pub fn from_unit_decimal(raw: &str, precision: u32) -> Result<BigDecimal, AmountError> {
    let atomic =
        BigDecimal::from_str(raw.trim()).map_err(|_| AmountError::InvalidAtomic(raw.to_string()))?;
    if atomic.is_negative() {
        return Err(AmountError::Negative(raw.to_string()));
    }
    let (digits, scale) = atomic.into_bigint_and_exponent();
    Ok(BigDecimal::new(digits, scale + i64::from(precision)))
}
