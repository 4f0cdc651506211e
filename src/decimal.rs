//! Fixed-precision decimal amounts.
//!
//! Monetary values are carried as an integer magnitude with a base-10 scale:
//! the pair `(value, scale)` means `value · 10⁻ˢᶜᵃˡᵉ`. ICY amounts use scale 18
//! (ERC-20 atomic units), BTC amounts use scale 8 (satoshi), derived rates use
//! scale 6. Arithmetic never rescales implicitly; adding or subtracting values
//! of different scales is an error the caller has to resolve explicitly.

use alloy::primitives::{I256, U256};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Scale of ICY ERC-20 atomic units.
pub const ICY_SCALE: u8 = 18;
/// Scale of satoshi relative to one BTC.
pub const BTC_SCALE: u8 = 8;
/// Scale used for derived conversion rates (ICY per BTC).
pub const RATIO_SCALE: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    #[error("mismatched scale: {0} vs {1}")]
    MismatchedScale(u8, u8),
    #[error("value does not fit the target width")]
    Overflow,
    #[error("invalid decimal literal: {0}")]
    Parse(String),
}

/// A fixed-precision decimal: `value · 10⁻ˢᶜᵃˡᵉ` with a 256-bit signed magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDecimal {
    value: I256,
    scale: u8,
}

impl FixedDecimal {
    pub fn new(value: I256, scale: u8) -> Self {
        Self { value, scale }
    }

    pub fn zero(scale: u8) -> Self {
        Self {
            value: I256::ZERO,
            scale,
        }
    }

    /// Wraps a raw unsigned token amount (e.g. a `uint256` read off-chain).
    ///
    /// Fails with [`DecimalError::Overflow`] for magnitudes above `I256::MAX`,
    /// which no sane token supply reaches.
    pub fn from_raw_u256(value: U256, scale: u8) -> Result<Self, DecimalError> {
        let value = I256::try_from(value).map_err(|_| DecimalError::Overflow)?;
        Ok(Self { value, scale })
    }

    /// A satoshi amount at scale 8.
    pub fn from_sats(sats: u64) -> Self {
        Self {
            value: I256::try_from(sats).expect("u64 fits in I256"),
            scale: BTC_SCALE,
        }
    }

    pub fn from_i64(value: i64, scale: u8) -> Self {
        Self {
            value: I256::try_from(value).expect("i64 fits in I256"),
            scale,
        }
    }

    /// Converts a float into a fixed decimal at the given scale, rounding to
    /// the nearest representable value.
    pub fn from_f64(value: f64, scale: u8) -> Result<Self, DecimalError> {
        if !value.is_finite() {
            return Err(DecimalError::Parse(value.to_string()));
        }
        let scaled = value * 10f64.powi(scale as i32);
        if scaled >= i128::MAX as f64 || scaled <= i128::MIN as f64 {
            return Err(DecimalError::Overflow);
        }
        let value = I256::try_from(scaled.round() as i128).map_err(|_| DecimalError::Overflow)?;
        Ok(Self { value, scale })
    }

    /// Parses a raw integer magnitude (no decimal point) at the given scale.
    pub fn from_raw_str(raw: &str, scale: u8) -> Result<Self, DecimalError> {
        let value = I256::from_str(raw).map_err(|e| DecimalError::Parse(e.to_string()))?;
        Ok(Self { value, scale })
    }

    pub fn raw(&self) -> I256 {
        self.value
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_negative()
    }

    /// Same-scale addition. The scales of both operands must match.
    pub fn add(&self, other: &Self) -> Result<Self, DecimalError> {
        if self.scale != other.scale {
            return Err(DecimalError::MismatchedScale(self.scale, other.scale));
        }
        let value = self
            .value
            .checked_add(other.value)
            .ok_or(DecimalError::Overflow)?;
        Ok(Self {
            value,
            scale: self.scale,
        })
    }

    /// Same-scale subtraction. The scales of both operands must match.
    pub fn sub(&self, other: &Self) -> Result<Self, DecimalError> {
        if self.scale != other.scale {
            return Err(DecimalError::MismatchedScale(self.scale, other.scale));
        }
        let value = self
            .value
            .checked_sub(other.value)
            .ok_or(DecimalError::Overflow)?;
        Ok(Self {
            value,
            scale: self.scale,
        })
    }

    /// Lossy conversion to `f64`: `value / 10ˢᶜᵃˡᵉ`.
    pub fn to_f64(&self) -> f64 {
        let magnitude: f64 = self.value.to_string().parse().unwrap_or(f64::NAN);
        magnitude / 10f64.powi(self.scale as i32)
    }

    /// The raw integer magnitude as an `i64`, failing on overflow.
    pub fn to_i64(&self) -> Result<i64, DecimalError> {
        i64::from_str(&self.value.to_string()).map_err(|_| DecimalError::Overflow)
    }

    /// Canonical integer comparison; the scales of both operands must match.
    pub fn compare(&self, other: &Self) -> Result<Ordering, DecimalError> {
        if self.scale != other.scale {
            return Err(DecimalError::MismatchedScale(self.scale, other.scale));
        }
        Ok(self.value.cmp(&other.value))
    }

    /// `numerator / denominator` rendered at the requested scale.
    ///
    /// A zero denominator yields zero rather than an error: a ratio against an
    /// empty treasury is "no conversion available", not a fault.
    pub fn ratio(numerator: &Self, denominator: &Self, scale: u8) -> Result<Self, DecimalError> {
        if denominator.is_zero() {
            return Ok(Self::zero(scale));
        }
        Self::from_f64(numerator.to_f64() / denominator.to_f64(), scale)
    }
}

impl Display for FixedDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.value);
        }
        let negative = self.value.is_negative();
        let digits = self.value.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        let sign = if negative { "-" } else { "" };
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

impl Serialize for FixedDecimal {
    /// Wire form used by the oracle endpoints: `{"value": "<raw>", "decimal": <scale>}`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_struct("FixedDecimal", 2)?;
        out.serialize_field("value", &self.value.to_string())?;
        out.serialize_field("decimal", &self.scale)?;
        out.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(value: i64, scale: u8) -> FixedDecimal {
        FixedDecimal::from_i64(value, scale)
    }

    #[test]
    fn add_then_sub_round_trips() {
        let x = fd(1_234_567, 8);
        let y = fd(89_001, 8);
        let sum = x.add(&y).unwrap();
        assert_eq!(sum.sub(&y).unwrap(), x);
    }

    #[test]
    fn mismatched_scale_is_rejected() {
        let x = fd(1, 18);
        let y = fd(1, 8);
        assert_eq!(x.add(&y), Err(DecimalError::MismatchedScale(18, 8)));
        assert_eq!(x.sub(&y), Err(DecimalError::MismatchedScale(18, 8)));
        assert_eq!(x.compare(&y), Err(DecimalError::MismatchedScale(18, 8)));
    }

    #[test]
    fn to_f64_divides_by_scale() {
        assert_eq!(fd(150_000_000, 8).to_f64(), 1.5);
        assert_eq!(fd(-25, 1).to_f64(), -2.5);
    }

    #[test]
    fn to_i64_overflow() {
        let big = FixedDecimal::from_raw_str("9223372036854775808", 0).unwrap();
        assert_eq!(big.to_i64(), Err(DecimalError::Overflow));
        let max = FixedDecimal::from_raw_str("9223372036854775807", 0).unwrap();
        assert_eq!(max.to_i64(), Ok(i64::MAX));
    }

    #[test]
    fn ratio_with_zero_denominator_is_zero() {
        let icy = fd(1_000_000, 18);
        let btc = FixedDecimal::zero(8);
        let ratio = FixedDecimal::ratio(&icy, &btc, RATIO_SCALE).unwrap();
        assert!(ratio.is_zero());
        assert_eq!(ratio.scale(), RATIO_SCALE);
    }

    #[test]
    fn ratio_is_scaled_to_requested_precision() {
        // 3 / 2 = 1.5 at scale 6.
        let num = fd(3, 0);
        let den = fd(2, 0);
        let ratio = FixedDecimal::ratio(&num, &den, RATIO_SCALE).unwrap();
        assert_eq!(ratio.raw(), I256::try_from(1_500_000).unwrap());
    }

    #[test]
    fn display_renders_decimal_point() {
        assert_eq!(fd(150_000_000, 8).to_string(), "1.50000000");
        assert_eq!(fd(-42, 4).to_string(), "-0.0042");
        assert_eq!(fd(7, 0).to_string(), "7");
    }

    #[test]
    fn serializes_as_value_and_decimal() {
        let json = serde_json::to_value(fd(123, 6)).unwrap();
        assert_eq!(json["value"], "123");
        assert_eq!(json["decimal"], 6);
    }

    #[test]
    fn comparison_uses_integer_order() {
        assert_eq!(fd(2, 8).compare(&fd(10, 8)).unwrap(), Ordering::Less);
        assert_eq!(fd(-1, 8).compare(&fd(-2, 8)).unwrap(), Ordering::Greater);
    }
}
