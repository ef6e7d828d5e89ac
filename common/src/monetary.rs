//! Monetary types for the AuraPay ledger.
//!
//! Amounts are held as a whole number of minor units (cents). Decimal strings only
//! appear at the boundary, through [`Money::from_decimal_str`] and the `Display` impl.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional digits in the display form.
pub const MINOR_UNIT_DIGITS: u32 = 2;

/// Basis points in 100%.
pub const BASIS_POINTS_SCALE: u32 = 10_000;

/// Errors produced by money arithmetic and parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    /// Input could not be read as an amount.
    #[error("not a decimal amount: {0:?}")]
    Malformed(String),

    /// More fractional digits than the minor unit allows.
    #[error("amount {0:?} has more than two fractional digits")]
    TooPrecise(String),

    /// Negative input where only non-negative amounts are accepted.
    #[error("amount {0:?} is negative")]
    Negative(String),

    /// Amount is above the configured ceiling.
    #[error("amount {amount} exceeds the maximum of {max}")]
    AboveMaximum { amount: Money, max: Money },

    /// Subtraction would go below zero.
    #[error("{minuend} - {subtrahend} would be negative")]
    Underflow { minuend: Money, subtrahend: Money },

    /// Result does not fit in 64-bit minor units.
    #[error("amount overflow")]
    Overflow,

    /// Fee rate above 100%.
    #[error("fee rate of {0} basis points is above 100%")]
    InvalidFeeRate(u32),
}

/// A monetary amount in integer minor units.
///
/// Values produced by [`Money::from_decimal_str`], [`Money::checked_add`] and
/// [`Money::checked_sub`] are never negative. Signed amounts (ledger entry deltas)
/// are only produced through the explicit [`Money::negate`] and [`Money::signed_sub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Money = Money(0);

    /// Largest representable amount.
    pub const MAX: Money = Money(i64::MAX);

    /// Create from a count of minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Parse a non-negative decimal string no greater than `max`.
    ///
    /// Accepts at most two fractional digits. Surrounding whitespace is ignored.
    pub fn from_decimal_str(s: &str, max: Money) -> Result<Self, MoneyError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MoneyError::Malformed(s.to_string()));
        }

        let value =
            Decimal::from_str_exact(trimmed).map_err(|_| MoneyError::Malformed(s.to_string()))?;

        if value.is_sign_negative() {
            return Err(MoneyError::Negative(s.to_string()));
        }
        if value.scale() > MINOR_UNIT_DIGITS {
            return Err(MoneyError::TooPrecise(s.to_string()));
        }

        let shift = 10i128.pow(MINOR_UNIT_DIGITS - value.scale());
        let minor = value
            .mantissa()
            .checked_mul(shift)
            .and_then(|m| i64::try_from(m).ok())
            .ok_or(MoneyError::Overflow)?;

        let amount = Self(minor);
        if amount > max {
            return Err(MoneyError::AboveMaximum { amount, max });
        }
        Ok(amount)
    }

    /// Number of minor units.
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Add two amounts.
    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Subtract, refusing to go below zero.
    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        let result = self.signed_sub(other)?;
        if result.is_negative() {
            return Err(MoneyError::Underflow {
                minuend: self,
                subtrahend: other,
            });
        }
        Ok(result)
    }

    /// Subtract, allowing a negative result. Only for signed deltas.
    pub fn signed_sub(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Flip the sign. Used to turn a debit amount into a ledger delta.
    pub fn negate(self) -> Result<Money, MoneyError> {
        self.0.checked_neg().map(Money).ok_or(MoneyError::Overflow)
    }

    /// Split a gross amount into `(net, fee)` with the fee at `rate_bps` of gross.
    ///
    /// `fee = round_half_up(gross * rate_bps / 10000)`, `net = gross - fee`.
    pub fn split_fee(self, rate_bps: u32) -> Result<(Money, Money), MoneyError> {
        self.split_fee_over(rate_bps, BASIS_POINTS_SCALE)
    }

    /// Split with the fee at `rate_bps / denominator_bps` of gross, rounded half up.
    ///
    /// With `denominator_bps = 10000` this is [`Money::split_fee`]. With
    /// `10000 + rate_bps` it recovers a fee that was added on top of a net amount.
    pub fn split_fee_over(
        self,
        rate_bps: u32,
        denominator_bps: u32,
    ) -> Result<(Money, Money), MoneyError> {
        if rate_bps > BASIS_POINTS_SCALE {
            return Err(MoneyError::InvalidFeeRate(rate_bps));
        }
        if self.is_negative() {
            return Err(MoneyError::Negative(self.to_string()));
        }

        let numerator = self.0 as i128 * rate_bps as i128;
        let denominator = denominator_bps.max(1) as i128;
        let fee = (2 * numerator + denominator) / (2 * denominator);
        let fee = Money(i64::try_from(fee).map_err(|_| MoneyError::Overflow)?);
        let net = self.checked_sub(fee)?;
        Ok((net, fee))
    }

    /// Decimal value with two fractional digits.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, MINOR_UNIT_DIGITS)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal_str(s, Money::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cents(c: i64) -> Money {
        Money::from_minor(c)
    }

    #[test]
    fn test_parse_decimal_strings() {
        assert_eq!("101.00".parse::<Money>().unwrap(), cents(10100));
        assert_eq!("0.5".parse::<Money>().unwrap(), cents(50));
        assert_eq!("7".parse::<Money>().unwrap(), cents(700));
        assert_eq!(" 30.01 ".parse::<Money>().unwrap(), cents(3001));
        assert_eq!("0".parse::<Money>().unwrap(), Money::ZERO);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!("1.001".parse::<Money>(), Err(MoneyError::TooPrecise(_))));
        assert!(matches!("1.000".parse::<Money>(), Err(MoneyError::TooPrecise(_))));
        assert!(matches!("-1.00".parse::<Money>(), Err(MoneyError::Negative(_))));
        assert!(matches!("abc".parse::<Money>(), Err(MoneyError::Malformed(_))));
        assert!(matches!("".parse::<Money>(), Err(MoneyError::Malformed(_))));
        assert!(matches!("1,000.00".parse::<Money>(), Err(MoneyError::Malformed(_))));
    }

    #[test]
    fn test_parse_enforces_maximum() {
        let max = cents(1_000_000);
        assert_eq!(Money::from_decimal_str("10000.00", max).unwrap(), max);
        assert!(matches!(
            Money::from_decimal_str("10000.01", max),
            Err(MoneyError::AboveMaximum { .. })
        ));
    }

    #[test]
    fn test_format_two_digits() {
        assert_eq!(cents(10000).to_string(), "100.00");
        assert_eq!(cents(5).to_string(), "0.05");
        assert_eq!(cents(0).to_string(), "0.00");
        assert_eq!(cents(123456789).to_string(), "1234567.89");
        assert_eq!(cents(-3000).to_string(), "-30.00");
    }

    #[test]
    fn test_sub_underflow() {
        assert_eq!(cents(100).checked_sub(cents(40)).unwrap(), cents(60));
        assert!(matches!(
            cents(100).checked_sub(cents(101)),
            Err(MoneyError::Underflow { .. })
        ));
        assert_eq!(cents(100).signed_sub(cents(101)).unwrap(), cents(-1));
    }

    #[test]
    fn test_add_overflow() {
        assert_eq!(Money::MAX.checked_add(cents(1)), Err(MoneyError::Overflow));
    }

    #[test]
    fn test_split_fee_rounds_half_up() {
        // 1% of 101.00
        assert_eq!(cents(10100).split_fee(100).unwrap(), (cents(9999), cents(101)));
        // 1% of 0.50 is exactly half a cent
        assert_eq!(cents(50).split_fee(100).unwrap(), (cents(49), cents(1)));
        // 1% of 0.49 rounds down
        assert_eq!(cents(49).split_fee(100).unwrap(), (cents(49), cents(0)));
        assert_eq!(cents(10000).split_fee(0).unwrap(), (cents(10000), cents(0)));
        assert_eq!(cents(10000).split_fee(10_000).unwrap(), (cents(0), cents(10000)));
    }

    #[test]
    fn test_split_fee_over_surcharge() {
        // 101.00 captured with a 1% surcharge on 100.00
        assert_eq!(
            cents(10100).split_fee_over(100, 10_100).unwrap(),
            (cents(10000), cents(100))
        );
    }

    #[test]
    fn test_split_fee_rejects_rate_above_scale() {
        assert_eq!(cents(100).split_fee(10_001), Err(MoneyError::InvalidFeeRate(10_001)));
    }

    proptest! {
        #[test]
        fn prop_split_fee_conserves_cents(gross in 0i64..=i64::MAX / 2, rate in 0u32..=10_000) {
            let (net, fee) = Money::from_minor(gross).split_fee(rate).unwrap();
            prop_assert!(!net.is_negative());
            prop_assert!(!fee.is_negative());
            prop_assert_eq!(net.checked_add(fee).unwrap(), Money::from_minor(gross));
        }

        #[test]
        fn prop_display_parses_back(minor in 0i64..=i64::MAX) {
            let money = Money::from_minor(minor);
            prop_assert_eq!(money.to_string().parse::<Money>().unwrap(), money);
        }
    }
}
