//! Platform fee policy.

use std::fmt;
use std::str::FromStr;

use aurapay_common::{Money, MoneyError, BASIS_POINTS_SCALE};
use serde::{Deserialize, Serialize};

/// What the fee rate is a percentage of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeBasis {
    /// Fee is a share of the captured amount and is deducted from it.
    Gross,
    /// Fee was added on top of the requested deposit, so the capture already includes it.
    Net,
}

impl FromStr for FeeBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gross" => Ok(FeeBasis::Gross),
            "net" => Ok(FeeBasis::Net),
            other => Err(format!("unknown fee basis: {other}")),
        }
    }
}

impl fmt::Display for FeeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeBasis::Gross => write!(f, "gross"),
            FeeBasis::Net => write!(f, "net"),
        }
    }
}

/// Result of splitting a captured amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub gross: Money,
    pub net: Money,
    pub fee: Money,
}

/// Computes the creditable amount and the retained fee from a captured amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    rate_bps: u32,
    basis: FeeBasis,
}

impl FeePolicy {
    pub fn new(rate_bps: u32, basis: FeeBasis) -> Result<Self, MoneyError> {
        if rate_bps > BASIS_POINTS_SCALE {
            return Err(MoneyError::InvalidFeeRate(rate_bps));
        }
        Ok(Self { rate_bps, basis })
    }

    pub fn rate_bps(&self) -> u32 {
        self.rate_bps
    }

    pub fn basis(&self) -> FeeBasis {
        self.basis
    }

    /// Split a captured gross amount. Always `net + fee == gross`.
    pub fn split(&self, gross: Money) -> Result<FeeSplit, MoneyError> {
        let (net, fee) = match self.basis {
            FeeBasis::Gross => gross.split_fee(self.rate_bps)?,
            FeeBasis::Net => {
                gross.split_fee_over(self.rate_bps, BASIS_POINTS_SCALE + self.rate_bps)?
            }
        };
        Ok(FeeSplit { gross, net, fee })
    }

    /// Amount to charge the payer so that roughly `requested` is credited.
    ///
    /// Under [`FeeBasis::Net`] this adds the fee on top of the request; under
    /// [`FeeBasis::Gross`] the payer is charged exactly the request.
    pub fn quote(&self, requested: Money) -> Result<Money, MoneyError> {
        match self.basis {
            FeeBasis::Gross => Ok(requested),
            FeeBasis::Net => {
                let (_, surcharge) = requested.split_fee(self.rate_bps)?;
                requested.checked_add(surcharge)
            }
        }
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
    fn test_net_basis_recovers_surcharge() {
        let policy = FeePolicy::new(100, FeeBasis::Net).unwrap();
        let split = policy.split(cents(10100)).unwrap();
        assert_eq!(split.net, cents(10000));
        assert_eq!(split.fee, cents(100));
    }

    #[test]
    fn test_gross_basis_deducts_from_capture() {
        let policy = FeePolicy::new(100, FeeBasis::Gross).unwrap();
        let split = policy.split(cents(10100)).unwrap();
        assert_eq!(split.net, cents(9999));
        assert_eq!(split.fee, cents(101));
    }

    #[test]
    fn test_quote_adds_surcharge() {
        let policy = FeePolicy::new(100, FeeBasis::Net).unwrap();
        let gross = policy.quote(cents(1000)).unwrap();
        assert_eq!(gross, cents(1010));
        assert_eq!(policy.split(gross).unwrap().net, cents(1000));

        let gross_policy = FeePolicy::new(100, FeeBasis::Gross).unwrap();
        assert_eq!(gross_policy.quote(cents(1000)).unwrap(), cents(1000));
    }

    #[test]
    fn test_rejects_rate_above_scale() {
        assert!(FeePolicy::new(10_001, FeeBasis::Gross).is_err());
    }

    #[test]
    fn test_fee_basis_parse() {
        assert_eq!("NET".parse::<FeeBasis>().unwrap(), FeeBasis::Net);
        assert_eq!("gross".parse::<FeeBasis>().unwrap(), FeeBasis::Gross);
        assert!("other".parse::<FeeBasis>().is_err());
    }

    proptest! {
        #[test]
        fn prop_split_conserves_cents(
            gross in 0i64..1_000_000_000_000,
            rate in 0u32..=10_000,
            net_basis in any::<bool>(),
        ) {
            let basis = if net_basis { FeeBasis::Net } else { FeeBasis::Gross };
            let policy = FeePolicy::new(rate, basis).unwrap();
            let split = policy.split(cents(gross)).unwrap();
            prop_assert!(!split.net.is_negative());
            prop_assert!(!split.fee.is_negative());
            prop_assert_eq!(split.net.checked_add(split.fee).unwrap(), split.gross);
        }
    }
}
