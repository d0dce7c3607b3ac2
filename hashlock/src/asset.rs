use crate::chain::ChainFamily;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A quantity expressed in the smallest unit of its chain.
///
/// Satoshi for UTXO chains, wei or token digits for event-log chains and
/// mutez or token digits for entrypoint chains. Serialized as a decimal
/// string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_base_units(units: u128) -> Self {
        Amount(units)
    }

    pub fn as_base_units(self) -> u128 {
        self.0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// `None` if the total does not fit into base units.
    pub fn checked_sum<I>(amounts: I) -> Option<Amount>
    where
        I: IntoIterator<Item = Amount>,
    {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |total, amount| total.checked_add(amount))
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for Amount {
    fn from(units: u64) -> Self {
        Amount(u128::from(units))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = Amount;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an amount in base units as decimal string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Amount, E>
            where
                E: de::Error,
            {
                v.parse::<u128>().map(Amount).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// A currency a swap leg can be denominated in.
///
/// The chain family decides which observer watches locks of this currency,
/// the number of decimals how agreed decimal quantities map onto
/// [`Amount`]s.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub family: ChainFamily,
    pub decimals: u32,
}

impl Currency {
    pub fn new(code: impl Into<String>, family: ChainFamily, decimals: u32) -> Self {
        Currency {
            code: code.into(),
            family,
            decimals,
        }
    }

    /// Scales `value` by `10^decimals` and truncates toward zero.
    ///
    /// Both parties derive lock requirements through this function, hence
    /// they always agree on the exact amount in base units.
    pub fn to_base_units(&self, value: Decimal) -> Result<Amount, AmountError> {
        if value.is_sign_negative() {
            return Err(AmountError::Negative {
                currency: self.code.clone(),
            });
        }

        let overflow = || AmountError::Overflow {
            currency: self.code.clone(),
        };

        // Whole and fractional parts are scaled separately so that large
        // quantities of 18-decimal currencies stay within integer range.
        let ten = Decimal::from(10u8);
        let whole = value.trunc().to_u64().ok_or_else(overflow)?;
        let fraction = (0..self.decimals)
            .try_fold(value.fract(), |acc, _| acc.checked_mul(ten))
            .and_then(|scaled| scaled.trunc().to_u64())
            .ok_or_else(overflow)?;

        let units = 10u128
            .checked_pow(self.decimals)
            .and_then(|factor| u128::from(whole).checked_mul(factor))
            .and_then(|whole| whole.checked_add(u128::from(fraction)))
            .ok_or_else(overflow)?;

        Ok(Amount(units))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AmountError {
    #[error("negative amount of {currency}")]
    Negative { currency: String },
    #[error("amount of {currency} does not fit into base units")]
    Overflow { currency: String },
}
