//! The economic terms of a swap, immutable once both parties agreed.

use crate::{
    asset::{Amount, AmountError, Currency},
    observer::LockParams,
    RelativeTime, Role, SecretHash, SwapId, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapTerms {
    pub swap_id: SwapId,
    pub symbol: Symbol,
    pub position: Position,
    pub price: Decimal,
    pub qty: Decimal,
    pub initiator: PartyTerms,
    pub acceptor: PartyTerms,
    pub rewards: Rewards,
    pub lock_times: LockTimes,
    pub created_at: Timestamp,
}

/// A trading pair, `price` is expressed in `quote` per unit of `base`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub base: Currency,
    pub quote: Currency,
}

/// The side of the initiator.
#[derive(
    Clone,
    Copy,
    Debug,
    strum_macros::Display,
    strum_macros::EnumString,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// The initiator pays `qty * price` of quote and receives `qty` of base.
    Buy,
    /// The initiator pays `qty` of base and receives `qty * price` of quote.
    Sell,
}

/// Addresses of one party.
///
/// `receiving_address` lives on the chain the party receives on,
/// `refund_address` on the chain the party pays on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyTerms {
    pub receiving_address: String,
    pub refund_address: String,
}

/// Reward for redeem embedded in each party's own lock, in the currency of
/// that lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rewards {
    pub initiator: Decimal,
    pub acceptor: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LockWindows")]
pub struct LockTimes {
    initiator: RelativeTime,
    acceptor: RelativeTime,
}

#[derive(Deserialize)]
struct LockWindows {
    initiator: RelativeTime,
    acceptor: RelativeTime,
}

impl TryFrom<LockWindows> for LockTimes {
    type Error = TermsError;

    fn try_from(windows: LockWindows) -> Result<Self, Self::Error> {
        LockTimes::new(windows.initiator, windows.acceptor)
    }
}

impl LockTimes {
    pub fn new(initiator: RelativeTime, acceptor: RelativeTime) -> Result<Self, TermsError> {
        if acceptor >= initiator {
            return Err(TermsError::LockWindows {
                initiator,
                acceptor,
            });
        }

        Ok(LockTimes {
            initiator,
            acceptor,
        })
    }

    pub fn window(&self, role: Role) -> RelativeTime {
        match role {
            Role::Initiator => self.initiator,
            Role::Acceptor => self.acceptor,
        }
    }
}

impl Default for LockTimes {
    fn default() -> Self {
        LockTimes {
            initiator: RelativeTime::from_hours(10),
            acceptor: RelativeTime::from_hours(5),
        }
    }
}

impl SwapTerms {
    pub fn pays(&self, role: Role) -> &Currency {
        match (role, self.position) {
            (Role::Initiator, Position::Buy) | (Role::Acceptor, Position::Sell) => {
                &self.symbol.quote
            }
            (Role::Initiator, Position::Sell) | (Role::Acceptor, Position::Buy) => {
                &self.symbol.base
            }
        }
    }

    pub fn receives(&self, role: Role) -> &Currency {
        self.pays(role.counterparty())
    }

    /// The amount `role` has to lock, in base units of its currency.
    pub fn payment(&self, role: Role) -> Result<Amount, TermsError> {
        let currency = self.pays(role);

        let value = if *currency == self.symbol.quote {
            self.qty
                .checked_mul(self.price)
                .ok_or(TermsError::Overflow)?
        } else {
            self.qty
        };

        Ok(currency.to_base_units(value)?)
    }

    pub fn reward(&self, role: Role) -> Result<Amount, TermsError> {
        let reward = match role {
            Role::Initiator => self.rewards.initiator,
            Role::Acceptor => self.rewards.acceptor,
        };

        Ok(self.pays(role).to_base_units(reward)?)
    }

    /// When the lock funded by `role` becomes refundable.
    pub fn refund_time(&self, role: Role) -> Timestamp {
        self.created_at
            .plus(self.lock_times.window(role).as_secs())
    }

    fn party(&self, role: Role) -> &PartyTerms {
        match role {
            Role::Initiator => &self.initiator,
            Role::Acceptor => &self.acceptor,
        }
    }

    /// What the lock funded by `payer` must look like on chain.
    pub fn lock_params(&self, payer: Role, secret_hash: SecretHash) -> Result<LockParams, TermsError> {
        Ok(LockParams {
            secret_hash,
            currency: self.pays(payer).clone(),
            redeem_address: self.party(payer.counterparty()).receiving_address.clone(),
            refund_address: self.party(payer).refund_address.clone(),
            amount: self.payment(payer)?,
            reward_for_redeem: self.reward(payer)?,
            refund_time: self.refund_time(payer),
            start_of_swap: self.created_at,
            payment_tx_id: None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TermsError {
    #[error("acceptor lock window {acceptor} must be shorter than initiator lock window {initiator}")]
    LockWindows {
        initiator: RelativeTime,
        acceptor: RelativeTime,
    },
    #[error("price times quantity does not fit")]
    Overflow,
    #[error(transparent)]
    Amount(#[from] AmountError),
}
