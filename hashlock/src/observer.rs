//! Stateless checks answering whether a lock was initiated, redeemed or
//! refunded in accordance with the agreed terms.
//!
//! The set of chain families is closed, hence [`ChainObserver`] is an enum
//! and not a trait object. Every variant presents the same three checks.

mod entrypoint;
mod event_log;
mod utxo;

pub use self::{entrypoint::EntrypointObserver, event_log::EventLogObserver, utxo::UtxoObserver};

use crate::{
    asset::{Amount, Currency},
    chain::{ChainFamily, TxId},
    observation::{Detected, LockLocation, Observation, ObservationError, ObservationResult},
    SecretHash, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything an observer needs to know about one lock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockParams {
    pub secret_hash: SecretHash,
    pub currency: Currency,
    pub redeem_address: String,
    pub refund_address: String,
    pub amount: Amount,
    pub reward_for_redeem: Amount,
    pub refund_time: Timestamp,
    pub start_of_swap: Timestamp,
    /// Needed by UTXO chains only, where the lock is found via the funding
    /// transaction.
    pub payment_tx_id: Option<TxId>,
}

impl LockParams {
    /// The least amount that satisfies an account or entrypoint lock.
    pub fn required_amount(&self) -> Amount {
        self.amount.saturating_sub(self.reward_for_redeem)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// `verify_reward` is set when checking the counterparty's lock.
    Initiated { verify_reward: bool },
    Redeemed,
    Refunded,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Initiated { .. } => f.write_str("initiated"),
            Check::Redeemed => f.write_str("redeemed"),
            Check::Refunded => f.write_str("refunded"),
        }
    }
}

#[derive(Debug)]
pub enum ChainObserver {
    Utxo(UtxoObserver),
    EventLog(EventLogObserver),
    Entrypoint(EntrypointObserver),
}

impl ChainObserver {
    pub fn family(&self) -> ChainFamily {
        match self {
            ChainObserver::Utxo(_) => ChainFamily::Utxo,
            ChainObserver::EventLog(_) => ChainFamily::EventLog,
            ChainObserver::Entrypoint(_) => ChainFamily::Entrypoint,
        }
    }

    /// Where locks of contract chains sit, known without looking at the
    /// chain. UTXO locks are only known once their funding transaction is.
    pub fn contract_location(&self) -> Option<LockLocation> {
        match self {
            ChainObserver::Utxo(_) => None,
            ChainObserver::EventLog(observer) => Some(observer.location()),
            ChainObserver::Entrypoint(observer) => Some(observer.location()),
        }
    }

    pub async fn check(&self, check: Check, params: &LockParams) -> ObservationResult {
        let observation = match check {
            Check::Initiated { verify_reward } => {
                self.check_initiated(params, verify_reward).await?
            }
            Check::Redeemed => self.check_redeemed(params).await?,
            Check::Refunded => self.check_refunded(params).await?,
        };

        if let Observation::Detected(detected) = &observation {
            tracing::info!(
                "{} lock {} detected in {} with {}",
                params.currency,
                check,
                detected.tx_id,
                detected.amount
            );
        }

        Ok(observation)
    }

    pub async fn check_initiated(
        &self,
        params: &LockParams,
        verify_reward: bool,
    ) -> ObservationResult {
        match self {
            ChainObserver::Utxo(observer) => observer.check_initiated(params).await,
            ChainObserver::EventLog(observer) => {
                observer.check_initiated(params, verify_reward).await
            }
            ChainObserver::Entrypoint(observer) => {
                observer.check_initiated(params, verify_reward).await
            }
        }
    }

    /// Only ever detects a redeem whose secret hashes to the agreed hash.
    pub async fn check_redeemed(&self, params: &LockParams) -> ObservationResult {
        let redeemed = match self {
            ChainObserver::Utxo(observer) => observer.scan_redeemed(params).await?,
            ChainObserver::EventLog(observer) => observer.scan_redeemed(params).await?,
            ChainObserver::Entrypoint(observer) => observer.scan_redeemed(params).await?,
        };

        Ok(redeemed.map_or(Observation::NotYet, Observation::Detected))
    }

    /// A refund that shows up next to a valid redeem is ambiguous and
    /// reported as `NotYet` until a later scan resolves it.
    pub async fn check_refunded(&self, params: &LockParams) -> ObservationResult {
        let refunded = match self {
            ChainObserver::Utxo(observer) => observer.scan_refunded(params).await?,
            ChainObserver::EventLog(observer) => observer.scan_refunded(params).await?,
            ChainObserver::Entrypoint(observer) => observer.scan_refunded(params).await?,
        };

        let refunded = match refunded {
            Some(refunded) => refunded,
            None => return Ok(Observation::NotYet),
        };

        if let Observation::Detected(redeemed) = self.check_redeemed(params).await? {
            tracing::warn!(
                "lock shows refund {} and redeem {}, checking again",
                refunded.tx_id,
                redeemed.tx_id
            );
            return Ok(Observation::NotYet);
        }

        Ok(Observation::Detected(refunded))
    }
}

fn detected(tx_id: TxId, location: LockLocation) -> Detected {
    Detected {
        tx_id,
        amount: Amount::ZERO,
        reward: Amount::ZERO,
        counterparty: None,
        secret: None,
        location,
    }
}

/// Sums a lock and its top-ups.
fn total_locked<I>(amounts: I) -> Result<Amount, ObservationError>
where
    I: IntoIterator<Item = Amount>,
{
    Amount::checked_sum(amounts).ok_or_else(|| {
        ObservationError::Internal(anyhow::anyhow!("locked amounts overflow base units"))
    })
}
