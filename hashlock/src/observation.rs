use crate::{asset::Amount, chain::TxId, Secret};
use serde::{Deserialize, Serialize};

pub type ObservationResult = Result<Observation, ObservationError>;

/// The answer of one chain check.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    NotYet,
    Detected(Detected),
}

impl Observation {
    pub fn is_detected(&self) -> bool {
        matches!(self, Observation::Detected(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detected {
    pub tx_id: TxId,
    /// Total locked, summed over the initial lock and every top-up.
    pub amount: Amount,
    /// The redeem-fee allowance embedded in the lock.
    pub reward: Amount,
    pub counterparty: Option<String>,
    /// Only set by redeem checks, and only after the hash was recomputed.
    pub secret: Option<Secret>,
    pub location: LockLocation,
}

/// Where the funds of a lock sit on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LockLocation {
    Utxo(Vec<Outpoint>),
    Contract(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: TxId,
    pub vout: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ObservationError {
    #[error("request to chain endpoint failed: {0:#}")]
    Request(anyhow::Error),
    #[error("lock refunds at {actual}, agreed was {expected}")]
    InvalidRefundLockTime { expected: u64, actual: u64 },
    #[error("lock rewards the redeemer with {actual}, agreed was {expected}")]
    InvalidRewardForRedeem { expected: Amount, actual: Amount },
    #[error("lock holds {detected}, {required} is required")]
    InsufficientAmount { required: Amount, detected: Amount },
    #[error("lock pays out to {actual}, agreed was {expected}")]
    InvalidRedeemAddress { expected: String, actual: String },
    #[error("internal error during observation: {0:#}")]
    Internal(anyhow::Error),
}

impl ObservationError {
    /// Transient errors are retried, everything else ends the check.
    pub fn is_transient(&self) -> bool {
        matches!(self, ObservationError::Request(_))
    }

    /// The detected lock violates the agreed terms.
    pub fn is_terms_violation(&self) -> bool {
        matches!(
            self,
            ObservationError::InvalidRefundLockTime { .. }
                | ObservationError::InvalidRewardForRedeem { .. }
                | ObservationError::InsufficientAmount { .. }
                | ObservationError::InvalidRedeemAddress { .. }
        )
    }
}
