//! The mutable progress of one swap.
//!
//! Progress is tracked per leg with an explicit transition table instead of
//! free-form flags. The flags callers care about are derived from the path a
//! leg took, so a leg can never hold both a redeem and a refund broadcast and
//! nothing moves once a leg is redeemed or refunded.

use crate::{
    chain::{KeyPath, TxId},
    observation::LockLocation,
    observer::LockParams,
    terms::SwapTerms,
    Leg, Role, Secret, SecretHash, SwapId,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

#[derive(
    Clone, Copy, Debug, strum_macros::Display, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    Unfunded,
    PaymentBroadcast,
    PaymentConfirmed,
    RedeemBroadcast,
    RedeemConfirmed,
    RefundBroadcast,
    RefundConfirmed,
}

impl LegState {
    pub const ALL: [LegState; 7] = [
        LegState::Unfunded,
        LegState::PaymentBroadcast,
        LegState::PaymentConfirmed,
        LegState::RedeemBroadcast,
        LegState::RedeemConfirmed,
        LegState::RefundBroadcast,
        LegState::RefundConfirmed,
    ];

    pub fn can_transition_to(self, next: LegState) -> bool {
        use LegState::*;

        matches!(
            (self, next),
            (Unfunded, PaymentBroadcast)
                | (Unfunded, PaymentConfirmed)
                | (PaymentBroadcast, PaymentConfirmed)
                | (PaymentConfirmed, RedeemBroadcast)
                | (PaymentConfirmed, RedeemConfirmed)
                | (RedeemBroadcast, RedeemConfirmed)
                | (PaymentBroadcast, RefundBroadcast)
                | (PaymentConfirmed, RefundBroadcast)
                | (RefundBroadcast, RefundConfirmed)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, LegState::RedeemConfirmed | LegState::RefundConfirmed)
    }
}

/// Every state a leg went through, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegHistory(Vec<LegState>);

impl LegHistory {
    pub fn current(&self) -> LegState {
        self.0.last().copied().unwrap_or(LegState::Unfunded)
    }

    pub fn has_reached(&self, state: LegState) -> bool {
        state == LegState::Unfunded || self.0.contains(&state)
    }

    fn push(&mut self, state: LegState) {
        self.0.push(state)
    }

    fn iter(&self) -> impl Iterator<Item = &LegState> {
        self.0.iter()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    strum_macros::Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum StateFlag {
    PaymentBroadcast,
    PaymentConfirmed,
    PartyPaymentConfirmed,
    RedeemBroadcast,
    RedeemConfirmed,
    RefundBroadcast,
    RefundConfirmed,
    Canceled,
}

#[derive(
    Clone, Copy, Debug, strum_macros::Display, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    AwaitingOwnBroadcast,
    AwaitingCounterpartyInitiate,
    Locked,
    AwaitingRedeemOrTimeout,
    Redeemed,
    Refunded,
    Completed,
    Canceled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Refunded | Phase::Canceled)
    }
}

/// Why a swap was abandoned before any of our funds were locked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "details", rename_all = "snake_case")]
pub enum CancelReason {
    TermsViolation(String),
    CounterpartyTimeout,
    ObservationFailed(String),
    FundingFailed(String),
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::TermsViolation(details) => write!(f, "terms violated: {}", details),
            CancelReason::CounterpartyTimeout => f.write_str("counterparty did not lock in time"),
            CancelReason::ObservationFailed(details) => {
                write!(f, "observing the chain failed: {}", details)
            }
            CancelReason::FundingFailed(details) => {
                write!(f, "funding own lock failed: {}", details)
            }
            CancelReason::Requested => f.write_str("canceled on request"),
        }
    }
}

/// Key paths handed to the wallet; the engine never sees key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPaths {
    /// Funds and refunds the own lock.
    pub payment: KeyPath,
    /// Redeems the counterparty's lock.
    pub redeem: KeyPath,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub role: Role,
    pub terms: SwapTerms,
    pub key_paths: KeyPaths,
    secret: Option<Secret>,
    secret_hash: Option<SecretHash>,
    pub payment_tx_id: Option<TxId>,
    pub party_payment_tx_id: Option<TxId>,
    pub redeem_tx_id: Option<TxId>,
    pub refund_tx_id: Option<TxId>,
    pub own_lock: Option<LockLocation>,
    pub party_lock: Option<LockLocation>,
    phase: Phase,
    cancel_reason: Option<CancelReason>,
    own: LegHistory,
    party: LegHistory,
}

impl SwapRecord {
    pub fn new(role: Role, terms: SwapTerms, key_paths: KeyPaths) -> Self {
        SwapRecord {
            id: terms.swap_id,
            role,
            terms,
            key_paths,
            secret: None,
            secret_hash: None,
            payment_tx_id: None,
            party_payment_tx_id: None,
            redeem_tx_id: None,
            refund_tx_id: None,
            own_lock: None,
            party_lock: None,
            phase: Phase::Created,
            cancel_reason: None,
            own: LegHistory::default(),
            party: LegHistory::default(),
        }
    }

    pub fn secret(&self) -> Option<Secret> {
        self.secret
    }

    pub fn secret_hash(&self) -> Option<SecretHash> {
        self.secret_hash
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        self.cancel_reason.as_ref()
    }

    pub fn leg_state(&self, leg: Leg) -> LegState {
        self.history(leg).current()
    }

    pub fn history(&self, leg: Leg) -> &LegHistory {
        match leg {
            Leg::Own => &self.own,
            Leg::Party => &self.party,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether our own funds are committed on chain.
    pub fn is_locked(&self) -> bool {
        self.own.current() != LegState::Unfunded
    }

    /// Records the secret hash, either generated or announced.
    pub fn set_secret_hash(&mut self, secret_hash: SecretHash) -> Result<(), TransitionError> {
        match self.secret_hash {
            Some(known) if known != secret_hash => Err(TransitionError::SecretHashConflict),
            _ => {
                self.secret_hash = Some(secret_hash);
                Ok(())
            }
        }
    }

    /// Records the secret after recomputing its hash.
    pub fn set_secret(&mut self, secret: Secret) -> Result<(), TransitionError> {
        let secret_hash = secret.hash();

        match self.secret_hash {
            Some(known) if !known.verify(&secret) => Err(TransitionError::SecretMismatch),
            _ => {
                self.secret_hash = Some(secret_hash);
                self.secret = Some(secret);
                Ok(())
            }
        }
    }

    pub fn transition(&mut self, leg: Leg, next: LegState) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::Finished(self.phase));
        }

        let current = self.leg_state(leg);
        if !current.can_transition_to(next) {
            return Err(TransitionError::Leg {
                leg,
                from: current,
                to: next,
            });
        }

        match leg {
            Leg::Own => self.own.push(next),
            Leg::Party => self.party.push(next),
        }

        Ok(())
    }

    pub fn set_phase(&mut self, phase: Phase) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::Finished(self.phase));
        }

        self.phase = phase;
        Ok(())
    }

    /// Abandons the swap. Only possible while our own funds are not locked.
    pub fn cancel(&mut self, reason: CancelReason) -> Result<(), TransitionError> {
        if self.phase.is_terminal() {
            return Err(TransitionError::Finished(self.phase));
        }
        if self.is_locked() {
            return Err(TransitionError::Locked);
        }

        self.phase = Phase::Canceled;
        self.cancel_reason = Some(reason);

        Ok(())
    }

    pub fn flags(&self, leg: Leg) -> BTreeSet<StateFlag> {
        let mut flags = self
            .history(leg)
            .iter()
            .filter_map(|state| match (leg, state) {
                (_, LegState::Unfunded) => None,
                (_, LegState::PaymentBroadcast) => Some(StateFlag::PaymentBroadcast),
                (Leg::Own, LegState::PaymentConfirmed) => Some(StateFlag::PaymentConfirmed),
                (Leg::Party, LegState::PaymentConfirmed) => Some(StateFlag::PartyPaymentConfirmed),
                (_, LegState::RedeemBroadcast) => Some(StateFlag::RedeemBroadcast),
                (_, LegState::RedeemConfirmed) => Some(StateFlag::RedeemConfirmed),
                (_, LegState::RefundBroadcast) => Some(StateFlag::RefundBroadcast),
                (_, LegState::RefundConfirmed) => Some(StateFlag::RefundConfirmed),
            })
            .collect::<BTreeSet<_>>();

        if self.phase == Phase::Canceled {
            flags.insert(StateFlag::Canceled);
        }

        flags
    }

    /// What the lock of `leg` must look like on chain.
    pub fn lock_params(&self, leg: Leg) -> anyhow::Result<LockParams> {
        let secret_hash = self
            .secret_hash
            .context("secret hash of swap is not yet known")?;

        let (payer, payment_tx_id) = match leg {
            Leg::Own => (self.role, self.payment_tx_id.clone()),
            Leg::Party => (self.role.counterparty(), self.party_payment_tx_id.clone()),
        };

        let mut params = self.terms.lock_params(payer, secret_hash)?;
        params.payment_tx_id = payment_tx_id;

        Ok(params)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("{leg} leg cannot move from {from} to {to}")]
    Leg {
        leg: Leg,
        from: LegState,
        to: LegState,
    },
    #[error("own funds are locked, swap can no longer be canceled")]
    Locked,
    #[error("swap already finished as {0}")]
    Finished(Phase),
    #[error("secret does not match the secret hash of the swap")]
    SecretMismatch,
    #[error("secret hash conflicts with the one already known")]
    SecretHashConflict,
}
