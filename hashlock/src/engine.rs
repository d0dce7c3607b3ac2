//! Drives one swap from agreed terms to a settled outcome.
//!
//! Every step first looks at the persisted leg states and skips whatever is
//! already done, so running a record again resumes it. Funds are never
//! broadcast twice for the same leg.

mod acceptor;
mod executor;
mod initiator;

pub use self::executor::SwapExecutor;

use crate::{
    asset::Currency,
    chain::{Broadcast, ChainFamily, LedgerTime, TxId, UnsignedTx, WalletSigner},
    channel::{CounterpartyChannel, Message, MessageKind},
    observation::{Detected, LockLocation, Observation, ObservationError},
    observer::{ChainObserver, Check, LockParams},
    poll::{poll, CancelToken, LegTasks, PollOutcome, PollParams},
    record::{CancelReason, LegState, Phase, SwapRecord, TransitionError},
    refund_guard::{Expiry, RefundError, RefundGuard},
    repository::SwapRepository,
    Leg, Role, SwapId, Timestamp,
};
use anyhow::Context;
use std::{collections::HashMap, convert::TryFrom, fmt, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing_futures::Instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    /// Applies to every poll that is not bounded by a refund time anyway.
    pub max_attempts: Option<u32>,
    pub guard_interval: Duration,
    /// How long an acceptor waits for the initiator's lock, counted from the
    /// creation of the swap.
    pub party_payment_timeout: Duration,
    pub message_timeout: Duration,
    /// Reserved for redeeming a counterparty lock before it becomes
    /// refundable.
    pub redeem_margin: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            poll_interval: Duration::from_secs(10),
            max_attempts: None,
            guard_interval: Duration::from_secs(60),
            party_payment_timeout: Duration::from_secs(60 * 60),
            message_timeout: Duration::from_secs(5 * 60),
            redeem_margin: Duration::from_secs(60 * 60),
        }
    }
}

/// Everything the engine talks to on one chain endpoint.
#[derive(Clone)]
pub struct LedgerHandle {
    pub observer: Arc<ChainObserver>,
    pub broadcaster: Arc<dyn Broadcast>,
    pub clock: Arc<dyn LedgerTime>,
}

impl fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerHandle")
            .field("observer", &self.observer)
            .finish()
    }
}

/// Ledger handles by currency code.
#[derive(Clone, Debug, Default)]
pub struct Ledgers(HashMap<String, LedgerHandle>);

impl Ledgers {
    pub fn with(mut self, code: impl Into<String>, handle: LedgerHandle) -> Self {
        let _ = self.0.insert(code.into(), handle);
        self
    }

    pub fn get(&self, currency: &Currency) -> Result<&LedgerHandle, EngineError> {
        let handle = self
            .0
            .get(&currency.code)
            .ok_or_else(|| EngineError::UnknownCurrency(currency.code.clone()))?;

        let observed = handle.observer.family();
        if observed != currency.family {
            return Err(EngineError::FamilyMismatch {
                code: currency.code.clone(),
                expected: currency.family,
                observed,
            });
        }

        Ok(handle)
    }
}

/// Progress notifications, published after the change was persisted.
#[derive(Clone, Debug, PartialEq)]
pub enum SwapEvent {
    PhaseChanged { swap_id: SwapId, phase: Phase },
    LegChanged {
        swap_id: SwapId,
        leg: Leg,
        state: LegState,
    },
    Canceled {
        swap_id: SwapId,
        reason: CancelReason,
    },
    RefundBroadcast { swap_id: SwapId, tx_id: TxId },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no ledger configured for {0}")]
    UnknownCurrency(String),
    #[error("ledger for {code} observes {observed} chains, the currency lives on {expected}")]
    FamilyMismatch {
        code: String,
        expected: ChainFamily,
        observed: ChainFamily,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("failed to persist swap: {0:#}")]
    Persist(anyhow::Error),
    #[error("counterparty channel failed: {0:#}")]
    Channel(anyhow::Error),
    #[error("counterparty sent {0} out of order")]
    UnexpectedMessage(MessageKind),
    #[error("failed to sign {action}: {error:#}")]
    Sign {
        action: &'static str,
        error: anyhow::Error,
    },
    #[error("failed to broadcast {action}: {error:#}")]
    Broadcast {
        action: &'static str,
        error: anyhow::Error,
    },
    #[error("secret of swap is not known")]
    SecretUnknown,
    #[error("counterparty lock is missing: {0}")]
    PartyLockMissing(CancelReason),
    #[error("{what} not confirmed: {outcome}")]
    NotConfirmed {
        what: &'static str,
        outcome: PollOutcome,
    },
    #[error(transparent)]
    Refund(#[from] RefundError),
    #[error("location of own lock is not known")]
    OwnLockUnknown,
    #[error("swap stopped unsettled in phase {0}")]
    Unsettled(Phase),
}

/// Attached to failures that happen while our own funds are locked.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("swap execution failed")]
pub struct SwapFailedShouldRefund<E: fmt::Debug>(pub E);

#[derive(Clone)]
pub struct SwapEngine {
    ledgers: Arc<Ledgers>,
    signer: Arc<dyn WalletSigner>,
    channel: Arc<dyn CounterpartyChannel>,
    repository: Arc<dyn SwapRepository>,
    events: mpsc::UnboundedSender<SwapEvent>,
    settings: EngineSettings,
}

impl fmt::Debug for SwapEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapEngine")
            .field("ledgers", &self.ledgers)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SwapEngine {
    pub fn new(
        ledgers: Ledgers,
        signer: Arc<dyn WalletSigner>,
        channel: Arc<dyn CounterpartyChannel>,
        repository: Arc<dyn SwapRepository>,
        settings: EngineSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SwapEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();

        let engine = SwapEngine {
            ledgers: Arc::new(ledgers),
            signer,
            channel,
            repository,
            events,
            settings,
        };

        (engine, receiver)
    }

    /// Runs the swap until it reaches a terminal phase.
    ///
    /// `cancel` is only honoured until our own funds are locked. An error
    /// leaves the persisted record where the failing step found it, a swap
    /// that stops short of a terminal phase is an error as well.
    pub async fn run(&self, record: SwapRecord, cancel: CancelToken) -> anyhow::Result<SwapRecord> {
        let span = tracing::error_span!("swap", swap_id = %record.id, role = %record.role);

        let mut swap = Execution {
            engine: self.clone(),
            record,
            cancel,
            tasks: LegTasks::default(),
        };

        async move {
            if swap.record.is_terminal() {
                return Ok(swap.record);
            }

            let result = match swap.record.role {
                Role::Initiator => initiator::run(&mut swap).await,
                Role::Acceptor => acceptor::run(&mut swap).await,
            };
            swap.tasks.cancel_all();
            result?;

            if !swap.record.is_terminal() {
                return Err(EngineError::Unsettled(swap.record.phase()).into());
            }

            Ok(swap.record)
        }
        .instrument(span)
        .await
    }

    fn publish(&self, event: SwapEvent) {
        let _ = self.events.send(event);
    }
}

/// Whether the counterparty's lock showed up as agreed.
#[derive(Debug)]
enum PartyLock {
    Confirmed,
    Missing(CancelReason),
}

/// The state of one running swap.
struct Execution {
    engine: SwapEngine,
    record: SwapRecord,
    cancel: CancelToken,
    tasks: LegTasks,
}

impl Execution {
    fn ledger(&self, leg: Leg) -> Result<LedgerHandle, EngineError> {
        let currency = match leg {
            Leg::Own => self.record.terms.pays(self.record.role),
            Leg::Party => self.record.terms.receives(self.record.role),
        };

        self.engine.ledgers.get(currency).map(Clone::clone)
    }

    fn poll_params(&self) -> PollParams {
        PollParams::every(self.engine.settings.poll_interval)
            .with_max_attempts(self.engine.settings.max_attempts)
    }

    async fn save(&self) -> Result<(), EngineError> {
        self.engine
            .repository
            .upsert(&self.record)
            .await
            .map_err(EngineError::Persist)
    }

    async fn advance(&mut self, leg: Leg, state: LegState) -> Result<(), EngineError> {
        self.record.transition(leg, state)?;
        self.save().await?;

        tracing::debug!("{} leg is {}", leg, state);
        self.engine.publish(SwapEvent::LegChanged {
            swap_id: self.record.id,
            leg,
            state,
        });

        Ok(())
    }

    async fn enter(&mut self, phase: Phase) -> Result<(), EngineError> {
        if self.record.phase() == phase {
            return Ok(());
        }

        self.record.set_phase(phase)?;
        self.save().await?;

        tracing::info!("swap is {}", phase);
        self.engine.publish(SwapEvent::PhaseChanged {
            swap_id: self.record.id,
            phase,
        });

        Ok(())
    }

    async fn abandon(&mut self, reason: CancelReason) -> anyhow::Result<()> {
        self.record.cancel(reason.clone())?;
        self.tasks.cancel_all();
        self.save().await?;

        tracing::warn!("swap canceled: {}", reason);
        self.engine.publish(SwapEvent::Canceled {
            swap_id: self.record.id,
            reason,
        });

        Ok(())
    }

    /// Awaits a message, `Err` carries why waiting was given up.
    async fn receive(
        &self,
        kind: MessageKind,
        timeout: Duration,
        mut cancel: CancelToken,
    ) -> Result<Result<Message, CancelReason>, EngineError> {
        let receive = tokio::time::timeout(timeout, self.engine.channel.receive(self.record.id, kind));

        tokio::select! {
            received = receive => match received {
                Ok(Ok(message)) => Ok(Ok(message)),
                Ok(Err(e)) => Err(EngineError::Channel(e)),
                Err(_) => {
                    tracing::debug!("no {} message within {:?}", kind, timeout);
                    Ok(Err(CancelReason::CounterpartyTimeout))
                }
            },
            _ = cancel.canceled() => Ok(Err(CancelReason::Requested)),
        }
    }

    /// Polls a check on the lock of `leg` in its own task, superseding any
    /// poll still running for that leg.
    fn spawn_poll(
        &mut self,
        leg: Leg,
        check: Check,
        params: LockParams,
        poll_params: PollParams,
        cancel: CancelToken,
    ) -> Result<tokio::sync::oneshot::Receiver<PollOutcome>, EngineError> {
        let observer = self.ledger(leg)?.observer;

        Ok(self.tasks.spawn(leg, move |token| async move {
            poll(
                || observer.check(check, &params),
                poll_params,
                token.or(cancel),
            )
            .await
        }))
    }

    async fn poll_leg(
        &mut self,
        leg: Leg,
        check: Check,
        params: LockParams,
        poll_params: PollParams,
        cancel: CancelToken,
    ) -> Result<PollOutcome, EngineError> {
        let outcome = self
            .spawn_poll(leg, check, params, poll_params, cancel)?
            .await
            .unwrap_or_else(|_| {
                PollOutcome::Failed(ObservationError::Internal(anyhow::anyhow!(
                    "{} leg poll ended without result",
                    leg
                )))
            });

        Ok(outcome)
    }

    /// Locks our own funds unless that already happened.
    async fn fund_own(&mut self) -> anyhow::Result<()> {
        if self.record.leg_state(Leg::Own) != LegState::Unfunded {
            return Ok(());
        }
        if self.cancel.is_canceled() {
            return self.abandon(CancelReason::Requested).await;
        }

        self.enter(Phase::AwaitingOwnBroadcast).await?;

        let params = self.record.lock_params(Leg::Own)?;
        let ledger = self.ledger(Leg::Own)?;

        let signed = match self
            .engine
            .signer
            .sign(UnsignedTx::lock(params), &self.record.key_paths.payment)
            .await
        {
            Ok(signed) => signed,
            Err(e) => return self.abandon(CancelReason::FundingFailed(format!("{:#}", e))).await,
        };
        let tx_id = ledger
            .broadcaster
            .broadcast(signed)
            .await
            .map_err(|error| EngineError::Broadcast {
                action: "lock",
                error,
            })?;

        tracing::info!("own lock broadcast in {}", tx_id);

        self.record.payment_tx_id = Some(tx_id.clone());
        self.advance(Leg::Own, LegState::PaymentBroadcast).await?;

        if let Err(e) = self
            .engine
            .channel
            .send(self.record.id, Message::PaymentTxId(tx_id))
            .await
        {
            tracing::warn!("failed to announce own lock: {:#}", e);
        }

        Ok(())
    }

    /// Waits until our broadcast lock is confirmed on chain.
    async fn confirm_own(&mut self) -> anyhow::Result<()> {
        if self.record.leg_state(Leg::Own) != LegState::PaymentBroadcast {
            return Ok(());
        }

        let params = self.record.lock_params(Leg::Own)?;
        let poll_params = self.poll_params().until(params.refund_time);

        match self
            .poll_leg(
                Leg::Own,
                Check::Initiated {
                    verify_reward: false,
                },
                params,
                poll_params,
                CancelToken::never(),
            )
            .await?
        {
            PollOutcome::Detected(detected) => {
                self.record.own_lock = Some(detected.location);
                self.advance(Leg::Own, LegState::PaymentConfirmed).await?;
                self.enter(Phase::Locked).await?;

                Ok(())
            }
            outcome => Err(EngineError::NotConfirmed {
                what: "own lock",
                outcome,
            })
            .context(SwapFailedShouldRefund(self.record.id)),
        }
    }

    /// Waits for the counterparty's lock to match the agreed terms.
    async fn await_party_lock(
        &mut self,
        deadline: Timestamp,
        cancel: CancelToken,
    ) -> anyhow::Result<PartyLock> {
        if self
            .record
            .history(Leg::Party)
            .has_reached(LegState::PaymentConfirmed)
        {
            return Ok(PartyLock::Confirmed);
        }

        let family = self.record.terms.receives(self.record.role).family;
        if family == ChainFamily::Utxo && self.record.party_payment_tx_id.is_none() {
            let timeout = Timestamp::now().until(deadline);

            match self
                .receive(MessageKind::PaymentTxId, timeout, cancel.clone())
                .await?
            {
                Ok(Message::PaymentTxId(tx_id)) => {
                    self.record.party_payment_tx_id = Some(tx_id);
                    self.save().await?;
                }
                Ok(other) => return Err(EngineError::UnexpectedMessage(other.kind()).into()),
                Err(reason) => return Ok(PartyLock::Missing(reason)),
            }
        }

        let params = self.record.lock_params(Leg::Party)?;
        let poll_params = self.poll_params().until(deadline);

        let outcome = self
            .poll_leg(
                Leg::Party,
                Check::Initiated {
                    verify_reward: true,
                },
                params,
                poll_params,
                cancel,
            )
            .await?;

        let reason = match outcome {
            PollOutcome::Detected(detected) => {
                if self.record.party_payment_tx_id.is_none() {
                    self.record.party_payment_tx_id = Some(detected.tx_id);
                }
                self.record.party_lock = Some(detected.location);
                self.advance(Leg::Party, LegState::PaymentConfirmed).await?;

                return Ok(PartyLock::Confirmed);
            }
            PollOutcome::Failed(e) if e.is_terms_violation() => {
                CancelReason::TermsViolation(e.to_string())
            }
            PollOutcome::Failed(e) => CancelReason::ObservationFailed(e.to_string()),
            PollOutcome::AttemptsExhausted { .. } | PollOutcome::DeadlineReached => {
                CancelReason::CounterpartyTimeout
            }
            PollOutcome::Canceled => CancelReason::Requested,
        };

        Ok(PartyLock::Missing(reason))
    }

    /// Redeems the counterparty's lock with the secret and waits for the
    /// redeem to confirm.
    async fn redeem_party(&mut self) -> anyhow::Result<()> {
        if self.record.leg_state(Leg::Party) == LegState::PaymentConfirmed {
            let secret = self.record.secret().ok_or(EngineError::SecretUnknown)?;
            let location = self
                .record
                .party_lock
                .clone()
                .context("location of counterparty lock is not known")?;
            let params = self.record.lock_params(Leg::Party)?;
            let ledger = self.ledger(Leg::Party)?;

            let signed = self
                .engine
                .signer
                .sign(
                    UnsignedTx::redeem(params, location, secret),
                    &self.record.key_paths.redeem,
                )
                .await
                .map_err(|error| EngineError::Sign {
                    action: "redeem",
                    error,
                })?;
            let tx_id = ledger
                .broadcaster
                .broadcast(signed)
                .await
                .map_err(|error| EngineError::Broadcast {
                    action: "redeem",
                    error,
                })?;

            tracing::info!("redeem broadcast in {}", tx_id);

            self.record.redeem_tx_id = Some(tx_id);
            self.advance(Leg::Party, LegState::RedeemBroadcast).await?;
        }

        if self.record.leg_state(Leg::Party) == LegState::RedeemBroadcast {
            let params = self.record.lock_params(Leg::Party)?;
            let poll_params = self.poll_params().until(params.refund_time);

            match self
                .poll_leg(
                    Leg::Party,
                    Check::Redeemed,
                    params,
                    poll_params,
                    CancelToken::never(),
                )
                .await?
            {
                PollOutcome::Detected(_) => {
                    self.advance(Leg::Party, LegState::RedeemConfirmed).await?;
                    self.enter(Phase::Redeemed).await?;
                }
                outcome => {
                    return Err(EngineError::NotConfirmed {
                        what: "redeem",
                        outcome,
                    }
                    .into())
                }
            }
        }

        Ok(())
    }

    /// Lets a failure through unless our funds are locked, in which case the
    /// swap continues towards a refund.
    fn route_to_refund(&self, swap_result: anyhow::Result<()>) -> anyhow::Result<()> {
        if let Err(e) = swap_result {
            if e.downcast_ref::<SwapFailedShouldRefund<SwapId>>().is_some() {
                tracing::warn!("swap failed, recovering own funds: {:#}", e);
                return Ok(());
            }

            return Err(e);
        }

        Ok(())
    }

    /// Waits until our own lock is either redeemed by the counterparty or
    /// refunded by us.
    async fn settle_own(&mut self) -> anyhow::Result<()> {
        if self.record.leg_state(Leg::Own) == LegState::PaymentBroadcast {
            self.recover_own_lock().await?;
        }

        if matches!(
            self.record.leg_state(Leg::Own),
            LegState::PaymentBroadcast | LegState::PaymentConfirmed
        ) {
            self.enter(Phase::AwaitingRedeemOrTimeout).await?;

            let params = self.record.lock_params(Leg::Own)?;
            let location = match self.record.own_lock.clone() {
                Some(location) => location,
                None => self.locate_own_lock(&params).await?,
            };
            let key_path = self.record.key_paths.payment.clone();
            let ledger = self.ledger(Leg::Own)?;
            let signer = self.engine.signer.clone();

            let mut redeemed = self.spawn_poll(
                Leg::Own,
                Check::Redeemed,
                params.clone(),
                self.poll_params().with_max_attempts(None),
                CancelToken::never(),
            )?;

            let guard = RefundGuard {
                observer: ledger.observer.as_ref(),
                clock: ledger.clock.as_ref(),
                signer: signer.as_ref(),
                broadcaster: ledger.broadcaster.as_ref(),
                check_interval: self.engine.settings.guard_interval,
            };

            let expiry = {
                let expired = guard.await_expiry(&params, CancelToken::never());
                tokio::pin!(expired);

                tokio::select! {
                    polled = &mut redeemed => match polled {
                        Ok(PollOutcome::Detected(detected)) => Expiry::Redeemed(detected),
                        Ok(outcome) => {
                            tracing::warn!("watching own lock for a redeem stopped: {}", outcome);
                            expired.await?
                        }
                        Err(_) => expired.await?,
                    },
                    expiry = &mut expired => expiry?,
                }
            };
            self.tasks.cancel(Leg::Own);

            match expiry {
                Expiry::Redeemed(detected) => self.own_redeemed(detected).await?,
                Expiry::Refundable => {
                    let tx_id = guard.refund(&params, location, &key_path).await?;

                    self.record.refund_tx_id = Some(tx_id.clone());
                    self.advance(Leg::Own, LegState::RefundBroadcast).await?;
                    self.engine.publish(SwapEvent::RefundBroadcast {
                        swap_id: self.record.id,
                        tx_id,
                    });
                }
                Expiry::Canceled => return Ok(()),
            }
        }

        if self.record.leg_state(Leg::Own) == LegState::RefundBroadcast {
            self.confirm_refund().await?;
        }

        Ok(())
    }

    /// Keeps looking for a broadcast lock that was not confirmed in time,
    /// until its refund time.
    async fn recover_own_lock(&mut self) -> anyhow::Result<()> {
        let params = self.record.lock_params(Leg::Own)?;
        let poll_params = self
            .poll_params()
            .with_max_attempts(None)
            .until(params.refund_time);

        match self
            .poll_leg(
                Leg::Own,
                Check::Initiated {
                    verify_reward: false,
                },
                params,
                poll_params,
                CancelToken::never(),
            )
            .await?
        {
            PollOutcome::Detected(detected) => {
                self.record.own_lock = Some(detected.location);
                self.advance(Leg::Own, LegState::PaymentConfirmed).await?;
            }
            outcome => tracing::warn!("own lock still not confirmed: {}", outcome),
        }

        Ok(())
    }

    /// Looks up a lock whose confirmation we never saw. Contract locks fall
    /// back to the contract itself.
    async fn locate_own_lock(&mut self, params: &LockParams) -> anyhow::Result<LockLocation> {
        let observer = self.ledger(Leg::Own)?.observer;

        match observer.check_initiated(params, false).await {
            Ok(Observation::Detected(detected)) => {
                self.record.own_lock = Some(detected.location.clone());
                self.save().await?;

                return Ok(detected.location);
            }
            Ok(Observation::NotYet) => tracing::warn!("own lock not found on chain"),
            Err(e) => tracing::warn!("failed to look up own lock: {}", e),
        }

        let location = observer
            .contract_location()
            .ok_or(EngineError::OwnLockUnknown)?;

        Ok(location)
    }

    async fn own_redeemed(&mut self, detected: Detected) -> anyhow::Result<()> {
        tracing::info!("counterparty redeemed own lock in {}", detected.tx_id);

        if let (Some(secret), None) = (detected.secret, self.record.secret()) {
            self.record.set_secret(secret)?;
        }
        if self.record.leg_state(Leg::Own) == LegState::PaymentBroadcast {
            self.advance(Leg::Own, LegState::PaymentConfirmed).await?;
        }
        self.advance(Leg::Own, LegState::RedeemConfirmed).await?;

        Ok(())
    }

    async fn confirm_refund(&mut self) -> anyhow::Result<()> {
        let params = self.record.lock_params(Leg::Own)?;
        let poll_params = self.poll_params();

        match self
            .poll_leg(
                Leg::Own,
                Check::Refunded,
                params,
                poll_params,
                CancelToken::never(),
            )
            .await?
        {
            PollOutcome::Detected(_) => {
                self.advance(Leg::Own, LegState::RefundConfirmed).await?;
                self.enter(Phase::Refunded).await?;

                Ok(())
            }
            outcome => Err(EngineError::NotConfirmed {
                what: "refund",
                outcome,
            }
            .into()),
        }
    }
}

fn secs(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX)
}
