//! Forces a refund of our own lock once it expires unredeemed.

use crate::{
    chain::{Broadcast, KeyPath, LedgerTime, TxId, UnsignedTx, WalletSigner},
    observation::{Detected, LockLocation, Observation, ObservationError},
    observer::{ChainObserver, LockParams},
    poll::CancelToken,
    Timestamp,
};
use backoff::backoff::Constant;
use std::{fmt, time::Duration};

#[derive(Debug)]
pub enum GuardOutcome {
    /// The lock was redeemed before we refunded; nothing was broadcast.
    Redeemed(Detected),
    RefundBroadcast(TxId),
    Canceled,
}

/// How waiting for the refund time of a lock ended.
#[derive(Debug)]
pub enum Expiry {
    /// The refund time passed and the final redeem check found nothing.
    Refundable,
    Redeemed(Detected),
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error("failed to read ledger time: {0:#}")]
    LedgerTime(anyhow::Error),
    #[error("final redeem check failed: {0}")]
    Observation(#[from] ObservationError),
    #[error("failed to sign refund: {0:#}")]
    Sign(anyhow::Error),
    #[error("failed to broadcast refund: {0:#}")]
    Broadcast(anyhow::Error),
}

/// Waits for the refund time of a lock on the lock's own chain and then
/// refunds it, unless a redeem shows up first.
///
/// Reading the ledger time and the final redeem check are retried on
/// transient failures. The refund itself is broadcast at most once per run,
/// a failure is handed back to the caller.
pub struct RefundGuard<'a> {
    pub observer: &'a ChainObserver,
    pub clock: &'a dyn LedgerTime,
    pub signer: &'a dyn WalletSigner,
    pub broadcaster: &'a dyn Broadcast,
    pub check_interval: Duration,
}

impl fmt::Debug for RefundGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefundGuard")
            .field("observer", &self.observer)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl RefundGuard<'_> {
    pub async fn run(
        &self,
        params: &LockParams,
        location: LockLocation,
        key_path: &KeyPath,
        cancel: CancelToken,
    ) -> Result<GuardOutcome, RefundError> {
        match self.await_expiry(params, cancel).await? {
            Expiry::Refundable => {
                let tx_id = self.refund(params, location, key_path).await?;
                Ok(GuardOutcome::RefundBroadcast(tx_id))
            }
            Expiry::Redeemed(redeemed) => Ok(GuardOutcome::Redeemed(redeemed)),
            Expiry::Canceled => Ok(GuardOutcome::Canceled),
        }
    }

    /// Waits for the refund time and checks for a redeem one last time.
    ///
    /// Dropping the returned future never leaves a refund half broadcast.
    pub async fn await_expiry(
        &self,
        params: &LockParams,
        mut cancel: CancelToken,
    ) -> Result<Expiry, RefundError> {
        tokio::select! {
            result = self.wait_until(params.refund_time) => result?,
            _ = cancel.canceled() => return Ok(Expiry::Canceled),
        }

        let last_check = tokio::select! {
            result = self.check_redeemed(params) => result?,
            _ = cancel.canceled() => return Ok(Expiry::Canceled),
        };
        if let Observation::Detected(redeemed) = last_check {
            tracing::info!("lock was redeemed in {}, not refunding", redeemed.tx_id);
            return Ok(Expiry::Redeemed(redeemed));
        }

        Ok(Expiry::Refundable)
    }

    /// Signs and broadcasts the refund, exactly once.
    pub async fn refund(
        &self,
        params: &LockParams,
        location: LockLocation,
        key_path: &KeyPath,
    ) -> Result<TxId, RefundError> {
        let refund = UnsignedTx::refund(params.clone(), location);
        let signed = self
            .signer
            .sign(refund, key_path)
            .await
            .map_err(RefundError::Sign)?;
        let tx_id = self
            .broadcaster
            .broadcast(signed)
            .await
            .map_err(RefundError::Broadcast)?;

        tracing::info!("refund broadcast in {}", tx_id);

        Ok(tx_id)
    }

    async fn wait_until(&self, refund_time: Timestamp) -> Result<(), RefundError> {
        loop {
            let now = self.ledger_time().await?;

            if refund_time.has_passed(now) {
                return Ok(());
            }

            let wait = self.check_interval.min(now.until(refund_time));
            tracing::trace!("lock refundable at {}, ledger time is {}", refund_time, now);

            tokio::time::sleep(wait).await;
        }
    }

    async fn ledger_time(&self) -> Result<Timestamp, RefundError> {
        backoff::future::retry_notify(
            Constant::new(self.check_interval),
            || async move {
                self.clock
                    .ledger_time()
                    .await
                    .map_err(backoff::Error::Transient)
            },
            |e, _| tracing::warn!("failed to read ledger time, retrying: {:#}", e),
        )
        .await
        .map_err(RefundError::LedgerTime)
    }

    async fn check_redeemed(&self, params: &LockParams) -> Result<Observation, RefundError> {
        let observation = backoff::future::retry_notify(
            Constant::new(self.check_interval),
            || async move {
                self.observer
                    .check_redeemed(params)
                    .await
                    .map_err(|e| match e {
                        e @ ObservationError::Request(_) => backoff::Error::Transient(e),
                        e => backoff::Error::Permanent(e),
                    })
            },
            |e, _| tracing::warn!("final redeem check failed, retrying: {}", e),
        )
        .await?;

        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asset::{Amount, Currency},
        chain::{
            event_log::{Address, EventLogChain, Hash, Log, Redeemed},
            ChainFamily, RateLimiter, SignedTx,
        },
        observer::EventLogObserver,
        poll::cancellation,
        Secret,
    };
    use spectral::prelude::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };

    const CONTRACT: Address = Address([0x11; 20]);

    #[derive(Default)]
    struct FakeChain {
        logs: Mutex<Vec<Log>>,
        time: AtomicU32,
        broadcasts: AtomicU32,
        fail_broadcast: bool,
    }

    #[async_trait::async_trait]
    impl EventLogChain for FakeChain {
        async fn contract_events(
            &self,
            _: Address,
            _: u64,
            topics: Vec<Option<Hash>>,
        ) -> anyhow::Result<Vec<Log>> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| log.matches(&topics))
                .cloned()
                .collect())
        }
    }

    #[async_trait::async_trait]
    impl LedgerTime for FakeChain {
        async fn ledger_time(&self) -> anyhow::Result<Timestamp> {
            Ok(Timestamp::from(self.time.load(Ordering::SeqCst)))
        }
    }

    #[async_trait::async_trait]
    impl WalletSigner for FakeChain {
        async fn sign(&self, transaction: UnsignedTx, _: &KeyPath) -> anyhow::Result<SignedTx> {
            Ok(SignedTx {
                family: transaction.family,
                bytes: serde_json::to_vec(&transaction)?,
            })
        }
    }

    #[async_trait::async_trait]
    impl Broadcast for FakeChain {
        async fn broadcast(&self, _: SignedTx) -> anyhow::Result<TxId> {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
            if self.fail_broadcast {
                anyhow::bail!("node rejected transaction")
            }
            Ok(TxId::from("0xrefund"))
        }
    }

    fn params() -> LockParams {
        LockParams {
            secret_hash: Secret::from([1u8; 32]).hash(),
            currency: Currency::new("ETH", ChainFamily::EventLog, 18),
            redeem_address: "0x00000000000000000000000000000000000000b2".to_owned(),
            refund_address: "0x00000000000000000000000000000000000000a1".to_owned(),
            amount: Amount::from_base_units(10),
            reward_for_redeem: Amount::ZERO,
            refund_time: Timestamp::from(1_000),
            start_of_swap: Timestamp::from(0),
            payment_tx_id: None,
        }
    }

    async fn run_guard(chain: &Arc<FakeChain>, cancel: CancelToken) -> Result<GuardOutcome, RefundError> {
        let observer = ChainObserver::EventLog(EventLogObserver::new(
            chain.clone(),
            CONTRACT,
            0,
            Arc::new(RateLimiter::unlimited()),
        ));
        let guard = RefundGuard {
            observer: &observer,
            clock: chain.as_ref(),
            signer: chain.as_ref(),
            broadcaster: chain.as_ref(),
            check_interval: Duration::from_secs(1),
        };

        guard
            .run(
                &params(),
                LockLocation::Contract(CONTRACT.to_string()),
                &KeyPath::new("m/0"),
                cancel,
            )
            .await
    }

    #[tokio::test]
    async fn refunds_once_refund_time_is_reached() {
        let chain = Arc::new(FakeChain::default());
        chain.time.store(1_000, Ordering::SeqCst);

        let outcome = run_guard(&chain, CancelToken::never()).await.unwrap();

        assert!(matches!(outcome, GuardOutcome::RefundBroadcast(_)));
        assert_that!(chain.broadcasts.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[tokio::test]
    async fn redeem_found_in_final_check_wins() {
        let chain = Arc::new(FakeChain::default());
        chain.time.store(1_000, Ordering::SeqCst);
        let redeemed = Redeemed {
            hashed_secret: params().secret_hash,
            secret: Secret::from([1u8; 32]),
        };
        chain.logs.lock().unwrap().push(Log {
            address: CONTRACT,
            topics: redeemed.topics(),
            data: redeemed.data(),
            block_number: 1,
            transaction_hash: Hash([0xee; 32]),
        });

        let outcome = run_guard(&chain, CancelToken::never()).await.unwrap();

        assert!(matches!(outcome, GuardOutcome::Redeemed(_)));
        assert_that!(chain.broadcasts.load(Ordering::SeqCst)).is_equal_to(0);
    }

    #[tokio::test]
    async fn failed_broadcast_is_not_retried() {
        let chain = Arc::new(FakeChain {
            fail_broadcast: true,
            ..FakeChain::default()
        });
        chain.time.store(2_000, Ordering::SeqCst);

        let result = run_guard(&chain, CancelToken::never()).await;

        assert!(matches!(result, Err(RefundError::Broadcast(_))));
        assert_that!(chain.broadcasts.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[tokio::test]
    async fn expiry_does_not_broadcast() {
        let chain = Arc::new(FakeChain::default());
        chain.time.store(1_000, Ordering::SeqCst);
        let observer = ChainObserver::EventLog(EventLogObserver::new(
            chain.clone(),
            CONTRACT,
            0,
            Arc::new(RateLimiter::unlimited()),
        ));
        let guard = RefundGuard {
            observer: &observer,
            clock: chain.as_ref(),
            signer: chain.as_ref(),
            broadcaster: chain.as_ref(),
            check_interval: Duration::from_secs(1),
        };

        let expiry = guard.await_expiry(&params(), CancelToken::never()).await;

        assert!(matches!(expiry, Ok(Expiry::Refundable)));
        assert_that!(chain.broadcasts.load(Ordering::SeqCst)).is_equal_to(0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_waiting_for_refund_time() {
        let chain = Arc::new(FakeChain::default());
        chain.time.store(10, Ordering::SeqCst);
        let (canceller, token) = cancellation();

        let guard = {
            let chain = chain.clone();
            tokio::spawn(async move { run_guard(&chain, token).await })
        };
        tokio::task::yield_now().await;
        canceller.cancel();

        let outcome = guard.await.unwrap().unwrap();

        assert!(matches!(outcome, GuardOutcome::Canceled));
        assert_that!(chain.broadcasts.load(Ordering::SeqCst)).is_equal_to(0);
    }
}
