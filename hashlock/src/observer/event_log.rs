use crate::{
    chain::{
        event_log::{
            Added, Address, EventLogChain, Hash, Initiated, Log, Redeemed, Refunded, ADDED,
            INITIATED, REDEEMED, REFUNDED,
        },
        RateLimiter, TxId,
    },
    observation::{Detected, LockLocation, Observation, ObservationError, ObservationResult},
    observer::{detected, total_locked, LockParams},
};
use std::{fmt, str::FromStr, sync::Arc};

pub struct EventLogObserver {
    chain: Arc<dyn EventLogChain>,
    contract: Address,
    from_block: u64,
    limiter: Arc<RateLimiter>,
}

impl fmt::Debug for EventLogObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLogObserver")
            .field("contract", &self.contract)
            .field("from_block", &self.from_block)
            .finish()
    }
}

impl EventLogObserver {
    pub fn new(
        chain: Arc<dyn EventLogChain>,
        contract: Address,
        from_block: u64,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        EventLogObserver {
            chain,
            contract,
            from_block,
            limiter,
        }
    }

    async fn logs(&self, topics: Vec<Option<Hash>>) -> Result<Vec<Log>, ObservationError> {
        self.limiter.acquire().await;

        let logs = self
            .chain
            .contract_events(self.contract, self.from_block, topics.clone())
            .await
            .map_err(ObservationError::Request)?;

        Ok(logs
            .into_iter()
            .filter(|log| log.address == self.contract && log.matches(&topics))
            .collect())
    }

    pub(super) fn location(&self) -> LockLocation {
        LockLocation::Contract(self.contract.to_string())
    }

    pub async fn check_initiated(
        &self,
        params: &LockParams,
        verify_reward: bool,
    ) -> ObservationResult {
        let participant = Address::from_str(&params.redeem_address).map_err(|e| {
            ObservationError::Internal(anyhow::anyhow!(
                "redeem address {} is not an account: {}",
                params.redeem_address,
                e
            ))
        })?;
        let hashed_secret = Hash::from(params.secret_hash);

        let logs = self
            .logs(vec![
                Some(*INITIATED),
                Some(hashed_secret),
                Some(participant.to_topic()),
            ])
            .await?;

        let (log, initiated) = match logs.iter().find_map(|log| decode(log, Initiated::from_log)) {
            Some(initiated) => initiated,
            None => return Ok(Observation::NotYet),
        };

        let expected_refund_time = u64::from(u32::from(params.refund_time));
        if initiated.refund_timestamp != expected_refund_time {
            return Err(ObservationError::InvalidRefundLockTime {
                expected: expected_refund_time,
                actual: initiated.refund_timestamp,
            });
        }

        if verify_reward && initiated.redeem_fee != params.reward_for_redeem {
            return Err(ObservationError::InvalidRewardForRedeem {
                expected: params.reward_for_redeem,
                actual: initiated.redeem_fee,
            });
        }

        let added = self
            .logs(vec![Some(*ADDED), Some(hashed_secret)])
            .await?;
        let total = total_locked(
            std::iter::once(initiated.value).chain(
                added
                    .iter()
                    .filter_map(|log| decode(log, Added::from_log))
                    .map(|(_, added)| added.value),
            ),
        )?;
        let required = params.required_amount();

        if total < required {
            tracing::debug!("lock holds {} of {} required", total, required);
            return Ok(Observation::NotYet);
        }

        Ok(Observation::Detected(Detected {
            tx_id: TxId::new(log.transaction_hash.to_string()),
            amount: total,
            reward: initiated.redeem_fee,
            counterparty: Some(initiated.initiator.to_string()),
            secret: None,
            location: self.location(),
        }))
    }

    pub async fn scan_redeemed(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        let logs = self
            .logs(vec![Some(*REDEEMED), Some(Hash::from(params.secret_hash))])
            .await?;

        let redeemed = logs
            .iter()
            .filter_map(|log| decode(log, Redeemed::from_log))
            .find(|(log, redeemed)| {
                let valid = params.secret_hash.verify(&redeemed.secret);
                if !valid {
                    tracing::debug!(
                        "ignoring redeem {} revealing a secret of another hash",
                        log.transaction_hash
                    );
                }
                valid
            });

        Ok(redeemed.map(|(log, redeemed)| Detected {
            secret: Some(redeemed.secret),
            ..detected(TxId::new(log.transaction_hash.to_string()), self.location())
        }))
    }

    pub async fn scan_refunded(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        let logs = self
            .logs(vec![Some(*REFUNDED), Some(Hash::from(params.secret_hash))])
            .await?;

        let refunded = logs
            .iter()
            .filter_map(|log| decode(log, Refunded::from_log))
            .find(|(_, refunded)| refunded.hashed_secret == params.secret_hash);

        Ok(refunded.map(|(log, _)| {
            detected(TxId::new(log.transaction_hash.to_string()), self.location())
        }))
    }
}

fn decode<'a, E, D>(log: &'a Log, decoder: D) -> Option<(&'a Log, E)>
where
    D: Fn(&Log) -> Result<E, crate::chain::event_log::DecodeError>,
{
    match decoder(log) {
        Ok(event) => Some((log, event)),
        Err(e) => {
            tracing::trace!("skipping log of {}: {}", log.transaction_hash, e);
            None
        }
    }
}
