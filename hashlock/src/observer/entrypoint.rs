use crate::{
    chain::{
        entrypoint::{
            AddParameters, InitiateParameters, Operation, OperationIndexer, RedeemParameters,
            RefundParameters, ADD, INITIATE, REDEEM, REFUND,
        },
        RateLimiter, TxId,
    },
    observation::{Detected, LockLocation, Observation, ObservationError, ObservationResult},
    observer::{detected, total_locked, LockParams},
    Timestamp,
};
use std::{fmt, sync::Arc};

pub struct EntrypointObserver {
    indexer: Arc<dyn OperationIndexer>,
    contract: String,
    limiter: Arc<RateLimiter>,
}

impl fmt::Debug for EntrypointObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrypointObserver")
            .field("contract", &self.contract)
            .finish()
    }
}

impl EntrypointObserver {
    pub fn new(
        indexer: Arc<dyn OperationIndexer>,
        contract: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        EntrypointObserver {
            indexer,
            contract: contract.into(),
            limiter,
        }
    }

    /// Applied calls to the swap contract since the swap started.
    async fn operations(&self, params: &LockParams) -> Result<Vec<Operation>, ObservationError> {
        self.limiter.acquire().await;

        let operations = self
            .indexer
            .operations(&self.contract, params.start_of_swap)
            .await
            .map_err(ObservationError::Request)?;

        Ok(operations
            .into_iter()
            .filter(|operation| operation.is_applied() && operation.target == self.contract)
            .collect())
    }

    pub(super) fn location(&self) -> LockLocation {
        LockLocation::Contract(self.contract.clone())
    }

    pub async fn check_initiated(
        &self,
        params: &LockParams,
        verify_reward: bool,
    ) -> ObservationResult {
        let operations = self.operations(params).await?;

        let initiate = operations
            .iter()
            .filter(|operation| operation.entrypoint == INITIATE)
            .filter_map(|operation| {
                operation
                    .decode::<InitiateParameters>()
                    .map(|parameters| (operation, parameters))
            })
            .find(|(operation, parameters)| {
                if parameters.settings.hashed_secret != params.secret_hash {
                    return false;
                }
                if parameters.participant != params.redeem_address {
                    tracing::debug!(
                        "ignoring initiate {} paying out to {}",
                        operation.hash,
                        parameters.participant
                    );
                    return false;
                }
                true
            });

        let (operation, parameters) = match initiate {
            Some(initiate) => initiate,
            None => return Ok(Observation::NotYet),
        };

        let refund_time = Timestamp::from(parameters.settings.refund_time);
        if refund_time != params.refund_time {
            return Err(ObservationError::InvalidRefundLockTime {
                expected: u64::from(u32::from(params.refund_time)),
                actual: u64::from(u32::from(refund_time)),
            });
        }

        let payoff = parameters.settings.payoff;
        if verify_reward && payoff != params.reward_for_redeem {
            return Err(ObservationError::InvalidRewardForRedeem {
                expected: params.reward_for_redeem,
                actual: payoff,
            });
        }

        let added = operations
            .iter()
            .filter(|operation| operation.entrypoint == ADD)
            .filter(|operation| {
                operation
                    .decode::<AddParameters>()
                    .map_or(false, |add| add.hashed_secret == params.secret_hash)
            })
            .map(|operation| operation.amount);
        let total = total_locked(std::iter::once(operation.amount).chain(added))?;
        let required = params.required_amount();

        if total < required {
            tracing::debug!("lock holds {} of {} required", total, required);
            return Ok(Observation::NotYet);
        }

        Ok(Observation::Detected(Detected {
            tx_id: TxId::new(operation.hash.clone()),
            amount: total,
            reward: payoff,
            counterparty: Some(operation.sender.clone()),
            secret: None,
            location: self.location(),
        }))
    }

    pub async fn scan_redeemed(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        let operations = self.operations(params).await?;

        let redeemed = operations
            .iter()
            .filter(|operation| operation.entrypoint == REDEEM)
            .filter_map(|operation| {
                operation
                    .decode::<RedeemParameters>()
                    .map(|parameters| (operation, parameters.secret))
            })
            .find(|(_, secret)| params.secret_hash.verify(secret));

        Ok(redeemed.map(|(operation, secret)| Detected {
            secret: Some(secret),
            ..detected(TxId::new(operation.hash.clone()), self.location())
        }))
    }

    pub async fn scan_refunded(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        let operations = self.operations(params).await?;

        let refunded = operations
            .iter()
            .filter(|operation| operation.entrypoint == REFUND)
            .find(|operation| {
                operation
                    .decode::<RefundParameters>()
                    .map_or(false, |refund| refund.hashed_secret == params.secret_hash)
            });

        Ok(refunded
            .map(|operation| detected(TxId::new(operation.hash.clone()), self.location())))
    }
}
