use crate::{
    asset::Amount,
    chain::{
        utxo::{pubkey_hash, revealed_secret, takes_refund_branch, HtlcScript, UtxoChain,
            UtxoTransaction},
        RateLimiter, TxId,
    },
    observation::{
        Detected, LockLocation, Observation, ObservationError, ObservationResult, Outpoint,
    },
    observer::{detected, total_locked, LockParams},
};
use bitcoin::{OutPoint, Transaction, Txid};
use std::{convert::TryFrom, fmt, str::FromStr, sync::Arc};

/// Watches HTLC outputs.
///
/// The lock is found through the funding transaction the payer announced,
/// redeem and refund through the transactions spending its HTLC outputs.
pub struct UtxoObserver {
    chain: Arc<dyn UtxoChain>,
    min_confirmations: u32,
    limiter: Arc<RateLimiter>,
}

impl fmt::Debug for UtxoObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtxoObserver")
            .field("min_confirmations", &self.min_confirmations)
            .finish()
    }
}

/// An HTLC output of the funding transaction.
struct HtlcOutput {
    outpoint: OutPoint,
    value: Amount,
    script: HtlcScript,
}

impl UtxoObserver {
    pub fn new(
        chain: Arc<dyn UtxoChain>,
        min_confirmations: u32,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        UtxoObserver {
            chain,
            min_confirmations,
            limiter,
        }
    }

    /// The confirmed funding transaction, if it was announced and mined.
    async fn payment(&self, params: &LockParams) -> Result<Option<Transaction>, ObservationError> {
        let tx_id = match &params.payment_tx_id {
            Some(tx_id) => tx_id,
            None => {
                tracing::trace!("funding transaction not yet announced");
                return Ok(None);
            }
        };
        let txid = Txid::from_str(tx_id.as_str()).map_err(|e| {
            ObservationError::Internal(anyhow::anyhow!("invalid txid {}: {}", tx_id, e))
        })?;

        self.limiter.acquire().await;
        let payment = self
            .chain
            .transaction(txid)
            .await
            .map_err(ObservationError::Request)?;

        Ok(payment
            .filter(|payment| payment.confirmations >= self.min_confirmations)
            .map(|payment| payment.transaction))
    }

    async fn spends(&self, outpoint: OutPoint) -> Result<Vec<UtxoTransaction>, ObservationError> {
        self.limiter.acquire().await;
        let spends = self
            .chain
            .spends(outpoint)
            .await
            .map_err(ObservationError::Request)?;

        Ok(spends
            .into_iter()
            .filter(|spend| spend.confirmations >= self.min_confirmations)
            .collect())
    }

    pub async fn check_initiated(&self, params: &LockParams) -> ObservationResult {
        let payment = match self.payment(params).await? {
            Some(payment) => payment,
            None => return Ok(Observation::NotYet),
        };

        let expected_redeem = pubkey_hash(&params.redeem_address).ok_or_else(|| {
            ObservationError::Internal(anyhow::anyhow!(
                "redeem address {} has no key hash",
                params.redeem_address
            ))
        })?;

        let outputs = htlc_outputs(&payment, params);

        // The funding transaction is immutable, any mismatch is final.
        for output in &outputs {
            if output.script.lock_time != params.refund_time {
                return Err(ObservationError::InvalidRefundLockTime {
                    expected: u64::from(u32::from(params.refund_time)),
                    actual: u64::from(u32::from(output.script.lock_time)),
                });
            }
            if output.script.redeem_pubkey_hash != expected_redeem {
                return Err(ObservationError::InvalidRedeemAddress {
                    expected: params.redeem_address.clone(),
                    actual: hex::encode(output.script.redeem_pubkey_hash),
                });
            }
        }

        let total = total_locked(outputs.iter().map(|output| output.value))?;
        if total < params.amount {
            return Err(ObservationError::InsufficientAmount {
                required: params.amount,
                detected: total,
            });
        }

        Ok(Observation::Detected(Detected {
            tx_id: TxId::new(payment.txid().to_string()),
            amount: total,
            reward: Amount::ZERO,
            counterparty: None,
            secret: None,
            location: location(&outputs),
        }))
    }

    pub async fn scan_redeemed(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        self.scan_spends(params, |spend, outpoint| {
            spend
                .input
                .iter()
                .filter(|input| input.previous_output == outpoint)
                .find_map(|input| revealed_secret(input, &params.secret_hash))
                .map(Some)
        })
        .await
    }

    pub async fn scan_refunded(
        &self,
        params: &LockParams,
    ) -> Result<Option<Detected>, ObservationError> {
        self.scan_spends(params, |spend, outpoint| {
            spend
                .input
                .iter()
                .any(|input| input.previous_output == outpoint && takes_refund_branch(input))
                .then(|| None)
        })
        .await
    }

    /// Finds the first confirmed spend of an HTLC output accepted by
    /// `matches`, which returns the revealed secret, if any, on a match.
    async fn scan_spends<F>(
        &self,
        params: &LockParams,
        matches: F,
    ) -> Result<Option<Detected>, ObservationError>
    where
        F: Fn(&Transaction, OutPoint) -> Option<Option<crate::Secret>>,
    {
        let payment = match self.payment(params).await? {
            Some(payment) => payment,
            None => return Ok(None),
        };
        let outputs = htlc_outputs(&payment, params);

        for output in &outputs {
            for spend in self.spends(output.outpoint).await? {
                if let Some(secret) = matches(&spend.transaction, output.outpoint) {
                    return Ok(Some(Detected {
                        secret,
                        ..detected(
                            TxId::new(spend.transaction.txid().to_string()),
                            location(&outputs),
                        )
                    }));
                }
            }
        }

        Ok(None)
    }
}

fn htlc_outputs(payment: &Transaction, params: &LockParams) -> Vec<HtlcOutput> {
    let txid = payment.txid();

    payment
        .output
        .iter()
        .enumerate()
        .filter_map(|(vout, output)| {
            let script = HtlcScript::parse(&output.script_pubkey)?;
            if script.secret_hash != params.secret_hash {
                return None;
            }

            Some(HtlcOutput {
                outpoint: OutPoint::new(txid, u32::try_from(vout).ok()?),
                value: Amount::from(output.value),
                script,
            })
        })
        .collect()
}

fn location(outputs: &[HtlcOutput]) -> LockLocation {
    LockLocation::Utxo(
        outputs
            .iter()
            .map(|output| Outpoint {
                txid: TxId::new(output.outpoint.txid.to_string()),
                vout: output.outpoint.vout,
            })
            .collect(),
    )
}
