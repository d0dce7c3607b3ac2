use super::{secs, EngineError, Execution, PartyLock};
use crate::{
    channel::{Message, MessageKind},
    record::{LegState, Phase},
    Leg,
};

/// Execute a swap as the party that locks second, under the initiator's
/// secret hash.
pub(super) async fn run(swap: &mut Execution) -> anyhow::Result<()> {
    tracing::info!("starting swap");

    learn_secret_hash(swap).await?;
    if swap.record.is_terminal() {
        return Ok(());
    }

    let party_locked = swap
        .record
        .history(Leg::Party)
        .has_reached(LegState::PaymentConfirmed);

    if !party_locked {
        swap.enter(Phase::AwaitingCounterpartyInitiate).await?;

        let deadline = swap
            .record
            .terms
            .created_at
            .plus(secs(swap.engine.settings.party_payment_timeout));
        let cancel = swap.cancel.clone();

        if let PartyLock::Missing(reason) = swap.await_party_lock(deadline, cancel).await? {
            return swap.abandon(reason).await;
        }

        tracing::info!("initiator locked, locking own funds");
    }

    swap.fund_own().await?;
    if swap.record.is_terminal() {
        return Ok(());
    }

    let swap_result = swap.confirm_own().await;
    swap.route_to_refund(swap_result)?;

    swap.settle_own().await?;

    if swap.record.leg_state(Leg::Own) == LegState::RedeemConfirmed {
        tracing::info!("learnt the secret, redeeming");

        swap.redeem_party().await?;
        swap.enter(Phase::Completed).await?;
    }

    Ok(())
}

async fn learn_secret_hash(swap: &mut Execution) -> anyhow::Result<()> {
    if swap.record.secret_hash().is_some() {
        return Ok(());
    }

    let received = swap
        .receive(
            MessageKind::SecretHash,
            swap.engine.settings.message_timeout,
            swap.cancel.clone(),
        )
        .await?;

    let secret_hash = match received {
        Ok(Message::SecretHash(secret_hash)) => secret_hash,
        Ok(other) => return Err(EngineError::UnexpectedMessage(other.kind()).into()),
        Err(reason) => return swap.abandon(reason).await,
    };

    swap.record.set_secret_hash(secret_hash)?;
    swap.save().await?;

    tracing::info!("initiator announced secret hash {}", secret_hash);

    Ok(())
}
