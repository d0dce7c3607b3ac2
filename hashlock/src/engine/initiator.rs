use super::{secs, EngineError, Execution, PartyLock, SwapFailedShouldRefund};
use crate::{
    channel::Message,
    poll::CancelToken,
    record::{LegState, Phase},
    Leg, Role, Secret,
};
use anyhow::Context;

/// Execute a swap as the party that generates the secret and locks first.
pub(super) async fn run(swap: &mut Execution) -> anyhow::Result<()> {
    tracing::info!("starting swap");

    announce_secret_hash(swap).await?;
    swap.fund_own().await?;
    if swap.record.is_terminal() {
        return Ok(());
    }

    let swap_result = redeem_counterparty(swap).await;
    swap.route_to_refund(swap_result)?;

    swap.settle_own().await?;

    if swap.record.leg_state(Leg::Own) == LegState::RedeemConfirmed {
        swap.enter(Phase::Completed).await?;
    }

    Ok(())
}

async fn announce_secret_hash(swap: &mut Execution) -> anyhow::Result<()> {
    if swap.record.phase() != Phase::Created {
        return Ok(());
    }

    if swap.record.secret().is_none() {
        swap.record.set_secret(Secret::generate())?;
        swap.save().await?;
    }
    let secret_hash = swap.record.secret_hash().ok_or(EngineError::SecretUnknown)?;

    swap.engine
        .channel
        .send(swap.record.id, Message::SecretHash(secret_hash))
        .await
        .map_err(EngineError::Channel)?;

    tracing::info!("announced secret hash {}", secret_hash);

    swap.enter(Phase::AwaitingOwnBroadcast).await?;

    Ok(())
}

async fn redeem_counterparty(swap: &mut Execution) -> anyhow::Result<()> {
    swap.confirm_own().await?;

    if swap.record.leg_state(Leg::Own) != LegState::PaymentConfirmed {
        return Ok(());
    }

    let deadline = swap
        .record
        .terms
        .refund_time(Role::Acceptor)
        .minus(secs(swap.engine.settings.redeem_margin));

    match swap.await_party_lock(deadline, CancelToken::never()).await? {
        PartyLock::Confirmed => {}
        PartyLock::Missing(reason) => {
            return Err(EngineError::PartyLockMissing(reason))
                .context(SwapFailedShouldRefund(swap.record.id))
        }
    }

    tracing::info!("counterparty locked, redeeming");

    swap.redeem_party()
        .await
        .context(SwapFailedShouldRefund(swap.record.id))
}
