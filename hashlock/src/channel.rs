//! Off-chain coordination with the counterparty of a swap.
//!
//! Encoding and transport are left to the implementor, the engine only
//! needs to hand over and await typed messages per swap.

use crate::{chain::TxId, SecretHash, SwapId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Announced by the initiator before anything happens on chain.
    SecretHash(SecretHash),
    /// Sent by a party right after broadcasting its own lock.
    PaymentTxId(TxId),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SecretHash(_) => MessageKind::SecretHash,
            Message::PaymentTxId(_) => MessageKind::PaymentTxId,
        }
    }
}

#[derive(Clone, Copy, Debug, strum_macros::Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    SecretHash,
    PaymentTxId,
}

#[async_trait::async_trait]
pub trait CounterpartyChannel: Send + Sync {
    async fn send(&self, swap_id: SwapId, message: Message) -> anyhow::Result<()>;

    /// Resolves with the next message of `kind` for `swap_id`.
    ///
    /// A message that arrived before the call is returned immediately.
    async fn receive(&self, swap_id: SwapId, kind: MessageKind) -> anyhow::Result<Message>;
}
