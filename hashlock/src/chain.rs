//! Narrow contracts towards the chain-facing collaborators.
//!
//! Everything that talks to a node, an indexer or a wallet lives behind one
//! of the traits in here. The engine never sees raw RPC types.

pub mod entrypoint;
pub mod event_log;
mod rate_limiter;
pub mod utxo;

pub use rate_limiter::RateLimiter;

use crate::{observation::LockLocation, observer::LockParams, Secret, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The transaction/contract model of a chain.
#[derive(
    Clone,
    Copy,
    Debug,
    strum_macros::Display,
    strum_macros::EnumString,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    /// Script-locked outputs, spent by redeem or refund transactions.
    Utxo,
    /// Account-based contract emitting indexed event logs.
    EventLog,
    /// Contract invoked through named entrypoints with typed parameters.
    Entrypoint,
}

/// Chain-native transaction identifier, kept opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        TxId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(id: String) -> Self {
        TxId(id)
    }
}

impl From<&str> for TxId {
    fn from(id: &str) -> Self {
        TxId(id.to_owned())
    }
}

/// Derivation path of the key the wallet should sign with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(String);

impl KeyPath {
    pub fn new(path: impl Into<String>) -> Self {
        KeyPath(path.into())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the wallet is asked to build and sign.
///
/// The engine only describes the intent; encoding it into a chain-specific
/// transaction is the wallet's job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub family: ChainFamily,
    pub action: LockAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockAction {
    Lock {
        params: LockParams,
    },
    Redeem {
        params: LockParams,
        location: LockLocation,
        secret: Secret,
    },
    Refund {
        params: LockParams,
        location: LockLocation,
    },
}

impl UnsignedTx {
    pub fn lock(params: LockParams) -> Self {
        UnsignedTx {
            family: params.currency.family,
            action: LockAction::Lock { params },
        }
    }

    pub fn redeem(params: LockParams, location: LockLocation, secret: Secret) -> Self {
        UnsignedTx {
            family: params.currency.family,
            action: LockAction::Redeem {
                params,
                location,
                secret,
            },
        }
    }

    pub fn refund(params: LockParams, location: LockLocation) -> Self {
        UnsignedTx {
            family: params.currency.family,
            action: LockAction::Refund { params, location },
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub family: ChainFamily,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for SignedTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTx")
            .field("family", &self.family)
            .field("bytes", &hex::encode(&self.bytes))
            .finish()
    }
}

#[async_trait::async_trait]
pub trait Broadcast: Send + Sync {
    async fn broadcast(&self, transaction: SignedTx) -> anyhow::Result<TxId>;
}

/// The time as seen by the chain, which is what refund eligibility is
/// checked against.
#[async_trait::async_trait]
pub trait LedgerTime: Send + Sync {
    async fn ledger_time(&self) -> anyhow::Result<Timestamp>;
}

#[async_trait::async_trait]
pub trait WalletSigner: Send + Sync {
    async fn sign(&self, transaction: UnsignedTx, key_path: &KeyPath) -> anyhow::Result<SignedTx>;
}
