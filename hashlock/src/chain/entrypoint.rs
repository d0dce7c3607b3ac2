//! Raw data of chains whose swap contract is called through named
//! entrypoints, as reported by an operation indexer.

use crate::{asset::Amount, Secret, SecretHash, Timestamp};
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const INITIATE: &str = "initiate";
pub const ADD: &str = "add";
pub const REDEEM: &str = "redeem";
pub const REFUND: &str = "refund";

#[async_trait::async_trait]
pub trait OperationIndexer: Send + Sync {
    /// Contract calls targeting `contract` since `since`, oldest first.
    async fn operations(&self, contract: &str, since: Timestamp)
        -> anyhow::Result<Vec<Operation>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub hash: String,
    pub sender: String,
    pub target: String,
    pub entrypoint: String,
    pub parameters: serde_json::Value,
    #[serde(with = "nat")]
    pub amount: Amount,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn is_applied(&self) -> bool {
        self.status == OperationStatus::Applied
    }

    /// Decodes the call parameters, `None` if they do not fit `P`.
    pub fn decode<P>(&self) -> Option<P>
    where
        P: de::DeserializeOwned,
    {
        match serde_json::from_value(self.parameters.clone()) {
            Ok(parameters) => Some(parameters),
            Err(e) => {
                tracing::trace!(
                    "skipping {} operation {}: {}",
                    self.entrypoint,
                    self.hash,
                    e
                );
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Applied,
    Failed,
    Backtracked,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitiateParameters {
    pub participant: String,
    pub settings: InitiateSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitiateSettings {
    pub hashed_secret: SecretHash,
    pub refund_time: DateTime<Utc>,
    #[serde(with = "nat")]
    pub payoff: Amount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddParameters {
    pub hashed_secret: SecretHash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedeemParameters {
    pub secret: Secret,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundParameters {
    pub hashed_secret: SecretHash,
}

/// Natural numbers as indexers render them: decimal strings, or plain JSON
/// numbers for small values.
mod nat {
    use super::*;

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(NatVisitor)
    }

    struct NatVisitor;

    impl<'de> de::Visitor<'de> for NatVisitor {
        type Value = Amount;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a natural number as string or integer")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Amount::from(v))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.parse::<u128>()
                .map(Amount::from_base_units)
                .map_err(E::custom)
        }
    }
}
