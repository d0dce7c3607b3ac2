//! Raw data of account-based chains whose swap contract reports through
//! indexed event logs.
//!
//! The swap contract emits four events, all indexed by the secret hash:
//!
//! * `Initiated(bytes32 indexed hashedSecret, address indexed participant,
//!   address initiator, uint256 refundTimestamp, uint256 value, uint256
//!   redeemFee)`
//! * `Added(bytes32 indexed hashedSecret, address sender, uint256 value)`
//! * `Redeemed(bytes32 indexed hashedSecret, bytes32 secret)`
//! * `Refunded(bytes32 indexed hashedSecret)`
//!
//! Topic 0 of every log is the keccak-256 hash of the event signature, data
//! is a sequence of 32-byte ABI words.

use crate::{asset::Amount, Secret, SecretHash};
use conquer_once::Lazy;
use primitive_types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use tiny_keccak::{Hasher, Keccak};

const WORD: usize = 32;

pub static INITIATED: Lazy<Hash> = Lazy::new(|| {
    event_signature("Initiated(bytes32,address,address,uint256,uint256,uint256)")
});
pub static ADDED: Lazy<Hash> = Lazy::new(|| event_signature("Added(bytes32,address,uint256)"));
pub static REDEEMED: Lazy<Hash> = Lazy::new(|| event_signature("Redeemed(bytes32,bytes32)"));
pub static REFUNDED: Lazy<Hash> = Lazy::new(|| event_signature("Refunded(bytes32)"));

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];

    hasher.update(bytes);
    hasher.finalize(&mut output);

    output
}

fn event_signature(signature: &str) -> Hash {
    Hash(keccak256(signature.as_bytes()))
}

/// Fetches the logs of one contract.
///
/// `topics` is positional: `None` matches anything at that position.
#[async_trait::async_trait]
pub trait EventLogChain: Send + Sync {
    async fn contract_events(
        &self,
        contract: Address,
        from_block: u64,
        topics: Vec<Option<Hash>>,
    ) -> anyhow::Result<Vec<Log>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: Hash,
}

impl Log {
    /// Whether the log satisfies a positional topic filter.
    pub fn matches(&self, topics: &[Option<Hash>]) -> bool {
        topics.iter().enumerate().all(|(index, filter)| match filter {
            Some(topic) => self.topics.get(index) == Some(topic),
            None => true,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The address left-padded to a full word, as used in topics.
    pub fn to_topic(self) -> Hash {
        let mut word = [0u8; WORD];
        word[12..].copy_from_slice(&self.0);

        Hash(word)
    }

    fn from_word(word: &[u8]) -> Address {
        let mut address = [0u8; 20];
        address.copy_from_slice(&word[12..WORD]);

        Address(address)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl FromStr for Address {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        if bytes.len() != 20 {
            return Err(DecodeError::Length {
                expected: 20,
                got: bytes.len(),
            });
        }

        let mut address = [0u8; 20];
        address.copy_from_slice(&bytes);

        Ok(Address(address))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Address::from_str(&string).map_err(de::Error::custom)
    }
}

/// A 32-byte word: topics, transaction hashes, block hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl From<SecretHash> for Hash {
    fn from(hash: SecretHash) -> Self {
        Hash(hash.into_raw())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected} topics, got {got}")]
    Topics { expected: usize, got: usize },
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("invalid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("value does not fit into {0} bits")]
    Overflow(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Initiated {
    pub hashed_secret: SecretHash,
    pub participant: Address,
    pub initiator: Address,
    pub refund_timestamp: u64,
    pub value: Amount,
    pub redeem_fee: Amount,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Added {
    pub hashed_secret: SecretHash,
    pub sender: Address,
    pub value: Amount,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Redeemed {
    pub hashed_secret: SecretHash,
    pub secret: Secret,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Refunded {
    pub hashed_secret: SecretHash,
}

impl Initiated {
    pub fn from_log(log: &Log) -> Result<Self, DecodeError> {
        let topics = expect_topics(log, 3)?;
        let words = expect_words(log, 4)?;

        Ok(Initiated {
            hashed_secret: SecretHash::from(topics[1].0),
            participant: Address::from_word(&topics[2].0),
            initiator: Address::from_word(words[0]),
            refund_timestamp: word_to_u64(words[1])?,
            value: word_to_amount(words[2])?,
            redeem_fee: word_to_amount(words[3])?,
        })
    }

    pub fn topics(&self) -> Vec<Hash> {
        vec![
            *INITIATED,
            Hash::from(self.hashed_secret),
            self.participant.to_topic(),
        ]
    }

    pub fn data(&self) -> Vec<u8> {
        [
            self.initiator.to_topic().0,
            u256_word(U256::from(self.refund_timestamp)),
            amount_word(self.value),
            amount_word(self.redeem_fee),
        ]
        .concat()
    }
}

impl Added {
    pub fn from_log(log: &Log) -> Result<Self, DecodeError> {
        let topics = expect_topics(log, 2)?;
        let words = expect_words(log, 2)?;

        Ok(Added {
            hashed_secret: SecretHash::from(topics[1].0),
            sender: Address::from_word(words[0]),
            value: word_to_amount(words[1])?,
        })
    }

    pub fn topics(&self) -> Vec<Hash> {
        vec![*ADDED, Hash::from(self.hashed_secret)]
    }

    pub fn data(&self) -> Vec<u8> {
        [self.sender.to_topic().0, amount_word(self.value)].concat()
    }
}

impl Redeemed {
    pub fn from_log(log: &Log) -> Result<Self, DecodeError> {
        let topics = expect_topics(log, 2)?;
        let words = expect_words(log, 1)?;

        let mut secret = [0u8; WORD];
        secret.copy_from_slice(words[0]);

        Ok(Redeemed {
            hashed_secret: SecretHash::from(topics[1].0),
            secret: Secret::from(secret),
        })
    }

    pub fn topics(&self) -> Vec<Hash> {
        vec![*REDEEMED, Hash::from(self.hashed_secret)]
    }

    pub fn data(&self) -> Vec<u8> {
        self.secret.as_raw_secret().to_vec()
    }
}

impl Refunded {
    pub fn from_log(log: &Log) -> Result<Self, DecodeError> {
        let topics = expect_topics(log, 2)?;

        Ok(Refunded {
            hashed_secret: SecretHash::from(topics[1].0),
        })
    }

    pub fn topics(&self) -> Vec<Hash> {
        vec![*REFUNDED, Hash::from(self.hashed_secret)]
    }
}

fn expect_topics(log: &Log, expected: usize) -> Result<&[Hash], DecodeError> {
    if log.topics.len() != expected {
        return Err(DecodeError::Topics {
            expected,
            got: log.topics.len(),
        });
    }

    Ok(&log.topics)
}

fn expect_words(log: &Log, expected: usize) -> Result<Vec<&[u8]>, DecodeError> {
    if log.data.len() != expected * WORD {
        return Err(DecodeError::Length {
            expected: expected * WORD,
            got: log.data.len(),
        });
    }

    Ok(log.data.chunks(WORD).collect())
}

fn word_to_u64(word: &[u8]) -> Result<u64, DecodeError> {
    let value = U256::from_big_endian(word);
    if value.bits() > 64 {
        return Err(DecodeError::Overflow(64));
    }

    Ok(value.low_u64())
}

fn word_to_amount(word: &[u8]) -> Result<Amount, DecodeError> {
    let value = U256::from_big_endian(word);
    if value.bits() > 128 {
        return Err(DecodeError::Overflow(128));
    }

    Ok(Amount::from_base_units(value.low_u128()))
}

fn u256_word(value: U256) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    value.to_big_endian(&mut word);

    word
}

fn amount_word(amount: Amount) -> [u8; WORD] {
    u256_word(U256::from(amount.as_base_units()))
}
