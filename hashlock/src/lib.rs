#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::print_stdout,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod asset;
pub mod chain;
pub mod channel;
pub mod config;
pub mod engine;
pub mod observation;
pub mod observer;
pub mod poll;
pub mod record;
pub mod refund_guard;
pub mod repository;
mod secret;
mod swap_id;
pub mod terms;
mod timestamp;
pub mod trace;

/// A module for exporting dependencies that appear in the public API of our
/// crate.
///
/// Chain adapters for the UTXO family exchange `bitcoin` transactions with
/// the observers, hence consumers need a semver-compatible version of it.
pub mod export {
    pub use ::bitcoin;
    pub use ::rust_decimal;
}

pub use self::{
    secret::{Secret, SecretHash},
    swap_id::SwapId,
    timestamp::{RelativeTime, Timestamp},
};

use serde::{Deserialize, Serialize};

/// The two roles of a swap.
///
/// By convention the initiator generates the secret, locks first and uses the
/// longer lock window. The acceptor locks second, under the same secret hash,
/// with a window that expires strictly before the initiator's.
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
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    pub fn counterparty(self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }
}

/// The two locks involved in a swap, seen from one party.
///
/// `Own` is the lock this party funds, `Party` is the lock funded by the
/// counterparty. Only the combination of a party's role and a leg makes it
/// possible to name the chain and the direction of funds unambiguously.
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
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Own,
    Party,
}
