//! Raw data of UTXO chains and the HTLC output script.

use crate::{Secret, SecretHash, Timestamp};
use bitcoin::{
    blockdata::{
        opcodes::all::*,
        script::{read_scriptint, Builder, Instruction, Script},
    },
    hashes::Hash,
    util::address::Payload,
    Address, OutPoint, Transaction, TxIn, Txid,
};
use std::{convert::TryFrom, str::FromStr};

#[async_trait::async_trait]
pub trait UtxoChain: Send + Sync {
    /// Looks up a transaction by id, `None` if the node does not know it yet.
    async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<UtxoTransaction>>;

    /// All known transactions spending `outpoint`.
    async fn spends(&self, outpoint: OutPoint) -> anyhow::Result<Vec<UtxoTransaction>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct UtxoTransaction {
    pub transaction: Transaction,
    pub confirmations: u32,
}

/// The swap output script.
///
/// The `IF` branch pays out against the secret and the redeemer's key, the
/// `ELSE` branch pays back to the funder once the absolute lock time passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HtlcScript {
    pub secret_hash: SecretHash,
    pub redeem_pubkey_hash: [u8; 20],
    pub refund_pubkey_hash: [u8; 20],
    pub lock_time: Timestamp,
}

impl HtlcScript {
    pub fn to_script(&self) -> Script {
        Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_HASH256)
            .push_slice(self.secret_hash.as_raw())
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&self.redeem_pubkey_hash)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(u32::from(self.lock_time)))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&self.refund_pubkey_hash)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// Recognises an HTLC output script, `None` for anything else.
    pub fn parse(script: &Script) -> Option<HtlcScript> {
        let instructions = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .ok()?;

        if instructions.len() != 20 {
            return None;
        }

        let secret_hash = SecretHash::from_vec(push_bytes(&instructions[5])?).ok()?;
        let redeem_pubkey_hash = <[u8; 20]>::try_from(push_bytes(&instructions[9])?).ok()?;
        let lock_time = read_scriptint(push_bytes(&instructions[11])?).ok()?;
        let refund_pubkey_hash = <[u8; 20]>::try_from(push_bytes(&instructions[16])?).ok()?;

        let candidate = HtlcScript {
            secret_hash,
            redeem_pubkey_hash,
            refund_pubkey_hash,
            lock_time: Timestamp::from(u32::try_from(lock_time).ok()?),
        };

        // The remaining opcodes must be exactly ours.
        if candidate.to_script() != *script {
            return None;
        }

        Some(candidate)
    }
}

fn push_bytes<'a>(instruction: &Instruction<'a>) -> Option<&'a [u8]> {
    match instruction {
        Instruction::PushBytes(bytes) => Some(*bytes),
        Instruction::Op(_) => None,
    }
}

/// The key hash behind a P2PKH or P2WPKH address.
pub fn pubkey_hash(address: &str) -> Option<[u8; 20]> {
    let address = Address::from_str(address).ok()?;

    match address.payload {
        Payload::PubkeyHash(hash) => Some(hash.into_inner()),
        Payload::WitnessProgram { program, .. } => <[u8; 20]>::try_from(program.as_slice()).ok(),
        Payload::ScriptHash(_) => None,
    }
}

/// The data items an input presents to the locking script.
///
/// Witness items for segwit spends, pushes of the signature script
/// otherwise. `OP_1` counts as the single byte `0x01`.
pub fn unlocking_items(input: &TxIn) -> Vec<Vec<u8>> {
    if !input.witness.is_empty() {
        return input.witness.clone();
    }

    input
        .script_sig
        .instructions()
        .filter_map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.to_vec()),
            Ok(Instruction::Op(op)) if op == OP_PUSHNUM_1 => Some(vec![1]),
            _ => None,
        })
        .collect()
}

/// A revealed secret matching `secret_hash`, if the input took the redeem
/// branch.
pub fn revealed_secret(input: &TxIn, secret_hash: &SecretHash) -> Option<Secret> {
    unlocking_items(input)
        .iter()
        .filter(|item| item.len() == 32)
        .filter_map(|item| Secret::from_vec(item).ok())
        .find(|secret| secret_hash.verify(secret))
}

/// Whether the input selects the refund branch: the last item is empty.
pub fn takes_refund_branch(input: &TxIn) -> bool {
    matches!(unlocking_items(input).last(), Some(item) if item.is_empty())
}

pub fn redeem_script_sig(signature: &[u8], public_key: &[u8], secret: &Secret) -> Script {
    Builder::new()
        .push_slice(signature)
        .push_slice(public_key)
        .push_slice(secret.as_raw_secret())
        .push_opcode(OP_PUSHNUM_1)
        .into_script()
}

pub fn refund_script_sig(signature: &[u8], public_key: &[u8]) -> Script {
    Builder::new()
        .push_slice(signature)
        .push_slice(public_key)
        .push_opcode(OP_PUSHBYTES_0)
        .into_script()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    fn htlc() -> HtlcScript {
        HtlcScript {
            secret_hash: Secret::from([1u8; 32]).hash(),
            redeem_pubkey_hash: [0xc0; 20],
            refund_pubkey_hash: [0x19; 20],
            lock_time: Timestamp::from(1_600_000_000),
        }
    }

    fn input(script_sig: Script) -> TxIn {
        TxIn {
            previous_output: OutPoint::default(),
            script_sig,
            sequence: 0xFFFF_FFFE,
            witness: Vec::new(),
        }
    }

    #[test]
    fn parses_what_it_builds() {
        let htlc = htlc();

        assert_that!(HtlcScript::parse(&htlc.to_script())).is_some().is_equal_to(htlc);
    }

    #[test]
    fn does_not_parse_a_different_script() {
        let script = Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(&[0xc0; 20])
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .into_script();

        assert_that!(HtlcScript::parse(&script)).is_none();
    }

    #[test]
    fn finds_secret_in_redeem_input() {
        let secret = Secret::from([1u8; 32]);
        let input = input(redeem_script_sig(&[0x30; 71], &[0x02; 33], &secret));

        assert_that!(revealed_secret(&input, &secret.hash())).is_some().is_equal_to(secret);
        assert!(!takes_refund_branch(&input));
    }

    #[test]
    fn secret_with_other_hash_is_not_revealed() {
        let secret = Secret::from([1u8; 32]);
        let input = input(redeem_script_sig(&[0x30; 71], &[0x02; 33], &secret));

        let other_hash = Secret::from([2u8; 32]).hash();

        assert_that!(revealed_secret(&input, &other_hash)).is_none();
    }

    #[test]
    fn recognises_refund_input() {
        let input = input(refund_script_sig(&[0x30; 71], &[0x02; 33]));

        assert!(takes_refund_branch(&input));
    }

    #[test]
    fn extracts_pubkey_hash_of_p2wpkh_address() {
        let pubkey_hash = pubkey_hash("bcrt1qcqslz7lfn34dl096t5uwurff9spen5h4v2pmap");

        assert_that!(pubkey_hash.map(hex::encode))
            .is_some()
            .is_equal_to("c021f17be99c6adfbcba5d38ee0d292c0399d2f5".to_owned());
    }
}
