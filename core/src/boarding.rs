//! # Boarding
//!
//! Fresh value enters the tree through boarding outputs: on-chain coins the
//! owner locks under the same policy as a claim output, owner+coordinator
//! or owner alone after `exit_delta` blocks. The round's funding transaction
//! spends them through the owner+coordinator leaf, so the coordinator's
//! wallet only pays for the round fee and change.

use crate::builder::address::taproot_script_pubkey;
use crate::builder::script::{CosignScript, SpendableScript};
use crate::builder::transaction::{claim_output_scripts, CLAIM_COSIGN_LEAF};
use crate::errors::{SignatureError, TxError};
use crate::utils::SECP;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{schnorr, Message, PublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::{LeafVersion, TaprootSpendInfo};
use bitcoin::{
    Network, OutPoint, ScriptBuf, TapLeafHash, TapSighash, TapSighashType, Transaction, TxOut,
    Witness,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Weight of a boarding input spent through the cosign leaf: outpoint,
/// sequence, two signatures, the script and a depth-1 control block.
pub const BOARDING_INPUT_WEIGHT: u64 = 4 * 41 + 1 + 2 * 65 + 70 + 66;

/// A boarding coin as its owner knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardingOutput {
    pub outpoint: OutPoint,
    pub output: TxOut,
}

/// Locking policy of an owner's boarding coins.
#[derive(Clone)]
pub struct BoardingPolicy {
    owner: PublicKey,
    coordinator: PublicKey,
    scripts: Vec<Arc<dyn SpendableScript>>,
    script_pubkey: ScriptBuf,
    spend_info: TaprootSpendInfo,
}

impl fmt::Debug for BoardingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardingPolicy")
            .field("owner", &self.owner)
            .field("coordinator", &self.coordinator)
            .field("script_pubkey", &self.script_pubkey)
            .finish()
    }
}

impl BoardingPolicy {
    pub fn new(
        owner: PublicKey,
        coordinator: PublicKey,
        exit_delta: u16,
        network: Network,
    ) -> Result<Self, TxError> {
        let scripts = claim_output_scripts(
            owner.x_only_public_key().0,
            coordinator.x_only_public_key().0,
            exit_delta,
        );
        let (script_pubkey, spend_info) = taproot_script_pubkey(&scripts, network)?;

        Ok(Self {
            owner,
            coordinator,
            scripts,
            script_pubkey,
            spend_info,
        })
    }

    /// Where the owner sends coins to board them.
    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    fn cosign_leaf(&self) -> ScriptBuf {
        self.scripts[CLAIM_COSIGN_LEAF].to_script_buf()
    }

    /// Digest both keys sign to spend input `index` of `tx`. `prevouts`
    /// holds the spent output of every input, in input order.
    pub fn sighash(
        &self,
        tx: &Transaction,
        prevouts: &[TxOut],
        index: usize,
    ) -> Result<TapSighash, TxError> {
        if prevouts.len() != tx.input.len() {
            return Err(TxError::SpendableTxIn(format!(
                "{} prevouts for {} inputs",
                prevouts.len(),
                tx.input.len()
            )));
        }
        if prevouts.get(index).map(|out| &out.script_pubkey) != Some(&self.script_pubkey) {
            return Err(TxError::SpendableTxIn(format!(
                "input {index} is not a boarding output of {}",
                self.owner
            )));
        }

        SighashCache::new(tx)
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(prevouts),
                TapLeafHash::from_script(&self.cosign_leaf(), LeafVersion::TapScript),
                TapSighashType::Default,
            )
            .map_err(|e| TxError::Sighash(e.to_string()))
    }

    /// Owner side: signs input `index` of a funding transaction.
    pub fn sign(
        &self,
        owner: &Keypair,
        tx: &Transaction,
        prevouts: &[TxOut],
        index: usize,
    ) -> Result<schnorr::Signature, TxError> {
        let sighash = self.sighash(tx, prevouts, index)?;

        Ok(SECP.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), owner))
    }

    /// Checks the owner's signature for input `index`.
    pub fn verify(
        &self,
        signature: &schnorr::Signature,
        tx: &Transaction,
        prevouts: &[TxOut],
        index: usize,
    ) -> Result<(), SignatureError> {
        let outpoint = tx
            .input
            .get(index)
            .map(|input| input.previous_output)
            .unwrap_or_default();
        let invalid = |reason: String| SignatureError::InvalidBoarding(outpoint, reason);

        let sighash = self
            .sighash(tx, prevouts, index)
            .map_err(|e| invalid(e.to_string()))?;

        SECP.verify_schnorr(
            signature,
            &Message::from_digest(sighash.to_byte_array()),
            &self.owner.x_only_public_key().0,
        )
        .map_err(|_| invalid("owner signature does not verify".into()))
    }

    /// Coordinator side: countersigns input `index` and assembles its
    /// witness.
    pub fn witness(
        &self,
        coordinator: &Keypair,
        owner_signature: &schnorr::Signature,
        tx: &Transaction,
        prevouts: &[TxOut],
        index: usize,
    ) -> Result<Witness, TxError> {
        if coordinator.public_key() != self.coordinator {
            return Err(TxError::SpendableTxIn(
                "boarding output locked to another coordinator".into(),
            ));
        }

        let sighash = self.sighash(tx, prevouts, index)?;
        let coordinator_signature =
            SECP.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), coordinator);

        let leaf = self.cosign_leaf();
        let control_block = self
            .spend_info
            .control_block(&(leaf.clone(), LeafVersion::TapScript))
            .ok_or(TxError::ControlBlockError)?;

        let mut witness = CosignScript::new(
            self.owner.x_only_public_key().0,
            self.coordinator.x_only_public_key().0,
        )
        .generate_script_inputs(owner_signature, &coordinator_signature);
        witness.push(leaf.as_bytes());
        witness.push(control_block.serialize());

        Ok(witness)
    }
}
