//! # builder::transaction
//!
//! Construction of every transaction a round produces: claim tree node
//! transactions, forfeits, unilateral exit claims and expiry sweeps.
//!
//! - [`txhandler`] wraps a transaction with the scripts and taproot spend
//!   info of its inputs and outputs, so sighashes and witnesses can be
//!   computed without extra context.
//! - [`input`] and [`output`] define the spendable/spent wrappers the
//!   [`TxHandler`] is built from.

use super::script::{
    AbsoluteTimelockScript, CheckSig, CosignScript, SpendableScript, TimelockScript,
};
use crate::builder::transaction::input::SpendableTxIn;
use crate::builder::transaction::output::UnspentTxOut;
use crate::errors::TxError;
use bitcoin::{Amount, ScriptBuf, Sequence, TxOut, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use txhandler::*;

pub mod input;
pub mod output;
mod txhandler;

/// Index of the MuSig2 cooperative leaf in a node output's scripts.
pub const NODE_COOPERATIVE_LEAF: usize = 0;
/// Index of the coordinator's expiry leaf in a node output's scripts.
pub const NODE_EXPIRY_LEAF: usize = 1;
/// Index of the owner+coordinator leaf in a claim output's scripts.
pub const CLAIM_COSIGN_LEAF: usize = 0;
/// Index of the owner's CSV exit leaf in a claim output's scripts.
pub const CLAIM_EXIT_LEAF: usize = 1;

/// Types of all transactions that can be created.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum TransactionType {
    /// Transaction of the internal node with the given arena index.
    Node(usize),
    Forfeit,
    ClaimExit,
    ExpirySweep,
}

/// Scripts of an internal node output: the cooperative MuSig2 leaf and the
/// coordinator's sweep after `expiry_height`.
pub fn node_output_scripts(
    aggregate_key: XOnlyPublicKey,
    coordinator: XOnlyPublicKey,
    expiry_height: u32,
) -> Vec<Arc<dyn SpendableScript>> {
    vec![
        Arc::new(CheckSig::new(aggregate_key)),
        Arc::new(AbsoluteTimelockScript::new(coordinator, expiry_height)),
    ]
}

/// Scripts of a claim output: owner+coordinator cooperative leaf and the
/// owner's exit after `exit_delta` blocks.
pub fn claim_output_scripts(
    owner: XOnlyPublicKey,
    coordinator: XOnlyPublicKey,
    exit_delta: u16,
) -> Vec<Arc<dyn SpendableScript>> {
    vec![
        Arc::new(CosignScript::new(owner, coordinator)),
        Arc::new(TimelockScript::new(Some(owner), exit_delta)),
    ]
}

/// Creates the transaction of an internal node: spends the node's own output
/// through the cooperative leaf and creates one output per child.
pub fn create_node_txhandler(
    node_index: usize,
    node_output: SpendableTxIn,
    children: Vec<UnspentTxOut>,
) -> TxHandler<Unsigned> {
    children
        .into_iter()
        .fold(
            TxHandlerBuilder::new(TransactionType::Node(node_index))
                .add_input(node_output, DEFAULT_SEQUENCE),
            |builder, child| builder.add_output(child),
        )
        .finalize()
}

/// Creates a forfeit: the claim output moves to the coordinator's settlement
/// script through the cooperative leaf.
pub fn create_forfeit_txhandler(
    claim: SpendableTxIn,
    settlement_script: ScriptBuf,
    fee: Amount,
) -> Result<TxHandler<Unsigned>, TxError> {
    let value = deduct_fee(claim.get_prevout().value, fee)?;

    Ok(TxHandlerBuilder::new(TransactionType::Forfeit)
        .add_input(claim, DEFAULT_SEQUENCE)
        .add_output(UnspentTxOut::from_partial(TxOut {
            value,
            script_pubkey: settlement_script,
        }))
        .finalize())
}

/// Creates the owner's unilateral claim of a matured claim output.
pub fn create_claim_exit_txhandler(
    claim: SpendableTxIn,
    exit_delta: u16,
    destination: ScriptBuf,
    fee: Amount,
) -> Result<TxHandler<Unsigned>, TxError> {
    let value = deduct_fee(claim.get_prevout().value, fee)?;

    Ok(TxHandlerBuilder::new(TransactionType::ClaimExit)
        .add_input(claim, Sequence::from_height(exit_delta))
        .add_output(UnspentTxOut::from_partial(TxOut {
            value,
            script_pubkey: destination,
        }))
        .finalize())
}

/// Creates the coordinator's sweep of an expired node output.
pub fn create_expiry_sweep_txhandler(
    node_output: SpendableTxIn,
    expiry: &AbsoluteTimelockScript,
    destination: ScriptBuf,
    fee: Amount,
) -> Result<TxHandler<Unsigned>, TxError> {
    let value = deduct_fee(node_output.get_prevout().value, fee)?;

    Ok(TxHandlerBuilder::new(TransactionType::ExpirySweep)
        .with_lock_time(expiry.lock_time())
        .add_input(node_output, DEFAULT_SEQUENCE)
        .add_output(UnspentTxOut::from_partial(TxOut {
            value,
            script_pubkey: destination,
        }))
        .finalize())
}

fn deduct_fee(value: Amount, fee: Amount) -> Result<Amount, TxError> {
    value.checked_sub(fee).ok_or_else(|| {
        TxError::ValueNotConserved(format!("fee {fee} exceeds spent value {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{self, SECP};
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Keypair, SecretKey};
    use bitcoin::{OutPoint, TapSighashType, Txid};

    fn xonly(byte: u8) -> XOnlyPublicKey {
        Keypair::from_secret_key(&SECP, &SecretKey::from_slice(&[byte; 32]).unwrap())
            .x_only_public_key()
            .0
    }

    fn claim_input(value: u64) -> SpendableTxIn {
        SpendableTxIn::from_scripts(
            OutPoint::new(Txid::all_zeros(), 3),
            Amount::from_sat(value),
            claim_output_scripts(xonly(1), xonly(2), 12),
            None,
            bitcoin::Network::Regtest,
        )
        .unwrap()
    }

    #[test]
    fn claim_exit_carries_relative_timelock() {
        let handler = create_claim_exit_txhandler(
            claim_input(1_000),
            12,
            ScriptBuf::new(),
            Amount::from_sat(100),
        )
        .unwrap();

        let tx = handler.get_cached_tx();
        assert_eq!(tx.input[0].sequence, Sequence::from_height(12));
        assert_eq!(tx.output[0].value, Amount::from_sat(900));
        assert!(handler
            .calculate_script_spend_sighash_indexed(0, CLAIM_EXIT_LEAF, TapSighashType::Default)
            .is_ok());
    }

    #[test]
    fn fee_above_value_is_rejected() {
        assert!(matches!(
            create_forfeit_txhandler(
                claim_input(50),
                ScriptBuf::new(),
                Amount::from_sat(51)
            ),
            Err(TxError::ValueNotConserved(_))
        ));
    }

    #[test]
    fn node_tx_spends_its_own_output_only() {
        let node_scripts =
            node_output_scripts(xonly(3), *utils::UNSPENDABLE_XONLY_PUBKEY, 500);
        let node_input = SpendableTxIn::from_scripts(
            OutPoint::new(Txid::all_zeros(), 0),
            Amount::from_sat(2_000),
            node_scripts,
            None,
            bitcoin::Network::Regtest,
        )
        .unwrap();
        let children = vec![
            UnspentTxOut::from_scripts(
                Amount::from_sat(1_000),
                claim_output_scripts(xonly(1), xonly(2), 12),
                None,
                bitcoin::Network::Regtest,
            )
            .unwrap(),
            UnspentTxOut::from_scripts(
                Amount::from_sat(900),
                claim_output_scripts(xonly(4), xonly(2), 12),
                None,
                bitcoin::Network::Regtest,
            )
            .unwrap(),
        ];

        let handler = create_node_txhandler(7, node_input, children);
        let tx = handler.get_cached_tx();

        assert_eq!(handler.get_transaction_type(), TransactionType::Node(7));
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output, OutPoint::new(Txid::all_zeros(), 0));
        assert_eq!(tx.output.len(), 2);
        assert!(handler.get_spendable_output(1).is_ok());
        assert!(matches!(
            handler.get_spendable_output(2),
            Err(TxError::TxOutputNotFound)
        ));
    }
}
