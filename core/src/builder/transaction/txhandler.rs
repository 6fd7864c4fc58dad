use super::input::{SpendableTxIn, SpentTxIn};
use super::output::UnspentTxOut;
use super::TransactionType;
use crate::errors::TxError;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{absolute, OutPoint, Script, Sequence, Transaction, Witness};
use bitcoin::{TapLeafHash, TapSighash, TapSighashType, TxOut, Txid};
use std::marker::PhantomData;

pub const DEFAULT_SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

#[derive(Debug, Clone)]
pub struct TxHandler<T: State = Unsigned> {
    transaction_type: TransactionType,
    txins: Vec<SpentTxIn>,
    txouts: Vec<UnspentTxOut>,

    /// Cached and immutable, same as other fields
    cached_tx: bitcoin::Transaction,
    cached_txid: bitcoin::Txid,

    phantom: PhantomData<T>,
}

pub trait State: Clone + std::fmt::Debug {}

#[derive(Debug, Clone)]
pub struct Signed;
#[derive(Debug, Clone)]
pub struct Unsigned;

impl State for Unsigned {}
impl State for Signed {}

impl<T: State> TxHandler<T> {
    pub fn get_transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn get_cached_tx(&self) -> &Transaction {
        &self.cached_tx
    }

    pub fn get_txid(&self) -> &Txid {
        &self.cached_txid
    }

    pub fn get_spendable_output(&self, idx: usize) -> Result<SpendableTxIn, TxError> {
        let txout = self.txouts.get(idx).ok_or(TxError::TxOutputNotFound)?;

        Ok(SpendableTxIn::new(
            OutPoint {
                txid: self.cached_txid,
                vout: idx as u32,
            },
            txout.txout().clone(),
            txout.scripts().clone(),
            txout.spendinfo().clone(),
        )?)
    }
}

impl TxHandler<Unsigned> {
    pub fn calculate_script_spend_sighash_indexed(
        &self,
        txin_index: usize,
        spend_script_idx: usize,
        sighash_type: TapSighashType,
    ) -> Result<TapSighash, TxError> {
        let script = self
            .txins
            .get(txin_index)
            .ok_or(TxError::TxInputNotFound)?
            .get_spendable()
            .get_scripts()
            .get(spend_script_idx)
            .ok_or(TxError::ScriptNotFound(spend_script_idx))?
            .to_script_buf();

        self.calculate_script_spend_sighash(txin_index, &script, sighash_type)
    }

    pub fn calculate_script_spend_sighash(
        &self,
        txin_index: usize,
        spend_script: &Script,
        sighash_type: TapSighashType,
    ) -> Result<TapSighash, TxError> {
        let prevouts_vec: Vec<&TxOut> = self
            .txins
            .iter()
            .map(|s| s.get_spendable().get_prevout())
            .collect();
        let prevout = prevouts_vec
            .get(txin_index)
            .ok_or(TxError::TxInputNotFound)?;

        let prevouts = match sighash_type {
            TapSighashType::SinglePlusAnyoneCanPay
            | TapSighashType::AllPlusAnyoneCanPay
            | TapSighashType::NonePlusAnyoneCanPay => {
                bitcoin::sighash::Prevouts::One(txin_index, *prevout)
            }
            _ => bitcoin::sighash::Prevouts::All(&prevouts_vec),
        };

        let leaf_hash = TapLeafHash::from_script(spend_script, LeafVersion::TapScript);
        SighashCache::new(&self.cached_tx)
            .taproot_script_spend_signature_hash(txin_index, &prevouts, leaf_hash, sighash_type)
            .map_err(|e| TxError::Sighash(e.to_string()))
    }

    /// Constructs the witness for a script path spend of a transaction input.
    ///
    /// # Arguments
    ///
    /// - `script_inputs`: The inputs to the tapscript
    /// - `txin_index`: The index of the transaction input to add the witness to.
    /// - `script_index`: The script index in the input UTXO's Taproot script tree.
    pub fn set_p2tr_script_spend_witness<T: AsRef<[u8]>>(
        &mut self,
        script_inputs: &[T],
        txin_index: usize,
        script_index: usize,
    ) -> Result<(), TxError> {
        let txin = self
            .txins
            .get_mut(txin_index)
            .ok_or(TxError::TxInputNotFound)?;

        if txin.get_witness().is_some() {
            return Err(TxError::WitnessAlreadySet);
        }

        let script = txin
            .get_spendable()
            .get_scripts()
            .get(script_index)
            .ok_or(TxError::ScriptNotFound(script_index))?
            .to_script_buf();

        let spend_control_block = txin
            .get_spendable()
            .get_spend_info()
            .as_ref()
            .ok_or(TxError::MissingSpendInfo)?
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or(TxError::ControlBlockError)?;

        let mut witness = Witness::new();
        script_inputs
            .iter()
            .for_each(|element| witness.push(element));
        witness.push(script);
        witness.push(spend_control_block.serialize());

        self.cached_tx.input[txin_index].witness = witness.clone();
        txin.set_witness(witness);

        Ok(())
    }

    /// Sets a witness produced elsewhere, e.g. by the wallet for its own
    /// inputs.
    pub fn set_witness(&mut self, txin_index: usize, witness: Witness) -> Result<(), TxError> {
        let txin = self
            .txins
            .get_mut(txin_index)
            .ok_or(TxError::TxInputNotFound)?;

        if txin.get_witness().is_some() {
            return Err(TxError::WitnessAlreadySet);
        }

        self.cached_tx.input[txin_index].witness = witness.clone();
        txin.set_witness(witness);

        Ok(())
    }

    pub fn promote(self) -> Result<TxHandler<Signed>, TxError> {
        if self.txins.iter().any(|s| s.get_witness().is_none()) {
            return Err(TxError::MissingWitnessData);
        }

        Ok(TxHandler {
            transaction_type: self.transaction_type,
            txins: self.txins,
            txouts: self.txouts,
            cached_tx: self.cached_tx,
            cached_txid: self.cached_txid,
            phantom: PhantomData::<Signed>,
        })
    }
}

impl TxHandler<Signed> {
    pub fn into_tx(self) -> Transaction {
        self.cached_tx
    }
}

#[derive(Debug, Clone)]
pub struct TxHandlerBuilder {
    transaction_type: TransactionType,
    lock_time: absolute::LockTime,
    txins: Vec<SpentTxIn>,
    txouts: Vec<UnspentTxOut>,
}

impl TxHandlerBuilder {
    pub fn new(transaction_type: TransactionType) -> TxHandlerBuilder {
        TxHandlerBuilder {
            transaction_type,
            lock_time: absolute::LockTime::ZERO,
            txins: vec![],
            txouts: vec![],
        }
    }

    pub fn with_lock_time(mut self, lock_time: absolute::LockTime) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn add_input(
        mut self,
        spendable: SpendableTxIn,
        sequence: Sequence,
    ) -> Self {
        self.txins
            .push(SpentTxIn::from_spendable(spendable, sequence, None));

        self
    }

    pub fn add_output(mut self, output: UnspentTxOut) -> Self {
        self.txouts.push(output);

        self
    }

    pub fn finalize(self) -> TxHandler<Unsigned> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: self.lock_time,
            input: self.txins.iter().map(|s| s.to_txin()).collect(),
            output: self.txouts.iter().map(|s| s.txout().clone()).collect(),
        };
        let txid = tx.compute_txid();

        TxHandler::<Unsigned> {
            transaction_type: self.transaction_type,
            txins: self.txins,
            txouts: self.txouts,
            cached_tx: tx,
            cached_txid: txid,
            phantom: PhantomData,
        }
    }
}
