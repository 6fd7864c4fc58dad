//! # Chain Client
//!
//! What the coordinator needs from a Bitcoin node and its wallet. The round
//! driver only talks to the chain through [`ChainClient`], implemented over
//! Bitcoin Core RPC by [`crate::extended_rpc::ExtendedRpc`] and in memory by
//! [`crate::testkit::MockChain`].

use crate::errors::ChainError;
use async_trait::async_trait;
use bitcoin::{FeeRate, OutPoint, Transaction, TxOut, Txid};

/// An unspent output as the node sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutput {
    pub output: TxOut,
    /// 0 while unconfirmed.
    pub confirmations: u32,
}

#[async_trait]
pub trait ChainClient: Send + Sync + std::fmt::Debug {
    async fn tip_height(&self) -> Result<u32, ChainError>;

    /// Fee rate to confirm within `target_blocks`.
    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<FeeRate, ChainError>;

    /// Adds wallet inputs to a transaction spending `inputs` and paying
    /// `outputs`, keeping both orders. The given inputs are foreign boarding
    /// outputs the wallet can't sign: wallet inputs and change, if any, go
    /// after them. The result is unsigned.
    async fn fund_transaction(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: FeeRate,
    ) -> Result<Transaction, ChainError>;

    /// Signs every wallet input. Fails with [`ChainError::Signing`] if any
    /// input is left unsigned.
    async fn sign_transaction(&self, tx: Transaction) -> Result<Transaction, ChainError>;

    /// Submits a transaction. Explicit rejections come back as
    /// [`ChainError::Rejected`], anything else is retried first.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// `None` if the node doesn't know the transaction.
    async fn confirmations(&self, txid: Txid) -> Result<Option<u32>, ChainError>;

    async fn is_unspent(&self, outpoint: OutPoint) -> Result<bool, ChainError>;

    /// `None` if the output doesn't exist or is spent, mempool included.
    async fn get_output(&self, outpoint: OutPoint) -> Result<Option<ChainOutput>, ChainError>;
}
