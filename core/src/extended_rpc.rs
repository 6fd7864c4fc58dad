//! # Extended Remote Procedure Call
//!
//! [`ChainClient`] over Bitcoin Core's RPC interface and wallet.
//!
//! `bitcoincore-rpc` is blocking, so every call runs on tokio's blocking
//! pool. Transient failures (connection problems, a node still warming up)
//! are retried with exponential backoff; explicit rejections of a broadcast
//! are mapped to [`RejectReason`]s and returned right away.

use crate::boarding::BOARDING_INPUT_WEIGHT;
use crate::chain::{ChainClient, ChainOutput};
use crate::errors::{ChainError, RejectReason};
use crate::utils::retry_transient;
use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::transaction::Version;
use bitcoin::{absolute, Amount, FeeRate, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid};
use bitcoincore_rpc::json::{EstimateMode, FundRawTransactionResult};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Bitcoin Core RPC error codes the client reacts to.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_IN_WARMUP: i32 = -28;
const RPC_VERIFY_ERROR: i32 = -25;
const RPC_VERIFY_REJECTED: i32 = -26;
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub attempts: usize,
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Whether an error is worth trying again.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for bitcoincore_rpc::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            bitcoincore_rpc::Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::Interrupted
                    | ErrorKind::UnexpectedEof
            ),
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Transport(_)) => true,
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) => e.code == RPC_IN_WARMUP,
            bitcoincore_rpc::Error::UnexpectedStructure => true,
            _ => false,
        }
    }
}

fn rpc_error_code(err: &bitcoincore_rpc::Error) -> Option<(i32, &str)> {
    match err {
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) => Some((e.code, e.message.as_str())),
        _ => None,
    }
}

fn to_chain_error(method: &'static str, err: bitcoincore_rpc::Error) -> ChainError {
    if err.is_retryable() {
        ChainError::Transient(format!("{method}: {err}"))
    } else {
        ChainError::Rpc(format!("{method}: {err}"))
    }
}

/// Maps a `sendrawtransaction` error to the reason the node gave, if it
/// explicitly refused the transaction.
pub fn reject_reason(err: &bitcoincore_rpc::Error) -> Option<RejectReason> {
    let (code, message) = rpc_error_code(err)?;
    let message = message.to_lowercase();

    if message.contains("min relay fee not met")
        || message.contains("mempool min fee not met")
        || message.contains("insufficient fee")
        || message.contains("fee too low")
    {
        return Some(RejectReason::InsufficientFee);
    }
    if message.contains("txn-mempool-conflict")
        || message.contains("missingorspent")
        || message.contains("missing-inputs")
        || code == RPC_VERIFY_ERROR
    {
        return Some(RejectReason::ConflictingSpend);
    }
    if code == RPC_VERIFY_REJECTED {
        return Some(RejectReason::Other(message));
    }

    None
}

/// `fundrawtransaction` options: change after the requested outputs, and
/// the weight of every foreign input the wallet can't solve for.
fn fund_options(inputs: &[OutPoint], outputs: usize, fee_rate: FeeRate) -> serde_json::Value {
    let input_weights: Vec<serde_json::Value> = inputs
        .iter()
        .map(|outpoint| {
            json!({
                "txid": outpoint.txid.to_string(),
                "vout": outpoint.vout,
                "weight": BOARDING_INPUT_WEIGHT,
            })
        })
        .collect();

    json!({
        "changePosition": outputs,
        "lockUnspents": true,
        "feeRate": Amount::from_sat(fee_rate.to_sat_per_kwu() * 4).to_btc(),
        "replaceable": true,
        "input_weights": input_weights,
    })
}

/// Converts a `estimatesmartfee` result in BTC/kvB, never going below the
/// minimum relay fee.
fn fee_rate_from_btc_per_kvb(rate: Amount) -> FeeRate {
    FeeRate::from_sat_per_kwu(rate.to_sat() / 4).max(FeeRate::BROADCAST_MIN)
}

#[derive(Debug, Clone)]
pub struct ExtendedRpc {
    pub url: String,
    client: Arc<Client>,
    retry: RetryConfig,
}

impl ExtendedRpc {
    /// Creates a client for the node at `url`. No request is made until the
    /// first call.
    pub fn new(
        url: String,
        user: &SecretString,
        password: &SecretString,
        retry: RetryConfig,
    ) -> Result<Self, ChainError> {
        let auth = Auth::UserPass(
            user.expose_secret().to_string(),
            password.expose_secret().to_string(),
        );
        let client = Client::new(&url, auth).map_err(|e| to_chain_error("connect", e))?;

        Ok(Self {
            url,
            client: Arc::new(client),
            retry,
        })
    }

    async fn call_with<T, F, E>(&self, method: &'static str, f: F, on_error: E) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: Fn(&Client) -> Result<T, bitcoincore_rpc::Error> + Send + Sync + 'static,
        E: Fn(bitcoincore_rpc::Error) -> ChainError + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let on_error = Arc::new(on_error);

        retry_transient(self.retry.attempts, self.retry.initial_backoff, || {
            let client = self.client.clone();
            let f = f.clone();
            let on_error = on_error.clone();

            async move {
                tokio::task::spawn_blocking(move || f(&client))
                    .await
                    .map_err(|e| ChainError::Transient(format!("{method}: {e}")))?
                    .map_err(|e| on_error(e))
            }
        })
        .await
    }

    async fn call<T, F>(&self, method: &'static str, f: F) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: Fn(&Client) -> Result<T, bitcoincore_rpc::Error> + Send + Sync + 'static,
    {
        self.call_with(method, f, move |e| to_chain_error(method, e))
            .await
    }
}

#[async_trait]
impl ChainClient for ExtendedRpc {
    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    async fn tip_height(&self) -> Result<u32, ChainError> {
        let height = self
            .call("getblockcount", |client| client.get_block_count())
            .await?;

        u32::try_from(height).map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    async fn estimate_fee_rate(&self, target_blocks: u16) -> Result<FeeRate, ChainError> {
        let estimate = self
            .call("estimatesmartfee", move |client| {
                client.estimate_smart_fee(target_blocks, Some(EstimateMode::Conservative))
            })
            .await?;

        match estimate.fee_rate {
            Some(rate) => Ok(fee_rate_from_btc_per_kvb(rate)),
            None => Err(ChainError::FeeEstimation(estimate.errors.unwrap_or_default())),
        }
    }

    #[tracing::instrument(skip(self, inputs, outputs), fields(inputs = inputs.len(), outputs = outputs.len()), err(level = tracing::Level::ERROR))]
    async fn fund_transaction(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: FeeRate,
    ) -> Result<Transaction, ChainError> {
        let options = fund_options(&inputs, outputs.len(), fee_rate);
        let unfunded = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    ..Default::default()
                })
                .collect(),
            output: outputs,
        };
        let unfunded = serialize_hex(&unfunded);

        let funded: FundRawTransactionResult = self
            .call_with(
                "fundrawtransaction",
                move |client| {
                    client.call(
                        "fundrawtransaction",
                        &[unfunded.clone().into(), options.clone(), false.into()],
                    )
                },
                |e| match rpc_error_code(&e) {
                    // RPC_WALLET_ERROR, RPC_WALLET_INSUFFICIENT_FUNDS
                    Some((-4 | -6, message)) => ChainError::Funding(message.to_string()),
                    _ => to_chain_error("fundrawtransaction", e),
                },
            )
            .await?;

        deserialize(&funded.hex).map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[tracing::instrument(skip(self, tx), fields(txid = %tx.compute_txid()), err(level = tracing::Level::ERROR))]
    async fn sign_transaction(&self, tx: Transaction) -> Result<Transaction, ChainError> {
        let signed = self
            .call("signrawtransactionwithwallet", move |client| {
                client.sign_raw_transaction_with_wallet(&tx, None, None)
            })
            .await?;

        if !signed.complete {
            return Err(ChainError::Signing(
                signed
                    .errors
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| e.error)
                    .collect(),
            ));
        }

        signed
            .transaction()
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[tracing::instrument(skip(self, tx), fields(txid = %tx.compute_txid()), err(level = tracing::Level::ERROR))]
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let txid = tx.compute_txid();
        let tx = tx.clone();

        let result = self
            .call_with(
                "sendrawtransaction",
                move |client| match client.send_raw_transaction(&tx) {
                    Err(e) if matches!(rpc_error_code(&e), Some((RPC_VERIFY_ALREADY_IN_CHAIN, _))) => {
                        Ok(tx.compute_txid())
                    }
                    other => other,
                },
                move |e| match reject_reason(&e) {
                    Some(reason) => ChainError::Rejected(txid, reason),
                    None => to_chain_error("sendrawtransaction", e),
                },
            )
            .await?;

        tracing::info!("Broadcast transaction {result}");

        Ok(result)
    }

    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    async fn confirmations(&self, txid: Txid) -> Result<Option<u32>, ChainError> {
        self.call("getrawtransaction", move |client| {
            match client.get_raw_transaction_info(&txid, None) {
                Ok(info) => Ok(Some(info.confirmations.unwrap_or(0))),
                Err(e) if matches!(rpc_error_code(&e), Some((RPC_INVALID_ADDRESS_OR_KEY, _))) => {
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
    async fn is_unspent(&self, outpoint: OutPoint) -> Result<bool, ChainError> {
        self.call("gettxout", move |client| {
            client
                .get_tx_out(&outpoint.txid, outpoint.vout, Some(true))
                .map(|out| out.is_some())
        })
        .await
    }

    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR))]
    async fn get_output(&self, outpoint: OutPoint) -> Result<Option<ChainOutput>, ChainError> {
        let Some(out) = self
            .call("gettxout", move |client| {
                client.get_tx_out(&outpoint.txid, outpoint.vout, Some(true))
            })
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(ChainOutput {
            output: TxOut {
                value: out.value,
                script_pubkey: out
                    .script_pub_key
                    .script()
                    .map_err(|e| ChainError::Rpc(format!("gettxout: {e}")))?,
            },
            confirmations: out.confirmations,
        }))
    }
}
