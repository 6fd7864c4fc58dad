//! # Testing Utilities
//!
//! In-memory stand-ins for the coordinator's collaborators and builders for
//! fully signed rounds. Used by unit tests and by the integration tests under
//! `core/tests`, so nothing here panics: helpers return errors instead.

use crate::boarding::BOARDING_INPUT_WEIGHT;
use crate::chain::{ChainClient, ChainOutput};
use crate::errors::{ArkError, ChainError, ExitError, RejectReason};
use crate::exit::{ExitPath, ForfeitTransaction, OffchainSettlement};
use crate::musig2::nonce_pair;
use crate::signature_engine::SignatureEngine;
use crate::tree::{ClaimLeaf, ClaimTree, SignedClaimTree, TreeParams};
use crate::utils::SECP;
use crate::ClaimId;
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::rand::{thread_rng, Rng};
use bitcoin::secp256k1::PublicKey;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Amount, FeeRate, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Fee the forfeits built by [`forfeit_of`] pay.
pub const TEST_FORFEIT_FEE: Amount = Amount::from_sat(200);

pub fn random_keypair() -> Keypair {
    Keypair::new(&SECP, &mut thread_rng())
}

fn random_outpoint() -> OutPoint {
    OutPoint::new(Txid::from_byte_array(thread_rng().gen()), 0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct MockChainState {
    height: u32,
    fee_rate: FeeRate,
    wallet_utxo_value: Amount,
    reject_next: Option<RejectReason>,
    funding_failure: Option<String>,
    /// Txid to the height it was broadcast at.
    mempool: HashMap<Txid, u32>,
    /// Every output created so far, with the height it was created at.
    outputs: HashMap<OutPoint, (TxOut, u32)>,
    spent: HashSet<OutPoint>,
    broadcasts: Vec<Transaction>,
}

/// A chain and wallet living in memory. Every funding request is paid from
/// a fresh wallet coin on top of the foreign inputs it names. Broadcast
/// transactions confirm as blocks are mined with [`MockChain::mine`].
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<MockChainState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockChainState {
                height: 100,
                fee_rate: FeeRate::from_sat_per_vb_unchecked(2),
                wallet_utxo_value: Amount::from_int_btc(10),
                reject_next: None,
                funding_failure: None,
                mempool: HashMap::new(),
                outputs: HashMap::new(),
                spent: HashSet::new(),
                broadcasts: Vec::new(),
            }),
        }
    }

    /// The next broadcast is rejected with `reason`.
    pub fn reject_next_broadcast(&self, reason: RejectReason) {
        lock(&self.state).reject_next = Some(reason);
    }

    /// Funding requests fail until cleared with `None`.
    pub fn set_funding_failure(&self, reason: Option<String>) {
        lock(&self.state).funding_failure = reason;
    }

    /// Creates a coin paying `script_pubkey`, mined in the last block.
    pub fn fund_address(&self, script_pubkey: ScriptBuf, value: Amount) -> OutPoint {
        let mut state = lock(&self.state);
        let outpoint = random_outpoint();
        let mined_at = state.height - 1;
        state.outputs.insert(
            outpoint,
            (
                TxOut {
                    value,
                    script_pubkey,
                },
                mined_at,
            ),
        );

        outpoint
    }

    pub fn mine(&self, blocks: u32) {
        lock(&self.state).height += blocks;
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        lock(&self.state).broadcasts.clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn tip_height(&self) -> Result<u32, ChainError> {
        Ok(lock(&self.state).height)
    }

    async fn estimate_fee_rate(&self, _target_blocks: u16) -> Result<FeeRate, ChainError> {
        Ok(lock(&self.state).fee_rate)
    }

    async fn fund_transaction(
        &self,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOut>,
        fee_rate: FeeRate,
    ) -> Result<Transaction, ChainError> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.funding_failure {
            return Err(ChainError::Funding(reason.clone()));
        }

        let mut foreign = Amount::ZERO;
        for outpoint in &inputs {
            match state.outputs.get(outpoint) {
                Some((output, _)) if !state.spent.contains(outpoint) => foreign += output.value,
                _ => return Err(ChainError::Funding(format!("unknown input {outpoint}"))),
            }
        }

        let wallet_coin = random_outpoint();
        let wallet_output = TxOut {
            value: state.wallet_utxo_value,
            script_pubkey: ScriptBuf::new_p2tr(&SECP, random_keypair().x_only_public_key().0, None),
        };
        let height = state.height;
        state
            .outputs
            .insert(wallet_coin, (wallet_output.clone(), height.saturating_sub(1)));

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs
                .iter()
                .chain([&wallet_coin])
                .map(|previous_output| TxIn {
                    previous_output: *previous_output,
                    ..Default::default()
                })
                .collect(),
            output: outputs,
        };
        let paid: Amount = tx.output.iter().map(|out| out.value).sum();
        // Size with a change output, a key-path witness and the foreign
        // witnesses.
        let vbytes = tx.vsize() as u64
            + 43
            + 17
            + inputs.len() as u64 * BOARDING_INPUT_WEIGHT.div_ceil(4);
        let fee = fee_rate
            .fee_vb(vbytes)
            .ok_or_else(|| ChainError::Funding("fee overflow".into()))?;
        let change = (wallet_output.value + foreign)
            .checked_sub(paid + fee)
            .ok_or_else(|| ChainError::Funding("insufficient funds".into()))?;
        tx.output.push(TxOut {
            value: change,
            script_pubkey: ScriptBuf::new_p2tr(&SECP, random_keypair().x_only_public_key().0, None),
        });

        Ok(tx)
    }

    async fn sign_transaction(&self, mut tx: Transaction) -> Result<Transaction, ChainError> {
        for input in &mut tx.input {
            if input.witness.is_empty() {
                input.witness = Witness::from_slice(&[[0u8; 64]]);
            }
        }

        Ok(tx)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut state = lock(&self.state);
        let txid = tx.compute_txid();

        if let Some(reason) = state.reject_next.take() {
            return Err(ChainError::Rejected(txid, reason));
        }
        if state.mempool.contains_key(&txid) {
            return Ok(txid);
        }
        if tx
            .input
            .iter()
            .any(|input| state.spent.contains(&input.previous_output))
        {
            return Err(ChainError::Rejected(txid, RejectReason::ConflictingSpend));
        }

        let height = state.height;
        state
            .spent
            .extend(tx.input.iter().map(|input| input.previous_output));
        for (vout, output) in tx.output.iter().enumerate() {
            state
                .outputs
                .insert(OutPoint::new(txid, vout as u32), (output.clone(), height));
        }
        state.mempool.insert(txid, height);
        state.broadcasts.push(tx.clone());

        Ok(txid)
    }

    async fn confirmations(&self, txid: Txid) -> Result<Option<u32>, ChainError> {
        let state = lock(&self.state);

        Ok(state
            .mempool
            .get(&txid)
            .map(|broadcast_at| state.height - broadcast_at))
    }

    async fn is_unspent(&self, outpoint: OutPoint) -> Result<bool, ChainError> {
        let state = lock(&self.state);

        Ok(state.outputs.contains_key(&outpoint) && !state.spent.contains(&outpoint))
    }

    async fn get_output(&self, outpoint: OutPoint) -> Result<Option<ChainOutput>, ChainError> {
        let state = lock(&self.state);
        if state.spent.contains(&outpoint) {
            return Ok(None);
        }

        Ok(state
            .outputs
            .get(&outpoint)
            .map(|(output, created_at)| ChainOutput {
                output: output.clone(),
                confirmations: state.height - created_at,
            }))
    }
}

/// A round signed by every participant, never touching a coordinator.
#[derive(Debug, Clone)]
pub struct SignedRound {
    pub coordinator: Keypair,
    /// In leaf order.
    pub owners: Vec<Keypair>,
    pub funding_tx: Transaction,
    pub signed: SignedClaimTree,
    pub node_txs: BTreeMap<usize, Transaction>,
    pub exit_paths: Vec<ExitPath>,
}

/// Signs every node of `signed` with the keys in `keys` through a
/// [`SignatureEngine`], the way the coordinator collects them.
pub fn sign_tree(signed: &mut SignedClaimTree, keys: &[Keypair]) -> Result<(), ArkError> {
    let keys: HashMap<PublicKey, &Keypair> = keys.iter().map(|kp| (kp.public_key(), kp)).collect();
    let mut engine = SignatureEngine::new();

    for (index, digest, signers) in signed.digests()? {
        engine.open(digest, signers.clone())?;

        let mut sec_nonces = Vec::with_capacity(signers.len());
        for signer in &signers {
            let keypair = keys
                .get(signer)
                .ok_or_else(|| eyre::eyre!("No key for signer {signer}"))?;
            let (sec_nonce, pub_nonce) = nonce_pair(keypair, &signers, digest, &mut thread_rng())?;
            engine.submit_nonce(signer, &digest, pub_nonce)?;
            sec_nonces.push((signer, *keypair, sec_nonce));
        }

        let agg_nonce = engine.aggregate_nonce(&digest)?;
        for (signer, keypair, sec_nonce) in sec_nonces {
            let partial =
                crate::musig2::partial_sign(&signers, sec_nonce, &agg_nonce, keypair, digest)?;
            engine.submit(signer, &digest, partial)?;
        }

        signed.attach_signature(index, engine.aggregate(&digest)?)?;
    }

    Ok(())
}

/// Builds and fully signs a round over claims of `values` sats, one fresh
/// owner each, paying `fee` sats in node transaction fees.
pub fn signed_round(values: &[u64], fee: u64) -> Result<SignedRound, ArkError> {
    let coordinator = random_keypair();
    let owners: Vec<Keypair> = values.iter().map(|_| random_keypair()).collect();
    let claims: Vec<ClaimLeaf> = owners
        .iter()
        .zip(values)
        .map(|(owner, value)| ClaimLeaf {
            owner: owner.public_key(),
            value: Amount::from_sat(*value),
        })
        .collect();
    let params = TreeParams {
        coordinator: coordinator.public_key(),
        network: Network::Regtest,
        radix: 4,
        expiry_height: 1_000,
        exit_delta: 12,
    };

    let tree = ClaimTree::build(&claims, Amount::from_sat(fee), params)?;
    let funding_tx = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: random_outpoint(),
            ..Default::default()
        }],
        output: vec![tree.root_txout()?],
    };
    let funding_outpoint = OutPoint::new(funding_tx.compute_txid(), 0);

    let mut signed = SignedClaimTree::new(tree, funding_outpoint)?;
    let mut keys = owners.clone();
    keys.push(coordinator);
    sign_tree(&mut signed, &keys)?;

    let node_txs = signed.signed_transactions()?;
    let exit_paths = ExitPath::from_signed_tree(1, &signed)?;

    Ok(SignedRound {
        coordinator,
        owners,
        funding_tx,
        signed,
        node_txs,
        exit_paths,
    })
}

/// Forfeit of the claim at `leaf`, signed by its owner.
pub fn forfeit_of(round: &SignedRound, leaf: usize) -> Result<ForfeitTransaction, ArkError> {
    let (path, owner) = round
        .exit_paths
        .get(leaf)
        .zip(round.owners.get(leaf))
        .ok_or_else(|| eyre::eyre!("Round has no leaf {leaf}"))?;

    ForfeitTransaction::sign(path, owner, TEST_FORFEIT_FEE)
}

/// Records every call, optionally failing commits.
#[derive(Debug, Default)]
pub struct RecordingSettlement {
    fail_commit: bool,
    prepared: Mutex<Vec<ClaimId>>,
    committed: Mutex<Vec<ClaimId>>,
    aborted: Mutex<Vec<ClaimId>>,
}

impl RecordingSettlement {
    pub fn failing_commit() -> Self {
        Self {
            fail_commit: true,
            ..Default::default()
        }
    }

    pub fn prepared(&self) -> Vec<ClaimId> {
        lock(&self.prepared).clone()
    }

    pub fn committed(&self) -> Vec<ClaimId> {
        lock(&self.committed).clone()
    }

    pub fn aborted(&self) -> Vec<ClaimId> {
        lock(&self.aborted).clone()
    }
}

#[async_trait]
impl OffchainSettlement for RecordingSettlement {
    async fn prepare(&self, claim: ClaimId, _forfeit: &ForfeitTransaction) -> Result<(), ArkError> {
        lock(&self.prepared).push(claim);
        Ok(())
    }

    async fn commit(&self, claim: ClaimId) -> Result<(), ArkError> {
        if self.fail_commit {
            return Err(ExitError::Settlement(format!("commit of {claim} refused")).into());
        }
        lock(&self.committed).push(claim);
        Ok(())
    }

    async fn abort(&self, claim: ClaimId) {
        lock(&self.aborted).push(claim);
    }
}
