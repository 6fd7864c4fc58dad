//! # Expired Tree Sweep
//!
//! After a round's expiry height every node output of its claim tree can be
//! spent by the coordinator alone through the expiry leaf. The sweeper
//! collects the outputs of expired rounds that are still on-chain and
//! unspent back into the coordinator's settlement script.

use crate::builder::script::AbsoluteTimelockScript;
use crate::builder::transaction::input::SpendableTxIn;
use crate::builder::transaction::{
    create_expiry_sweep_txhandler, node_output_scripts, NODE_EXPIRY_LEAF,
};
use crate::chain::ChainClient;
use crate::database::Database;
use crate::errors::{ArkError, ExitError, TxError};
use crate::exit::{settlement_script, ExitPath};
use crate::metrics::CLAIM_METRICS;
use crate::utils::SECP;
use crate::{musig2, RoundId};
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{Message, PublicKey};
use bitcoin::{Amount, ScriptBuf, TapSighashType, Transaction, TxOut, Txid};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Virtual size of a single input expiry sweep, rounded up.
const SWEEP_TX_VBYTES: u64 = 150;

fn node_input(
    path: &ExitPath,
    outpoint: bitcoin::OutPoint,
    output: &TxOut,
    signers: &[PublicKey],
) -> Result<SpendableTxIn, ArkError> {
    let aggregate_key = musig2::aggregate_xonly(signers)?;
    let input = SpendableTxIn::from_scripts(
        outpoint,
        output.value,
        node_output_scripts(
            aggregate_key,
            path.coordinator.x_only_public_key().0,
            path.expiry_height,
        ),
        None,
        path.network,
    )?;

    if input.get_prevout() != output {
        return Err(TxError::SpendableTxIn(format!(
            "node output {outpoint} does not match its expiry policy"
        ))
        .into());
    }

    Ok(input)
}

/// The tree root of the round `path` belongs to, spendable through its
/// expiry leaf.
pub fn expired_tree_input(path: &ExitPath) -> Result<SpendableTxIn, ArkError> {
    let root = path
        .steps
        .first()
        .ok_or_else(|| ExitError::InvalidStep(0, "exit path has no steps".into()))?;

    node_input(path, path.funding_outpoint, &path.funding_output, &root.signers)
}

/// Every node output along `path`, root first.
pub fn expired_node_inputs(path: &ExitPath) -> Result<Vec<SpendableTxIn>, ArkError> {
    let mut inputs = vec![expired_tree_input(path)?];

    for (i, pair) in path.steps.windows(2).enumerate() {
        let (parent, child) = (&pair[0], &pair[1]);
        let spent = child
            .transaction
            .input
            .first()
            .ok_or_else(|| ExitError::InvalidStep(i + 1, "no inputs".into()))?
            .previous_output;
        let output = parent
            .transaction
            .output
            .get(spent.vout as usize)
            .ok_or_else(|| ExitError::InvalidStep(i + 1, "spends a missing output".into()))?;

        inputs.push(node_input(path, spent, output, &child.signers)?);
    }

    Ok(inputs)
}

/// Builds and signs the coordinator's sweep of an expired node output.
pub fn sweep_tx(
    input: SpendableTxIn,
    expiry_height: u32,
    coordinator: &Keypair,
    destination: ScriptBuf,
    fee: Amount,
) -> Result<Transaction, ArkError> {
    let expiry = AbsoluteTimelockScript::new(coordinator.x_only_public_key().0, expiry_height);
    let mut handler = create_expiry_sweep_txhandler(input, &expiry, destination, fee)?;

    let sighash =
        handler.calculate_script_spend_sighash_indexed(0, NODE_EXPIRY_LEAF, TapSighashType::Default)?;
    let signature =
        SECP.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), coordinator);
    let witness = expiry.generate_script_inputs(&signature);
    handler.set_p2tr_script_spend_witness(&witness.to_vec(), 0, NODE_EXPIRY_LEAF)?;

    Ok(handler.promote()?.into_tx())
}

#[derive(Debug, Clone)]
pub struct Sweeper {
    chain: Arc<dyn ChainClient>,
    db: Database,
    coordinator: Keypair,
    fee_target_blocks: u16,
}

impl Sweeper {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        db: Database,
        coordinator: Keypair,
        fee_target_blocks: u16,
    ) -> Self {
        Self {
            chain,
            db,
            coordinator,
            fee_target_blocks,
        }
    }

    /// Sweeps every expired round. Returns the broadcast sweeps per round.
    /// A round is only marked swept once none of its node outputs is left
    /// to sweep; failing rounds are retried on the next pass.
    #[tracing::instrument(skip(self), err(level = tracing::Level::WARN))]
    pub async fn sweep_expired(&self) -> Result<BTreeMap<RoundId, Vec<Txid>>, ArkError> {
        let tip = self.chain.tip_height().await?;
        let mut swept = BTreeMap::new();

        for round_id in self.db.get_expired_rounds(None, tip).await? {
            let pass = match self.sweep_round(round_id).await {
                Ok(pass) => pass,
                Err(e) => {
                    tracing::warn!("Can't sweep round {round_id}, retrying next pass: {e}");
                    continue;
                }
            };

            if pass.pending == 0 && self.db.mark_round_swept(None, round_id).await? {
                CLAIM_METRICS.swept_rounds.increment(1);
                tracing::info!(
                    "Round {round_id} expired, swept {} tree outputs",
                    pass.txids.len()
                );
            }
            if !pass.txids.is_empty() {
                swept.insert(round_id, pass.txids);
            }
        }

        Ok(swept)
    }

    async fn sweep_round(&self, round_id: RoundId) -> Result<SweepPass, ArkError> {
        let claims = self.db.get_claims_of_round(None, round_id).await?;

        // Exit paths share their upper nodes.
        let mut inputs = BTreeMap::new();
        for claim in &claims {
            for input in expired_node_inputs(&claim.exit_path)? {
                inputs.insert(*input.get_prev_outpoint(), (input, claim.exit_path.expiry_height));
            }
        }

        let fee = self
            .chain
            .estimate_fee_rate(self.fee_target_blocks)
            .await?
            .fee_vb(SWEEP_TX_VBYTES)
            .ok_or_else(|| eyre::eyre!("Sweep fee overflows"))?;
        let destination = settlement_script(&self.coordinator.public_key());

        let mut pass = SweepPass::default();
        for (outpoint, (input, expiry_height)) in inputs {
            if !self.chain.is_unspent(outpoint).await? {
                continue;
            }
            if input.get_prevout().value <= fee {
                tracing::debug!("Node output {outpoint} is not worth sweeping");
                continue;
            }

            let tx = sweep_tx(input, expiry_height, &self.coordinator, destination.clone(), fee)?;
            match self.chain.broadcast(&tx).await {
                Ok(txid) => pass.txids.push(txid),
                Err(e) => {
                    tracing::warn!("Sweep of node output {outpoint} failed: {e}");
                    pass.pending += 1;
                }
            }
        }

        // Outputs of node transactions broadcast since show up next pass.
        if !pass.txids.is_empty() {
            pass.pending += 1;
        }

        Ok(pass)
    }
}

/// Outcome of sweeping one round once.
#[derive(Debug, Default)]
struct SweepPass {
    txids: Vec<Txid>,
    /// Outputs left for a later pass.
    pending: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CompletedRound;
    use crate::errors::RejectReason;
    use crate::testkit::{self, MockChain};
    use bitcoin::absolute::LockTime;

    #[test]
    fn tree_root_is_spendable_after_expiry() {
        let round = testkit::signed_round(&[1_000, 2_000, 3_000], 30).unwrap();
        let path = &round.exit_paths[0];

        let input = expired_tree_input(path).unwrap();
        assert_eq!(*input.get_prevout(), round.funding_tx.output[0]);
        assert_eq!(*input.get_prev_outpoint(), round.signed.funding_outpoint());

        let tx = sweep_tx(
            input,
            path.expiry_height,
            &round.coordinator,
            ScriptBuf::new(),
            Amount::from_sat(500),
        )
        .unwrap();
        assert_eq!(tx.lock_time, LockTime::from_height(1_000).unwrap());
        assert_eq!(tx.output[0].value, round.funding_tx.output[0].value - Amount::from_sat(500));
        // Signature, script and control block.
        assert_eq!(tx.input[0].witness.len(), 3);
    }

    #[test]
    fn wrong_signers_dont_match_the_root() {
        let round = testkit::signed_round(&[1_000, 2_000], 20).unwrap();
        let mut path = round.exit_paths[0].clone();
        path.steps[0].signers.reverse();

        assert!(expired_tree_input(&path).is_err());
    }

    #[test]
    fn node_inputs_follow_the_path() {
        let values: Vec<u64> = (1..=20).map(|v| v * 1_000).collect();
        let round = testkit::signed_round(&values, 100).unwrap();
        let path = &round.exit_paths[7];

        let inputs = expired_node_inputs(path).unwrap();
        assert_eq!(inputs.len(), path.steps.len());
        for (input, step) in inputs.iter().zip(&path.steps) {
            assert_eq!(*input.get_prev_outpoint(), step.transaction.input[0].previous_output);
        }
    }

    async fn saved_round(chain: &MockChain, db: &Database) -> testkit::SignedRound {
        let round = testkit::signed_round(&[10_000, 20_000, 30_000], 30).unwrap();
        chain.broadcast(&round.funding_tx).await.unwrap();
        db.save_completed_round(CompletedRound {
            round_id: 1,
            funding_tx: &round.funding_tx,
            funding_outpoint: round.signed.funding_outpoint(),
            expiry_height: 1_000,
            node_txs: &round.node_txs,
            exit_paths: &round.exit_paths,
            forfeits: &[],
        })
        .await
        .unwrap();

        round
    }

    async fn is_swept(db: &Database) -> bool {
        db.get_round(None, 1).await.unwrap().unwrap().swept
    }

    #[tokio::test]
    async fn expired_rounds_are_swept_once() {
        let chain = Arc::new(MockChain::new());
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = saved_round(&chain, &db).await;

        let sweeper = Sweeper::new(chain.clone(), db.clone(), round.coordinator, 6);
        assert!(sweeper.sweep_expired().await.unwrap().is_empty());

        chain.mine(900);
        let swept = sweeper.sweep_expired().await.unwrap();
        // Only the root exists on-chain.
        assert_eq!(swept.get(&1).map(Vec::len), Some(1));
        assert!(!is_swept(&db).await);

        // Nothing left to sweep.
        assert!(sweeper.sweep_expired().await.unwrap().is_empty());
        assert!(is_swept(&db).await);

        assert!(sweeper.sweep_expired().await.unwrap().is_empty());
        assert_eq!(chain.broadcasts().len(), 2);
    }

    #[tokio::test]
    async fn rejected_sweeps_are_retried() {
        let chain = Arc::new(MockChain::new());
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = saved_round(&chain, &db).await;
        let sweeper = Sweeper::new(chain.clone(), db.clone(), round.coordinator, 6);

        chain.mine(1_000);
        chain.reject_next_broadcast(RejectReason::InsufficientFee);
        assert!(sweeper.sweep_expired().await.unwrap().is_empty());
        assert!(!is_swept(&db).await);

        let swept = sweeper.sweep_expired().await.unwrap();
        assert_eq!(swept.get(&1).map(Vec::len), Some(1));
        sweeper.sweep_expired().await.unwrap();
        assert!(is_swept(&db).await);
    }

    #[tokio::test]
    async fn outputs_of_broadcast_nodes_are_swept() {
        let chain = Arc::new(MockChain::new());
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = saved_round(&chain, &db).await;
        let sweeper = Sweeper::new(chain.clone(), db.clone(), round.coordinator, 6);

        // Someone started exiting before the expiry.
        let root_tx = &round.exit_paths[0].steps[0].transaction;
        chain.broadcast(root_tx).await.unwrap();
        chain.mine(1_000);

        let swept = sweeper.sweep_expired().await.unwrap();
        let count = swept.get(&1).map(Vec::len).unwrap_or_default();
        assert!(count >= 1);
        let sweeps = chain.broadcasts().split_off(2);
        assert_eq!(sweeps.len(), count);
        for sweep in &sweeps {
            assert_eq!(sweep.input[0].previous_output.txid, root_tx.compute_txid());
        }

        assert!(sweeper.sweep_expired().await.unwrap().is_empty());
        assert!(is_swept(&db).await);
    }
}
