//! # Exit and Forfeit Manager
//!
//! Hands out the exit material of claims and accepts forfeits that
//! relinquish them.
//!
//! An [`ExitPath`] is self-contained: a participant holding one can check it
//! against the funding transaction and broadcast it without ever talking to
//! the coordinator again. A [`ForfeitTransaction`] moves a claim output to
//! the coordinator through the owner+coordinator leaf; once the coordinator
//! accepts it the claim's exit path is relinquished.

use crate::builder::address::taproot_script_pubkey;
use crate::builder::script::{CosignScript, SpendableScript, TimelockScript};
use crate::builder::transaction::input::SpendableTxIn;
use crate::builder::transaction::{
    claim_output_scripts, create_claim_exit_txhandler, create_forfeit_txhandler,
    node_output_scripts, TxHandler, Unsigned, CLAIM_COSIGN_LEAF, CLAIM_EXIT_LEAF,
    NODE_COOPERATIVE_LEAF,
};
use crate::database::Database;
use crate::errors::{ArkError, ExitError, SignatureError, TxError};
use crate::metrics::CLAIM_METRICS;
use crate::tree::SignedClaimTree;
use crate::utils::SECP;
use crate::{musig2, ClaimId, RoundId};
use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{schnorr, Message, PublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::{Amount, OutPoint, ScriptBuf, TapLeafHash, TapSighashType, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimStatus {
    Live,
    /// Forfeit stored, off-chain settlement not committed yet.
    Settling,
    Forfeited,
    Exited,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Live => "live",
            ClaimStatus::Settling => "settling",
            ClaimStatus::Forfeited => "forfeited",
            ClaimStatus::Exited => "exited",
        }
    }
}

impl FromStr for ClaimStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(ClaimStatus::Live),
            "settling" => Ok(ClaimStatus::Settling),
            "forfeited" => Ok(ClaimStatus::Forfeited),
            "exited" => Ok(ClaimStatus::Exited),
            other => Err(eyre::eyre!("Unknown claim status {other}")),
        }
    }
}

/// The coordinator's view of a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub claim_id: ClaimId,
    pub round_id: RoundId,
    pub owner: PublicKey,
    pub value: Amount,
    pub status: ClaimStatus,
    pub exit_path: ExitPath,
}

/// One fully signed node transaction of an exit path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStep {
    pub transaction: Transaction,
    /// Signer set of the node output this transaction spends, coordinator
    /// first.
    pub signers: Vec<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPath {
    pub round_id: RoundId,
    pub funding_outpoint: OutPoint,
    pub funding_output: TxOut,
    /// From the root's transaction down to the leaf's parent.
    pub steps: Vec<ExitStep>,
    pub claim_outpoint: ClaimId,
    pub claim_output: TxOut,
    pub owner: PublicKey,
    pub coordinator: PublicKey,
    pub exit_delta: u16,
    pub expiry_height: u32,
    pub network: bitcoin::Network,
}

/// Key-path output the coordinator collects forfeited claims into.
pub fn settlement_script(coordinator: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr(&SECP, coordinator.x_only_public_key().0, None)
}

impl ExitPath {
    /// Exit paths of every claim in a signed tree, in leaf order.
    #[tracing::instrument(skip(signed), fields(leaves = signed.tree().leaf_count()), err)]
    pub fn from_signed_tree(
        round_id: RoundId,
        signed: &SignedClaimTree,
    ) -> Result<Vec<ExitPath>, ArkError> {
        let tree = signed.tree();
        let params = tree.params();
        let signed_txs = signed.signed_transactions()?;
        let funding_output = tree.root_txout()?;

        (0..tree.leaf_count())
            .map(|leaf| -> Result<ExitPath, ArkError> {
                let steps = tree
                    .path_to_root(leaf)
                    .into_iter()
                    .map(|index| -> Result<ExitStep, ArkError> {
                        Ok(ExitStep {
                            transaction: signed_txs
                                .get(&index)
                                .ok_or(TxError::TxInputNotFound)?
                                .clone(),
                            signers: tree.node(index)?.signers.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let owner = tree.node(leaf)?.owner.ok_or(TxError::TxOutputNotFound)?;

                Ok(ExitPath {
                    round_id,
                    funding_outpoint: signed.funding_outpoint(),
                    funding_output: funding_output.clone(),
                    steps,
                    claim_outpoint: signed.leaf_outpoint(leaf)?,
                    claim_output: tree.output(leaf)?.txout().clone(),
                    owner,
                    coordinator: params.coordinator,
                    exit_delta: params.exit_delta,
                    expiry_height: params.expiry_height,
                    network: params.network,
                })
            })
            .collect()
    }

    /// Checks the whole path against the funding transaction without any help
    /// from the coordinator.
    pub fn verify(&self, funding_tx: &Transaction) -> Result<(), ExitError> {
        let funding_txid = funding_tx.compute_txid();
        if funding_txid != self.funding_outpoint.txid
            || funding_tx.output.get(self.funding_outpoint.vout as usize)
                != Some(&self.funding_output)
        {
            return Err(ExitError::FundingMismatch(funding_txid));
        }
        if self.steps.is_empty() {
            return Err(ExitError::InvalidStep(0, "path has no steps".into()));
        }

        let mut spent_outpoint = self.funding_outpoint;
        let mut spent_output = self.funding_output.clone();

        for (i, step) in self.steps.iter().enumerate() {
            let input = match step.transaction.input.as_slice() {
                [input] => input,
                _ => {
                    return Err(ExitError::InvalidStep(
                        i,
                        "node transaction must have exactly one input".into(),
                    ))
                }
            };
            if input.previous_output != spent_outpoint {
                return Err(ExitError::InvalidStep(
                    i,
                    format!("spends {} instead of {spent_outpoint}", input.previous_output),
                ));
            }

            self.verify_step(i, step, &spent_output)?;

            let txid = step.transaction.compute_txid();
            let next_outpoint = match self.steps.get(i + 1) {
                Some(next) => next
                    .transaction
                    .input
                    .first()
                    .map(|input| input.previous_output)
                    .ok_or_else(|| ExitError::InvalidStep(i + 1, "no input".into()))?,
                None => self.claim_outpoint,
            };
            if next_outpoint.txid != txid {
                return Err(ExitError::InvalidStep(
                    i + 1,
                    format!("does not spend step {i} ({txid})"),
                ));
            }

            spent_output = step
                .transaction
                .output
                .get(next_outpoint.vout as usize)
                .ok_or_else(|| ExitError::InvalidStep(i, "missing child output".into()))?
                .clone();
            spent_outpoint = next_outpoint;
        }

        let (claim_spk, _) = taproot_script_pubkey(
            &claim_output_scripts(
                self.owner.x_only_public_key().0,
                self.coordinator.x_only_public_key().0,
                self.exit_delta,
            ),
            self.network,
        )
        .map_err(|e| ExitError::InvalidStep(self.steps.len(), e.to_string()))?;

        if spent_output != self.claim_output || spent_output.script_pubkey != claim_spk {
            return Err(ExitError::OwnerMismatch);
        }

        Ok(())
    }

    /// Checks that `spent` commits to the step's signer set and that the
    /// witness carries a valid aggregate signature for it.
    fn verify_step(&self, i: usize, step: &ExitStep, spent: &TxOut) -> Result<(), ExitError> {
        let invalid = |reason: String| ExitError::InvalidStep(i, reason);

        if step.signers.first() != Some(&self.coordinator) {
            return Err(invalid("coordinator is not the first signer".into()));
        }
        if !step.signers.contains(&self.owner) {
            return Err(ExitError::OwnerMismatch);
        }

        let aggregate_key =
            musig2::aggregate_xonly(&step.signers).map_err(|e| invalid(e.to_string()))?;
        let scripts = node_output_scripts(
            aggregate_key,
            self.coordinator.x_only_public_key().0,
            self.expiry_height,
        );
        let (script_pubkey, spend_info) =
            taproot_script_pubkey(&scripts, self.network).map_err(|e| invalid(e.to_string()))?;
        if spent.script_pubkey != script_pubkey {
            return Err(invalid(
                "spent output does not commit to the signer set".into(),
            ));
        }

        let cooperative = scripts[NODE_COOPERATIVE_LEAF].to_script_buf();
        let control_block = spend_info
            .control_block(&(cooperative.clone(), LeafVersion::TapScript))
            .ok_or_else(|| invalid("no control block for the cooperative leaf".into()))?;

        let witness = &step.transaction.input[0].witness;
        if witness.len() != 3
            || witness.nth(1) != Some(cooperative.as_bytes())
            || witness.nth(2) != Some(control_block.serialize().as_slice())
        {
            return Err(invalid("witness does not spend the cooperative leaf".into()));
        }
        let signature = witness
            .nth(0)
            .and_then(|bytes| schnorr::Signature::from_slice(bytes).ok())
            .ok_or_else(|| invalid("malformed signature".into()))?;

        let sighash = SighashCache::new(&step.transaction)
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&[spent.clone()]),
                TapLeafHash::from_script(&cooperative, LeafVersion::TapScript),
                TapSighashType::Default,
            )
            .map_err(|e| invalid(e.to_string()))?;

        SECP.verify_schnorr(
            &signature,
            &Message::from_digest(sighash.to_byte_array()),
            &aggregate_key,
        )
        .map_err(|_| invalid("aggregate signature does not verify".into()))?;

        let created: Amount = step.transaction.output.iter().map(|out| out.value).sum();
        if created > spent.value {
            return Err(invalid(format!(
                "creates {created} out of {}",
                spent.value
            )));
        }

        Ok(())
    }

    fn claim_input(&self) -> Result<SpendableTxIn, TxError> {
        let input = SpendableTxIn::from_scripts(
            self.claim_outpoint,
            self.claim_output.value,
            claim_output_scripts(
                self.owner.x_only_public_key().0,
                self.coordinator.x_only_public_key().0,
                self.exit_delta,
            ),
            None,
            self.network,
        )?;

        if *input.get_prevout() != self.claim_output {
            return Err(TxError::SpendableTxIn(format!(
                "claim output of {} does not match its policy",
                self.claim_outpoint
            )));
        }

        Ok(input)
    }

    /// Builds and signs the owner's sweep of the claim output, valid
    /// `exit_delta` blocks after the claim output confirms.
    pub fn claim_tx(
        &self,
        owner: &Keypair,
        destination: ScriptBuf,
        fee: Amount,
    ) -> Result<Transaction, ArkError> {
        if owner.public_key() != self.owner {
            return Err(ExitError::OwnerMismatch.into());
        }

        let mut handler =
            create_claim_exit_txhandler(self.claim_input()?, self.exit_delta, destination, fee)?;
        let sighash = handler.calculate_script_spend_sighash_indexed(
            0,
            CLAIM_EXIT_LEAF,
            TapSighashType::Default,
        )?;
        let signature = SECP.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), owner);
        let witness = TimelockScript::new(Some(owner.x_only_public_key().0), self.exit_delta)
            .generate_script_inputs(Some(&signature));

        handler.set_p2tr_script_spend_witness(&witness.to_vec(), 0, CLAIM_EXIT_LEAF)?;

        Ok(handler.promote()?.into_tx())
    }
}

/// A claim's owner handing the claim output over to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitTransaction {
    pub claim: ClaimId,
    /// Unsigned: the witness is only assembled by [`ExitManager::finalize_forfeit`].
    pub transaction: Transaction,
    pub owner_signature: schnorr::Signature,
}

fn forfeit_txhandler(path: &ExitPath, fee: Amount) -> Result<TxHandler<Unsigned>, TxError> {
    create_forfeit_txhandler(path.claim_input()?, settlement_script(&path.coordinator), fee)
}

impl ForfeitTransaction {
    /// Owner side: builds and signs the forfeit of the claim behind `path`.
    pub fn sign(path: &ExitPath, owner: &Keypair, fee: Amount) -> Result<Self, ArkError> {
        if owner.public_key() != path.owner {
            return Err(ExitError::OwnerMismatch.into());
        }

        let handler = forfeit_txhandler(path, fee)?;
        let sighash = handler.calculate_script_spend_sighash_indexed(
            0,
            CLAIM_COSIGN_LEAF,
            TapSighashType::Default,
        )?;

        Ok(ForfeitTransaction {
            claim: path.claim_outpoint,
            transaction: handler.get_cached_tx().clone(),
            owner_signature: SECP
                .sign_schnorr(&Message::from_digest(sighash.to_byte_array()), owner),
        })
    }

    /// Fee the forfeit pays, if it doesn't create value.
    fn fee(&self, path: &ExitPath) -> Option<Amount> {
        let created: Amount = self.transaction.output.iter().map(|out| out.value).sum();
        path.claim_output.value.checked_sub(created)
    }

    /// Checks the forfeit spends exactly the claim of `path` into the
    /// coordinator's settlement script, signed by the owner.
    pub fn verify(&self, path: &ExitPath) -> Result<(), SignatureError> {
        let invalid = |reason: &str| SignatureError::InvalidForfeit(self.claim, reason.into());

        if self.claim != path.claim_outpoint {
            return Err(invalid("forfeit is for another claim"));
        }
        match self.transaction.input.as_slice() {
            [input] if input.previous_output == path.claim_outpoint => {}
            _ => return Err(invalid("must spend exactly the claim output")),
        }
        match self.transaction.output.as_slice() {
            [output] if output.script_pubkey == settlement_script(&path.coordinator) => {}
            _ => return Err(invalid("must pay exactly the settlement output")),
        }
        let fee = self.fee(path).ok_or_else(|| invalid("creates value"))?;

        // Rebuilding the forfeit pins every other field of the transaction.
        let handler = forfeit_txhandler(path, fee).map_err(|e| invalid(&e.to_string()))?;
        if *handler.get_cached_tx() != self.transaction {
            return Err(invalid("unexpected transaction layout"));
        }
        let sighash = handler
            .calculate_script_spend_sighash_indexed(0, CLAIM_COSIGN_LEAF, TapSighashType::Default)
            .map_err(|e| invalid(&e.to_string()))?;

        SECP.verify_schnorr(
            &self.owner_signature,
            &Message::from_digest(sighash.to_byte_array()),
            &path.owner.x_only_public_key().0,
        )
        .map_err(|_| invalid("owner signature does not verify"))
    }
}

/// Settlement of a forfeit outside of a round, e.g. a payment channel the
/// forfeited value moves into. Driven as a two-phase commit around the claim
/// status change.
#[async_trait]
pub trait OffchainSettlement: Send + Sync {
    async fn prepare(&self, claim: ClaimId, forfeit: &ForfeitTransaction) -> Result<(), ArkError>;

    async fn commit(&self, claim: ClaimId) -> Result<(), ArkError>;

    async fn abort(&self, claim: ClaimId);
}

/// Error for a claim that is not live.
fn not_live(claim: ClaimId, status: ClaimStatus) -> ArkError {
    match status {
        ClaimStatus::Settling => ExitError::ClaimSettling(claim).into(),
        ClaimStatus::Forfeited => ExitError::ClaimForfeited(claim).into(),
        ClaimStatus::Exited => ExitError::ClaimExited(claim).into(),
        ClaimStatus::Live => {
            ExitError::Settlement(format!("status of claim {claim} changed concurrently")).into()
        }
    }
}

#[derive(Debug)]
pub struct ExitManager {
    db: Database,
    coordinator: Keypair,
    /// Serializes claim status changes: forfeits, exits and refresh
    /// reservations.
    forfeit_lock: Mutex<()>,
    /// Claims a running round refreshes, to the round. Only changed under
    /// `forfeit_lock`.
    refreshing: std::sync::Mutex<HashMap<ClaimId, RoundId>>,
}

impl ExitManager {
    pub fn new(db: Database, coordinator: Keypair) -> Self {
        Self {
            db,
            coordinator,
            forfeit_lock: Mutex::new(()),
            refreshing: Default::default(),
        }
    }

    fn refreshing(&self) -> std::sync::MutexGuard<'_, HashMap<ClaimId, RoundId>> {
        self.refreshing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Round currently refreshing `claim`, if any.
    pub fn refreshing_round(&self, claim: ClaimId) -> Option<RoundId> {
        self.refreshing().get(&claim).copied()
    }

    fn check_not_refreshing(&self, claim: ClaimId) -> Result<(), ExitError> {
        match self.refreshing_round(claim) {
            Some(round_id) => Err(ExitError::ClaimRefreshing(claim, round_id)),
            None => Ok(()),
        }
    }

    async fn claim(&self, claim: ClaimId) -> Result<ClaimRecord, ArkError> {
        self.db
            .get_claim(None, claim)
            .await?
            .ok_or_else(|| ExitError::UnknownClaim(claim).into())
    }

    /// Exit path of a live claim.
    #[tracing::instrument(skip(self), err(level = tracing::Level::WARN))]
    pub async fn build_exit_path(&self, claim: ClaimId) -> Result<ExitPath, ArkError> {
        let record = self.claim(claim).await?;

        match record.status {
            ClaimStatus::Live => Ok(record.exit_path),
            status => Err(not_live(claim, status)),
        }
    }

    /// Reserves live claims for the round refreshing them. Until the round
    /// releases them, no forfeit or exit of these claims is accepted outside
    /// of it.
    #[tracing::instrument(skip(self, claims), fields(claims = claims.len()), err(level = tracing::Level::DEBUG))]
    pub async fn reserve_refresh(
        &self,
        round_id: RoundId,
        claims: &[ClaimId],
    ) -> Result<(), ArkError> {
        let _guard = self.forfeit_lock.lock().await;

        for claim in claims {
            if let Some(reserved_by) = self.refreshing_round(*claim) {
                if reserved_by != round_id {
                    return Err(ExitError::ClaimRefreshing(*claim, reserved_by).into());
                }
            }

            let status = self.claim(*claim).await?.status;
            if status != ClaimStatus::Live {
                return Err(not_live(*claim, status));
            }
        }

        self.refreshing()
            .extend(claims.iter().map(|claim| (*claim, round_id)));

        Ok(())
    }

    /// Releases the reservations `round_id` holds on `claims`.
    pub fn release_refresh(&self, round_id: RoundId, claims: &[ClaimId]) {
        let mut refreshing = self.refreshing();
        for claim in claims {
            if refreshing.get(claim) == Some(&round_id) {
                refreshing.remove(claim);
            }
        }
    }

    /// Releases every reservation of a finished round.
    pub fn release_round(&self, round_id: RoundId) {
        self.refreshing()
            .retain(|_, reserved_by| *reserved_by != round_id);
    }

    /// Fails unless every one of `claims` is still live.
    pub async fn ensure_live(&self, claims: &[ClaimId]) -> Result<(), ArkError> {
        for claim in claims {
            let status = self.claim(*claim).await?.status;
            if status != ClaimStatus::Live {
                return Err(not_live(*claim, status));
            }
        }

        Ok(())
    }

    /// Checks a forfeit against the stored claim. Returns the claim.
    #[tracing::instrument(skip(self, forfeit), err(level = tracing::Level::WARN))]
    pub async fn validate_forfeit(
        &self,
        claim: ClaimId,
        forfeit: &ForfeitTransaction,
    ) -> Result<ClaimRecord, ArkError> {
        let record = self.claim(claim).await?;

        if record.status != ClaimStatus::Live {
            return Err(not_live(claim, record.status));
        }
        if forfeit.claim != claim {
            return Err(SignatureError::InvalidForfeit(claim, "forfeit is for another claim".into()).into());
        }
        forfeit.verify(&record.exit_path)?;

        Ok(record)
    }

    /// Accepts a forfeit as the single commit point of `settlement`.
    ///
    /// The forfeit is stored and the claim moved to settling before the
    /// settlement commits. A failed commit puts the claim back to live and
    /// aborts the settlement; any earlier failure only aborts it.
    #[tracing::instrument(skip(self, forfeit, settlement), err(level = tracing::Level::WARN))]
    pub async fn accept_forfeit(
        &self,
        claim: ClaimId,
        forfeit: ForfeitTransaction,
        settlement: &dyn OffchainSettlement,
    ) -> Result<(), ArkError> {
        let _guard = self.forfeit_lock.lock().await;

        settlement.prepare(claim, &forfeit).await?;

        if let Err(e) = self.begin_settlement(claim, &forfeit).await {
            tracing::warn!("Aborting settlement of forfeited claim {claim}: {e}");
            settlement.abort(claim).await;
            return Err(e);
        }

        if let Err(e) = settlement.commit(claim).await {
            tracing::warn!("Settlement of claim {claim} didn't commit, claim stays live: {e}");
            if let Err(revert) = self.revert_settlement(claim).await {
                // TODO: reconcile claims left settling on startup, from the
                // settlement's own record of commits.
                tracing::error!("Claim {claim} left settling: {revert}");
            }
            settlement.abort(claim).await;
            return Err(e);
        }

        // Committed: the claim is relinquished whatever happens next.
        match self
            .db
            .update_claim_status(None, claim, ClaimStatus::Settling, ClaimStatus::Forfeited)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::error!("Settled claim {claim} was not settling"),
            Err(e) => tracing::error!("Settled claim {claim} stays settling: {e}"),
        }
        CLAIM_METRICS.forfeited.increment(1);
        tracing::info!("Claim {claim} forfeited");

        Ok(())
    }

    async fn begin_settlement(
        &self,
        claim: ClaimId,
        forfeit: &ForfeitTransaction,
    ) -> Result<(), ArkError> {
        self.check_not_refreshing(claim)?;
        self.validate_forfeit(claim, forfeit).await?;

        let mut dbtx = self.db.begin_transaction().await?;
        let settling = self
            .db
            .update_claim_status(
                Some(&mut dbtx),
                claim,
                ClaimStatus::Live,
                ClaimStatus::Settling,
            )
            .await?;
        if !settling {
            return Err(not_live(claim, ClaimStatus::Live));
        }
        self.db.insert_forfeit(Some(&mut dbtx), None, forfeit).await?;
        dbtx.commit().await?;

        Ok(())
    }

    async fn revert_settlement(&self, claim: ClaimId) -> Result<(), ArkError> {
        let mut dbtx = self.db.begin_transaction().await?;
        self.db.delete_forfeit(Some(&mut dbtx), claim).await?;
        let reverted = self
            .db
            .update_claim_status(
                Some(&mut dbtx),
                claim,
                ClaimStatus::Settling,
                ClaimStatus::Live,
            )
            .await?;
        if !reverted {
            return Err(ExitError::Settlement(format!("claim {claim} is no longer settling")).into());
        }
        dbtx.commit().await?;

        Ok(())
    }

    /// Records that a claim was exited on-chain. A forfeited claim can't be
    /// exited: its forfeit has to be finalized and broadcast instead.
    #[tracing::instrument(skip(self), err(level = tracing::Level::WARN))]
    pub async fn record_exit(&self, claim: ClaimId) -> Result<(), ArkError> {
        let _guard = self.forfeit_lock.lock().await;
        self.check_not_refreshing(claim)?;

        if self
            .db
            .update_claim_status(None, claim, ClaimStatus::Live, ClaimStatus::Exited)
            .await?
        {
            CLAIM_METRICS.exited.increment(1);
            return Ok(());
        }

        Err(not_live(claim, self.claim(claim).await?.status))
    }

    /// Adds the coordinator's signature to a stored forfeit, making it
    /// broadcastable.
    #[tracing::instrument(skip(self), err(level = tracing::Level::ERROR))]
    pub async fn finalize_forfeit(&self, claim: ClaimId) -> Result<Transaction, ArkError> {
        let record = self.claim(claim).await?;
        let forfeit = self
            .db
            .get_forfeit(None, claim)
            .await?
            .ok_or(ExitError::UnknownClaim(claim))?;

        forfeit.verify(&record.exit_path)?;
        let fee = forfeit
            .fee(&record.exit_path)
            .ok_or_else(|| SignatureError::InvalidForfeit(claim, "creates value".into()))?;

        let mut handler = forfeit_txhandler(&record.exit_path, fee)?;
        let sighash = handler.calculate_script_spend_sighash_indexed(
            0,
            CLAIM_COSIGN_LEAF,
            TapSighashType::Default,
        )?;
        let coordinator_signature =
            SECP.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), &self.coordinator);

        let witness = CosignScript::new(
            record.owner.x_only_public_key().0,
            self.coordinator.x_only_public_key().0,
        )
        .generate_script_inputs(&forfeit.owner_signature, &coordinator_signature);
        handler.set_p2tr_script_spend_witness(&witness.to_vec(), 0, CLAIM_COSIGN_LEAF)?;

        Ok(handler.promote()?.into_tx())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CompletedRound;
    use crate::testkit::{self, RecordingSettlement, SignedRound};
    use bitcoin::secp256k1::rand::thread_rng;

    async fn manager_with_round(values: &[u64]) -> (ExitManager, SignedRound) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let round = testkit::signed_round(values, 300).unwrap();
        db.save_completed_round(CompletedRound {
            round_id: 1,
            funding_tx: &round.funding_tx,
            funding_outpoint: round.signed.funding_outpoint(),
            expiry_height: round.signed.tree().params().expiry_height,
            node_txs: &round.node_txs,
            exit_paths: &round.exit_paths,
            forfeits: &[],
        })
        .await
        .unwrap();

        (ExitManager::new(db, round.coordinator), round)
    }

    #[test]
    fn exit_paths_verify_offline() {
        let round = testkit::signed_round(&[1_000, 2_000, 3_000, 4_000, 5_000, 6_000], 60).unwrap();

        for path in &round.exit_paths {
            path.verify(&round.funding_tx).unwrap();
            assert_eq!(path.steps.len(), round.signed.tree().path_to_root(0).len());
        }
    }

    #[test]
    fn tampered_exit_paths_are_rejected() {
        let round = testkit::signed_round(&[1_000, 2_000], 20).unwrap();
        let path = &round.exit_paths[0];

        let mut other_funding = round.funding_tx.clone();
        other_funding.lock_time = bitcoin::absolute::LockTime::from_consensus(1);
        assert!(matches!(
            path.verify(&other_funding),
            Err(ExitError::FundingMismatch(_))
        ));

        let mut wrong_owner = path.clone();
        wrong_owner.owner = round.exit_paths[1].owner;
        assert!(wrong_owner.verify(&round.funding_tx).is_err());

        let mut stripped = path.clone();
        stripped.steps[0].transaction.input[0].witness = bitcoin::Witness::new();
        assert!(matches!(
            stripped.verify(&round.funding_tx),
            Err(ExitError::InvalidStep(0, _))
        ));

        let mut outsider = path.clone();
        outsider.steps[0].signers.pop();
        assert!(outsider.verify(&round.funding_tx).is_err());
    }

    #[test]
    fn claim_tx_spends_through_the_exit_leaf() {
        let round = testkit::signed_round(&[50_000], 10).unwrap();
        let path = &round.exit_paths[0];

        let claim = path
            .claim_tx(&round.owners[0], ScriptBuf::new(), Amount::from_sat(500))
            .unwrap();
        assert_eq!(claim.input[0].previous_output, path.claim_outpoint);
        assert_eq!(
            claim.input[0].sequence,
            bitcoin::Sequence::from_height(path.exit_delta)
        );
        assert_eq!(claim.output[0].value, Amount::from_sat(49_500));

        let stranger = Keypair::new(&SECP, &mut thread_rng());
        assert!(matches!(
            path.claim_tx(&stranger, ScriptBuf::new(), Amount::from_sat(500)),
            Err(ArkError::Exit(ExitError::OwnerMismatch))
        ));
    }

    #[test]
    fn forfeit_signature_is_checked() {
        let round = testkit::signed_round(&[10_000, 20_000], 20).unwrap();
        let path = &round.exit_paths[0];

        let forfeit = ForfeitTransaction::sign(path, &round.owners[0], Amount::from_sat(100)).unwrap();
        forfeit.verify(path).unwrap();

        // Signed over some other message.
        let mut forged = forfeit.clone();
        forged.owner_signature =
            SECP.sign_schnorr(&Message::from_digest([7; 32]), &round.owners[0]);
        assert!(matches!(
            forged.verify(path),
            Err(SignatureError::InvalidForfeit(..))
        ));

        // Paying someone else.
        let mut redirected = forfeit.clone();
        redirected.transaction.output[0].script_pubkey = ScriptBuf::new();
        assert!(redirected.verify(path).is_err());

        // Spending another claim.
        assert!(forfeit.verify(&round.exit_paths[1]).is_err());
    }

    #[tokio::test]
    async fn forfeited_claim_has_no_exit_path() {
        let (manager, round) = manager_with_round(&[10_000, 20_000, 30_000]).await;
        let claim = round.exit_paths[1].claim_outpoint;
        let settlement = RecordingSettlement::default();

        assert_eq!(
            manager.build_exit_path(claim).await.unwrap(),
            round.exit_paths[1]
        );

        let forfeit = testkit::forfeit_of(&round, 1).unwrap();
        manager
            .accept_forfeit(claim, forfeit.clone(), &settlement)
            .await
            .unwrap();
        assert_eq!(settlement.committed(), vec![claim]);

        assert!(matches!(
            manager.build_exit_path(claim).await,
            Err(ArkError::Exit(ExitError::ClaimForfeited(c))) if c == claim
        ));
        // Second acceptance fails and aborts its settlement.
        assert!(manager
            .accept_forfeit(claim, forfeit, &settlement)
            .await
            .is_err());
        assert_eq!(settlement.aborted(), vec![claim]);

        let finalized = manager.finalize_forfeit(claim).await.unwrap();
        assert_eq!(finalized.input[0].witness.len(), 4);
        assert_eq!(finalized.input[0].previous_output, claim);
    }

    #[tokio::test]
    async fn failed_settlement_leaves_claim_live() {
        let (manager, round) = manager_with_round(&[10_000]).await;
        let claim = round.exit_paths[0].claim_outpoint;
        let settlement = RecordingSettlement::failing_commit();

        let forfeit = testkit::forfeit_of(&round, 0).unwrap();
        assert!(manager
            .accept_forfeit(claim, forfeit.clone(), &settlement)
            .await
            .is_err());
        assert_eq!(settlement.aborted(), vec![claim]);
        assert!(manager.build_exit_path(claim).await.is_ok());
        assert_eq!(manager.db.get_forfeit(None, claim).await.unwrap(), None);

        // Nothing is left over from the failed attempt.
        let retry = RecordingSettlement::default();
        manager
            .accept_forfeit(claim, forfeit, &retry)
            .await
            .unwrap();
        assert_eq!(retry.committed(), vec![claim]);
    }

    /// Records the claim's status at the moment the settlement commits.
    struct StatusAtCommit {
        db: Database,
        seen: std::sync::Mutex<Option<ClaimStatus>>,
    }

    #[async_trait]
    impl OffchainSettlement for StatusAtCommit {
        async fn prepare(&self, _: ClaimId, _: &ForfeitTransaction) -> Result<(), ArkError> {
            Ok(())
        }

        async fn commit(&self, claim: ClaimId) -> Result<(), ArkError> {
            let record = self.db.get_claim(None, claim).await?.unwrap();
            assert!(self.db.get_forfeit(None, claim).await?.is_some());
            *self.seen.lock().unwrap() = Some(record.status);
            Ok(())
        }

        async fn abort(&self, _: ClaimId) {}
    }

    #[tokio::test]
    async fn forfeit_is_stored_before_the_settlement_commits() {
        let (manager, round) = manager_with_round(&[10_000, 20_000]).await;
        let claim = round.exit_paths[0].claim_outpoint;
        let settlement = StatusAtCommit {
            db: manager.db.clone(),
            seen: Default::default(),
        };

        manager
            .accept_forfeit(claim, testkit::forfeit_of(&round, 0).unwrap(), &settlement)
            .await
            .unwrap();

        assert_eq!(*settlement.seen.lock().unwrap(), Some(ClaimStatus::Settling));
        assert_eq!(
            manager.db.get_claim(None, claim).await.unwrap().unwrap().status,
            ClaimStatus::Forfeited
        );
    }

    #[tokio::test]
    async fn database_failure_never_commits_the_settlement() {
        let (manager, round) = manager_with_round(&[10_000]).await;
        let claim = round.exit_paths[0].claim_outpoint;
        let settlement = RecordingSettlement::default();
        manager.db.close().await;

        assert!(matches!(
            manager
                .accept_forfeit(claim, testkit::forfeit_of(&round, 0).unwrap(), &settlement)
                .await,
            Err(ArkError::DatabaseError(_))
        ));
        assert_eq!(settlement.prepared(), vec![claim]);
        assert!(settlement.committed().is_empty());
        assert_eq!(settlement.aborted(), vec![claim]);
    }

    #[tokio::test]
    async fn claims_being_refreshed_are_reserved() {
        let (manager, round) = manager_with_round(&[10_000, 20_000]).await;
        let claim = round.exit_paths[0].claim_outpoint;
        let forfeit = testkit::forfeit_of(&round, 0).unwrap();

        manager.reserve_refresh(2, &[claim]).await.unwrap();
        // Idempotent for the same round, exclusive across rounds.
        manager.reserve_refresh(2, &[claim]).await.unwrap();
        assert!(matches!(
            manager.reserve_refresh(3, &[claim]).await,
            Err(ArkError::Exit(ExitError::ClaimRefreshing(_, 2)))
        ));

        let settlement = RecordingSettlement::default();
        assert!(matches!(
            manager.accept_forfeit(claim, forfeit.clone(), &settlement).await,
            Err(ArkError::Exit(ExitError::ClaimRefreshing(_, 2)))
        ));
        assert!(settlement.committed().is_empty());
        assert_eq!(settlement.aborted(), vec![claim]);
        assert!(matches!(
            manager.record_exit(claim).await,
            Err(ArkError::Exit(ExitError::ClaimRefreshing(_, 2)))
        ));
        manager.ensure_live(&[claim]).await.unwrap();

        manager.release_round(2);
        manager
            .accept_forfeit(claim, forfeit, &settlement)
            .await
            .unwrap();

        // Only live claims can be reserved.
        assert!(matches!(
            manager.reserve_refresh(3, &[claim]).await,
            Err(ArkError::Exit(ExitError::ClaimForfeited(_)))
        ));
        assert!(matches!(
            manager.ensure_live(&[claim]).await,
            Err(ArkError::Exit(ExitError::ClaimForfeited(_)))
        ));

        let other = round.exit_paths[1].claim_outpoint;
        manager.reserve_refresh(4, &[other]).await.unwrap();
        manager.release_refresh(4, &[other]);
        manager.record_exit(other).await.unwrap();
    }

    #[tokio::test]
    async fn exited_claim_rejects_forfeits() {
        let (manager, round) = manager_with_round(&[10_000, 20_000]).await;
        let claim = round.exit_paths[0].claim_outpoint;

        manager.record_exit(claim).await.unwrap();
        assert!(matches!(
            manager.record_exit(claim).await,
            Err(ArkError::Exit(ExitError::ClaimExited(_)))
        ));

        let forfeit = testkit::forfeit_of(&round, 0).unwrap();
        assert!(matches!(
            manager.validate_forfeit(claim, &forfeit).await,
            Err(ArkError::Exit(ExitError::ClaimExited(_)))
        ));

        let unknown = OutPoint::new(round.funding_tx.compute_txid(), 99);
        assert!(matches!(
            manager.build_exit_path(unknown).await,
            Err(ArkError::Exit(ExitError::UnknownClaim(_)))
        ));
    }
}
