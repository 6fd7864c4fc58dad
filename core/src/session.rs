//! # Client Session
//!
//! Wallet side of a round: registers a claim, checks the published tree
//! against its own request before contributing nonces and partial
//! signatures, hands in forfeits for refreshed claims and signatures for
//! its boarding outputs, and finally fetches and verifies its exit path.

use crate::boarding::{BoardingOutput, BoardingPolicy};
use crate::coordinator::{CoordinatorHandle, CoordinatorInfo};
use crate::errors::{ArkError, SignatureError, TimeoutError, ValidationError};
use crate::exit::{ExitPath, ForfeitTransaction};
use crate::musig2::{self, SecNonce};
use crate::round::{
    ClaimRequest, RoundEvent, RoundStatus, RoundTicket, SignatureShare, TreeAnnouncement,
};
use crate::tree::{ClaimLeaf, ClaimTree, SignedClaimTree};
use crate::{ClaimId, RoundId};
use bitcoin::key::Keypair;
use bitcoin::secp256k1::rand::thread_rng;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, SignedAmount, TapSighash, Transaction, TxOut, Txid};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::time::{timeout_at, Instant};

/// A claim the session ended up with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub round_id: RoundId,
    pub funding_txid: Txid,
    pub claim: ClaimId,
    pub exit_path: ExitPath,
}

/// Value a session brings into its new claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimFunding {
    /// Exit paths of the claims to refresh.
    pub refreshed: Vec<ExitPath>,
    /// Confirmed outputs locked under the owner's boarding policy.
    pub boarding: Vec<BoardingOutput>,
}

impl ClaimFunding {
    pub fn boarding(boarding: Vec<BoardingOutput>) -> Self {
        Self {
            refreshed: Vec::new(),
            boarding,
        }
    }

    pub fn refreshing(refreshed: Vec<ExitPath>) -> Self {
        Self {
            refreshed,
            boarding: Vec::new(),
        }
    }
}

/// Rebuilds the announced tree and checks it is the tree of the announced
/// claims, funded by the announced transaction and containing `own`, and
/// that the funding transaction spends `boarding` as announced.
/// Returns the digests `own.owner` has to sign.
pub fn check_announcement(
    announcement: &TreeAnnouncement,
    own: &ClaimLeaf,
    boarding: &[BoardingOutput],
) -> Result<Vec<(TapSighash, Vec<PublicKey>)>, ArkError> {
    if !announcement.claims.contains(own) {
        return Err(ArkError::TreeMismatch(format!(
            "claim of {} for {} is missing",
            own.owner, own.value
        )));
    }

    let tree = ClaimTree::build(&announcement.claims, announcement.fee, announcement.params)?;
    let funding_output = announcement
        .funding_tx
        .output
        .get(announcement.funding_vout as usize)
        .ok_or_else(|| ArkError::TreeMismatch("funding output is missing".into()))?;
    if *funding_output != tree.root_txout()? {
        return Err(ArkError::TreeMismatch(
            "funding output doesn't commit to the tree root".into(),
        ));
    }

    if announcement.funding_prevouts.len() != announcement.funding_tx.input.len() {
        return Err(ArkError::TreeMismatch(
            "funding prevouts don't match the inputs".into(),
        ));
    }
    for boarded in boarding {
        let spent = announcement
            .funding_tx
            .input
            .iter()
            .position(|input| input.previous_output == boarded.outpoint)
            .map(|index| &announcement.funding_prevouts[index]);
        if spent != Some(&boarded.output) {
            return Err(ArkError::TreeMismatch(format!(
                "boarding output {} isn't spent as announced",
                boarded.outpoint
            )));
        }
    }

    let signed = SignedClaimTree::new(
        tree,
        OutPoint::new(announcement.funding_tx.compute_txid(), announcement.funding_vout),
    )?;
    if signed.digests()? != announcement.digests {
        return Err(ArkError::TreeMismatch(
            "node transaction digests don't match".into(),
        ));
    }

    Ok(announcement
        .digests
        .iter()
        .filter(|(_, _, signers)| signers.contains(&own.owner))
        .map(|(_, digest, signers)| (*digest, signers.clone()))
        .collect())
}

/// Submissions the coordinator turned down because they belong to a
/// signing attempt it already discarded.
fn is_stale(error: &ArkError) -> bool {
    matches!(
        error,
        ArkError::Signature(SignatureError::Replayed(_) | SignatureError::UnknownDigest(_))
    )
}

/// Nonces of the signing attempt the session takes part in.
struct Attempt {
    number: usize,
    funding_tx: Transaction,
    funding_prevouts: Vec<TxOut>,
    digests: Vec<(TapSighash, Vec<PublicKey>)>,
    sec_nonces: HashMap<TapSighash, SecNonce>,
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    keypair: Keypair,
    handle: CoordinatorHandle,
}

impl ClientSession {
    pub fn new(keypair: Keypair, handle: CoordinatorHandle) -> Self {
        Self { keypair, handle }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Where to send coins to board them with this session's coordinator.
    pub fn boarding_policy(&self, info: &CoordinatorInfo) -> Result<BoardingPolicy, ArkError> {
        Ok(BoardingPolicy::new(
            self.keypair.public_key(),
            info.public_key,
            info.params.exit_delta,
            info.network,
        )?)
    }

    /// Joins the next round with a claim of `value`, paid for by `funding`.
    /// Gives up after `timeout`.
    #[tracing::instrument(skip(self, funding), fields(owner = %self.keypair.public_key()), err(level = tracing::Level::WARN))]
    pub async fn participate(
        &self,
        value: Amount,
        funding: ClaimFunding,
        timeout: Duration,
    ) -> Result<SessionOutcome, ArkError> {
        let deadline = Instant::now() + timeout;
        let info = self.handle.info().await;

        // Subscribing first, the tree of the round is announced right after
        // registration closes.
        let mut events = self.handle.subscribe();
        let value_signed = value
            .to_signed()
            .map_err(|_| ValidationError::AboveCap(value, info.params.max_claim_value))?;

        let ticket = self
            .register(&info, value_signed, &funding, &mut events, deadline)
            .await?;
        let round_id = ticket.round_id;
        tracing::debug!("Registered into round {round_id}");

        let own = ClaimLeaf {
            owner: self.keypair.public_key(),
            value,
        };
        let mut attempt: Option<Attempt> = None;

        loop {
            let stage = if attempt.is_some() {
                "nonce aggregation or completion"
            } else {
                "tree publication"
            };
            let event = next_event(&mut events, deadline, round_id, stage).await?;
            if event.round_id() != round_id {
                continue;
            }

            match event {
                RoundEvent::TreePublished(announcement) => {
                    match self
                        .contribute_nonces(&info, &ticket, &announcement, &own, &funding)
                        .await
                    {
                        Ok(contributed) => attempt = Some(contributed),
                        Err(e) if is_stale(&e) => {
                            tracing::debug!("Attempt {} was discarded: {e}", announcement.attempt);
                            attempt = None;
                        }
                        Err(e) => return Err(e),
                    }
                }
                RoundEvent::NoncesAggregated {
                    attempt: number,
                    nonces,
                    ..
                } => {
                    let Some(current) = attempt.as_mut().filter(|a| a.number == number) else {
                        continue;
                    };
                    match self
                        .contribute_signatures(&info, &ticket, current, &nonces, &funding)
                        .await
                    {
                        Ok(()) => {}
                        Err(e) if is_stale(&e) => {
                            tracing::debug!("Attempt {number} was discarded: {e}");
                            attempt = None;
                        }
                        Err(e) => return Err(e),
                    }
                }
                RoundEvent::Excluded {
                    participants,
                    reason,
                    ..
                } => {
                    if participants.contains(&own.owner) {
                        return Err(ArkError::Excluded(round_id, reason));
                    }
                    // A new tree without the excluded participants follows.
                    attempt = None;
                }
                RoundEvent::Completed {
                    funding_txid,
                    claims,
                    ..
                } => {
                    let funding_tx = attempt
                        .map(|a| a.funding_tx)
                        .ok_or_else(|| eyre::eyre!("Round {round_id} completed without a tree"))?;
                    return self
                        .collect_exit_path(round_id, funding_txid, &funding_tx, &claims)
                        .await;
                }
                RoundEvent::Aborted { reason, .. } => {
                    tracing::warn!("Round {round_id} aborted: {reason}");
                    return Err(ArkError::WrongRoundState(round_id, RoundStatus::Aborted));
                }
                RoundEvent::Started { .. } => {}
            }
        }
    }

    /// Registers into the open round, waiting for the next one if none is
    /// open. Requests are signed for the round they're sent to.
    async fn register(
        &self,
        info: &CoordinatorInfo,
        value: SignedAmount,
        funding: &ClaimFunding,
        events: &mut Receiver<RoundEvent>,
        deadline: Instant,
    ) -> Result<RoundTicket, ArkError> {
        let refreshed: Vec<ClaimId> = funding
            .refreshed
            .iter()
            .map(|path| path.claim_outpoint)
            .collect();
        let boarding: Vec<OutPoint> = funding
            .boarding
            .iter()
            .map(|boarded| boarded.outpoint)
            .collect();
        let mut round_id = info.current_round;

        loop {
            let Some(target) = round_id else {
                round_id = Some(next_started(events, deadline).await?);
                continue;
            };

            let request = ClaimRequest::new(
                target,
                &self.keypair,
                value,
                refreshed.clone(),
                boarding.clone(),
            );
            match self.handle.register(request).await {
                Ok(ticket) => return Ok(ticket),
                Err(ArkError::Validation(ValidationError::StaleRound { current, .. }))
                    if current > target =>
                {
                    round_id = Some(current);
                }
                Err(ArkError::Validation(
                    ValidationError::NoRoundOpen | ValidationError::StaleRound { .. },
                )) => {
                    round_id = Some(next_started(events, deadline).await?);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn contribute_nonces(
        &self,
        info: &CoordinatorInfo,
        ticket: &RoundTicket,
        announcement: &Arc<TreeAnnouncement>,
        own: &ClaimLeaf,
        funding: &ClaimFunding,
    ) -> Result<Attempt, ArkError> {
        if announcement.params.coordinator != info.public_key
            || announcement.params.network != info.network
        {
            return Err(ArkError::TreeMismatch(
                "tree isn't built for this coordinator".into(),
            ));
        }
        let digests = check_announcement(announcement, own, &funding.boarding)?;

        let mut sec_nonces = HashMap::with_capacity(digests.len());
        let mut pub_nonces = Vec::with_capacity(digests.len());
        for (digest, signers) in &digests {
            let (sec_nonce, pub_nonce) =
                musig2::nonce_pair(&self.keypair, signers, *digest, &mut thread_rng())?;
            sec_nonces.insert(*digest, sec_nonce);
            pub_nonces.push((*digest, pub_nonce));
        }

        self.handle.submit_nonces(ticket, pub_nonces).await?;

        Ok(Attempt {
            number: announcement.attempt,
            funding_tx: announcement.funding_tx.clone(),
            funding_prevouts: announcement.funding_prevouts.clone(),
            digests,
            sec_nonces,
        })
    }

    async fn contribute_signatures(
        &self,
        info: &CoordinatorInfo,
        ticket: &RoundTicket,
        attempt: &mut Attempt,
        nonces: &BTreeMap<TapSighash, musig2::AggNonce>,
        funding: &ClaimFunding,
    ) -> Result<(), ArkError> {
        let mut partials = Vec::with_capacity(attempt.digests.len());
        for (digest, signers) in &attempt.digests {
            let agg_nonce = nonces
                .get(digest)
                .ok_or_else(|| ArkError::TreeMismatch(format!("no aggregate nonce for {digest}")))?;
            let sec_nonce = attempt
                .sec_nonces
                .remove(digest)
                .ok_or_else(|| eyre::eyre!("Nonce of {digest} was already used"))?;

            partials.push((
                *digest,
                musig2::partial_sign(signers, sec_nonce, agg_nonce, &self.keypair, *digest)?,
            ));
        }

        let forfeits = funding
            .refreshed
            .iter()
            .map(|path| ForfeitTransaction::sign(path, &self.keypair, info.params.forfeit_fee))
            .collect::<Result<Vec<_>, _>>()?;

        let mut boarding = Vec::with_capacity(funding.boarding.len());
        if !funding.boarding.is_empty() {
            let policy = self.boarding_policy(info)?;
            for boarded in &funding.boarding {
                let index = attempt
                    .funding_tx
                    .input
                    .iter()
                    .position(|input| input.previous_output == boarded.outpoint)
                    .ok_or_else(|| {
                        ArkError::TreeMismatch(format!("{} isn't boarded", boarded.outpoint))
                    })?;
                let signature = policy.sign(
                    &self.keypair,
                    &attempt.funding_tx,
                    &attempt.funding_prevouts,
                    index,
                )?;
                boarding.push((boarded.outpoint, signature));
            }
        }

        self.handle
            .submit_signatures(
                ticket,
                SignatureShare {
                    partials,
                    forfeits,
                    boarding,
                },
            )
            .await
    }

    async fn collect_exit_path(
        &self,
        round_id: RoundId,
        funding_txid: Txid,
        funding_tx: &Transaction,
        claims: &[(PublicKey, ClaimId)],
    ) -> Result<SessionOutcome, ArkError> {
        if funding_tx.compute_txid() != funding_txid {
            return Err(ArkError::TreeMismatch(
                "round completed with another funding transaction".into(),
            ));
        }

        let owner = self.keypair.public_key();
        let claim = claims
            .iter()
            .find(|(claim_owner, _)| *claim_owner == owner)
            .map(|(_, claim)| *claim)
            .ok_or_else(|| ArkError::TreeMismatch("own claim is missing".into()))?;

        let exit_path = self.handle.exit_material(claim).await?;
        exit_path.verify(funding_tx)?;
        if exit_path.owner != owner {
            return Err(ArkError::TreeMismatch("exit path of another owner".into()));
        }

        Ok(SessionOutcome {
            round_id,
            funding_txid,
            claim,
            exit_path,
        })
    }
}

async fn next_event(
    events: &mut Receiver<RoundEvent>,
    deadline: Instant,
    round_id: RoundId,
    stage: &'static str,
) -> Result<RoundEvent, ArkError> {
    match timeout_at(deadline, events.recv()).await {
        Ok(Ok(event)) => Ok(event),
        Ok(Err(RecvError::Lagged(skipped))) => Err(ArkError::EventsLagged(skipped)),
        Ok(Err(RecvError::Closed)) => Err(ArkError::ChannelClosed("round events".into())),
        Err(_) => Err(TimeoutError::Session(round_id, stage).into()),
    }
}

/// Waits for the next round to open.
async fn next_started(
    events: &mut Receiver<RoundEvent>,
    deadline: Instant,
) -> Result<RoundId, ArkError> {
    loop {
        if let RoundEvent::Started { round_id } =
            next_event(events, deadline, 0, "registration").await?
        {
            return Ok(round_id);
        }
    }
}
