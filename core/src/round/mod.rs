//! # Round
//!
//! Types shared by the round driver and the sessions taking part in a round,
//! and the per-round context the driver owns.
//!
//! Sessions never touch a [`Round`] directly. They send [`RoundInput`]s to
//! the driver and follow the round through [`RoundEvent`]s.

use crate::boarding::{BoardingOutput, BoardingPolicy};
use crate::chain::ChainClient;
use crate::config::RoundParams;
use crate::database::Database;
use crate::errors::{ArkError, ChainError, QuorumError, ValidationError};
use crate::exit::{ClaimRecord, ClaimStatus, ForfeitTransaction};
use crate::musig2::{AggNonce, PartialSignature, PubNonce};
use crate::tree::{ClaimLeaf, TreeParams};
use crate::utils::SECP;
use crate::{ClaimId, RoundId};
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::key::Keypair;
use bitcoin::secp256k1::rand::{thread_rng, Rng};
use bitcoin::secp256k1::{schnorr, Message, PublicKey};
use bitcoin::{
    Amount, Network, OutPoint, SignedAmount, TapSighash, Transaction, TxOut, Txid,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub mod state;

/// A claim request as it arrives from a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Round the request was signed for.
    pub round_id: RoundId,
    /// Serialized compressed public key of the claim's owner.
    pub owner: Vec<u8>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: SignedAmount,
    /// Live claims of the owner that are merged into this one.
    pub refreshed: Vec<ClaimId>,
    /// On-chain boarding outputs of the owner the funding transaction
    /// spends.
    pub boarding: Vec<OutPoint>,
    /// Owner's signature over everything above.
    pub signature: schnorr::Signature,
}

fn request_message(
    round_id: RoundId,
    owner: &[u8],
    value: SignedAmount,
    refreshed: &[ClaimId],
    boarding: &[OutPoint],
) -> Message {
    let mut engine = sha256::Hash::engine();
    engine.input(b"ark/claim-request");
    engine.input(&round_id.to_le_bytes());
    engine.input(&(owner.len() as u32).to_le_bytes());
    engine.input(owner);
    engine.input(&value.to_sat().to_le_bytes());
    engine.input(&(refreshed.len() as u32).to_le_bytes());
    for claim in refreshed {
        engine.input(&serialize(claim));
    }
    engine.input(&(boarding.len() as u32).to_le_bytes());
    for outpoint in boarding {
        engine.input(&serialize(outpoint));
    }

    Message::from_digest(sha256::Hash::from_engine(engine).to_byte_array())
}

impl ClaimRequest {
    /// Builds a request for `round_id`, signed by `owner`.
    pub fn new(
        round_id: RoundId,
        owner: &Keypair,
        value: SignedAmount,
        refreshed: Vec<ClaimId>,
        boarding: Vec<OutPoint>,
    ) -> Self {
        let owner_key = owner.public_key().serialize().to_vec();
        let message = request_message(round_id, &owner_key, value, &refreshed, &boarding);

        ClaimRequest {
            round_id,
            owner: owner_key,
            value,
            refreshed,
            boarding,
            signature: SECP.sign_schnorr(&message, owner),
        }
    }

    /// What the owner signs.
    pub fn message(&self) -> Message {
        request_message(
            self.round_id,
            &self.owner,
            self.value,
            &self.refreshed,
            &self.boarding,
        )
    }
}

/// A validated claim request. Immutable once accepted into a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedClaim {
    pub owner: PublicKey,
    pub value: Amount,
    pub refreshed: Vec<ClaimRecord>,
    pub boarding: Vec<BoardingOutput>,
}

impl AcceptedClaim {
    pub fn boarded(&self) -> Amount {
        self.boarding.iter().map(|boarded| boarded.output.value).sum()
    }

    pub fn leaf(&self) -> ClaimLeaf {
        ClaimLeaf {
            owner: self.owner,
            value: self.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundStatus {
    Registering,
    TreeBuilding,
    CollectingSignatures,
    Finalizing,
    Broadcast,
    Completed,
    Aborted,
}

impl RoundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Aborted)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            RoundStatus::Registering => "registering",
            RoundStatus::TreeBuilding => "building its tree",
            RoundStatus::CollectingSignatures => "collecting signatures",
            RoundStatus::Finalizing => "finalizing",
            RoundStatus::Broadcast => "broadcasting",
            RoundStatus::Completed => "completed",
            RoundStatus::Aborted => "aborted",
        };

        write!(f, "{status}")
    }
}

/// Status of every round this coordinator ran, written by the round
/// lifecycle on each transition.
pub type RoundStatuses = Arc<RwLock<BTreeMap<RoundId, RoundStatus>>>;

/// Why a round was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    Quorum(QuorumError),
    Chain(ChainError),
    /// Any other failure before broadcast, e.g. a funding transaction that
    /// doesn't conserve value.
    Failure(String),
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::Quorum(e) => write!(f, "{e}"),
            AbortCause::Chain(e) => write!(f, "{e}"),
            AbortCause::Failure(reason) => write!(f, "{reason}"),
        }
    }
}

impl From<AbortCause> for ArkError {
    fn from(cause: AbortCause) -> Self {
        match cause {
            AbortCause::Quorum(e) => e.into(),
            AbortCause::Chain(e) => e.into(),
            AbortCause::Failure(reason) => eyre::eyre!("Round aborted: {reason}").into(),
        }
    }
}

/// Secret handed to a registered participant. Every later submission of
/// the participant has to carry it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; 32]);

impl SessionToken {
    pub fn random() -> Self {
        Self(thread_rng().gen())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Returned to a participant whose claim was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTicket {
    pub round_id: RoundId,
    pub owner: PublicKey,
    pub value: Amount,
    pub token: SessionToken,
}

/// Everything a participant needs to rebuild and check a round's tree
/// before signing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeAnnouncement {
    pub round_id: RoundId,
    /// Signing attempt, starting at 0 and bumped on every rebuild.
    pub attempt: usize,
    pub claims: Vec<ClaimLeaf>,
    pub fee: Amount,
    pub params: TreeParams,
    /// Funded but unsigned. Signing the wallet inputs doesn't change its
    /// txid.
    pub funding_tx: Transaction,
    /// Outputs spent by the funding transaction, in input order. Boarding
    /// signatures commit to all of them.
    pub funding_prevouts: Vec<TxOut>,
    pub funding_vout: u32,
    /// `(node index, digest, signers)` of every node transaction.
    pub digests: Vec<(usize, TapSighash, Vec<PublicKey>)>,
}

/// Published by the round driver to every subscriber.
#[derive(Debug, Clone)]
pub enum RoundEvent {
    Started {
        round_id: RoundId,
    },
    TreePublished(Arc<TreeAnnouncement>),
    NoncesAggregated {
        round_id: RoundId,
        attempt: usize,
        nonces: Arc<BTreeMap<TapSighash, AggNonce>>,
    },
    Excluded {
        round_id: RoundId,
        attempt: usize,
        participants: Vec<PublicKey>,
        reason: String,
    },
    Completed {
        round_id: RoundId,
        funding_txid: Txid,
        claims: Vec<(PublicKey, ClaimId)>,
    },
    Aborted {
        round_id: RoundId,
        reason: String,
    },
}

impl RoundEvent {
    pub fn round_id(&self) -> RoundId {
        match self {
            RoundEvent::Started { round_id }
            | RoundEvent::NoncesAggregated { round_id, .. }
            | RoundEvent::Excluded { round_id, .. }
            | RoundEvent::Completed { round_id, .. }
            | RoundEvent::Aborted { round_id, .. } => *round_id,
            RoundEvent::TreePublished(announcement) => announcement.round_id,
        }
    }
}

/// Requests to the round driver. Every request carries its reply channel.
#[derive(Debug)]
pub enum RoundInput {
    Register {
        request: ClaimRequest,
        reply: oneshot::Sender<Result<RoundTicket, ArkError>>,
    },
    SubmitNonces {
        ticket: RoundTicket,
        nonces: Vec<(TapSighash, PubNonce)>,
        reply: oneshot::Sender<Result<(), ArkError>>,
    },
    SubmitSignatures {
        ticket: RoundTicket,
        signatures: SignatureShare,
        reply: oneshot::Sender<Result<(), ArkError>>,
    },
}

/// Everything a participant signs once nonces are aggregated.
#[derive(Debug, Clone, Default)]
pub struct SignatureShare {
    pub partials: Vec<(TapSighash, PartialSignature)>,
    /// One per refreshed claim.
    pub forfeits: Vec<ForfeitTransaction>,
    /// One per boarding output, over the funding transaction.
    pub boarding: Vec<(OutPoint, schnorr::Signature)>,
}

/// Checks the parts of a request that need neither the database nor the
/// chain.
pub fn validate_request(
    request: &ClaimRequest,
    round_id: RoundId,
    coordinator: &PublicKey,
    params: &RoundParams,
) -> Result<(PublicKey, Amount), ValidationError> {
    if request.value <= SignedAmount::ZERO {
        return Err(ValidationError::NonPositiveValue(request.value.to_sat()));
    }
    let value = request
        .value
        .to_unsigned()
        .map_err(|_| ValidationError::NonPositiveValue(request.value.to_sat()))?;
    if value < params.min_claim_value {
        return Err(ValidationError::BelowMinimum(value, params.min_claim_value));
    }
    if value > params.max_claim_value {
        return Err(ValidationError::AboveCap(value, params.max_claim_value));
    }

    if request.owner.len() != 33 {
        return Err(ValidationError::UnknownKeyFormat);
    }
    let owner =
        PublicKey::from_slice(&request.owner).map_err(|_| ValidationError::UnknownKeyFormat)?;
    if owner == *coordinator {
        return Err(ValidationError::CoordinatorKey);
    }

    SECP.verify_schnorr(
        &request.signature,
        &request.message(),
        &owner.x_only_public_key().0,
    )
    .map_err(|_| ValidationError::InvalidRequestSignature)?;
    if request.round_id != round_id {
        return Err(ValidationError::StaleRound {
            requested: request.round_id,
            current: round_id,
        });
    }

    Ok((owner, value))
}

/// What checking a request against stored claims and the chain needs.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub round_id: RoundId,
    pub coordinator: &'a PublicKey,
    pub network: Network,
    pub params: &'a RoundParams,
    pub db: &'a Database,
    pub chain: &'a dyn ChainClient,
}

/// Validates a request, loads the claims it refreshes and looks its
/// boarding outputs up on-chain. The claim has to be fully covered by them.
#[tracing::instrument(skip(request, ctx), fields(round_id = ctx.round_id, value = %request.value), err(level = tracing::Level::DEBUG))]
pub async fn resolve_request(
    request: &ClaimRequest,
    ctx: RequestContext<'_>,
) -> Result<AcceptedClaim, ArkError> {
    let (owner, value) = validate_request(request, ctx.round_id, ctx.coordinator, ctx.params)?;

    let mut seen = HashSet::new();
    let mut refreshed = Vec::with_capacity(request.refreshed.len());
    for claim_id in &request.refreshed {
        if !seen.insert(*claim_id) {
            return Err(ValidationError::ClaimAlreadyRefreshed(*claim_id).into());
        }

        let record = ctx
            .db
            .get_claim(None, *claim_id)
            .await?
            .ok_or(ValidationError::UnknownClaim(*claim_id))?;
        if record.status != ClaimStatus::Live {
            return Err(ValidationError::ClaimNotLive(*claim_id).into());
        }
        if record.owner != owner {
            return Err(ValidationError::ForeignClaim(*claim_id).into());
        }

        refreshed.push(record);
    }

    let mut boarding = Vec::with_capacity(request.boarding.len());
    if !request.boarding.is_empty() {
        let policy =
            BoardingPolicy::new(owner, *ctx.coordinator, ctx.params.exit_delta, ctx.network)?;
        let mut seen = HashSet::new();

        for outpoint in &request.boarding {
            if !seen.insert(*outpoint) {
                return Err(ValidationError::BoardingAlreadyUsed(*outpoint).into());
            }

            let found = ctx
                .chain
                .get_output(*outpoint)
                .await?
                .ok_or(ValidationError::UnknownBoardingOutput(*outpoint))?;
            if found.confirmations < ctx.params.boarding_min_confirmations {
                return Err(ValidationError::BoardingUnconfirmed(
                    *outpoint,
                    found.confirmations,
                    ctx.params.boarding_min_confirmations,
                )
                .into());
            }
            if found.output.script_pubkey != *policy.script_pubkey() {
                return Err(ValidationError::BoardingPolicyMismatch(*outpoint).into());
            }

            boarding.push(BoardingOutput {
                outpoint: *outpoint,
                output: found.output,
            });
        }
    }

    let covered: Amount = refreshed
        .iter()
        .map(|claim| claim.value)
        .chain(boarding.iter().map(|boarded| boarded.output.value))
        .sum();
    if value > covered {
        return Err(ValidationError::InsufficientFunding(value, covered).into());
    }

    Ok(AcceptedClaim {
        owner,
        value,
        refreshed,
        boarding,
    })
}

/// Context of one round, owned by its driver.
#[derive(Debug)]
pub struct Round {
    pub id: RoundId,
    pub registration_deadline: Instant,
    pub expiry_height: u32,
    /// Signing attempt, bumped on every rebuild.
    pub attempt: usize,
    pub funding_tx: Option<Transaction>,
    claims: Vec<AcceptedClaim>,
    tokens: HashMap<PublicKey, SessionToken>,
}

impl Round {
    pub fn new(id: RoundId, registration_deadline: Instant, expiry_height: u32) -> Self {
        Self {
            id,
            registration_deadline,
            expiry_height,
            attempt: 0,
            funding_tx: None,
            claims: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    /// Accepted claims in registration order.
    pub fn claims(&self) -> &[AcceptedClaim] {
        &self.claims
    }

    pub fn claim_of(&self, owner: &PublicKey) -> Option<&AcceptedClaim> {
        self.claims.iter().find(|claim| claim.owner == *owner)
    }

    pub fn leaves(&self) -> Vec<ClaimLeaf> {
        self.claims.iter().map(AcceptedClaim::leaf).collect()
    }

    pub fn is_full(&self, params: &RoundParams) -> bool {
        self.claims.len() >= params.max_participants
    }

    /// Adds a validated claim. Enforces what depends on the other claims of
    /// the round.
    pub fn accept(
        &mut self,
        claim: AcceptedClaim,
        params: &RoundParams,
    ) -> Result<RoundTicket, ValidationError> {
        if self.is_full(params) {
            return Err(ValidationError::RoundFull(params.max_participants));
        }
        if self.claim_of(&claim.owner).is_some() {
            return Err(ValidationError::Duplicate(claim.owner));
        }

        let referenced: BTreeSet<ClaimId> = self
            .claims
            .iter()
            .flat_map(|accepted| accepted.refreshed.iter().map(|record| record.claim_id))
            .collect();
        if let Some(record) = claim
            .refreshed
            .iter()
            .find(|record| referenced.contains(&record.claim_id))
        {
            return Err(ValidationError::ClaimAlreadyRefreshed(record.claim_id));
        }

        let boarded: BTreeSet<OutPoint> = self
            .claims
            .iter()
            .flat_map(|accepted| accepted.boarding.iter().map(|boarded| boarded.outpoint))
            .collect();
        if let Some(boarded) = claim
            .boarding
            .iter()
            .find(|boarding| boarded.contains(&boarding.outpoint))
        {
            return Err(ValidationError::BoardingAlreadyUsed(boarded.outpoint));
        }

        let ticket = RoundTicket {
            round_id: self.id,
            owner: claim.owner,
            value: claim.value,
            token: SessionToken::random(),
        };
        self.tokens.insert(claim.owner, ticket.token);
        self.claims.push(claim);

        Ok(ticket)
    }

    /// The accepted claim behind a ticket, if the ticket is the one handed
    /// out at registration.
    pub fn authenticate(&self, ticket: &RoundTicket) -> Result<&AcceptedClaim, ValidationError> {
        let claim = self
            .claim_of(&ticket.owner)
            .ok_or(ValidationError::NotRegistered(ticket.owner, self.id))?;
        if self.tokens.get(&ticket.owner) != Some(&ticket.token) {
            return Err(ValidationError::SessionMismatch(ticket.owner));
        }

        Ok(claim)
    }

    /// Drops the claims of `excluded`. Returns the dropped claims.
    pub fn exclude(&mut self, excluded: &BTreeSet<PublicKey>) -> Vec<AcceptedClaim> {
        let (dropped, kept) = std::mem::take(&mut self.claims)
            .into_iter()
            .partition(|claim| excluded.contains(&claim.owner));
        self.claims = kept;
        self.tokens.retain(|owner, _| !excluded.contains(owner));

        dropped
    }

    /// Boarding outputs the funding transaction spends, in registration
    /// order.
    pub fn boarding_inputs(&self) -> Vec<OutPoint> {
        self.claims
            .iter()
            .flat_map(|claim| claim.boarding.iter().map(|boarded| boarded.outpoint))
            .collect()
    }

    /// Refreshed claims a participant owes a forfeit for.
    pub fn owed_forfeits(&self, owner: &PublicKey) -> Vec<&ClaimRecord> {
        self.claim_of(owner)
            .map(|claim| claim.refreshed.iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoundParams;
    use crate::database::CompletedRound;
    use crate::testkit::{self, random_keypair, MockChain};
    use std::time::Duration;

    fn request(owner: &Keypair, value: i64) -> ClaimRequest {
        ClaimRequest::new(1, owner, SignedAmount::from_sat(value), vec![], vec![])
    }

    fn context<'a>(
        coordinator: &'a PublicKey,
        params: &'a RoundParams,
        db: &'a Database,
        chain: &'a MockChain,
    ) -> RequestContext<'a> {
        RequestContext {
            round_id: 1,
            coordinator,
            network: Network::Regtest,
            params,
            db,
            chain,
        }
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let params = RoundParams::regtest();
        let coordinator = random_keypair();
        let owner = random_keypair();
        let validate = |request: &ClaimRequest| {
            validate_request(request, 1, &coordinator.public_key(), &params)
        };

        assert_eq!(
            validate(&request(&owner, 0)),
            Err(ValidationError::NonPositiveValue(0))
        );
        assert_eq!(
            validate(&request(&owner, -5)),
            Err(ValidationError::NonPositiveValue(-5))
        );
        assert!(matches!(
            validate(&request(&owner, 1)),
            Err(ValidationError::BelowMinimum(..))
        ));
        let above = params.max_claim_value.to_signed().unwrap() + SignedAmount::ONE_SAT;
        assert!(matches!(
            validate(&request(&owner, above.to_sat())),
            Err(ValidationError::AboveCap(..))
        ));
        assert_eq!(
            validate(&request(&coordinator, 10_000)),
            Err(ValidationError::CoordinatorKey)
        );

        let mut uncompressed = request(&owner, 10_000);
        uncompressed.owner = owner.public_key().serialize_uncompressed().to_vec();
        assert_eq!(validate(&uncompressed), Err(ValidationError::UnknownKeyFormat));
        let mut garbage = request(&owner, 10_000);
        garbage.owner = vec![7; 33];
        assert_eq!(validate(&garbage), Err(ValidationError::UnknownKeyFormat));

        assert_eq!(
            validate(&request(&owner, 10_000)),
            Ok((owner.public_key(), Amount::from_sat(10_000)))
        );
    }

    #[test]
    fn requests_must_be_signed_by_their_owner_for_the_open_round() {
        let params = RoundParams::regtest();
        let coordinator = random_keypair().public_key();
        let owner = random_keypair();

        let mut raised = request(&owner, 10_000);
        raised.value = SignedAmount::from_sat(20_000);
        assert_eq!(
            validate_request(&raised, 1, &coordinator, &params),
            Err(ValidationError::InvalidRequestSignature)
        );

        let mut impersonated = request(&random_keypair(), 10_000);
        impersonated.owner = owner.public_key().serialize().to_vec();
        assert_eq!(
            validate_request(&impersonated, 1, &coordinator, &params),
            Err(ValidationError::InvalidRequestSignature)
        );

        assert_eq!(
            validate_request(&request(&owner, 10_000), 2, &coordinator, &params),
            Err(ValidationError::StaleRound {
                requested: 1,
                current: 2
            })
        );
    }

    #[test]
    fn request_value_is_serialized_in_sats() {
        let signed = request(&random_keypair(), 10_000);

        let json = serde_json::to_value(&signed).unwrap();
        assert_eq!(json["value"], 10_000);
        assert_eq!(json["round_id"], 1);

        let parsed: ClaimRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, signed);
        assert_eq!(parsed.message(), signed.message());
    }

    #[test]
    fn round_rejects_duplicates_and_overflow() {
        let mut params = RoundParams::regtest();
        params.max_participants = 2;
        let mut round = Round::new(1, Instant::now() + Duration::from_secs(1), 1_000);

        let claim = |owner: PublicKey| AcceptedClaim {
            owner,
            value: Amount::from_sat(10_000),
            refreshed: vec![],
            boarding: vec![],
        };
        let a = random_keypair().public_key();
        let b = random_keypair().public_key();
        let c = random_keypair().public_key();

        let ticket = round.accept(claim(a), &params).unwrap();
        assert_eq!(ticket.round_id, 1);
        assert_eq!(
            round.accept(claim(a), &params),
            Err(ValidationError::Duplicate(a))
        );
        round.accept(claim(b), &params).unwrap();
        assert_eq!(
            round.accept(claim(c), &params),
            Err(ValidationError::RoundFull(2))
        );

        assert_eq!(round.exclude(&BTreeSet::from([a])), vec![claim(a)]);
        assert_eq!(round.leaves(), vec![claim(b).leaf()]);
        assert_eq!(
            round.authenticate(&ticket),
            Err(ValidationError::NotRegistered(a, 1))
        );
    }

    #[test]
    fn submissions_need_the_registration_token() {
        let params = RoundParams::regtest();
        let mut round = Round::new(1, Instant::now(), 1_000);
        let owner = random_keypair().public_key();

        let ticket = round
            .accept(
                AcceptedClaim {
                    owner,
                    value: Amount::from_sat(10_000),
                    refreshed: vec![],
                    boarding: vec![],
                },
                &params,
            )
            .unwrap();
        assert_eq!(round.authenticate(&ticket).unwrap().owner, owner);

        let forged = RoundTicket {
            token: SessionToken::random(),
            ..ticket
        };
        assert_eq!(
            round.authenticate(&forged),
            Err(ValidationError::SessionMismatch(owner))
        );
    }

    #[tokio::test]
    async fn refreshed_claims_are_checked() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let chain = MockChain::new();
        let params = RoundParams::regtest();
        let round = testkit::signed_round(&[10_000, 20_000], 200).unwrap();
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
        let coordinator = round.coordinator.public_key();
        let ctx = context(&coordinator, &params, &db, &chain);
        let owner = &round.owners[0];
        let own_claim = round.exit_paths[0].claim_outpoint;
        let foreign_claim = round.exit_paths[1].claim_outpoint;
        let refresh = |value: i64, refreshed: Vec<ClaimId>| {
            ClaimRequest::new(1, owner, SignedAmount::from_sat(value), refreshed, vec![])
        };

        let accepted = resolve_request(&refresh(10_000, vec![own_claim]), ctx)
            .await
            .unwrap();
        assert_eq!(accepted.refreshed[0].claim_id, own_claim);

        assert!(matches!(
            resolve_request(&refresh(10_001, vec![own_claim]), ctx).await,
            Err(ArkError::Validation(ValidationError::InsufficientFunding(..)))
        ));
        assert!(matches!(
            resolve_request(&refresh(5_000, vec![foreign_claim]), ctx).await,
            Err(ArkError::Validation(ValidationError::ForeignClaim(_)))
        ));
        assert!(matches!(
            resolve_request(&refresh(5_000, vec![own_claim, own_claim]), ctx).await,
            Err(ArkError::Validation(ValidationError::ClaimAlreadyRefreshed(_)))
        ));

        let unknown = OutPoint::new(round.funding_tx.compute_txid(), 42);
        assert!(matches!(
            resolve_request(&refresh(5_000, vec![unknown]), ctx).await,
            Err(ArkError::Validation(ValidationError::UnknownClaim(_)))
        ));

        db.update_claim_status(None, own_claim, ClaimStatus::Live, ClaimStatus::Exited)
            .await
            .unwrap();
        assert!(matches!(
            resolve_request(&refresh(5_000, vec![own_claim]), ctx).await,
            Err(ArkError::Validation(ValidationError::ClaimNotLive(_)))
        ));
    }

    #[tokio::test]
    async fn boarding_outputs_are_checked_on_chain() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let chain = MockChain::new();
        let mut params = RoundParams::regtest();
        let coordinator = random_keypair().public_key();
        let owner = random_keypair();
        let policy = BoardingPolicy::new(
            owner.public_key(),
            coordinator,
            params.exit_delta,
            Network::Regtest,
        )
        .unwrap();
        let first = chain.fund_address(policy.script_pubkey().clone(), Amount::from_sat(6_000));
        let second = chain.fund_address(policy.script_pubkey().clone(), Amount::from_sat(5_000));
        let board = |value: i64, boarding: Vec<OutPoint>| {
            ClaimRequest::new(1, &owner, SignedAmount::from_sat(value), vec![], boarding)
        };

        let accepted = resolve_request(
            &board(11_000, vec![first, second]),
            context(&coordinator, &params, &db, &chain),
        )
        .await
        .unwrap();
        assert_eq!(accepted.boarded(), Amount::from_sat(11_000));
        assert_eq!(accepted.boarding[0].outpoint, first);

        let ctx = context(&coordinator, &params, &db, &chain);
        assert!(matches!(
            resolve_request(&board(11_001, vec![first, second]), ctx).await,
            Err(ArkError::Validation(ValidationError::InsufficientFunding(..)))
        ));
        // Fresh value needs on-chain backing.
        assert!(matches!(
            resolve_request(&board(10_000, vec![]), ctx).await,
            Err(ArkError::Validation(ValidationError::InsufficientFunding(_, covered)))
                if covered == Amount::ZERO
        ));
        assert!(matches!(
            resolve_request(&board(5_000, vec![first, first]), ctx).await,
            Err(ArkError::Validation(ValidationError::BoardingAlreadyUsed(_)))
        ));
        let unknown = OutPoint::new(Txid::all_zeros(), 1);
        assert!(matches!(
            resolve_request(&board(5_000, vec![unknown]), ctx).await,
            Err(ArkError::Validation(ValidationError::UnknownBoardingOutput(_)))
        ));

        // Locked to someone else.
        let stranger = BoardingPolicy::new(
            random_keypair().public_key(),
            coordinator,
            params.exit_delta,
            Network::Regtest,
        )
        .unwrap();
        let foreign = chain.fund_address(stranger.script_pubkey().clone(), Amount::from_sat(9_000));
        assert!(matches!(
            resolve_request(&board(5_000, vec![foreign]), ctx).await,
            Err(ArkError::Validation(ValidationError::BoardingPolicyMismatch(_)))
        ));

        params.boarding_min_confirmations = 2;
        assert!(matches!(
            resolve_request(
                &board(5_000, vec![first]),
                context(&coordinator, &params, &db, &chain)
            )
            .await,
            Err(ArkError::Validation(ValidationError::BoardingUnconfirmed(_, 1, 2)))
        ));
    }

    #[test]
    fn claims_cannot_be_refreshed_twice_per_round() {
        let params = RoundParams::regtest();
        let round = testkit::signed_round(&[10_000, 20_000], 200).unwrap();
        let record = ClaimRecord {
            claim_id: round.exit_paths[0].claim_outpoint,
            round_id: 1,
            owner: round.owners[0].public_key(),
            value: Amount::from_sat(10_000),
            status: ClaimStatus::Live,
            exit_path: round.exit_paths[0].clone(),
        };

        let mut current = Round::new(2, Instant::now(), 1_000);
        current
            .accept(
                AcceptedClaim {
                    owner: round.owners[0].public_key(),
                    value: Amount::from_sat(10_000),
                    refreshed: vec![record.clone()],
                    boarding: vec![],
                },
                &params,
            )
            .unwrap();
        assert_eq!(
            current.accept(
                AcceptedClaim {
                    owner: round.owners[1].public_key(),
                    value: Amount::from_sat(10_000),
                    refreshed: vec![record.clone()],
                    boarding: vec![],
                },
                &params,
            ),
            Err(ValidationError::ClaimAlreadyRefreshed(record.claim_id))
        );
        assert_eq!(current.owed_forfeits(&round.owners[0].public_key()), vec![&record]);
    }

    #[test]
    fn boarding_outputs_fund_one_claim_per_round() {
        let params = RoundParams::regtest();
        let boarded = BoardingOutput {
            outpoint: OutPoint::new(Txid::all_zeros(), 3),
            output: TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: bitcoin::ScriptBuf::new(),
            },
        };
        let claim = |owner: PublicKey| AcceptedClaim {
            owner,
            value: Amount::from_sat(10_000),
            refreshed: vec![],
            boarding: vec![boarded.clone()],
        };

        let mut current = Round::new(2, Instant::now(), 1_000);
        current.accept(claim(random_keypair().public_key()), &params).unwrap();
        assert_eq!(
            current.accept(claim(random_keypair().public_key()), &params),
            Err(ValidationError::BoardingAlreadyUsed(boarded.outpoint))
        );
        assert_eq!(current.boarding_inputs(), vec![boarded.outpoint]);
    }
}
