//! # Round Coordinator
//!
//! Runs rounds back to back. Each round is driven by a [`RoundDriver`] that
//! owns the round's context, its [`SignatureEngine`] and the coordinator's
//! own nonces. Wallets reach the running round only through a
//! [`CoordinatorHandle`], which forwards their requests as [`RoundInput`]
//! messages and lets them subscribe to [`RoundEvent`]s.
//!
//! Broadcasting the funding transaction is the commit point of a round.
//! Anything failing before it aborts the round and participants retry in
//! the next one. Anything failing after it is a protocol violation.

use crate::boarding::BoardingPolicy;
use crate::chain::ChainClient;
use crate::config::{ArkConfig, RoundParams};
use crate::database::{CompletedRound, Database};
use crate::errors::{ArkError, ChainError, SignatureError, TxError, ValidationError};
use crate::exit::{ExitManager, ExitPath, ForfeitTransaction, OffchainSettlement};
use crate::metrics::ROUND_METRICS;
use crate::musig2::{self, PubNonce, SecNonce};
use crate::round::state::{LifecycleEvent, RoundLifecycle};
use crate::round::{
    resolve_request, AbortCause, ClaimRequest, RequestContext, Round, RoundEvent, RoundInput,
    RoundStatus, RoundStatuses, RoundTicket, SignatureShare, TreeAnnouncement,
};
use crate::signature_engine::SignatureEngine;
use crate::sweep::Sweeper;
use crate::tree::{ClaimTree, SignedClaimTree, TreeParams};
use crate::utils::SECP;
use crate::{ClaimId, RoundId};
use bitcoin::key::Keypair;
use bitcoin::secp256k1::rand::thread_rng;
use bitcoin::secp256k1::{schnorr, PublicKey, SecretKey};
use bitcoin::{Network, OutPoint, TapSighash, Transaction, TxOut, Txid};
use statig::awaitable::{InitializedStateMachine, IntoStateMachineExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

const ROUND_INPUT_CAPACITY: usize = 256;
const ROUND_EVENT_CAPACITY: usize = 1024;

/// What wallets need to know before joining a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorInfo {
    pub public_key: PublicKey,
    pub network: Network,
    pub params: RoundParams,
    /// Round currently running, if any.
    pub current_round: Option<RoundId>,
}

/// Summary of a completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRoundSummary {
    pub round_id: RoundId,
    pub funding_txid: Txid,
    /// `(owner, claim)` in leaf order.
    pub claims: Vec<(PublicKey, ClaimId)>,
    pub rebuilds: usize,
}

#[derive(Debug, Clone)]
struct OpenRound {
    round_id: RoundId,
    inputs: mpsc::Sender<RoundInput>,
}

#[derive(Debug)]
pub struct Coordinator {
    keypair: Keypair,
    network: Network,
    params: RoundParams,
    chain: Arc<dyn ChainClient>,
    db: Database,
    exit: Arc<ExitManager>,
    events: broadcast::Sender<RoundEvent>,
    statuses: RoundStatuses,
    current: Arc<RwLock<Option<OpenRound>>>,
}

impl Coordinator {
    pub fn new(
        secret_key: SecretKey,
        network: Network,
        params: RoundParams,
        chain: Arc<dyn ChainClient>,
        db: Database,
    ) -> Result<Self, ArkError> {
        params.validate()?;
        let keypair = Keypair::from_secret_key(&SECP, &secret_key);
        let (events, _) = broadcast::channel(ROUND_EVENT_CAPACITY);

        Ok(Self {
            keypair,
            network,
            params,
            chain,
            exit: Arc::new(ExitManager::new(db.clone(), keypair)),
            db,
            events,
            statuses: Default::default(),
            current: Default::default(),
        })
    }

    pub fn from_config(
        config: &ArkConfig,
        chain: Arc<dyn ChainClient>,
        db: Database,
    ) -> Result<Self, ArkError> {
        Self::new(
            config.secret_key,
            config.network,
            config.round_params(),
            chain,
            db,
        )
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            public_key: self.keypair.public_key(),
            network: self.network,
            params: self.params.clone(),
            exit: self.exit.clone(),
            events: self.events.clone(),
            statuses: self.statuses.clone(),
            current: self.current.clone(),
        }
    }

    /// Starts the scheduler on its own task.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<Result<(), ArkError>>) {
        let handle = self.handle();

        (handle, tokio::spawn(async move { self.run().await }))
    }

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.chain.clone(),
            self.db.clone(),
            self.keypair,
            self.params.fee_target_blocks,
        )
    }

    /// Runs rounds forever, `round_interval` apart, sweeping expired trees
    /// in between. Only returns on a protocol violation.
    pub async fn run(&self) -> Result<(), ArkError> {
        let sweeper = self.sweeper();

        loop {
            if let Err(e) = sweeper.sweep_expired().await {
                tracing::warn!("Sweeping expired rounds failed: {e}");
            }

            match self.run_round().await {
                Ok(summary) => tracing::info!(
                    "Round {} completed with {} claims, funding tx {}",
                    summary.round_id,
                    summary.claims.len(),
                    summary.funding_txid
                ),
                Err(e @ ArkError::ProtocolViolation(..)) => {
                    tracing::error!("Stopping round scheduler: {e}");
                    return Err(e);
                }
                Err(e) => tracing::warn!("Round failed: {e}"),
            }

            tokio::time::sleep(self.params.interval()).await;
        }
    }

    /// Opens a round, drives it to completion or abort and closes it.
    #[tracing::instrument(skip(self), err(level = tracing::Level::WARN))]
    pub async fn run_round(&self) -> Result<CompletedRoundSummary, ArkError> {
        let round_id = self.db.get_last_round_id(None).await?.map_or(1, |id| id + 1);
        let tip = self.chain.tip_height().await?;
        let round = Round::new(
            round_id,
            Instant::now() + self.params.submit_time(),
            tip + self.params.vtxo_expiry_delta,
        );
        let lifecycle = RoundLifecycle::new(
            round_id,
            self.params.min_participants,
            self.params.max_rebuilds,
            self.statuses.clone(),
        )
        .uninitialized_state_machine()
        .init()
        .await;

        let (inputs, rx) = mpsc::channel(ROUND_INPUT_CAPACITY);
        *self.current.write().await = Some(OpenRound { round_id, inputs });
        ROUND_METRICS.current_round.set(round_id as f64);
        tracing::info!("Round {round_id} open for registration");

        let driver = RoundDriver {
            coordinator: self,
            round,
            lifecycle,
            engine: SignatureEngine::new(),
            nonces: HashMap::new(),
            signed: None,
            digests: Vec::new(),
            funding_prevouts: Vec::new(),
            forfeits: HashMap::new(),
            boarding_signatures: HashMap::new(),
            excluded: BTreeMap::new(),
            inputs: rx,
        };
        let result = driver.drive().await;

        *self.current.write().await = None;
        self.exit.release_round(round_id);

        result
    }
}

/// Entry point for wallets and operators. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    public_key: PublicKey,
    network: Network,
    params: RoundParams,
    exit: Arc<ExitManager>,
    events: broadcast::Sender<RoundEvent>,
    statuses: RoundStatuses,
    current: Arc<RwLock<Option<OpenRound>>>,
}

impl CoordinatorHandle {
    pub async fn info(&self) -> CoordinatorInfo {
        CoordinatorInfo {
            public_key: self.public_key,
            network: self.network,
            params: self.params.clone(),
            current_round: self.current.read().await.as_ref().map(|open| open.round_id),
        }
    }

    /// Subscribe before registering, or the tree announcement may be missed.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn round_status(&self, round_id: RoundId) -> Option<RoundStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&round_id)
            .copied()
    }

    /// Registers a claim into the round that is currently open.
    pub async fn register(&self, request: ClaimRequest) -> Result<RoundTicket, ArkError> {
        let open = self
            .current
            .read()
            .await
            .clone()
            .ok_or(ValidationError::NoRoundOpen)?;

        let (reply, response) = oneshot::channel();
        open.inputs
            .send(RoundInput::Register { request, reply })
            .await
            .map_err(|_| ValidationError::NoRoundOpen)?;

        response.await.map_err(|_| ValidationError::NoRoundOpen)?
    }

    pub async fn submit_nonces(
        &self,
        ticket: &RoundTicket,
        nonces: Vec<(TapSighash, PubNonce)>,
    ) -> Result<(), ArkError> {
        let ticket = *ticket;
        self.request(ticket.round_id, |reply| RoundInput::SubmitNonces {
            ticket,
            nonces,
            reply,
        })
        .await
    }

    /// Partial signatures, plus a signed forfeit for every claim and a
    /// signature for every boarding output the participant brings in.
    pub async fn submit_signatures(
        &self,
        ticket: &RoundTicket,
        signatures: SignatureShare,
    ) -> Result<(), ArkError> {
        let ticket = *ticket;
        self.request(ticket.round_id, |reply| RoundInput::SubmitSignatures {
            ticket,
            signatures,
            reply,
        })
        .await
    }

    pub async fn exit_material(&self, claim: ClaimId) -> Result<ExitPath, ArkError> {
        self.exit.build_exit_path(claim).await
    }

    /// Forfeits a claim outside of a round, settled through `settlement`.
    pub async fn forfeit_claim(
        &self,
        claim: ClaimId,
        forfeit: ForfeitTransaction,
        settlement: &dyn OffchainSettlement,
    ) -> Result<(), ArkError> {
        self.exit.accept_forfeit(claim, forfeit, settlement).await
    }

    pub fn exit_manager(&self) -> &ExitManager {
        &self.exit
    }

    /// Why a request can't reach `round_id`.
    fn unreachable_round(&self, round_id: RoundId) -> ArkError {
        match self.round_status(round_id) {
            Some(status) => ArkError::WrongRoundState(round_id, status),
            None => ArkError::RoundNotFound(round_id),
        }
    }

    async fn request(
        &self,
        round_id: RoundId,
        input: impl FnOnce(oneshot::Sender<Result<(), ArkError>>) -> RoundInput,
    ) -> Result<(), ArkError> {
        let open = match self.current.read().await.clone() {
            Some(open) if open.round_id == round_id => open,
            _ => return Err(self.unreachable_round(round_id)),
        };

        let (reply, response) = oneshot::channel();
        if open.inputs.send(input(reply)).await.is_err() {
            return Err(self.unreachable_round(round_id));
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(self.unreachable_round(round_id)),
        }
    }
}

/// How a signing attempt ended.
enum Collection {
    Complete,
    /// Participants to drop, with the reason.
    Excluded(BTreeMap<PublicKey, String>),
}

fn abort_cause_of(error: &ArkError) -> AbortCause {
    match error {
        ArkError::ChainSubmission(e) => AbortCause::Chain(e.clone()),
        ArkError::Quorum(e) => AbortCause::Quorum(e.clone()),
        other => AbortCause::Failure(other.to_string()),
    }
}

/// Drives one round from registration to completion or abort.
struct RoundDriver<'a> {
    coordinator: &'a Coordinator,
    round: Round,
    lifecycle: InitializedStateMachine<RoundLifecycle>,
    engine: SignatureEngine,
    /// Coordinator's secret nonces of the current attempt, by digest.
    nonces: HashMap<TapSighash, SecNonce>,
    signed: Option<SignedClaimTree>,
    digests: Vec<(usize, TapSighash, Vec<PublicKey>)>,
    /// Spent outputs of the current funding transaction, in input order.
    funding_prevouts: Vec<TxOut>,
    /// Forfeits of refreshed claims, by participant and claim.
    forfeits: HashMap<PublicKey, BTreeMap<ClaimId, ForfeitTransaction>>,
    /// Owner signatures of the current funding transaction's boarding
    /// inputs.
    boarding_signatures: HashMap<PublicKey, BTreeMap<OutPoint, schnorr::Signature>>,
    excluded: BTreeMap<PublicKey, String>,
    inputs: mpsc::Receiver<RoundInput>,
}

impl RoundDriver<'_> {
    fn round_id(&self) -> RoundId {
        self.round.id
    }

    fn status(&self) -> RoundStatus {
        RoundStatus::from(self.lifecycle.state())
    }

    fn publish(&self, event: RoundEvent) {
        // No subscribers is fine.
        let _ = self.coordinator.events.send(event);
    }

    async fn handle(&mut self, event: LifecycleEvent) {
        self.lifecycle.handle(&event).await;
    }

    async fn abort(&mut self, cause: AbortCause) {
        self.handle(LifecycleEvent::Abort(cause)).await;
    }

    async fn drive(mut self) -> Result<CompletedRoundSummary, ArkError> {
        self.publish(RoundEvent::Started {
            round_id: self.round_id(),
        });

        self.collect_registrations().await;
        let registered = self.round.claims().len();
        self.handle(LifecycleEvent::RegistrationClosed { registered })
            .await;
        let signing_started = Instant::now();

        loop {
            if self.status() == RoundStatus::Aborted {
                return self.finish_aborted().await;
            }

            if let Err(e) = self.build_tree().await {
                self.abort(abort_cause_of(&e)).await;
                continue;
            }
            self.handle(LifecycleEvent::TreeFunded).await;

            match self.collect_signatures().await {
                Ok(Collection::Complete) => break,
                Ok(Collection::Excluded(excluded)) => self.exclude(excluded).await,
                Err(e) => self.abort(abort_cause_of(&e)).await,
            }
        }
        self.handle(LifecycleEvent::SignaturesCollected).await;

        let funding_tx = match self.finalize().await {
            Ok(funding_tx) => funding_tx,
            Err(e) => {
                self.abort(abort_cause_of(&e)).await;
                return self.finish_aborted().await;
            }
        };
        self.handle(LifecycleEvent::FundingSigned).await;

        // Requests arriving from here on are queued until the round is over.
        if let Err(e) = self.coordinator.chain.broadcast(&funding_tx).await {
            tracing::warn!(round_id = self.round_id(), "Funding broadcast failed: {e}");
            self.abort(AbortCause::Chain(e)).await;
            return self.finish_aborted().await;
        }
        self.handle(LifecycleEvent::BroadcastAccepted).await;
        tracing::info!(
            round_id = self.round_id(),
            "Funding transaction {} broadcast",
            funding_tx.compute_txid()
        );

        let claims = match self.persist(&funding_tx).await {
            Ok(claims) => claims,
            Err(e) => {
                self.drain_inputs().await;
                return Err(ArkError::ProtocolViolation(
                    self.round_id(),
                    format!("broadcast round could not be persisted: {e}"),
                ));
            }
        };
        self.handle(LifecycleEvent::Persisted).await;

        ROUND_METRICS.completed.increment(1);
        ROUND_METRICS.last_round_claims.set(claims.len() as f64);
        ROUND_METRICS
            .signing_duration_seconds
            .record(signing_started.elapsed().as_secs_f64());

        let summary = CompletedRoundSummary {
            round_id: self.round_id(),
            funding_txid: funding_tx.compute_txid(),
            claims,
            rebuilds: self.lifecycle.rebuilds(),
        };
        self.publish(RoundEvent::Completed {
            round_id: summary.round_id,
            funding_txid: summary.funding_txid,
            claims: summary.claims.clone(),
        });
        self.drain_inputs().await;

        Ok(summary)
    }

    /// Accepts registrations until the round is full or the registration
    /// deadline passes.
    async fn collect_registrations(&mut self) {
        let deadline = self.round.registration_deadline;
        let coordinator = self.coordinator;
        let params = &coordinator.params;

        while !self.round.is_full(params) && self.status() == RoundStatus::Registering {
            let input = tokio::select! {
                _ = sleep_until(deadline) => break,
                input = self.inputs.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };

            match input {
                RoundInput::Register { request, reply } => {
                    let result = self.register(request).await;
                    if let Err(e) = &result {
                        ROUND_METRICS.rejected_requests.increment(1);
                        tracing::debug!(round_id = self.round.id, "Rejected claim request: {e}");
                    }
                    let _ = reply.send(result);
                }
                other => self.answer_out_of_phase(other),
            }
        }
    }

    async fn register(&mut self, request: ClaimRequest) -> Result<RoundTicket, ArkError> {
        let coordinator = self.coordinator;
        let coordinator_key = coordinator.keypair.public_key();
        let claim = resolve_request(
            &request,
            RequestContext {
                round_id: self.round.id,
                coordinator: &coordinator_key,
                network: coordinator.network,
                params: &coordinator.params,
                db: &coordinator.db,
                chain: coordinator.chain.as_ref(),
            },
        )
        .await?;
        let refreshed: Vec<ClaimId> = claim
            .refreshed
            .iter()
            .map(|record| record.claim_id)
            .collect();

        let ticket = self.round.accept(claim, &coordinator.params)?;
        // Off-round forfeits and exits of these claims wait for the round.
        if let Err(e) = coordinator.exit.reserve_refresh(self.round.id, &refreshed).await {
            self.round.exclude(&BTreeSet::from([ticket.owner]));
            return Err(e);
        }
        tracing::debug!(
            round_id = self.round.id,
            "Accepted claim of {} for {}",
            ticket.owner,
            ticket.value
        );

        Ok(ticket)
    }

    /// Answers requests the current phase doesn't take.
    fn answer_out_of_phase(&self, input: RoundInput) {
        match input {
            RoundInput::Register { reply, .. } => {
                let _ = reply.send(Err(ValidationError::NoRoundOpen.into()));
            }
            RoundInput::SubmitNonces { reply, .. } | RoundInput::SubmitSignatures { reply, .. } => {
                let _ = reply.send(Err(ArkError::WrongRoundState(self.round.id, self.status())));
            }
        }
    }

    /// Answers whatever is still queued once the round is over.
    async fn drain_inputs(&mut self) {
        self.inputs.close();
        while let Some(input) = self.inputs.recv().await {
            self.answer_out_of_phase(input);
        }
    }

    /// Builds the tree over the current claims, funds it and opens its
    /// digests. Publishes the tree for participants to check.
    async fn build_tree(&mut self) -> Result<(), ArkError> {
        let coordinator = self.coordinator;
        let params = &coordinator.params;

        let tree_params = TreeParams {
            coordinator: coordinator.keypair.public_key(),
            network: coordinator.network,
            radix: params.tree_radix,
            expiry_height: self.round.expiry_height,
            exit_delta: params.exit_delta,
        };
        let tree = ClaimTree::build(&self.round.leaves(), params.round_fee, tree_params)?;
        let root_txout = tree.root_txout()?;

        let fee_rate = coordinator
            .chain
            .estimate_fee_rate(params.fee_target_blocks)
            .await?;
        let boarding = self.round.boarding_inputs();
        let funding_tx = coordinator
            .chain
            .fund_transaction(boarding.clone(), vec![root_txout.clone()], fee_rate)
            .await?;
        let funding_prevouts = self.funding_prevouts(&funding_tx, &boarding).await?;
        let funding_vout = funding_tx
            .output
            .iter()
            .position(|output| *output == root_txout)
            .ok_or(TxError::RootOutputNotFound)? as u32;

        let signed = SignedClaimTree::new(
            tree,
            OutPoint::new(funding_tx.compute_txid(), funding_vout),
        )?;
        signed.check_conservation(&funding_tx)?;

        let digests = signed.digests()?;
        let keypair = coordinator.keypair;
        for (_, digest, signers) in &digests {
            self.engine.open(*digest, signers.clone())?;

            let (sec_nonce, pub_nonce) =
                musig2::nonce_pair(&keypair, signers, *digest, &mut thread_rng())?;
            self.engine
                .submit_nonce(&keypair.public_key(), digest, pub_nonce)?;
            self.nonces.insert(*digest, sec_nonce);
        }

        tracing::info!(
            round_id = self.round.id,
            attempt = self.round.attempt,
            "Claim tree with {} claims and {} node transactions published",
            signed.tree().leaf_count(),
            digests.len()
        );
        self.publish(RoundEvent::TreePublished(Arc::new(TreeAnnouncement {
            round_id: self.round.id,
            attempt: self.round.attempt,
            claims: self.round.leaves(),
            fee: signed.tree().fee(),
            params: tree_params,
            funding_tx: funding_tx.clone(),
            funding_prevouts: funding_prevouts.clone(),
            funding_vout,
            digests: digests.clone(),
        })));

        self.round.funding_tx = Some(funding_tx);
        self.funding_prevouts = funding_prevouts;
        self.signed = Some(signed);
        self.digests = digests;

        Ok(())
    }

    /// Outputs spent by `funding_tx`, which has to spend the `boarding`
    /// outputs first and in order.
    async fn funding_prevouts(
        &self,
        funding_tx: &Transaction,
        boarding: &[OutPoint],
    ) -> Result<Vec<TxOut>, ArkError> {
        let spent: Vec<OutPoint> = funding_tx
            .input
            .iter()
            .map(|input| input.previous_output)
            .collect();
        if !spent.starts_with(boarding) {
            return Err(ChainError::Funding("wallet moved the boarding inputs".into()).into());
        }

        let known: HashMap<OutPoint, &TxOut> = self
            .round
            .claims()
            .iter()
            .flat_map(|claim| claim.boarding.iter())
            .map(|boarded| (boarded.outpoint, &boarded.output))
            .collect();

        let mut prevouts = Vec::with_capacity(spent.len());
        for outpoint in spent {
            let output = match known.get(&outpoint) {
                Some(output) => (*output).clone(),
                None => {
                    self.coordinator
                        .chain
                        .get_output(outpoint)
                        .await?
                        .ok_or_else(|| {
                            ChainError::Funding(format!("wallet input {outpoint} not found"))
                        })?
                        .output
                }
            };
            prevouts.push(output);
        }

        Ok(prevouts)
    }

    /// Whether every participant handed in a forfeit for each claim they
    /// refresh.
    fn missing_forfeits(&self) -> BTreeSet<PublicKey> {
        self.round
            .claims()
            .iter()
            .filter(|claim| {
                let submitted = self.forfeits.get(&claim.owner);
                claim.refreshed.iter().any(|record| {
                    !submitted.is_some_and(|forfeits| forfeits.contains_key(&record.claim_id))
                })
            })
            .map(|claim| claim.owner)
            .collect()
    }

    /// Participants that still owe a signature for one of their boarding
    /// inputs.
    fn missing_boarding_signatures(&self) -> BTreeSet<PublicKey> {
        self.round
            .claims()
            .iter()
            .filter(|claim| {
                let submitted = self.boarding_signatures.get(&claim.owner);
                claim.boarding.iter().any(|boarded| {
                    !submitted.is_some_and(|signatures| signatures.contains_key(&boarded.outpoint))
                })
            })
            .map(|claim| claim.owner)
            .collect()
    }

    /// Aggregates the nonces, adds the coordinator's partial signatures and
    /// publishes the aggregate nonces.
    fn aggregate_nonces(&mut self) -> Result<(), ArkError> {
        let keypair = self.coordinator.keypair;
        let mut aggregated = BTreeMap::new();

        for (_, digest, signers) in &self.digests {
            let agg_nonce = self.engine.aggregate_nonce(digest)?;
            let sec_nonce = self
                .nonces
                .remove(digest)
                .ok_or(SignatureError::NotReady(*digest))?;
            let partial = musig2::partial_sign(signers, sec_nonce, &agg_nonce, &keypair, *digest)?;
            self.engine.submit(&keypair.public_key(), digest, partial)?;

            aggregated.insert(*digest, agg_nonce);
        }

        self.publish(RoundEvent::NoncesAggregated {
            round_id: self.round.id,
            attempt: self.round.attempt,
            nonces: Arc::new(aggregated),
        });

        Ok(())
    }

    /// Collects nonces, partial signatures, forfeits and boarding signatures
    /// until every one is in, someone is excluded or the signing deadline
    /// passes.
    async fn collect_signatures(&mut self) -> Result<Collection, ArkError> {
        let deadline = Instant::now() + self.coordinator.params.sign_time();
        let mut nonces_aggregated = false;

        loop {
            if !self.excluded.is_empty() {
                return Ok(Collection::Excluded(std::mem::take(&mut self.excluded)));
            }
            if !nonces_aggregated && self.engine.nonces_complete() {
                self.aggregate_nonces()?;
                nonces_aggregated = true;
            }
            if nonces_aggregated
                && self.engine.signatures_complete()
                && self.missing_forfeits().is_empty()
                && self.missing_boarding_signatures().is_empty()
            {
                return Ok(Collection::Complete);
            }

            let input = tokio::select! {
                _ = sleep_until(deadline) => None,
                input = self.inputs.recv() => input,
            };
            let Some(input) = input else {
                let missing = self.missing_material();
                tracing::warn!(
                    round_id = self.round.id,
                    "Signing deadline passed, {} participants missing",
                    missing.len()
                );
                return Ok(Collection::Excluded(
                    missing
                        .into_iter()
                        .map(|participant| (participant, "missed the signing deadline".into()))
                        .collect(),
                ));
            };

            match input {
                RoundInput::SubmitNonces {
                    ticket,
                    nonces,
                    reply,
                } => {
                    let result = self.submit_nonces(&ticket, nonces);
                    let _ = reply.send(result);
                }
                RoundInput::SubmitSignatures {
                    ticket,
                    signatures,
                    reply,
                } => {
                    let result = self.submit_signatures(&ticket, signatures).await;
                    let _ = reply.send(result);
                }
                other => self.answer_out_of_phase(other),
            }
        }
    }

    /// Participants, never the coordinator, that still owe anything.
    fn missing_material(&self) -> BTreeSet<PublicKey> {
        let coordinator = self.coordinator.keypair.public_key();
        let mut missing = self.engine.missing_nonces();
        missing.extend(self.engine.missing_signatures());
        missing.extend(self.missing_forfeits());
        missing.extend(self.missing_boarding_signatures());
        missing.remove(&coordinator);

        missing
    }

    fn submit_nonces(
        &mut self,
        ticket: &RoundTicket,
        nonces: Vec<(TapSighash, PubNonce)>,
    ) -> Result<(), ArkError> {
        self.round.authenticate(ticket)?;

        for (digest, nonce) in nonces {
            self.engine.submit_nonce(&ticket.owner, &digest, nonce)?;
        }

        Ok(())
    }

    async fn submit_signatures(
        &mut self,
        ticket: &RoundTicket,
        share: SignatureShare,
    ) -> Result<(), ArkError> {
        self.round.authenticate(ticket)?;
        let participant = ticket.owner;

        // Partials go first: they fail without exclusion when they belong
        // to an earlier attempt.
        for (digest, partial) in share.partials {
            match self.engine.submit(&participant, &digest, partial) {
                Ok(()) => {}
                Err(e @ SignatureError::InvalidSignature(..)) => {
                    self.excluded.insert(participant, e.to_string());
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        for forfeit in share.forfeits {
            let claim = forfeit.claim;
            if let Err(e) = self.check_forfeit(&participant, &forfeit).await {
                self.excluded.insert(participant, e.to_string());
                return Err(e);
            }

            self.forfeits
                .entry(participant)
                .or_default()
                .insert(claim, forfeit);
        }

        for (outpoint, signature) in share.boarding {
            if let Err(e) = self.check_boarding_signature(&participant, outpoint, &signature) {
                self.excluded.insert(participant, e.to_string());
                return Err(e.into());
            }

            self.boarding_signatures
                .entry(participant)
                .or_default()
                .insert(outpoint, signature);
        }

        Ok(())
    }

    fn boarding_policy(&self, owner: PublicKey) -> Result<BoardingPolicy, TxError> {
        let coordinator = self.coordinator;

        BoardingPolicy::new(
            owner,
            coordinator.keypair.public_key(),
            coordinator.params.exit_delta,
            coordinator.network,
        )
    }

    /// Position of a boarding output among the funding transaction's
    /// inputs.
    fn boarding_index(&self, outpoint: OutPoint) -> Option<usize> {
        self.round
            .funding_tx
            .as_ref()?
            .input
            .iter()
            .position(|input| input.previous_output == outpoint)
    }

    fn check_boarding_signature(
        &self,
        participant: &PublicKey,
        outpoint: OutPoint,
        signature: &schnorr::Signature,
    ) -> Result<(), SignatureError> {
        let invalid = |reason: &str| SignatureError::InvalidBoarding(outpoint, reason.into());

        let owned = self
            .round
            .claim_of(participant)
            .is_some_and(|claim| claim.boarding.iter().any(|boarded| boarded.outpoint == outpoint));
        if !owned {
            return Err(invalid("not boarded by this participant"));
        }
        let (Some(funding_tx), Some(index)) =
            (self.round.funding_tx.as_ref(), self.boarding_index(outpoint))
        else {
            return Err(invalid("not spent by the funding transaction"));
        };

        self.boarding_policy(*participant)
            .map_err(|e| invalid(&e.to_string()))?
            .verify(signature, funding_tx, &self.funding_prevouts, index)
    }

    async fn check_forfeit(
        &self,
        participant: &PublicKey,
        forfeit: &ForfeitTransaction,
    ) -> Result<(), ArkError> {
        let owed = self.round.owed_forfeits(participant);
        if !owed.iter().any(|record| record.claim_id == forfeit.claim) {
            return Err(SignatureError::InvalidForfeit(
                forfeit.claim,
                "claim is not refreshed by this participant".into(),
            )
            .into());
        }

        self.coordinator
            .exit
            .validate_forfeit(forfeit.claim, forfeit)
            .await
            .map(|_| ())
    }

    /// Drops excluded participants and starts a new signing attempt if the
    /// lifecycle allows one.
    async fn exclude(&mut self, excluded: BTreeMap<PublicKey, String>) {
        for (participant, reason) in &excluded {
            tracing::warn!(
                round_id = self.round.id,
                "Excluding {participant} from round: {reason}"
            );
        }
        let participants: BTreeSet<PublicKey> = excluded.keys().copied().collect();

        self.engine.retire_all();
        self.nonces.clear();
        self.signed = None;
        self.digests.clear();
        self.round.funding_tx = None;
        self.funding_prevouts.clear();
        self.boarding_signatures.clear();
        self.forfeits
            .retain(|participant, _| !participants.contains(participant));
        for dropped in self.round.exclude(&participants) {
            let refreshed: Vec<ClaimId> =
                dropped.refreshed.iter().map(|record| record.claim_id).collect();
            self.coordinator
                .exit
                .release_refresh(self.round.id, &refreshed);
        }

        ROUND_METRICS
            .excluded_participants
            .increment(participants.len() as u64);
        self.publish(RoundEvent::Excluded {
            round_id: self.round.id,
            attempt: self.round.attempt,
            participants: participants.into_iter().collect(),
            reason: excluded
                .values()
                .cloned()
                .collect::<Vec<_>>()
                .join("; "),
        });

        let remaining = self.round.claims().len();
        self.handle(LifecycleEvent::ParticipantsExcluded { remaining })
            .await;
        if self.status() == RoundStatus::TreeBuilding {
            self.round.attempt += 1;
            ROUND_METRICS.rebuilds.increment(1);
        }
    }

    /// Cosigned witnesses of every boarding input, by input index.
    fn boarding_witnesses(
        &self,
        unsigned: &Transaction,
    ) -> Result<Vec<(usize, bitcoin::Witness)>, ArkError> {
        let mut witnesses = Vec::new();

        for claim in self.round.claims() {
            if claim.boarding.is_empty() {
                continue;
            }
            let policy = self.boarding_policy(claim.owner)?;
            let signatures = self.boarding_signatures.get(&claim.owner);

            for boarded in &claim.boarding {
                let signature = signatures
                    .and_then(|signatures| signatures.get(&boarded.outpoint))
                    .ok_or_else(|| eyre::eyre!("No signature for boarding output {}", boarded.outpoint))?;
                let index = self
                    .boarding_index(boarded.outpoint)
                    .ok_or(TxError::TxInputNotFound)?;

                witnesses.push((
                    index,
                    policy.witness(
                        &self.coordinator.keypair,
                        signature,
                        unsigned,
                        &self.funding_prevouts,
                        index,
                    )?,
                ));
            }
        }

        Ok(witnesses)
    }

    /// Aggregates every digest into its node transaction, cosigns the
    /// boarding inputs and gets the wallet inputs signed.
    async fn finalize(&mut self) -> Result<Transaction, ArkError> {
        let refreshed: Vec<ClaimId> = self
            .round
            .claims()
            .iter()
            .flat_map(|claim| claim.refreshed.iter().map(|record| record.claim_id))
            .collect();
        let unsigned = self
            .round
            .funding_tx
            .clone()
            .ok_or_else(|| eyre::eyre!("No funding transaction to sign"))?;
        let boarding_witnesses = self.boarding_witnesses(&unsigned)?;

        let signed = self
            .signed
            .as_mut()
            .ok_or_else(|| eyre::eyre!("No tree to finalize"))?;

        for (index, digest, _) in &self.digests {
            signed.attach_signature(*index, self.engine.aggregate(digest)?)?;
        }
        if !signed.is_fully_signed() {
            return Err(eyre::eyre!("Claim tree is missing node signatures").into());
        }

        let mut cosigned = unsigned.clone();
        for (index, witness) in boarding_witnesses {
            cosigned.input[index].witness = witness;
        }
        let funding_tx = self.coordinator.chain.sign_transaction(cosigned).await?;
        if funding_tx.compute_txid() != unsigned.compute_txid() {
            return Err(TxError::FundingTxidChanged(
                unsigned.compute_txid(),
                funding_tx.compute_txid(),
            )
            .into());
        }
        signed.check_conservation(&funding_tx)?;

        // Reserved claims can't change status, unless the reservation was
        // bypassed.
        self.coordinator.exit.ensure_live(&refreshed).await?;

        self.round.funding_tx = Some(funding_tx.clone());

        Ok(funding_tx)
    }

    /// Stores the broadcast round. Returns `(owner, claim)` in leaf order.
    async fn persist(
        &self,
        funding_tx: &Transaction,
    ) -> Result<Vec<(PublicKey, ClaimId)>, ArkError> {
        let signed = self
            .signed
            .as_ref()
            .ok_or_else(|| eyre::eyre!("No signed tree to persist"))?;
        let exit_paths = ExitPath::from_signed_tree(self.round.id, signed)?;
        let node_txs = signed.signed_transactions()?;
        let forfeits: Vec<ForfeitTransaction> = self
            .round
            .claims()
            .iter()
            .filter_map(|claim| self.forfeits.get(&claim.owner))
            .flat_map(|forfeits| forfeits.values().cloned())
            .collect();

        self.coordinator
            .db
            .save_completed_round(CompletedRound {
                round_id: self.round.id,
                funding_tx,
                funding_outpoint: signed.funding_outpoint(),
                expiry_height: self.round.expiry_height,
                node_txs: &node_txs,
                exit_paths: &exit_paths,
                forfeits: &forfeits,
            })
            .await?;

        Ok(exit_paths
            .iter()
            .map(|path| (path.owner, path.claim_outpoint))
            .collect())
    }

    async fn finish_aborted(mut self) -> Result<CompletedRoundSummary, ArkError> {
        let cause = self
            .lifecycle
            .abort_cause()
            .cloned()
            .unwrap_or_else(|| AbortCause::Failure("aborted without a cause".into()));
        let round_id = self.round.id;

        ROUND_METRICS.aborted.increment(1);
        if let Err(e) = self
            .coordinator
            .db
            .save_aborted_round(None, round_id, &cause.to_string())
            .await
        {
            tracing::error!("Can't record abort of round {round_id}: {e}");
        }

        self.publish(RoundEvent::Aborted {
            round_id,
            reason: cause.to_string(),
        });
        self.drain_inputs().await;

        Err(cause.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::SessionToken;
    use crate::testkit::{random_keypair, MockChain};
    use bitcoin::{Amount, SignedAmount};
    use std::time::Duration;

    async fn coordinator(params: RoundParams) -> (Coordinator, Arc<MockChain>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let chain = Arc::new(MockChain::new());

        let coordinator = Coordinator::new(
            random_keypair().secret_key(),
            Network::Regtest,
            params,
            chain.clone(),
            db,
        )
        .unwrap();

        (coordinator, chain)
    }

    fn fast_params() -> RoundParams {
        RoundParams {
            min_participants: 2,
            round_submit_time_ms: 50,
            round_sign_time_ms: 200,
            round_interval_ms: 10,
            ..RoundParams::regtest()
        }
    }

    #[tokio::test]
    async fn no_round_open_before_scheduling() {
        let (coordinator, _) = coordinator(fast_params()).await;
        let handle = coordinator.handle();
        let owner = random_keypair();

        assert!(matches!(
            handle
                .register(ClaimRequest::new(
                    1,
                    &owner,
                    SignedAmount::from_sat(10_000),
                    vec![],
                    vec![],
                ))
                .await,
            Err(ArkError::Validation(ValidationError::NoRoundOpen))
        ));
        assert_eq!(handle.info().await.current_round, None);

        let ticket = RoundTicket {
            round_id: 1,
            owner: owner.public_key(),
            value: Amount::from_sat(10_000),
            token: SessionToken::random(),
        };
        assert!(matches!(
            handle.submit_nonces(&ticket, vec![]).await,
            Err(ArkError::RoundNotFound(1))
        ));
    }

    #[tokio::test]
    async fn underfilled_round_is_aborted_and_recorded() {
        let (coordinator, chain) = coordinator(fast_params()).await;
        let coordinator_key = coordinator.public_key();
        let handle = coordinator.handle();
        let mut events = handle.subscribe();

        let round = tokio::spawn(async move {
            let result = coordinator.run_round().await;
            (coordinator, result)
        });

        // Wait for the round to open.
        let started = events.recv().await.unwrap();
        assert_eq!(started.round_id(), 1);

        let owner = random_keypair();
        let policy = BoardingPolicy::new(
            owner.public_key(),
            coordinator_key,
            RoundParams::regtest().exit_delta,
            Network::Regtest,
        )
        .unwrap();
        let boarded = chain.fund_address(policy.script_pubkey().clone(), Amount::from_sat(20_000));
        let ticket = handle
            .register(ClaimRequest::new(
                1,
                &owner,
                SignedAmount::from_sat(10_000),
                vec![],
                vec![boarded],
            ))
            .await
            .unwrap();
        assert_eq!(ticket.round_id, 1);

        let (coordinator, result) = round.await.unwrap();
        assert!(matches!(
            result,
            Err(ArkError::Quorum(crate::errors::QuorumError::Underfilled {
                registered: 1,
                minimum: 2
            }))
        ));
        assert_eq!(handle.round_status(1), Some(RoundStatus::Aborted));
        assert!(matches!(
            events.recv().await.unwrap(),
            RoundEvent::Aborted { round_id: 1, .. }
        ));

        let record = coordinator.db.get_round(None, 1).await.unwrap().unwrap();
        assert!(record.abort_reason.unwrap().contains("participants registered"));
        assert!(matches!(
            handle.submit_nonces(&ticket, vec![]).await,
            Err(ArkError::WrongRoundState(1, RoundStatus::Aborted))
        ));
        // The boarding output wasn't spent.
        assert!(chain.is_unspent(boarded).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_value_has_to_be_boarded() {
        let (coordinator, _) = coordinator(RoundParams {
            round_submit_time_ms: 300,
            ..fast_params()
        })
        .await;
        let handle = coordinator.handle();
        let mut events = handle.subscribe();

        let round = tokio::spawn(async move { coordinator.run_round().await });
        events.recv().await.unwrap();

        let owner = random_keypair();
        assert!(matches!(
            handle
                .register(ClaimRequest::new(
                    1,
                    &owner,
                    SignedAmount::from_sat(10_000),
                    vec![],
                    vec![],
                ))
                .await,
            Err(ArkError::Validation(ValidationError::InsufficientFunding(..)))
        ));

        let result = tokio::time::timeout(Duration::from_secs(10), round)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(handle.round_status(1), Some(RoundStatus::Aborted));
    }
}
