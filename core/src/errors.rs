//! # Errors
//!
//! This module defines errors, returned by the library.
//!
//! Round related failures are split into the classes a participant can act
//! on: [`ValidationError`] (request rejected, no round impact),
//! [`QuorumError`] (round aborted before broadcast), [`SignatureError`]
//! (participant excluded), [`ChainError`] (broadcast failed) and
//! [`TimeoutError`]. Everything before the funding broadcast is recoverable
//! by joining a later round.

use crate::round::RoundStatus;
use crate::{ClaimId, RoundId};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, TapSighash, Txid};
use core::fmt::Debug;
use thiserror::Error;

/// Errors returned by the coordinator and the wallet session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArkError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    ChainSubmission(#[from] ChainError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Exit(#[from] ExitError),
    #[error(transparent)]
    Tx(#[from] TxError),

    /// Something happened after the funding transaction was broadcast that
    /// should be impossible by construction.
    #[error("Protocol invariant violated in round {0}: {1}")]
    ProtocolViolation(RoundId, String),

    #[error("Round {0} not found")]
    RoundNotFound(RoundId),
    #[error("Round {0} is {1}, request not accepted")]
    WrongRoundState(RoundId, RoundStatus),
    #[error("Claim tree does not match the published claim list: {0}")]
    TreeMismatch(String),
    #[error("Excluded from round {0}: {1}")]
    Excluded(RoundId, String),

    /// Returned when the bitcoin::secp256k1 crate returns an error
    #[error("Secp256k1Error: {0}")]
    Secp256k1Error(#[from] bitcoin::secp256k1::Error),
    /// Returned when the bitcoin crate returns an error in the sighash taproot module
    #[error("BitcoinSighashTaprootError: {0}")]
    BitcoinSighashTaprootError(#[from] bitcoin::sighash::TaprootError),
    #[error("BitcoinConsensusEncodeError: {0}")]
    BitcoinConsensusEncodeError(#[from] bitcoin::consensus::encode::Error),

    /// ConfigError is returned when the configuration is invalid
    #[error("ConfigError: {0}")]
    ConfigError(String),
    #[error("Environment variable {1}: {0}")]
    EnvVarNotSet(std::env::VarError, &'static str),
    #[error("Environment variable {0} is malformed: {1}")]
    EnvVarMalformed(&'static str, String),

    #[error("DatabaseError: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Can't de/serialize stored data: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Channel to the round coordinator closed: {0}")]
    ChannelClosed(String),
    #[error("Round event stream lagged, skipped {0} events")]
    EventsLagged(u64),

    #[error(transparent)]
    Eyre(#[from] eyre::Report),
}

/// A claim request was malformed or can't be served. The round is not
/// affected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Claim value must be positive, got {0} sat")]
    NonPositiveValue(i64),
    #[error("Claim value {0} is below the minimum of {1}")]
    BelowMinimum(Amount, Amount),
    #[error("Claim value {0} exceeds the per-round cap of {1}")]
    AboveCap(Amount, Amount),
    #[error("Unknown key format: expected a 33 byte compressed public key")]
    UnknownKeyFormat,
    #[error("Owner key can't be the coordinator's key")]
    CoordinatorKey,
    #[error("Request is not signed by its owner")]
    InvalidRequestSignature,
    #[error("Request is for round {requested} but round {current} is open")]
    StaleRound { requested: RoundId, current: RoundId },
    #[error("Owner {0} is already registered in this round")]
    Duplicate(PublicKey),
    #[error("Round is full ({0} participants)")]
    RoundFull(usize),
    #[error("No round is accepting registrations")]
    NoRoundOpen,
    #[error("Refreshed claim {0} is unknown")]
    UnknownClaim(ClaimId),
    #[error("Refreshed claim {0} is not live")]
    ClaimNotLive(ClaimId),
    #[error("Refreshed claim {0} belongs to another owner")]
    ForeignClaim(ClaimId),
    #[error("Refreshed claim {0} is already used in this round")]
    ClaimAlreadyRefreshed(ClaimId),
    #[error("Requested {0} but refreshed claims and boarding outputs only cover {1}")]
    InsufficientFunding(Amount, Amount),
    #[error("Boarding output {0} is unknown or spent")]
    UnknownBoardingOutput(OutPoint),
    #[error("Boarding output {0} has {1} confirmations, {2} required")]
    BoardingUnconfirmed(OutPoint, u32, u32),
    #[error("Boarding output {0} isn't locked to the owner and the coordinator")]
    BoardingPolicyMismatch(OutPoint),
    #[error("Boarding output {0} is already used in this round")]
    BoardingAlreadyUsed(OutPoint),
    #[error("Participant {0} is not registered in round {1}")]
    NotRegistered(PublicKey, RoundId),
    #[error("Session token doesn't match the registration of {0}")]
    SessionMismatch(PublicKey),
}

/// The round could not gather or keep enough participants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuorumError {
    #[error("Only {registered} participants registered, at least {minimum} required")]
    Underfilled { registered: usize, minimum: usize },
    #[error("{remaining} participants left after exclusions, at least {minimum} required")]
    LostParticipants { remaining: usize, minimum: usize },
    #[error("Signing failed after {0} tree rebuilds")]
    RebuildsExhausted(usize),
}

/// Errors of the signature engine and MuSig2 helpers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Partial signature of {0} does not verify for digest {1}")]
    InvalidSignature(PublicKey, TapSighash),
    #[error("Not collecting signatures for digest {0}")]
    UnknownDigest(TapSighash),
    #[error("Digest {0} belongs to a discarded signing attempt")]
    Replayed(TapSighash),
    #[error("Nonces for digest {0} are not aggregated yet")]
    NotReady(TapSighash),
    #[error("{0} is not a signer of digest {1}")]
    NotASigner(PublicKey, TapSighash),
    #[error("{0} already submitted a different value for digest {1}")]
    Conflicting(PublicKey, TapSighash),
    #[error("Digest {0} is missing contributions from {1} signers")]
    Incomplete(TapSighash, usize),
    #[error("Aggregate signature for digest {0} does not verify")]
    InvalidAggregate(TapSighash),
    #[error("Invalid forfeit for claim {0}: {1}")]
    InvalidForfeit(ClaimId, String),
    #[error("Invalid signature for boarding output {0}: {1}")]
    InvalidBoarding(OutPoint, String),
    #[error("MuSig2 key aggregation failed: {0}")]
    KeyAggregation(String),
    #[error("MuSig2 signing failed: {0}")]
    Signing(String),
}

/// Reasons a node rejects a transaction outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientFee,
    ConflictingSpend,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InsufficientFee => write!(f, "fee too low"),
            RejectReason::ConflictingSpend => write!(f, "conflicting spend"),
            RejectReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// Errors from the chain client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Terminal for the broadcast attempt.
    #[error("Transaction {0} rejected: {1}")]
    Rejected(Txid, RejectReason),
    /// Retried with backoff by the client before surfacing.
    #[error("Transient chain client failure: {0}")]
    Transient(String),
    #[error("Wallet can't fund the transaction: {0}")]
    Funding(String),
    #[error("Wallet couldn't sign all funding inputs: {0:?}")]
    Signing(Vec<String>),
    #[error("Fee estimation failed: {0:?}")]
    FeeEstimation(Vec<String>),
    /// Not retryable and not a rejection, e.g. a malformed response.
    #[error("Chain client error: {0}")]
    Rpc(String),
}

/// A deadline expired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("Signing deadline of round {0} expired with {1} participants missing")]
    Signing(RoundId, usize),
    #[error("Timed out waiting for round {0} to reach {1}")]
    Session(RoundId, &'static str),
}

/// Errors of the exit and forfeit manager.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExitError {
    #[error("Claim {0} is unknown")]
    UnknownClaim(ClaimId),
    #[error("Claim {0} was forfeited, its exit path is relinquished")]
    ClaimForfeited(ClaimId),
    #[error("Claim {0} was already exited on-chain")]
    ClaimExited(ClaimId),
    #[error("Claim {0} is being refreshed by round {1}")]
    ClaimRefreshing(ClaimId, RoundId),
    #[error("Claim {0} is being settled off-chain")]
    ClaimSettling(ClaimId),
    #[error("Exit path step {0} is invalid: {1}")]
    InvalidStep(usize, String),
    #[error("Exit path does not spend the funding output {0}")]
    FundingMismatch(Txid),
    #[error("Owner key doesn't match the claim")]
    OwnerMismatch,
    #[error("Off-chain settlement failed: {0}")]
    Settlement(String),
}

/// Errors while building and signing transactions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("TxInputNotFound")]
    TxInputNotFound,
    #[error("TxOutputNotFound")]
    TxOutputNotFound,
    #[error("WitnessAlreadySet")]
    WitnessAlreadySet,
    #[error("Script with index {0} not found for transaction")]
    ScriptNotFound(usize),
    #[error("ControlBlockError")]
    ControlBlockError,
    #[error("MissingSpendInfo")]
    MissingSpendInfo,
    #[error("MissingWitnessData")]
    MissingWitnessData,
    #[error("Taproot tree can't be built: {0}")]
    TaprootBuilderError(String),
    #[error("Sighash can't be computed: {0}")]
    Sighash(String),
    #[error("Spendable input doesn't match its taproot spend info: {0}")]
    SpendableTxIn(String),
    #[error("Funding transaction doesn't contain the tree root output")]
    RootOutputNotFound,
    #[error("Funding txid changed while signing: {0} -> {1}")]
    FundingTxidChanged(Txid, Txid),
    #[error("Value not conserved: {0}")]
    ValueNotConserved(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ArkError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ArkError::ChannelClosed(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ArkError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        ArkError::ChannelClosed(e.to_string())
    }
}
