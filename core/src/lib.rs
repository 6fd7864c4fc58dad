//! # Ark Core
//!
//! Round coordination and claim tree construction for an Ark service
//! provider, plus the wallet-side session that participates in rounds.
//!
//! A round batches many participants' claims into a single on-chain funding
//! output. The output is the root of a claim tree: a set of pre-signed
//! transactions that lets every participant exit unilaterally without the
//! coordinator's help.

pub mod boarding;
pub mod builder;
pub mod chain;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod errors;
pub mod exit;
pub mod extended_rpc;
pub mod metrics;
pub mod musig2;
pub mod round;
pub mod session;
pub mod signature_engine;
pub mod sweep;
pub mod testkit;
pub mod tree;
pub mod utils;

/// Identifier of a round. Monotonically increasing per coordinator.
pub type RoundId = u64;

/// A claim is identified by the outpoint of its leaf output in the claim
/// tree.
pub type ClaimId = bitcoin::OutPoint;
