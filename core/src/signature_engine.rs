//! # Signature Engine
//!
//! Collects, verifies and aggregates MuSig2 contributions per transaction
//! digest for one round. Every digest goes through two phases: public nonces
//! are collected and frozen into an aggregate nonce, then partial signatures
//! are collected against it. A partial signature is only recorded after it
//! verifies, so [`SignatureEngine::aggregate`] can't succeed with fewer than
//! the full signer set.

use crate::errors::SignatureError;
use crate::musig2::{self, AggNonce, PartialSignature, PubNonce};
use bitcoin::secp256k1::{schnorr, PublicKey};
use bitcoin::{TapSighash, XOnlyPublicKey};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug)]
struct DigestSession {
    signers: Vec<PublicKey>,
    aggregate_key: XOnlyPublicKey,
    nonces: HashMap<PublicKey, PubNonce>,
    agg_nonce: Option<AggNonce>,
    partial_signatures: HashMap<PublicKey, PartialSignature>,
}

impl DigestSession {
    fn missing_nonces(&self) -> impl Iterator<Item = &PublicKey> {
        self.signers
            .iter()
            .filter(|signer| !self.nonces.contains_key(signer))
    }

    fn missing_signatures(&self) -> impl Iterator<Item = &PublicKey> {
        self.signers
            .iter()
            .filter(|signer| !self.partial_signatures.contains_key(signer))
    }
}

#[derive(Debug, Default)]
pub struct SignatureEngine {
    sessions: HashMap<TapSighash, DigestSession>,
    retired: HashSet<TapSighash>,
}

impl SignatureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, digest: &TapSighash) -> Result<&DigestSession, SignatureError> {
        match self.sessions.get(digest) {
            Some(session) => Ok(session),
            None if self.retired.contains(digest) => Err(SignatureError::Replayed(*digest)),
            None => Err(SignatureError::UnknownDigest(*digest)),
        }
    }

    fn session_mut(&mut self, digest: &TapSighash) -> Result<&mut DigestSession, SignatureError> {
        if self.retired.contains(digest) {
            return Err(SignatureError::Replayed(*digest));
        }

        self.sessions
            .get_mut(digest)
            .ok_or(SignatureError::UnknownDigest(*digest))
    }

    /// Starts collecting for `digest`, signed by `signers` in this order.
    /// Returns the aggregate key the final signature must verify against.
    pub fn open(
        &mut self,
        digest: TapSighash,
        signers: Vec<PublicKey>,
    ) -> Result<XOnlyPublicKey, SignatureError> {
        if self.retired.contains(&digest) {
            return Err(SignatureError::Replayed(digest));
        }
        if let Some(session) = self.sessions.get(&digest) {
            return Ok(session.aggregate_key);
        }

        let aggregate_key = musig2::aggregate_xonly(&signers)?;
        self.sessions.insert(
            digest,
            DigestSession {
                signers,
                aggregate_key,
                nonces: HashMap::new(),
                agg_nonce: None,
                partial_signatures: HashMap::new(),
            },
        );

        Ok(aggregate_key)
    }

    pub fn signers(&self, digest: &TapSighash) -> Result<&[PublicKey], SignatureError> {
        Ok(&self.session(digest)?.signers)
    }

    pub fn aggregate_key(&self, digest: &TapSighash) -> Result<XOnlyPublicKey, SignatureError> {
        Ok(self.session(digest)?.aggregate_key)
    }

    /// Digests this participant has to contribute to.
    pub fn digests_of(&self, participant: &PublicKey) -> BTreeSet<TapSighash> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.signers.contains(participant))
            .map(|(digest, _)| *digest)
            .collect()
    }

    /// Records a public nonce. Submitting the same nonce again is a no-op.
    pub fn submit_nonce(
        &mut self,
        participant: &PublicKey,
        digest: &TapSighash,
        nonce: PubNonce,
    ) -> Result<(), SignatureError> {
        let session = self.session_mut(digest)?;

        if !session.signers.contains(participant) {
            return Err(SignatureError::NotASigner(*participant, *digest));
        }

        match session.nonces.get(participant) {
            Some(existing) if *existing == nonce => Ok(()),
            Some(_) => Err(SignatureError::Conflicting(*participant, *digest)),
            None if session.agg_nonce.is_some() => {
                Err(SignatureError::Conflicting(*participant, *digest))
            }
            None => {
                session.nonces.insert(*participant, nonce);
                Ok(())
            }
        }
    }

    /// Sums the public nonces of every signer. The nonce set is frozen
    /// afterwards.
    pub fn aggregate_nonce(&mut self, digest: &TapSighash) -> Result<AggNonce, SignatureError> {
        let session = self.session_mut(digest)?;

        if let Some(agg_nonce) = &session.agg_nonce {
            return Ok(agg_nonce.clone());
        }

        let missing = session.missing_nonces().count();
        if missing > 0 {
            return Err(SignatureError::Incomplete(*digest, missing));
        }

        let agg_nonce = musig2::aggregate_nonces(
            session
                .signers
                .iter()
                .filter_map(|signer| session.nonces.get(signer)),
        );
        session.agg_nonce = Some(agg_nonce.clone());

        Ok(agg_nonce)
    }

    /// Records a partial signature after verifying it against the
    /// participant's key and the exact digest. Re-submitting the same valid
    /// signature is a no-op.
    pub fn submit(
        &mut self,
        participant: &PublicKey,
        digest: &TapSighash,
        partial_signature: PartialSignature,
    ) -> Result<(), SignatureError> {
        let session = self.session_mut(digest)?;

        if !session.signers.contains(participant) {
            return Err(SignatureError::NotASigner(*participant, *digest));
        }
        let Some(agg_nonce) = &session.agg_nonce else {
            return Err(SignatureError::NotReady(*digest));
        };

        match session.partial_signatures.get(participant) {
            Some(existing) if *existing == partial_signature => return Ok(()),
            Some(_) => return Err(SignatureError::Conflicting(*participant, *digest)),
            None => {}
        }

        let pub_nonce = session
            .nonces
            .get(participant)
            .ok_or(SignatureError::NotReady(*digest))?;

        musig2::verify_partial_signature(
            &session.signers,
            participant,
            pub_nonce,
            agg_nonce,
            partial_signature,
            *digest,
        )
        .map_err(|_| SignatureError::InvalidSignature(*participant, *digest))?;

        session
            .partial_signatures
            .insert(*participant, partial_signature);

        Ok(())
    }

    /// Combines every signer's verified partial signature. The result is
    /// checked against the digest's aggregate key.
    pub fn aggregate(&self, digest: &TapSighash) -> Result<schnorr::Signature, SignatureError> {
        let session = self.session(digest)?;

        let Some(agg_nonce) = &session.agg_nonce else {
            return Err(SignatureError::Incomplete(
                *digest,
                session.missing_nonces().count().max(1),
            ));
        };

        let missing = session.missing_signatures().count();
        if missing > 0 {
            return Err(SignatureError::Incomplete(*digest, missing));
        }

        let partial_signatures = session
            .signers
            .iter()
            .filter_map(|signer| session.partial_signatures.get(signer).copied())
            .collect();

        musig2::aggregate_partial_signatures(
            &session.signers,
            agg_nonce,
            partial_signatures,
            *digest,
        )
    }

    /// Signers that still owe a nonce for some digest.
    pub fn missing_nonces(&self) -> BTreeSet<PublicKey> {
        self.sessions
            .values()
            .flat_map(|session| session.missing_nonces().copied())
            .collect()
    }

    /// Signers that still owe a partial signature for some digest.
    pub fn missing_signatures(&self) -> BTreeSet<PublicKey> {
        self.sessions
            .values()
            .flat_map(|session| session.missing_signatures().copied())
            .collect()
    }

    pub fn nonces_complete(&self) -> bool {
        self.sessions
            .values()
            .all(|session| session.missing_nonces().next().is_none())
    }

    pub fn signatures_complete(&self) -> bool {
        self.sessions
            .values()
            .all(|session| session.missing_signatures().next().is_none())
    }

    /// Discards every open digest. Later submissions for them fail with
    /// [`SignatureError::Replayed`].
    pub fn retire_all(&mut self) {
        self.retired.extend(self.sessions.drain().map(|(digest, _)| digest));
    }
}
