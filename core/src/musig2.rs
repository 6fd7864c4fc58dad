//! # MuSig2
//!
//! Helper functions for the MuSig2 signature scheme, wrapping the `musig2`
//! crate. Keys cross the boundary as serialized bytes, so the `bitcoin`
//! crate's secp256k1 version doesn't have to match the one `musig2` uses.
//!
//! Claim tree nodes are spent through a `<aggregate key> OP_CHECKSIG`
//! tapleaf, so no taproot tweak is ever applied to the aggregate key.

use crate::errors::SignatureError;
use crate::utils::SECP;
use ::musig2::secp::{Point, Scalar};
use ::musig2::{KeyAggContext, LiftedSignature};
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{rand::Rng, schnorr, Message, PublicKey};
use bitcoin::{TapSighash, XOnlyPublicKey};

pub use ::musig2::{AggNonce, PartialSignature, PubNonce, SecNonce};

pub type MuSigNoncePair = (SecNonce, PubNonce);

pub fn to_musig_point(pk: &PublicKey) -> Result<Point, SignatureError> {
    Point::from_slice(&pk.serialize()).map_err(|e| SignatureError::KeyAggregation(e.to_string()))
}

fn to_musig_scalar(keypair: &Keypair) -> Result<Scalar, SignatureError> {
    Scalar::from_slice(&keypair.secret_bytes())
        .map_err(|e| SignatureError::Signing(e.to_string()))
}

/// Creates the key aggregation context of `signers`. Order matters: the same
/// set in a different order aggregates to a different key.
pub fn key_agg_context(signers: &[PublicKey]) -> Result<KeyAggContext, SignatureError> {
    let points = signers
        .iter()
        .map(to_musig_point)
        .collect::<Result<Vec<_>, _>>()?;

    KeyAggContext::new(points).map_err(|e| SignatureError::KeyAggregation(e.to_string()))
}

/// Aggregates `signers` into the x-only key committed to in a node's
/// cooperative leaf.
#[tracing::instrument(err(level = tracing::Level::ERROR), ret(level = tracing::Level::TRACE))]
pub fn aggregate_xonly(signers: &[PublicKey]) -> Result<XOnlyPublicKey, SignatureError> {
    let aggregated: Point = key_agg_context(signers)?.aggregated_pubkey();

    XOnlyPublicKey::from_slice(&aggregated.serialize_xonly())
        .map_err(|e| SignatureError::KeyAggregation(e.to_string()))
}

/// Generates a pair of nonces, one secret and one public, bound to a single
/// sighash. Be careful, DO NOT REUSE the secret nonce for another message.
/// It will leak the secret key.
#[tracing::instrument(skip(keypair, rng), err(level = tracing::Level::ERROR))]
pub fn nonce_pair(
    keypair: &Keypair,
    signers: &[PublicKey],
    sighash: TapSighash,
    rng: &mut impl Rng,
) -> Result<MuSigNoncePair, SignatureError> {
    let aggregated: Point = key_agg_context(signers)?.aggregated_pubkey();
    let seed: [u8; 32] = rng.gen();

    let sec_nonce = SecNonce::build(seed)
        .with_seckey(to_musig_scalar(keypair)?)
        .with_message(&sighash.to_byte_array())
        .with_aggregated_pubkey(aggregated)
        .build();
    let pub_nonce = sec_nonce.public_nonce();

    Ok((sec_nonce, pub_nonce))
}

/// Aggregates the public nonces into a single aggregated nonce.
pub fn aggregate_nonces<'a>(pub_nonces: impl IntoIterator<Item = &'a PubNonce>) -> AggNonce {
    AggNonce::sum(pub_nonces)
}

#[tracing::instrument(skip(sec_nonce, keypair), err(level = tracing::Level::ERROR))]
pub fn partial_sign(
    signers: &[PublicKey],
    sec_nonce: SecNonce,
    agg_nonce: &AggNonce,
    keypair: &Keypair,
    sighash: TapSighash,
) -> Result<PartialSignature, SignatureError> {
    let ctx = key_agg_context(signers)?;

    ::musig2::sign_partial(
        &ctx,
        to_musig_scalar(keypair)?,
        sec_nonce,
        agg_nonce,
        sighash.to_byte_array(),
    )
    .map_err(|e| SignatureError::Signing(e.to_string()))
}

/// Verifies one signer's partial signature against their key, their public
/// nonce and the exact sighash.
pub fn verify_partial_signature(
    signers: &[PublicKey],
    signer: &PublicKey,
    pub_nonce: &PubNonce,
    agg_nonce: &AggNonce,
    partial_signature: PartialSignature,
    sighash: TapSighash,
) -> Result<(), SignatureError> {
    let ctx = key_agg_context(signers)?;

    ::musig2::verify_partial(
        &ctx,
        partial_signature,
        agg_nonce,
        to_musig_point(signer)?,
        pub_nonce,
        sighash.to_byte_array(),
    )
    .map_err(|e| SignatureError::Signing(e.to_string()))
}

/// Aggregates the partial signatures into a single final signature and
/// checks it against the aggregate key.
#[tracing::instrument(skip(partial_signatures), err(level = tracing::Level::ERROR))]
pub fn aggregate_partial_signatures(
    signers: &[PublicKey],
    agg_nonce: &AggNonce,
    partial_signatures: Vec<PartialSignature>,
    sighash: TapSighash,
) -> Result<schnorr::Signature, SignatureError> {
    let ctx = key_agg_context(signers)?;

    let lifted: LiftedSignature = ::musig2::aggregate_partial_signatures(
        &ctx,
        agg_nonce,
        partial_signatures,
        sighash.to_byte_array(),
    )
    .map_err(|_| SignatureError::InvalidAggregate(sighash))?;

    let signature = schnorr::Signature::from_slice(&lifted.serialize())
        .map_err(|_| SignatureError::InvalidAggregate(sighash))?;

    SECP.verify_schnorr(
        &signature,
        &Message::from_digest(sighash.to_byte_array()),
        &aggregate_xonly(signers)?,
    )
    .map_err(|_| SignatureError::InvalidAggregate(sighash))?;

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand::thread_rng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        (0..n).map(|_| Keypair::new(&SECP, &mut thread_rng())).collect()
    }

    fn sighash() -> TapSighash {
        TapSighash::from_byte_array(thread_rng().gen())
    }

    #[test]
    fn musig2_three_signers() {
        let kps = keypairs(3);
        let signers: Vec<PublicKey> = kps.iter().map(|kp| kp.public_key()).collect();
        let msg = sighash();

        let nonces: Vec<MuSigNoncePair> = kps
            .iter()
            .map(|kp| nonce_pair(kp, &signers, msg, &mut thread_rng()).unwrap())
            .collect();
        let agg_nonce = aggregate_nonces(nonces.iter().map(|(_, p)| p));

        let partials: Vec<PartialSignature> = kps
            .iter()
            .zip(nonces.clone())
            .map(|(kp, (sec, _))| partial_sign(&signers, sec, &agg_nonce, kp, msg).unwrap())
            .collect();

        for ((kp, (_, pub_nonce)), partial) in kps.iter().zip(&nonces).zip(&partials) {
            verify_partial_signature(
                &signers,
                &kp.public_key(),
                pub_nonce,
                &agg_nonce,
                *partial,
                msg,
            )
            .unwrap();
        }

        let signature = aggregate_partial_signatures(&signers, &agg_nonce, partials, msg).unwrap();
        SECP.verify_schnorr(
            &signature,
            &Message::from_digest(msg.to_byte_array()),
            &aggregate_xonly(&signers).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn partial_signature_bound_to_digest() {
        let kps = keypairs(2);
        let signers: Vec<PublicKey> = kps.iter().map(|kp| kp.public_key()).collect();
        let msg = sighash();
        let other = sighash();

        let nonces: Vec<MuSigNoncePair> = kps
            .iter()
            .map(|kp| nonce_pair(kp, &signers, msg, &mut thread_rng()).unwrap())
            .collect();
        let agg_nonce = aggregate_nonces(nonces.iter().map(|(_, p)| p));
        let partial =
            partial_sign(&signers, nonces[0].0.clone(), &agg_nonce, &kps[0], msg).unwrap();

        assert!(verify_partial_signature(
            &signers,
            &kps[0].public_key(),
            &nonces[0].1,
            &agg_nonce,
            partial,
            other,
        )
        .is_err());
        assert!(verify_partial_signature(
            &signers,
            &kps[1].public_key(),
            &nonces[1].1,
            &agg_nonce,
            partial,
            msg,
        )
        .is_err());
    }

    #[test]
    fn aggregate_key_depends_on_order() {
        let kps = keypairs(2);
        let forward = vec![kps[0].public_key(), kps[1].public_key()];
        let backward = vec![kps[1].public_key(), kps[0].public_key()];

        assert_ne!(
            aggregate_xonly(&forward).unwrap(),
            aggregate_xonly(&backward).unwrap()
        );
    }
}
