//! # Taproot Address Builder
//!
//! Every output the claim tree creates is a script-path-only taproot output:
//! its internal key is the unspendable NUMS point and all spending conditions
//! live in tapleaves.

use crate::builder::script::SpendableScript;
use crate::errors::TxError;
use crate::utils;
use bitcoin::{
    taproot::{TaprootBuilder, TaprootSpendInfo},
    Address, ScriptBuf, XOnlyPublicKey,
};
use std::sync::Arc;

/// Calculates the leaf depths of a balanced taproot tree with `n` leaves.
/// Leaves at the end of the list are one level shallower when `n` is not a
/// power of two.
pub fn calculate_taproot_leaf_depths(n: usize) -> Vec<u8> {
    if n == 0 {
        return vec![];
    }
    if n == 1 {
        return vec![0];
    }

    let m: u8 = ((n - 1).ilog2() + 1) as u8; // m = ceil(log(n))
    let k = 2_usize.pow(m.into()) - n;
    (0..n).map(|i| m - ((i >= n - k) as u8)).collect()
}

/// Creates a taproot address with either key path spend or script spend path
/// addresses. This depends on given arguments.
///
/// # Arguments
///
/// - `scripts`: If empty, script will be key path spend
/// - `internal_key`: If not given, will be defaulted to an unspendable x-only public key
/// - `network`: Bitcoin network
///
/// # Returns
///
/// - [`Address`]: Generated taproot address
/// - [`TaprootSpendInfo`]: Taproot spending information
pub fn create_taproot_address(
    scripts: &[ScriptBuf],
    internal_key: Option<XOnlyPublicKey>,
    network: bitcoin::Network,
) -> Result<(Address, TaprootSpendInfo), TxError> {
    let taproot_builder = calculate_taproot_leaf_depths(scripts.len())
        .into_iter()
        .zip(scripts.iter())
        .try_fold(TaprootBuilder::new(), |acc, (depth, script)| {
            acc.add_leaf(depth, script.clone())
        })
        .map_err(|e| TxError::TaprootBuilderError(e.to_string()))?;

    let internal_key = internal_key.unwrap_or(*utils::UNSPENDABLE_XONLY_PUBKEY);
    let tree_info = taproot_builder
        .finalize(&utils::SECP, internal_key)
        .map_err(|_| TxError::TaprootBuilderError("unfinalizable taproot tree".into()))?;

    let taproot_address = Address::p2tr(
        &utils::SECP,
        internal_key,
        tree_info.merkle_root(),
        network,
    );

    Ok((taproot_address, tree_info))
}

/// Shorthand for [`create_taproot_address`] over typed scripts with the
/// unspendable internal key, returning only the locking script.
pub fn taproot_script_pubkey(
    scripts: &[Arc<dyn SpendableScript>],
    network: bitcoin::Network,
) -> Result<(ScriptBuf, TaprootSpendInfo), TxError> {
    let script_bufs: Vec<ScriptBuf> = scripts.iter().map(|s| s.to_script_buf()).collect();
    let (address, spend_info) = create_taproot_address(&script_bufs, None, network)?;

    Ok((address.script_pubkey(), spend_info))
}
