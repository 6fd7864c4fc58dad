//! # Claim Tree
//!
//! Packs the claims of a round into a tree of taproot outputs rooted at a
//! single funding output.
//!
//! The tree is an arena: leaves occupy indices `0..n` in registration order,
//! internal nodes follow level by level and the root is the last node. Every
//! internal node is spent by its own node transaction, which creates one
//! output per child. A node transaction spends only its node's output, so any
//! path from the root to a leaf can be broadcast without touching siblings.
//!
//! Construction is deterministic: participants rebuild the tree from the
//! published claim list and compare it with the funding transaction.

use crate::builder::script::{CheckSig, SpendableScript};
use crate::builder::transaction::input::SpendableTxIn;
use crate::builder::transaction::output::UnspentTxOut;
use crate::builder::transaction::{
    claim_output_scripts, create_node_txhandler, node_output_scripts, TxHandler, Unsigned,
    NODE_COOPERATIVE_LEAF,
};
use crate::errors::{ArkError, QuorumError, TxError};
use crate::musig2;
use bitcoin::secp256k1::{schnorr, PublicKey};
use bitcoin::{Amount, OutPoint, TapSighash, TapSighashType, Transaction, TxOut, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One claim as the tree sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLeaf {
    pub owner: PublicKey,
    pub value: Amount,
}

/// Parameters every participant needs to rebuild a round's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    pub coordinator: PublicKey,
    pub network: bitcoin::Network,
    /// Maximum number of children of an internal node.
    pub radix: usize,
    /// Absolute height after which the coordinator can sweep the tree.
    pub expiry_height: u32,
    /// Relative timelock of a claim's unilateral exit.
    pub exit_delta: u16,
}

impl TreeParams {
    pub fn coordinator_xonly(&self) -> XOnlyPublicKey {
        self.coordinator.x_only_public_key().0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Value of the node's output.
    pub value: Amount,
    /// Fee of the node transaction spending this node. Zero for leaves.
    pub fee: Amount,
    /// Cooperative signers: coordinator first, then the owners of the
    /// descendant leaves in leaf order.
    pub signers: Vec<PublicKey>,
    /// Set for leaves only.
    pub owner: Option<PublicKey>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTree {
    nodes: Vec<TreeNode>,
    leaf_count: usize,
    fee: Amount,
    params: TreeParams,
}

/// Splits `len` items into `ceil(len / radix)` consecutive groups whose sizes
/// differ by at most one. Larger groups come first.
fn group_sizes(len: usize, radix: usize) -> Vec<usize> {
    let groups = len.div_ceil(radix);
    let (base, extra) = (len / groups, len % groups);

    (0..groups)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Number of internal nodes a tree over `leaves` claims has.
pub fn internal_node_count(leaves: usize, radix: usize) -> usize {
    let radix = radix.max(2);
    let mut level = leaves;
    let mut count = 0;

    while level > 1 || count == 0 {
        level = level.div_ceil(radix);
        count += level;
    }

    count
}

impl ClaimTree {
    /// Builds the tree over `claims` in the given order. `fee` is split
    /// evenly over the internal node transactions, the remainder going to the
    /// root.
    #[tracing::instrument(skip(claims), fields(claims = claims.len()), err)]
    pub fn build(claims: &[ClaimLeaf], fee: Amount, params: TreeParams) -> Result<Self, ArkError> {
        if claims.is_empty() {
            return Err(QuorumError::Underfilled {
                registered: 0,
                minimum: 1,
            }
            .into());
        }
        let radix = params.radix.max(2);

        let mut nodes: Vec<TreeNode> = claims
            .iter()
            .map(|claim| TreeNode {
                parent: None,
                children: vec![],
                value: claim.value,
                fee: Amount::ZERO,
                signers: vec![params.coordinator, claim.owner],
                owner: Some(claim.owner),
            })
            .collect();

        let internal_count = internal_node_count(claims.len(), radix) as u64;
        let per_node_fee = fee.to_sat() / internal_count;
        let root_extra = fee.to_sat() % internal_count;

        let mut level: Vec<usize> = (0..claims.len()).collect();
        while level.len() > 1 || nodes.len() == claims.len() {
            let mut next_level = Vec::new();
            let mut cursor = 0;

            for size in group_sizes(level.len(), radix) {
                let children = level[cursor..cursor + size].to_vec();
                cursor += size;

                let index = nodes.len();
                let mut signers = vec![params.coordinator];
                let mut value = Amount::from_sat(per_node_fee);
                for child in &children {
                    let child_node = &mut nodes[*child];
                    child_node.parent = Some(index);
                    value += child_node.value;
                    signers.extend(child_node.signers.iter().skip(1));
                }

                nodes.push(TreeNode {
                    parent: None,
                    children,
                    value,
                    fee: Amount::from_sat(per_node_fee),
                    signers,
                    owner: None,
                });
                next_level.push(index);
            }

            level = next_level;
        }

        let root = nodes.len() - 1;
        nodes[root].fee += Amount::from_sat(root_extra);
        nodes[root].value += Amount::from_sat(root_extra);

        tracing::debug!(
            "Built claim tree: {} leaves, {} internal nodes, root value {}",
            claims.len(),
            internal_count,
            nodes[root].value
        );

        Ok(ClaimTree {
            nodes,
            leaf_count: claims.len(),
            fee,
            params,
        })
    }

    pub fn params(&self) -> &TreeParams {
        &self.params
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn root(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Result<&TreeNode, TxError> {
        self.nodes.get(index).ok_or(TxError::TxOutputNotFound)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn leaves(&self) -> &[TreeNode] {
        &self.nodes[..self.leaf_count]
    }

    pub fn internal_nodes(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.leaf_count..self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        self.path_to_root(0).len()
    }

    /// Internal nodes from the root down to the leaf's parent.
    pub fn path_to_root(&self, leaf: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(leaf).and_then(|node| node.parent);

        while let Some(index) = cursor {
            path.push(index);
            cursor = self.nodes[index].parent;
        }
        path.reverse();

        path
    }

    /// Position of `index` among its parent's outputs.
    pub fn output_position(&self, index: usize) -> Result<u32, TxError> {
        let parent = self
            .node(index)?
            .parent
            .ok_or(TxError::TxOutputNotFound)?;

        self.nodes[parent]
            .children
            .iter()
            .position(|child| *child == index)
            .map(|pos| pos as u32)
            .ok_or(TxError::TxOutputNotFound)
    }

    /// Taproot scripts of the node's output.
    pub fn output_scripts(&self, index: usize) -> Result<Vec<Arc<dyn SpendableScript>>, ArkError> {
        let node = self.node(index)?;

        Ok(match node.owner {
            Some(owner) => claim_output_scripts(
                owner.x_only_public_key().0,
                self.params.coordinator_xonly(),
                self.params.exit_delta,
            ),
            None => node_output_scripts(
                musig2::aggregate_xonly(&node.signers)?,
                self.params.coordinator_xonly(),
                self.params.expiry_height,
            ),
        })
    }

    pub fn output(&self, index: usize) -> Result<UnspentTxOut, ArkError> {
        Ok(UnspentTxOut::from_scripts(
            self.node(index)?.value,
            self.output_scripts(index)?,
            None,
            self.params.network,
        )?)
    }

    /// The output the funding transaction has to create.
    pub fn root_txout(&self) -> Result<TxOut, ArkError> {
        Ok(self.output(self.root())?.txout().clone())
    }

    pub fn leaf_value_sum(&self) -> Amount {
        self.leaves().iter().map(|leaf| leaf.value).sum()
    }
}

/// A claim tree bound to its funding outpoint, with one node transaction per
/// internal node.
#[derive(Debug, Clone)]
pub struct SignedClaimTree {
    tree: ClaimTree,
    funding_outpoint: OutPoint,
    node_txs: BTreeMap<usize, TxHandler<Unsigned>>,
    signatures: BTreeMap<usize, schnorr::Signature>,
}

impl SignedClaimTree {
    pub fn new(tree: ClaimTree, funding_outpoint: OutPoint) -> Result<Self, ArkError> {
        let root = tree.root();
        let mut node_txs: BTreeMap<usize, TxHandler<Unsigned>> = BTreeMap::new();

        // Parents have larger indices than their children.
        for index in tree.internal_nodes().rev() {
            let node = tree.node(index)?;
            let spent_output = if index == root {
                let output = tree.output(root)?;
                SpendableTxIn::new(
                    funding_outpoint,
                    output.txout().clone(),
                    output.scripts().clone(),
                    output.spendinfo().clone(),
                )
                .map_err(TxError::from)?
            } else {
                let parent = node.parent.ok_or(TxError::TxInputNotFound)?;
                node_txs
                    .get(&parent)
                    .ok_or(TxError::TxInputNotFound)?
                    .get_spendable_output(tree.output_position(index)? as usize)?
            };

            let children = node
                .children
                .iter()
                .map(|child| tree.output(*child))
                .collect::<Result<Vec<_>, _>>()?;

            node_txs.insert(index, create_node_txhandler(index, spent_output, children));
        }

        Ok(SignedClaimTree {
            tree,
            funding_outpoint,
            node_txs,
            signatures: BTreeMap::new(),
        })
    }

    pub fn tree(&self) -> &ClaimTree {
        &self.tree
    }

    pub fn funding_outpoint(&self) -> OutPoint {
        self.funding_outpoint
    }

    pub fn node_tx(&self, index: usize) -> Result<&TxHandler<Unsigned>, TxError> {
        self.node_txs.get(&index).ok_or(TxError::TxInputNotFound)
    }

    /// Digest the node's transaction has to be signed over.
    pub fn sighash(&self, index: usize) -> Result<TapSighash, TxError> {
        self.node_tx(index)?.calculate_script_spend_sighash_indexed(
            0,
            NODE_COOPERATIVE_LEAF,
            TapSighashType::Default,
        )
    }

    /// `(node index, digest, signers)` of every node transaction.
    pub fn digests(&self) -> Result<Vec<(usize, TapSighash, Vec<PublicKey>)>, ArkError> {
        self.tree
            .internal_nodes()
            .map(|index| -> Result<_, ArkError> {
                Ok((
                    index,
                    self.sighash(index)?,
                    self.tree.node(index)?.signers.clone(),
                ))
            })
            .collect()
    }

    /// Outpoint of a claim's output, which identifies the claim.
    pub fn leaf_outpoint(&self, leaf: usize) -> Result<OutPoint, TxError> {
        let parent = self
            .tree
            .node(leaf)?
            .parent
            .ok_or(TxError::TxOutputNotFound)?;

        Ok(OutPoint {
            txid: *self.node_tx(parent)?.get_txid(),
            vout: self.tree.output_position(leaf)?,
        })
    }

    /// Attaches the aggregate signature of a node's cooperative leaf.
    pub fn attach_signature(
        &mut self,
        index: usize,
        signature: schnorr::Signature,
    ) -> Result<(), ArkError> {
        let handler = self
            .node_txs
            .get_mut(&index)
            .ok_or(TxError::TxInputNotFound)?;
        let aggregate_key = musig2::aggregate_xonly(&self.tree.node(index)?.signers)?;
        let witness = CheckSig::new(aggregate_key).generate_script_inputs(&signature);

        handler.set_p2tr_script_spend_witness(&witness.to_vec(), 0, NODE_COOPERATIVE_LEAF)?;
        self.signatures.insert(index, signature);

        Ok(())
    }

    pub fn is_fully_signed(&self) -> bool {
        self.node_txs
            .keys()
            .all(|index| self.signatures.contains_key(index))
    }

    pub fn signatures(&self) -> &BTreeMap<usize, schnorr::Signature> {
        &self.signatures
    }

    /// Fully witnessed node transactions, keyed by node index.
    pub fn signed_transactions(&self) -> Result<BTreeMap<usize, Transaction>, TxError> {
        self.node_txs
            .iter()
            .map(|(index, handler)| -> Result<_, TxError> {
                Ok((*index, handler.clone().promote()?.into_tx()))
            })
            .collect()
    }

    /// Checks that the funding transaction pays the tree root exactly, and
    /// that the node transactions only move value down minus their fees.
    pub fn check_conservation(&self, funding_tx: &Transaction) -> Result<(), ArkError> {
        if funding_tx.compute_txid() != self.funding_outpoint.txid {
            return Err(TxError::ValueNotConserved(format!(
                "funding transaction {} is not the bound one {}",
                funding_tx.compute_txid(),
                self.funding_outpoint.txid
            ))
            .into());
        }

        let root_txout = self.tree.root_txout()?;
        let funded = funding_tx
            .output
            .get(self.funding_outpoint.vout as usize)
            .ok_or(TxError::RootOutputNotFound)?;
        if *funded != root_txout {
            return Err(TxError::RootOutputNotFound.into());
        }

        let expected = self.tree.leaf_value_sum() + self.tree.fee();
        if funded.value != expected {
            return Err(TxError::ValueNotConserved(format!(
                "funding output {} != claims {} + fee {}",
                funded.value,
                self.tree.leaf_value_sum(),
                self.tree.fee()
            ))
            .into());
        }

        let mut fees = Amount::ZERO;
        for (index, handler) in &self.node_txs {
            let node = self.tree.node(*index)?;
            let out: Amount = handler
                .get_cached_tx()
                .output
                .iter()
                .map(|txout| txout.value)
                .sum();
            if out + node.fee != node.value {
                return Err(TxError::ValueNotConserved(format!(
                    "node {index} spends {} but creates {} with fee {}",
                    node.value, out, node.fee
                ))
                .into());
            }
            fees += node.fee;
        }
        if fees != self.tree.fee() {
            return Err(TxError::ValueNotConserved(format!(
                "node fees {fees} != round fee {}",
                self.tree.fee()
            ))
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SECP;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Keypair, SecretKey};
    use bitcoin::Txid;

    fn key(byte: u8) -> PublicKey {
        Keypair::from_secret_key(&SECP, &SecretKey::from_slice(&[byte; 32]).unwrap()).public_key()
    }

    fn params(radix: usize) -> TreeParams {
        TreeParams {
            coordinator: key(100),
            network: bitcoin::Network::Regtest,
            radix,
            expiry_height: 1_000,
            exit_delta: 12,
        }
    }

    fn claims(values: &[u64]) -> Vec<ClaimLeaf> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| ClaimLeaf {
                owner: key(i as u8 + 1),
                value: Amount::from_sat(*value),
            })
            .collect()
    }

    #[test]
    fn three_claims_single_root() {
        let tree = ClaimTree::build(&claims(&[10, 20, 30]), Amount::from_sat(5), params(4)).unwrap();

        assert_eq!(tree.nodes().len(), 4);
        assert_eq!(tree.root(), 3);
        assert_eq!(tree.node(3).unwrap().value, Amount::from_sat(65));
        assert_eq!(tree.node(3).unwrap().children, vec![0, 1, 2]);
        assert_eq!(
            tree.node(3).unwrap().signers,
            vec![key(100), key(1), key(2), key(3)]
        );
        assert_eq!(tree.path_to_root(1), vec![3]);
    }

    #[test]
    fn single_claim_still_has_a_root() {
        let tree = ClaimTree::build(&claims(&[42]), Amount::from_sat(3), params(4)).unwrap();

        assert_eq!(tree.nodes().len(), 2);
        assert_eq!(tree.node(1).unwrap().children, vec![0]);
        assert_eq!(tree.node(1).unwrap().value, Amount::from_sat(45));
    }

    #[test]
    fn groups_are_balanced() {
        assert_eq!(group_sizes(10, 4), vec![4, 3, 3]);
        assert_eq!(group_sizes(5, 4), vec![3, 2]);
        assert_eq!(group_sizes(4, 4), vec![4]);
        assert_eq!(group_sizes(9, 2), vec![2, 2, 2, 2, 1]);
    }

    #[test]
    fn depth_is_logarithmic_and_fees_conserved() {
        let values: Vec<u64> = (1..=20).map(|v| v * 1_000).collect();
        let fee = Amount::from_sat(1_003);
        let tree = ClaimTree::build(&claims(&values), fee, params(4)).unwrap();

        // 20 -> 5 -> 2 -> 1
        assert_eq!(internal_node_count(20, 4), 8);
        assert_eq!(tree.nodes().len(), 28);
        assert_eq!(tree.depth(), 3);

        let root = tree.node(tree.root()).unwrap();
        assert_eq!(root.value, tree.leaf_value_sum() + fee);
        // 1003 = 8 * 125 + 3
        assert_eq!(root.fee, Amount::from_sat(128));
        for index in tree.internal_nodes() {
            let node = tree.node(index).unwrap();
            let children: Amount = node
                .children
                .iter()
                .map(|c| tree.node(*c).unwrap().value)
                .sum();
            assert_eq!(node.value, children + node.fee);
        }
    }

    #[test]
    fn build_is_deterministic() {
        let a = ClaimTree::build(&claims(&[5, 6, 7, 8, 9]), Amount::from_sat(2), params(2)).unwrap();
        let b = ClaimTree::build(&claims(&[5, 6, 7, 8, 9]), Amount::from_sat(2), params(2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.root_txout().unwrap(), b.root_txout().unwrap());

        let reordered =
            ClaimTree::build(&claims(&[6, 5, 7, 8, 9]), Amount::from_sat(2), params(2)).unwrap();
        assert_ne!(a.root_txout().unwrap(), reordered.root_txout().unwrap());
    }

    #[test]
    fn signed_tree_chains_node_transactions() {
        let tree = ClaimTree::build(
            &claims(&[1_000, 2_000, 3_000, 4_000, 5_000]),
            Amount::from_sat(40),
            params(2),
        )
        .unwrap();
        let funding_outpoint = OutPoint::new(Txid::all_zeros(), 0);
        let signed = SignedClaimTree::new(tree.clone(), funding_outpoint).unwrap();

        let root_tx = signed.node_tx(tree.root()).unwrap().get_cached_tx();
        assert_eq!(root_tx.input[0].previous_output, funding_outpoint);

        for index in tree.internal_nodes() {
            let node = tree.node(index).unwrap();
            if let Some(parent) = node.parent {
                let parent_txid = *signed.node_tx(parent).unwrap().get_txid();
                let tx = signed.node_tx(index).unwrap().get_cached_tx();
                assert_eq!(tx.input.len(), 1);
                assert_eq!(tx.input[0].previous_output.txid, parent_txid);
            }
        }

        let digests = signed.digests().unwrap();
        assert_eq!(digests.len(), internal_node_count(5, 2));
        assert!(!signed.is_fully_signed());
        assert!(matches!(
            signed.signed_transactions(),
            Err(TxError::MissingWitnessData)
        ));
    }
}
