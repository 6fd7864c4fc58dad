//! # Script Builder
//!
//! Script builder provides the tapscripts used by claim tree outputs.

use bitcoin::secp256k1::schnorr;
use bitcoin::{
    opcodes::all::*,
    script::Builder,
    ScriptBuf, XOnlyPublicKey,
};
use bitcoin::{absolute, Witness};
use std::any::Any;
use std::fmt::Debug;

/// A trait that marks all script types. Each script has a
/// `generate_script_inputs` function that builds the witness stack for it.
/// A `dyn SpendableScript` is cast into a concrete [`ScriptKind`] to generate
/// a witness, the trait object can be used to generate the script_buf.
///
/// When creating a new Script, make sure you add it to the [`ScriptKind`]
/// enum and add a test for it below.
pub trait SpendableScript: Send + Sync + 'static + std::any::Any {
    fn as_any(&self) -> &dyn Any;

    fn kind(&self) -> ScriptKind;

    fn to_script_buf(&self) -> ScriptBuf;
}

impl Debug for dyn SpendableScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpendableScript({})", self.to_script_buf())
    }
}

/// Struct for scripts that only includes a CHECKSIG. Claim tree nodes use it
/// with the MuSig2 aggregate key of the node's signers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSig(pub(crate) XOnlyPublicKey);

impl SpendableScript for CheckSig {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::CheckSig(self)
    }

    fn to_script_buf(&self) -> ScriptBuf {
        Builder::new()
            .push_x_only_key(&self.0)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }
}

impl CheckSig {
    pub fn generate_script_inputs(&self, signature: &schnorr::Signature) -> Witness {
        Witness::from_slice(&[signature.serialize()])
    }

    pub fn new(xonly_pk: XOnlyPublicKey) -> Self {
        Self(xonly_pk)
    }

    pub fn pubkey(&self) -> XOnlyPublicKey {
        self.0
    }
}

/// Struct for scripts that include a relative timelock (by block count) and
/// optionally a CHECKSIG if a pubkey is provided. This is the unilateral exit
/// clause of a claim output.
///
/// ATTENTION: If you want to spend a UTXO using timelock script, the
/// condition is that (`# in the script`) ≤ (`# in the sequence of the tx`)
/// ≤ (`# of blocks mined after UTXO appears on the chain`). For more, see:
///
/// - [BIP-0068](https://github.com/bitcoin/bips/blob/master/bip-0068.mediawiki)
/// - [BIP-0112](https://github.com/bitcoin/bips/blob/master/bip-0112.mediawiki)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelockScript(pub(crate) Option<XOnlyPublicKey>, u16);

impl SpendableScript for TimelockScript {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::TimelockScript(self)
    }

    fn to_script_buf(&self) -> ScriptBuf {
        let script_builder = Builder::new()
            .push_int(self.1 as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);

        if let Some(xonly_pk) = self.0 {
            script_builder
                .push_x_only_key(&xonly_pk)
                .push_opcode(OP_CHECKSIG)
        } else {
            script_builder.push_opcode(OP_PUSHNUM_1)
        }
        .into_script()
    }
}

impl TimelockScript {
    pub fn generate_script_inputs(&self, signature: Option<&schnorr::Signature>) -> Witness {
        match signature {
            Some(sig) => Witness::from_slice(&[sig.serialize()]),
            None => Witness::default(),
        }
    }

    pub fn new(xonly_pk: Option<XOnlyPublicKey>, block_count: u16) -> Self {
        Self(xonly_pk, block_count)
    }

    pub fn block_count(&self) -> u16 {
        self.1
    }
}

/// `<height> OP_CLTV OP_DROP <pk> OP_CHECKSIG`: lets `pk` spend the output
/// once the chain reaches an absolute height. The coordinator uses it to sweep
/// expired claim trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsoluteTimelockScript(pub(crate) XOnlyPublicKey, u32);

impl SpendableScript for AbsoluteTimelockScript {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::AbsoluteTimelockScript(self)
    }

    fn to_script_buf(&self) -> ScriptBuf {
        Builder::new()
            .push_int(self.1 as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.0)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }
}

impl AbsoluteTimelockScript {
    pub fn generate_script_inputs(&self, signature: &schnorr::Signature) -> Witness {
        Witness::from_slice(&[signature.serialize()])
    }

    pub fn new(xonly_pk: XOnlyPublicKey, height: u32) -> Self {
        Self(xonly_pk, height)
    }

    /// Lock time the spending transaction has to carry.
    pub fn lock_time(&self) -> absolute::LockTime {
        absolute::LockTime::from_height(self.1).unwrap_or(absolute::LockTime::ZERO)
    }
}

/// `<owner> OP_CHECKSIGVERIFY <coordinator> OP_CHECKSIG`: the cooperative
/// clause of a claim output, spent by forfeit transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosignScript(pub(crate) XOnlyPublicKey, pub(crate) XOnlyPublicKey);

impl SpendableScript for CosignScript {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::CosignScript(self)
    }

    fn to_script_buf(&self) -> ScriptBuf {
        Builder::new()
            .push_x_only_key(&self.0)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.1)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }
}

impl CosignScript {
    /// The owner's signature is checked first, so it sits on top of the stack.
    pub fn generate_script_inputs(
        &self,
        owner_signature: &schnorr::Signature,
        coordinator_signature: &schnorr::Signature,
    ) -> Witness {
        Witness::from_slice(&[
            coordinator_signature.serialize(),
            owner_signature.serialize(),
        ])
    }

    pub fn new(owner: XOnlyPublicKey, coordinator: XOnlyPublicKey) -> Self {
        Self(owner, coordinator)
    }
}

#[derive(Clone)]
pub enum ScriptKind<'a> {
    CheckSig(&'a CheckSig),
    TimelockScript(&'a TimelockScript),
    AbsoluteTimelockScript(&'a AbsoluteTimelockScript),
    CosignScript(&'a CosignScript),
}

#[cfg(test)]
fn get_script_from_arr<T: SpendableScript>(
    arr: &[std::sync::Arc<dyn SpendableScript>],
) -> Option<(usize, &T)> {
    arr.iter()
        .enumerate()
        .find_map(|(i, x)| x.as_any().downcast_ref::<T>().map(|x| (i, x)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;
    use std::sync::Arc;

    fn dummy_xonly() -> XOnlyPublicKey {
        *utils::UNSPENDABLE_XONLY_PUBKEY
    }

    #[test]
    fn dynamic_casting() {
        let scripts: Vec<Arc<dyn SpendableScript>> = vec![
            Arc::new(CheckSig::new(dummy_xonly())),
            Arc::new(TimelockScript::new(Some(dummy_xonly()), 12)),
            Arc::new(AbsoluteTimelockScript::new(dummy_xonly(), 800)),
            Arc::new(CosignScript::new(dummy_xonly(), dummy_xonly())),
        ];

        assert_eq!(get_script_from_arr::<CheckSig>(&scripts).unwrap().0, 0);
        assert_eq!(get_script_from_arr::<TimelockScript>(&scripts).unwrap().0, 1);
        assert_eq!(
            get_script_from_arr::<AbsoluteTimelockScript>(&scripts).unwrap().0,
            2
        );
        assert_eq!(get_script_from_arr::<CosignScript>(&scripts).unwrap().0, 3);
    }

    #[test]
    fn scriptkind_completeness() {
        let script_variants: Vec<(&str, Arc<dyn SpendableScript>)> = vec![
            ("CheckSig", Arc::new(CheckSig::new(dummy_xonly()))),
            (
                "TimelockScript",
                Arc::new(TimelockScript::new(Some(dummy_xonly()), 15)),
            ),
            (
                "AbsoluteTimelockScript",
                Arc::new(AbsoluteTimelockScript::new(dummy_xonly(), 100)),
            ),
            (
                "CosignScript",
                Arc::new(CosignScript::new(dummy_xonly(), dummy_xonly())),
            ),
        ];

        for (expected, script) in script_variants {
            let kind = script.kind();
            match (expected, kind) {
                ("CheckSig", ScriptKind::CheckSig(_)) => (),
                ("TimelockScript", ScriptKind::TimelockScript(_)) => (),
                ("AbsoluteTimelockScript", ScriptKind::AbsoluteTimelockScript(_)) => (),
                ("CosignScript", ScriptKind::CosignScript(_)) => (),
                (s, _) => panic!("ScriptKind conversion not comprehensive for variant: {}", s),
            }
        }
    }

    #[test]
    fn exit_clause_layout() {
        let script = TimelockScript::new(Some(dummy_xonly()), 12).to_script_buf();
        let instructions: Vec<_> = script.instructions().map(|i| i.unwrap()).collect();

        assert_eq!(instructions.len(), 5);
        assert_eq!(
            instructions[1].opcode(),
            Some(bitcoin::opcodes::all::OP_CSV)
        );
        assert_eq!(
            instructions[4].opcode(),
            Some(bitcoin::opcodes::all::OP_CHECKSIG)
        );
    }

    #[test]
    fn expiry_clause_lock_time() {
        let script = AbsoluteTimelockScript::new(dummy_xonly(), 850);
        assert_eq!(
            script.lock_time(),
            absolute::LockTime::from_height(850).unwrap()
        );
        assert!(script
            .to_script_buf()
            .instructions()
            .any(|i| i.unwrap().opcode() == Some(bitcoin::opcodes::all::OP_CLTV)));
    }
}
