//! Control-flow checking, shared machinery.
//!
//! Both algorithms assign each eligible block a compile-time signature `CT`
//! and a previous-value adjustment `SR`, both random in `[1, 2^31 - 1]`,
//! with `CT` and `CT + SR` each unique module-wide. A runtime signature
//! cell is updated on every edge and verified at block entry by a
//! synthesized verification block; mismatches divert to an error block that
//! calls the signature-mismatch handler.

pub mod racfed;
pub mod rasm;

use std::collections::{HashMap, HashSet};

use aspis_ir::{
    BlockId, Builder, Callee, DebugLoc, FuncId, InstId, InstKind, Module, Value,
};
use rand::Rng;
use rand::rngs::StdRng;

use crate::annotations::LinkageMap;
use crate::error::PassError;
use crate::handlers::{SIG_MISMATCH_HANDLER, ensure_handler};

/// Signature constants stay below 2^31 so additive updates have headroom.
pub const SIG_MIN: u32 = 1;
pub const SIG_MAX: u32 = 0x7fff_ffff;

/// Compile-time signatures and adjustments, module-wide.
#[derive(Debug, Clone, Default)]
pub struct SignatureTable {
    pub ct: HashMap<BlockId, u32>,
    pub sr: HashMap<BlockId, u32>,
    used_ct: HashSet<u32>,
    used_sum: HashSet<u32>,
}

impl SignatureTable {
    /// Draws a unique `CT` and an `SR` keeping `CT + SR` unique.
    pub fn assign(&mut self, rng: &mut StdRng, block: BlockId) {
        let ct = loop {
            let candidate = rng.gen_range(SIG_MIN..=SIG_MAX);
            if self.used_ct.insert(candidate) {
                break candidate;
            }
        };
        let sr = loop {
            let candidate = rng.gen_range(SIG_MIN..=SIG_MAX);
            if self.used_sum.insert(ct.wrapping_add(candidate)) {
                break candidate;
            }
        };
        self.ct.insert(block, ct);
        self.sr.insert(block, sr);
    }

    /// Registers an alias block (a verification block standing in front of
    /// `of`) under the same signature requirements.
    pub fn alias(&mut self, alias: BlockId, of: BlockId) {
        if let (Some(ct), Some(sr)) = (self.ct.get(&of).copied(), self.sr.get(&of).copied()) {
            self.ct.insert(alias, ct);
            self.sr.insert(alias, sr);
        }
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.ct.contains_key(&block)
    }

    /// Expected value on entry to `block`, before the `SR` subtraction.
    pub fn entry_sum(&self, block: BlockId) -> Option<u32> {
        let ct = self.ct.get(&block)?;
        let sr = self.sr.get(&block)?;
        Some(ct.wrapping_add(*sr))
    }
}

/// Per-run result, exposed for the invariant tests.
pub struct CfcReport {
    pub table: SignatureTable,
    pub compiled: Vec<String>,
    /// Verification block to the block it protects.
    pub verify_blocks: HashMap<BlockId, BlockId>,
}

/// Interposes a fresh block before `block`: phis move into it, and every
/// predecessor is retargeted to it. Successor phis keep `block` as their
/// incoming edge since control still leaves through it.
pub(crate) fn interpose_verification_block(
    m: &mut Module,
    block: BlockId,
    name: &str,
) -> BlockId {
    let func = m.block(block).parent;
    let preds = m.preds(block);
    let verify = m.insert_block_before(func, block, name);
    while let Some(&first) = m.block(block).insts.first() {
        if !m.inst(first).is_phi() {
            break;
        }
        m.block_mut(block).insts.remove(0);
        m.inst_mut(first).parent = verify;
        let at = m.block(verify).insts.len();
        m.block_mut(verify).insts.insert(at, first);
    }
    for p in preds {
        if let Some(t) = m.terminator(p) {
            m.inst_mut(t).replace_successor(block, verify);
        }
    }
    verify
}

/// Error blocks and handler-generated blocks carry no signature.
pub(crate) fn is_err_block_name(m: &Module, block: BlockId) -> bool {
    m.block(block).name.to_ascii_lowercase().contains("errbb")
}

pub(crate) fn starts_with_landing_pad(m: &Module, block: BlockId) -> bool {
    m.block(block)
        .insts
        .iter()
        .find(|&&i| !m.inst(i).is_phi())
        .is_some_and(|&i| matches!(m.inst(i).kind, InstKind::LandingPad { .. }))
}

/// First debug location found in the function's entry block.
pub(crate) fn entry_debug_loc(m: &Module, f: FuncId) -> Option<DebugLoc> {
    let entry = m.entry(f);
    m.block(entry)
        .insts
        .iter()
        .find_map(|&i| m.inst(i).dbg)
}

/// Appends the function's signature-mismatch error block.
pub(crate) fn create_sig_err_block(
    m: &mut Module,
    f: FuncId,
    linkage: &LinkageMap,
    dbg: Option<DebugLoc>,
) -> Result<BlockId, PassError> {
    let handler = ensure_handler(m, linkage, SIG_MISMATCH_HANDLER)?;
    let err = m.new_block(f, "ErrBB");
    let void = m.tys.void;
    let mut b = Builder::at_end(m, err);
    b.set_dbg(dbg);
    b.call(Callee::Direct(handler), void, vec![]);
    b.unreachable();
    Ok(err)
}

/// Rejects terminators the protectors require lowered away: `indirectbr`
/// always, `switch` beyond two targets.
pub(crate) fn validate_terminators(
    m: &Module,
    fns: &[FuncId],
    pass: &'static str,
) -> Result<(), PassError> {
    for &f in fns {
        for &b in &m.func(f).blocks {
            let Some(t) = m.terminator(b) else { continue };
            match &m.inst(t).kind {
                InstKind::IndirectBr { .. } => {
                    return Err(PassError::MalformedIr {
                        pass,
                        what: format!(
                            "indirectbr in {} requires prior lowering",
                            m.func(f).name
                        ),
                    });
                }
                InstKind::Switch { cases, .. } if cases.len() > 1 => {
                    return Err(PassError::MalformedIr {
                        pass,
                        what: format!(
                            "switch with {} targets in {} requires prior lowering",
                            cases.len() + 1,
                            m.func(f).name
                        ),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// The i1 steering a two-successor terminator, synthesizing the case
/// comparison for two-target switches. Returns the condition and the
/// successors ordered `(on_true, on_false)`.
pub(crate) fn two_way_condition(
    m: &mut Module,
    term: InstId,
) -> Result<(Value, BlockId, BlockId), PassError> {
    match m.inst(term).kind.clone() {
        InstKind::CondBr {
            then_dest,
            else_dest,
        } => Ok((m.inst(term).operands[0], then_dest, else_dest)),
        InstKind::Switch { default, cases } if cases.len() == 1 => {
            let (case_val, case_dest) = cases[0];
            let cond_operand = m.inst(term).operands[0];
            let ty = m.value_type(cond_operand);
            let case_const = Value::Const(m.const_int(ty, case_val));
            let mut b = Builder::before(m, term);
            let eq = b.icmp(aspis_ir::IntPred::Eq, cond_operand, case_const);
            Ok((Value::Inst(eq), case_dest, default))
        }
        other => Err(PassError::MalformedIr {
            pass: "cfc",
            what: format!("no branch condition on {other:?}"),
        }),
    }
}
