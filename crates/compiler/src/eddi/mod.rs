//! Error Detection by Duplicated Instructions.
//!
//! The pass runs in three strictly-sequenced phases over the module:
//! globals duplication, `_dup` signature cloning, and per-instruction
//! duplication with consistency checks. The original/shadow relation is
//! kept in a symmetric [`ShadowMap`] whose entries are created here and
//! retracted only when a clone proves textually identical to its original.
//!
//! Submodules:
//! - `globals`: module-level storage duplication
//! - `dup_fns`: `_dup` function synthesis with doubled parameter lists
//! - `duplicate`: the per-instruction duplication policy
//! - `checks`: consistency-check insertion at synchronization points

mod checks;
mod dup_fns;
mod duplicate;
mod globals;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use aspis_ir::{
    Builder, Callee, FuncId, InstId, Module, Value, clone_inst_at, find_nearest_debug_loc,
};
use tracing::debug;

use crate::annotations::{AnnotationIndex, LinkageMap};
use crate::compile_set::{archive_originals, eligible_functions};
use crate::config::HardeningConfig;
use crate::error::PassError;
use crate::handlers::{DATA_CORRUPTION_HANDLER, ensure_handler};
use crate::persistence::{EDDI_CSV, persist_compiled_functions, read_compiled_functions};

/// Symmetric original/shadow relation over module values.
///
/// Inserting a pair records both directions; a value participates in at
/// most one pair. A value maps to itself exactly when its side-effecting
/// clone was erased for being textually identical.
#[derive(Debug, Clone, Default)]
pub struct ShadowMap {
    map: BTreeMap<Value, Value>,
}

impl ShadowMap {
    pub fn insert_pair(&mut self, a: Value, b: Value) {
        self.map.insert(a, b);
        self.map.insert(b, a);
    }

    pub fn shadow(&self, v: Value) -> Option<Value> {
        self.map.get(&v).copied()
    }

    /// Shadow of `v`, or `v` itself when it has none.
    pub fn shadow_or_self(&self, v: Value) -> Value {
        self.shadow(v).unwrap_or(v)
    }

    pub fn contains(&self, v: Value) -> bool {
        self.map.contains_key(&v)
    }

    /// Undoes a pair whose clone was erased, leaving the original
    /// self-paired so it is not duplicated again.
    pub fn retract_to_self(&mut self, original: Value, clone: Value) {
        self.map.remove(&original);
        self.map.remove(&clone);
        self.map.insert(original, original);
    }

    pub fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.map.iter().map(|(a, b)| (*a, *b))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Symmetry and type agreement, checked after the pass completes.
    pub fn check_invariants(&self, m: &Module) -> Result<(), PassError> {
        for (a, b) in self.pairs() {
            if self.map.get(&b) != Some(&a) {
                return Err(PassError::ShadowInvariant {
                    what: format!("asymmetric pair for {}", describe(m, a)),
                });
            }
            if m.value_type(a) != m.value_type(b) {
                return Err(PassError::ShadowInvariant {
                    what: format!(
                        "type mismatch between {} and {}",
                        describe(m, a),
                        describe(m, b)
                    ),
                });
            }
        }
        Ok(())
    }
}

fn describe(m: &Module, v: Value) -> String {
    m.value_name(v).unwrap_or_else(|| format!("{v:?}"))
}

pub struct EddiReport {
    pub shadow: ShadowMap,
    pub compiled: Vec<String>,
    pub dup_functions: Vec<FuncId>,
}

/// Per-function working state shared by the duplication submodules.
pub(crate) struct EddiCtx<'a> {
    pub cfg: &'a HardeningConfig,
    pub ann: &'a AnnotationIndex,
    pub shadow: &'a mut ShadowMap,
    pub err_block: aspis_ir::BlockId,
    pub processed: HashSet<InstId>,
    pub to_remove: Vec<InstId>,
}

pub fn run(m: &mut Module, cfg: &HardeningConfig) -> Result<EddiReport, PassError> {
    let ann = AnnotationIndex::scan(m);
    let linkage = LinkageMap::build(m);
    let mut shadow = ShadowMap::default();

    debug!("duplicating globals");
    globals::duplicate_globals(m, &ann, cfg, &mut shadow);

    // Functions persisted by an earlier invocation are already hardened;
    // re-running the pass must not touch them.
    let previously = read_compiled_functions(&cfg.state_dir, EDDI_CSV)?;

    let fn_list: Vec<FuncId> = eligible_functions(m, &ann, &HashSet::new())
        .into_iter()
        .filter(|f| !previously.contains(&m.func(*f).name))
        .collect();
    debug!(count = fn_list.len(), "archiving pristine originals");
    let archive = archive_originals(m, &fn_list);

    let mut dup_fns = HashSet::new();
    for &f in &fn_list {
        dup_fns.insert(dup_fns::create_dup_function(m, f, cfg));
    }

    let mut compiled: BTreeSet<String> = previously;
    let mut leftovers = Vec::new();
    let worklist: Vec<FuncId> = eligible_functions(m, &ann, &archive)
        .into_iter()
        .filter(|f| !compiled.contains(&m.func(*f).name))
        .collect();
    for f in worklist {
        debug!(func = %m.func(f).name, "duplicating instructions");
        compiled.insert(m.func(f).name.clone());
        let mut ctx = EddiCtx {
            cfg,
            ann: &ann,
            shadow: &mut shadow,
            err_block: m.new_block(f, "ErrBB"),
            processed: HashSet::new(),
            to_remove: Vec::new(),
        };
        instrument_function(m, f, &mut ctx, &dup_fns)?;
        let err_block = ctx.err_block;
        leftovers.extend(ctx.to_remove);
        finalize_error_block(m, f, err_block, &linkage)?;
    }

    // Rewritten call sites were only detached logically; drop them now that
    // no check machinery can still be looking at them.
    for i in leftovers {
        if !m.inst_is_dead(i) {
            m.erase_inst(i);
        }
    }

    shadow.check_invariants(m)?;
    persist_compiled_functions(&cfg.state_dir, EDDI_CSV, &compiled)?;

    Ok(EddiReport {
        shadow,
        compiled: compiled.into_iter().collect(),
        dup_functions: dup_fns.into_iter().collect(),
    })
}

fn instrument_function(
    m: &mut Module,
    f: FuncId,
    ctx: &mut EddiCtx<'_>,
    dup_fns: &HashSet<FuncId>,
) -> Result<(), PassError> {
    // Inside a `_dup` function the parameter halves shadow each other;
    // establish those pairs before any instruction is visited so argument
    // uses pick up the shadow slots.
    if dup_fns.contains(&f) {
        let n = m.func(f).params.len();
        let pairs: Vec<(Value, Value)> = if ctx.cfg.alternate_memmap {
            (0..n / 2)
                .map(|i| (Value::Arg(f, 2 * i as u32), Value::Arg(f, (2 * i + 1) as u32)))
                .collect()
        } else {
            (0..n / 2)
                .map(|i| (Value::Arg(f, i as u32), Value::Arg(f, (i + n / 2) as u32)))
                .collect()
        };
        for (orig, copy) in pairs {
            ctx.shadow.insert_pair(orig, copy);
            for user in m.users_of_in(f, orig) {
                duplicate::duplicate_instruction(m, ctx, user)?;
            }
        }
    }

    let worklist: Vec<InstId> = m
        .func(f)
        .blocks
        .clone()
        .into_iter()
        .flat_map(|b| m.block(b).insts.clone())
        .collect();
    for i in worklist {
        if m.inst_is_dead(i) {
            continue;
        }
        duplicate::duplicate_instruction(m, ctx, i)?;
    }
    Ok(())
}

/// Fills the function's error block with the fault-handler call, then clones
/// it per predecessor so every check site carries its own debug location.
fn finalize_error_block(
    m: &mut Module,
    f: FuncId,
    err: aspis_ir::BlockId,
    linkage: &LinkageMap,
) -> Result<(), PassError> {
    let preds = m.preds(err);
    if preds.is_empty() {
        m.erase_block(err);
        return Ok(());
    }
    let handler = ensure_handler(m, linkage, DATA_CORRUPTION_HANDLER)?;
    let void = m.tys.void;
    {
        let mut b = Builder::at_end(m, err);
        b.call(Callee::Direct(handler), void, vec![]);
        b.unreachable();
    }

    let fallback_dbg = m
        .func(f)
        .blocks
        .last()
        .and_then(|b| m.terminator(*b))
        .and_then(|t| find_nearest_debug_loc(m, t));

    for p in preds {
        let Some(t) = m.terminator(p) else { continue };
        let site_dbg = m.inst(t).dbg.or(fallback_dbg);
        let copy = m.insert_block_after(f, p, "ErrBB");
        for (pos, src) in m.block(err).insts.clone().into_iter().enumerate() {
            let ni = clone_inst_at(m, src, copy, pos);
            m.inst_mut(ni).dbg = site_dbg;
        }
        m.inst_mut(t).replace_successor(err, copy);
    }
    m.erase_block(err);
    Ok(())
}
