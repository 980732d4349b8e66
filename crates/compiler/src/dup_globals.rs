//! Standalone globals duplication and propagation.
//!
//! Used when hardened code links against functions compiled elsewhere: the
//! EDDI CSV names the functions already transformed; inside everything
//! else, stores into duplicated globals are cloned onto the shadow, loads
//! feeding calls are duplicated and the call moved to its `_dup` sibling,
//! and calls into the transformed set are redirected to the pristine
//! `_original` clones.

use std::collections::BTreeSet;

use aspis_ir::{
    Builder, Callee, GlobalId, InstId, InstKind, METADATA_SECTION, Module, Type, Value,
    clone_inst_after,
};
use tracing::debug;

use crate::annotations::{Annotation, AnnotationIndex};
use crate::compile_set::ORIGINAL_SUFFIX;
use crate::config::HardeningConfig;
use crate::error::PassError;
use crate::persistence::{EDDI_CSV, read_compiled_functions};

pub struct DupGlobalsReport {
    pub duplicated: Vec<(GlobalId, GlobalId)>,
}

pub fn run(m: &mut Module, cfg: &HardeningConfig) -> Result<DupGlobalsReport, PassError> {
    let ann = AnnotationIndex::scan(m);
    let already_compiled: BTreeSet<String> = read_compiled_functions(&cfg.state_dir, EDDI_CSV)?;
    let mut duplicated = Vec::new();

    for g in m.global_ids() {
        if !wants_duplication(m, &ann, g) {
            continue;
        }
        let copy = get_or_create_duplicate(m, cfg, g);
        duplicated.push((g, copy));
        propagate_global(m, cfg, g, copy, &already_compiled);
    }

    restore_original_calls(m, &already_compiled);
    Ok(DupGlobalsReport { duplicated })
}

/// Constants need no shadow and aggregate stores cannot be cloned blindly;
/// `to_duplicate` overrides the shape filter.
fn wants_duplication(m: &Module, ann: &AnnotationIndex, g: GlobalId) -> bool {
    let v = Value::Global(g);
    match ann.get(v) {
        Some(Annotation::Exclude)
        | Some(Annotation::RuntimeSig)
        | Some(Annotation::RunAdjSig) => return false,
        Some(Annotation::ToDuplicate) => return true,
        _ => {}
    }
    let gv = m.global(g);
    if gv.name.ends_with("_dup") || gv.section.as_deref() == Some(METADATA_SECTION) {
        return false;
    }
    !(gv.is_const
        || matches!(
            m.types.get(gv.value_ty),
            Type::Struct { .. } | Type::Array { .. } | Type::Ptr
        ))
}

/// Reuses an existing `<name>_dup` (synchronizing its initializer when it
/// is not externally initialized), otherwise clones the global next to the
/// original.
fn get_or_create_duplicate(m: &mut Module, cfg: &HardeningConfig, g: GlobalId) -> GlobalId {
    let name = m.global(g).name.clone();
    let dup_name = format!("{name}_dup");
    if let Some(existing) = m.global_by_name(&dup_name) {
        let init = m.global(g).init;
        let externally_init = m.global(g).externally_init;
        let copy = m.global_mut(existing);
        if !copy.externally_init {
            copy.init = init;
            copy.externally_init = externally_init;
        }
        return existing;
    }
    let mut copy = m.global(g).clone();
    copy.name = dup_name;
    copy.section = None;
    if !cfg.alternate_memmap && m.global(g).section.is_none() && copy.init.is_none() {
        copy.section = Some(cfg.duplicate_sec.clone());
    }
    debug!(global = %name, "duplicated global (standalone)");
    m.insert_global_before(g, copy)
}

/// Clones stores and call-feeding loads in functions the EDDI CSV does not
/// cover, keeping the shadow global coherent with the original.
fn propagate_global(
    m: &mut Module,
    cfg: &HardeningConfig,
    g: GlobalId,
    copy: GlobalId,
    already_compiled: &BTreeSet<String>,
) {
    let gval = Value::Global(g);
    let cval = Value::Global(copy);
    for user in m.users_of(gval) {
        if m.inst_is_dead(user) {
            continue;
        }
        let func = m.block(m.inst(user).parent).parent;
        if already_compiled.contains(&m.func(func).name) {
            continue;
        }
        match m.inst(user).kind.clone() {
            InstKind::Store { .. } if m.inst(user).operands[1] == gval => {
                let clone = clone_inst_after(m, user);
                m.inst_mut(clone).operands[1] = cval;
            }
            InstKind::Load { .. } => {
                // A loaded value flowing into a call crosses into code that
                // expects both halves.
                let call = m
                    .users_of_in(func, Value::Inst(user))
                    .into_iter()
                    .find(|&u| m.inst(u).is_call());
                if let Some(call) = call {
                    let clone = clone_inst_after(m, user);
                    m.inst_mut(clone).operands[0] = cval;
                    if let Some(name) = m.inst(user).name.clone() {
                        m.inst_mut(clone).name = Some(format!("{name}_dup"));
                    }
                    duplicate_call(m, cfg, call, Value::Inst(user), Value::Inst(clone));
                }
            }
            InstKind::Call { .. } | InstKind::Invoke { .. } => {
                duplicate_call(m, cfg, user, gval, cval);
            }
            _ => {}
        }
    }
}

/// Points `call` at the `_dup` sibling of its callee (doubling the argument
/// list), or fills in the shadow slot when the callee already is a `_dup`.
fn duplicate_call(m: &mut Module, cfg: &HardeningConfig, call: InstId, original: Value, copy: Value) {
    let Some(Callee::Direct(callee)) = m.inst(call).callee() else {
        return;
    };
    let callee_name = m.func(callee).name.clone();
    if callee_name.ends_with("_dup") {
        let ops = m.inst(call).operands.clone();
        let n = ops.len();
        for (idx, op) in ops.into_iter().enumerate() {
            if op != original {
                continue;
            }
            let slot = if cfg.alternate_memmap { idx + 1 } else { idx + n / 2 };
            if slot < n {
                m.inst_mut(call).operands[slot] = copy;
            }
        }
        return;
    }
    let Some(dup_callee) = m.func_by_name(&format!("{callee_name}_dup")) else {
        return;
    };
    let ops = m.inst(call).operands.clone();
    let shadow_of = |op: &Value| if *op == original { copy } else { *op };
    let mut args = Vec::with_capacity(ops.len() * 2);
    if cfg.alternate_memmap {
        for op in &ops {
            args.push(*op);
            args.push(shadow_of(op));
        }
    } else {
        args.extend(ops.iter().copied());
        for op in &ops {
            args.push(shadow_of(op));
        }
    }
    let ret_ty = m.inst(call).ty;
    let dbg = m.inst(call).dbg;
    let func = m.block(m.inst(call).parent).parent;
    let new_call = match m.inst(call).kind.clone() {
        InstKind::Invoke { normal, unwind, .. } => {
            let mut b = Builder::before(m, call);
            b.set_dbg(dbg);
            b.invoke(Callee::Direct(dup_callee), ret_ty, args, normal, unwind)
        }
        _ => {
            let mut b = Builder::before(m, call);
            b.set_dbg(dbg);
            b.call(Callee::Direct(dup_callee), ret_ty, args)
        }
    };
    m.replace_uses_in(func, Value::Inst(call), Value::Inst(new_call));
    m.erase_inst(call);
}

/// Functions outside the compiled set keep the uninstrumented API: their
/// calls into transformed functions go to the `_original` clones.
fn restore_original_calls(m: &mut Module, already_compiled: &BTreeSet<String>) {
    for f in m.func_ids().collect::<Vec<_>>() {
        if m.func(f).is_declaration() || already_compiled.contains(&m.func(f).name) {
            continue;
        }
        for block in m.func(f).blocks.clone() {
            for i in m.block(block).insts.clone() {
                let Some(Callee::Direct(callee)) = m.inst(i).callee() else {
                    continue;
                };
                let name = m.func(callee).name.clone();
                if !already_compiled.contains(&name) {
                    continue;
                }
                if let Some(orig) = m.func_by_name(&format!("{name}{ORIGINAL_SUFFIX}")) {
                    m.inst_mut(i).set_callee(Callee::Direct(orig));
                }
            }
        }
    }
}
