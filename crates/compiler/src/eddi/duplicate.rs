//! Per-instruction duplication policy.
//!
//! Data-producing instructions are cloned next to their originals with
//! operands rewired to shadows; operands without shadows are duplicated
//! first, recursively. Side-effecting clones that end up textually
//! identical to their originals are erased again. Terminators are never
//! cloned: their operands are duplicated and the sole instruction reads the
//! shadow stream. Calls either move to a `_dup` callee with doubled
//! arguments, are cloned outright (annotated callees and the memory
//! intrinsics), or get a pointer fix-up sequence after the call.

use aspis_ir::{
    Builder, Callee, Const, FuncId, InstId, InstKind, Module, TypeId, Value, clone_inst_after,
    clone_inst_at,
};

use super::globals::DUP_SUFFIX;
use super::{EddiCtx, checks};
use crate::annotations::Annotation;
use crate::error::PassError;

pub(super) fn duplicate_instruction(
    m: &mut Module,
    ctx: &mut EddiCtx<'_>,
    i: InstId,
) -> Result<(), PassError> {
    if m.inst_is_dead(i) || ctx.processed.contains(&i) || ctx.shadow.contains(Value::Inst(i)) {
        return Ok(());
    }
    ctx.processed.insert(i);

    let kind = m.inst(i).kind.clone();
    match &kind {
        InstKind::Alloca { .. } => {
            if !is_alloca_for_exception_handling(m, i) {
                clone_instr(m, ctx, i);
            }
            Ok(())
        }

        InstKind::Bin(_)
        | InstKind::Cast(_)
        | InstKind::Load { .. }
        | InstKind::Gep { .. }
        | InstKind::Icmp(_)
        | InstKind::Fcmp(_)
        | InstKind::Phi { .. }
        | InstKind::Select
        | InstKind::ExtractValue { .. }
        | InstKind::InsertValue { .. } => {
            let clone = clone_instr(m, ctx, i);
            duplicate_operands(m, ctx, i, Some(clone))
        }

        InstKind::Store { .. } | InstKind::AtomicRmw { .. } | InstKind::CmpXchg => {
            let clone = clone_instr(m, ctx, i);
            duplicate_operands(m, ctx, i, Some(clone))?;
            if ctx.cfg.check_stores {
                checks::add_consistency_checks(m, ctx, i)?;
            }
            // A clone that picked up no shadow dependency carries nothing;
            // retract it so the store stays single.
            if m.inst(clone).operands == m.inst(i).operands {
                m.erase_inst(clone);
                ctx.shadow
                    .retract_to_self(Value::Inst(i), Value::Inst(clone));
            }
            Ok(())
        }

        InstKind::Br { .. }
        | InstKind::CondBr { .. }
        | InstKind::Switch { .. }
        | InstKind::IndirectBr { .. }
        | InstKind::Ret => {
            duplicate_operands(m, ctx, i, None)?;
            rewire_operands_to_shadows(m, ctx, i);
            let multi = m.inst(i).successors().len() > 1;
            let is_ret = matches!(kind, InstKind::Ret);
            if (ctx.cfg.check_branches && multi) || (ctx.cfg.check_returns && is_ret) {
                checks::add_consistency_checks(m, ctx, i)?;
            }
            Ok(())
        }

        InstKind::Call { callee } | InstKind::Invoke { callee, .. } => {
            duplicate_call(m, ctx, i, *callee)
        }

        InstKind::LandingPad { .. } | InstKind::Unreachable => Ok(()),
    }
}

/// Clones `i` next to itself (or into the block's alloca prologue under the
/// sequential layout), names it `<name>_dup` and registers the pair.
fn clone_instr(m: &mut Module, ctx: &mut EddiCtx<'_>, i: InstId) -> InstId {
    let is_alloca = matches!(m.inst(i).kind, InstKind::Alloca { .. });
    let clone = if is_alloca && !ctx.cfg.alternate_memmap {
        let (block, _) = m.inst_pos(i);
        let insts = m.block(block).insts.clone();
        let at = insts
            .iter()
            .position(|&x| {
                let inst = m.inst(x);
                !(inst.is_phi() || matches!(inst.kind, InstKind::Alloca { .. }))
            })
            .unwrap_or(insts.len());
        clone_inst_at(m, i, block, at)
    } else {
        clone_inst_after(m, i)
    };
    if !m.types.is_void(m.inst(i).ty) {
        if let Some(name) = m.inst(i).name.clone() {
            m.inst_mut(clone).name = Some(format!("{name}{DUP_SUFFIX}"));
        }
    }
    ctx.shadow.insert_pair(Value::Inst(i), Value::Inst(clone));
    clone
}

/// Duplicates the operands of `i`, then rewires the clone's operand list to
/// the shadows. Inline constant GEPs are rebuilt over the shadow base.
fn duplicate_operands(
    m: &mut Module,
    ctx: &mut EddiCtx<'_>,
    i: InstId,
    clone: Option<InstId>,
) -> Result<(), PassError> {
    let ops = m.inst(i).operands.clone();
    for (j, op) in ops.into_iter().enumerate() {
        match op {
            Value::Inst(def) => {
                duplicate_instruction(m, ctx, def)?;
            }
            Value::Const(c) => {
                if let Const::Gep {
                    base,
                    source_elem,
                    indices,
                } = m.const_get(c).clone()
                {
                    let base_ptr = match m.const_get(base) {
                        Const::Ref(ptr) => Some(*ptr),
                        _ => None,
                    };
                    if let (Some(clone_id), Some(ptr)) = (clone, base_ptr) {
                        if let Some(sh) = ctx.shadow.shadow(ptr) {
                            if sh != ptr {
                                let new_base = m.const_ref(sh);
                                let rebuilt = m.const_gep(new_base, source_elem, indices);
                                m.inst_mut(clone_id).operands[j] = Value::Const(rebuilt);
                                continue;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        if let Some(clone_id) = clone {
            if let Some(sh) = ctx.shadow.shadow(op) {
                if sh != op {
                    m.inst_mut(clone_id).operands[j] = sh;
                }
            }
        }
    }
    Ok(())
}

/// Terminators are not cloned; the one instruction reads the shadow stream.
fn rewire_operands_to_shadows(m: &mut Module, ctx: &mut EddiCtx<'_>, i: InstId) {
    let ops = m.inst(i).operands.clone();
    for (j, op) in ops.into_iter().enumerate() {
        if let Some(sh) = ctx.shadow.shadow(op) {
            if sh != op {
                m.inst_mut(i).operands[j] = sh;
            }
        }
    }
}

fn duplicate_call(
    m: &mut Module,
    ctx: &mut EddiCtx<'_>,
    i: InstId,
    callee: Callee,
) -> Result<(), PassError> {
    let direct = match callee {
        Callee::Direct(f) => Some(f),
        Callee::Indirect(_) => None,
    };

    let annotated = direct
        .map(|f| strip_dup_variant(m, f))
        .is_some_and(|f| ctx.ann.is(Value::Func(f), Annotation::ToDuplicate));
    let intrinsic = direct.is_some_and(|f| ctx.cfg.is_duplicated_intrinsic(&m.func(f).name));

    if annotated || intrinsic {
        let clone = clone_instr(m, ctx, i);
        duplicate_operands(m, ctx, i, Some(clone))?;
        if ctx.cfg.check_calls {
            checks::add_consistency_checks(m, ctx, i)?;
        }
        return Ok(());
    }

    duplicate_operands(m, ctx, i, None)?;
    if ctx.cfg.check_calls {
        checks::add_consistency_checks(m, ctx, i)?;
    }

    match direct.and_then(|f| find_dup_variant(m, f)) {
        Some(dup) if Some(dup) != direct => rewrite_call_with_doubled_args(m, ctx, i, dup),
        Some(_) => Ok(()),
        None => {
            fix_func_vals_passed_by_reference(m, ctx, i);
            Ok(())
        }
    }
}

/// Redirects the call to the `_dup` callee, passing originals and shadows in
/// the layout the duplicated signature expects.
fn rewrite_call_with_doubled_args(
    m: &mut Module,
    ctx: &mut EddiCtx<'_>,
    i: InstId,
    dup: FuncId,
) -> Result<(), PassError> {
    let ops = m.inst(i).operands.clone();
    let mut args = Vec::with_capacity(ops.len() * 2);
    if ctx.cfg.alternate_memmap {
        for op in &ops {
            args.push(*op);
            args.push(ctx.shadow.shadow_or_self(*op));
        }
    } else {
        args.extend(ops.iter().copied());
        for op in &ops {
            args.push(ctx.shadow.shadow_or_self(*op));
        }
    }

    let dbg = m.inst(i).dbg;
    let ret_ty = m.inst(i).ty;
    let func = m.block(m.inst(i).parent).parent;
    let new_call = match m.inst(i).kind.clone() {
        InstKind::Call { .. } => {
            let mut b = Builder::before(m, i);
            b.set_dbg(dbg);
            b.call(Callee::Direct(dup), ret_ty, args)
        }
        InstKind::Invoke { normal, unwind, .. } => {
            let mut b = Builder::before(m, i);
            b.set_dbg(dbg);
            b.invoke(Callee::Direct(dup), ret_ty, args, normal, unwind)
        }
        other => {
            return Err(PassError::UnsupportedCall {
                func: m.func(func).name.clone(),
                what: format!("{other:?}"),
            });
        }
    };
    m.replace_uses_in(func, Value::Inst(i), Value::Inst(new_call));
    ctx.to_remove.push(i);
    Ok(())
}

/// After a call into code outside the sphere of replication, the callee's
/// writes through original pointers must reach the shadows: load each
/// affected pointee and store it through the shadow pointer.
fn fix_func_vals_passed_by_reference(m: &mut Module, ctx: &mut EddiCtx<'_>, i: InstId) {
    let ops = m.inst(i).operands.clone();
    let mut fixups: Vec<(Value, Value, TypeId)> = Vec::new();
    for op in ops {
        if !op.is_inst() || !m.types.is_pointer(m.value_type(op)) {
            continue;
        }
        let Some(sh) = ctx.shadow.shadow(op) else { continue };
        if sh == op {
            continue;
        }
        let Some(pointee) = pointee_type(m, op) else { continue };
        fixups.push((op, sh, pointee));
    }
    if fixups.is_empty() {
        return;
    }
    let mut b = match m.inst(i).kind.clone() {
        InstKind::Invoke { normal, .. } => Builder::at_first_insertion_point(m, normal),
        _ => Builder::after(m, i),
    };
    for (op, sh, pointee) in fixups {
        let tmp = b.load(pointee, op);
        let st = b.store(Value::Inst(tmp), sh);
        // Self-pairs: synchronization plumbing, not duplicated data.
        ctx.shadow.insert_pair(Value::Inst(tmp), Value::Inst(tmp));
        ctx.shadow.insert_pair(Value::Inst(st), Value::Inst(st));
    }
}

/// The element type behind a pointer, when the pointer names storage whose
/// shape is known. Opaque pointers otherwise leave the fix-up untypeable,
/// and the operand is skipped.
fn pointee_type(m: &Module, v: Value) -> Option<TypeId> {
    match v {
        Value::Inst(i) => match m.inst(i).kind {
            InstKind::Alloca { alloc_ty } => Some(alloc_ty),
            _ => None,
        },
        Value::Global(g) => Some(m.global(g).value_ty),
        _ => None,
    }
}

/// `f`'s duplicated-argument sibling: `<name>_dup`, `<name>_ret_dup`, or
/// `f` itself when it already is one.
fn find_dup_variant(m: &Module, f: FuncId) -> Option<FuncId> {
    let name = &m.func(f).name;
    if name.ends_with(DUP_SUFFIX) {
        return Some(f);
    }
    m.func_by_name(&format!("{name}_dup"))
        .or_else(|| m.func_by_name(&format!("{name}_ret_dup")))
}

/// Inverse of [`find_dup_variant`].
fn strip_dup_variant(m: &Module, f: FuncId) -> FuncId {
    let name = m.func(f).name.clone();
    if !name.ends_with(DUP_SUFFIX) {
        return f;
    }
    name.strip_suffix("_ret_dup")
        .and_then(|base| m.func_by_name(base))
        .or_else(|| name.strip_suffix("_dup").and_then(|base| m.func_by_name(base)))
        .unwrap_or(f)
}

/// C++ exception-handling allocas (stores of a `__cxa_begin_catch` result)
/// stay outside the sphere of replication.
fn is_alloca_for_exception_handling(m: &Module, i: InstId) -> bool {
    let func = m.block(m.inst(i).parent).parent;
    for u in m.users_of_in(func, Value::Inst(i)) {
        if !matches!(m.inst(u).kind, InstKind::Store { .. }) {
            continue;
        }
        if let Value::Inst(stored) = m.inst(u).operands[0] {
            if let Some(Callee::Direct(cf)) = m.inst(stored).callee() {
                if m.func(cf).name == "__cxa_begin_catch" {
                    return true;
                }
            }
        }
    }
    false
}
