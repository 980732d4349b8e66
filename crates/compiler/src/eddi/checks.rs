//! Consistency-check insertion at synchronization points.
//!
//! The checked instruction is hoisted to the head of a fresh block; a
//! verification block interposed before it compares every shadowed operand
//! against its duplicate and branches to the function's error block when
//! any pair disagrees.

use aspis_ir::{
    Builder, FloatPred, FuncId, InstId, InstKind, IntPred, Module, Type, TypeId, Value,
    split_block_before,
};

use super::EddiCtx;
use crate::error::PassError;

enum ComparePlan {
    Scalar {
        original: Value,
        copy: Value,
        float: bool,
    },
    /// Compare what the pointers hold, not the pointers themselves.
    PtrContents {
        original: Value,
        copy: Value,
        elem: TypeId,
    },
    /// Element-wise comparison of a flat array pair.
    Array {
        original: Value,
        copy: Value,
        elem: TypeId,
        len: u64,
    },
}

pub(super) fn add_consistency_checks(
    m: &mut Module,
    ctx: &mut EddiCtx<'_>,
    i: InstId,
) -> Result<(), PassError> {
    split_block_before(m, i);
    let protected = m.inst(i).parent;
    let func = m.block(protected).parent;
    let verify = m.insert_block_before(func, protected, "VerificationBB");
    for p in m.preds(protected) {
        if p == verify {
            continue;
        }
        if let Some(t) = m.terminator(p) {
            m.inst_mut(t).replace_successor(protected, verify);
        }
    }
    for pi in m.block(protected).insts.clone() {
        // The split leaves no phis behind, but a re-entrant check on an
        // already-split block must keep incoming edges consistent.
        if m.inst(pi).is_phi() {
            for p in m.preds(verify) {
                m.inst_mut(pi).phi_replace_incoming_block(p, verify);
            }
        }
    }

    let plans = plan_compares(m, ctx, i, func);

    let dbg = m.inst(i).dbg;
    let i1 = m.tys.i1;
    let mut cmps: Vec<Value> = Vec::new();
    {
        let mut b = Builder::at_end(m, verify);
        if ctx.cfg.debug_enabled {
            b.set_dbg(dbg);
        }
        for plan in plans {
            match plan {
                ComparePlan::Scalar {
                    original,
                    copy,
                    float,
                } => {
                    cmps.push(Value::Inst(emit_cmp(&mut b, original, copy, float)));
                }
                ComparePlan::PtrContents {
                    original,
                    copy,
                    elem,
                } => {
                    let float = b.m.types.is_float(elem);
                    let la = Value::Inst(b.load(elem, original));
                    let lb = Value::Inst(b.load(elem, copy));
                    cmps.push(Value::Inst(emit_cmp(&mut b, la, lb, float)));
                }
                ComparePlan::Array {
                    original,
                    copy,
                    elem,
                    len,
                } => {
                    let is_ptr = b.m.types.is_pointer(elem);
                    let float = b.m.types.is_float(elem);
                    for k in 0..len {
                        let ea = Value::Inst(b.extract_value(elem, original, vec![k as u32]));
                        let eb = Value::Inst(b.extract_value(elem, copy, vec![k as u32]));
                        ctx.shadow.insert_pair(ea, eb);
                        // Pointer elements only matter through their
                        // pointees; freshly extracted ones have none.
                        if !is_ptr {
                            cmps.push(Value::Inst(emit_cmp(&mut b, ea, eb, float)));
                        }
                    }
                }
            }
        }
        let mut acc = match cmps.first() {
            Some(first) => *first,
            None => {
                b.set_dbg(dbg);
                b.br(protected);
                return Ok(());
            }
        };
        for c in &cmps[1..] {
            acc = Value::Inst(b.and(i1, acc, *c));
        }
        b.set_dbg(dbg);
        b.cond_br(acc, protected, ctx.err_block);
    }
    Ok(())
}

fn plan_compares(
    m: &Module,
    ctx: &EddiCtx<'_>,
    i: InstId,
    func: FuncId,
) -> Vec<ComparePlan> {
    let mut plans = Vec::new();
    for op in m.inst(i).operands.clone() {
        let Value::Inst(def) = op else { continue };
        let ty = m.value_type(op);
        // A pointer no reachable store writes through carries no payload
        // worth checking.
        if m.types.is_pointer(ty) && !is_used_by_store(m, def, i) {
            continue;
        }
        let Some(copy) = ctx.shadow.shadow(op) else { continue };
        if copy == op {
            continue;
        }
        if m.types.is_pointer(ty) {
            let chased = ptr_final_value(m, func, op, 0);
            let chased_copy = ptr_final_value(m, func, copy, 0);
            if let (Some((fa, elem)), Some((fb, _))) = (chased, chased_copy) {
                if !m.types.is_pointer(elem) {
                    plans.push(ComparePlan::PtrContents {
                        original: fa,
                        copy: fb,
                        elem,
                    });
                }
            }
        } else if let Type::Array { elem, len } = *m.types.get(ty) {
            if !m.types.is_aggregate(elem) {
                plans.push(ComparePlan::Array {
                    original: op,
                    copy,
                    elem,
                    len,
                });
            }
        } else if !m.types.is_aggregate(ty) && !m.types.is_void(ty) {
            plans.push(ComparePlan::Scalar {
                original: op,
                copy,
                float: m.types.is_float(ty),
            });
        }
    }
    plans
}

fn emit_cmp(b: &mut Builder<'_>, a: Value, c: Value, float: bool) -> InstId {
    if float {
        b.fcmp(FloatPred::Ueq, a, c)
    } else {
        b.icmp(IntPred::Eq, a, c)
    }
}

/// Whether some store other than `user` consumes `def` in a block from
/// which `def`'s block is reachable.
fn is_used_by_store(m: &Module, def: InstId, user: InstId) -> bool {
    let func = m.block(m.inst(def).parent).parent;
    let def_block = m.inst(def).parent;
    for u in m.users_of_in(func, Value::Inst(def)) {
        if u == user || !matches!(m.inst(u).kind, InstKind::Store { .. }) {
            continue;
        }
        if m.reachable_from(m.inst(u).parent).contains(&def_block) {
            return true;
        }
    }
    false
}

/// Follows the store chain behind a pointer to the value it ultimately
/// holds. `store a, b; store b, c` means chasing `c` lands on `b` and the
/// comparison loads through it.
fn ptr_final_value(
    m: &Module,
    func: FuncId,
    v: Value,
    depth: u32,
) -> Option<(Value, TypeId)> {
    if depth > 8 || !m.types.is_pointer(m.value_type(v)) {
        return None;
    }
    for u in m.users_of_in(func, v) {
        if !matches!(m.inst(u).kind, InstKind::Store { .. }) {
            continue;
        }
        if m.inst(u).operands[1] != v {
            continue;
        }
        let stored = m.inst(u).operands[0];
        let stored_ty = m.value_type(stored);
        if m.types.is_pointer(stored_ty) {
            return ptr_final_value(m, func, stored, depth + 1);
        }
        return Some((v, stored_ty));
    }
    None
}
