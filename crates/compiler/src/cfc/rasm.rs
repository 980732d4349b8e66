//! Random Additive Signature Monitoring.
//!
//! Per-function stack cells hold the runtime and return signatures. Every
//! edge subtracts `CT(src) - (CT(dst) + SR(dst))` from the runtime cell;
//! conditional branches pick the adjustment with a `select` on the branch
//! condition. Verification blocks subtract `SR` and compare against `CT`;
//! returns are checked against the return-signature cell. The optional
//! inter-procedural mode threads both signatures through annotated globals,
//! saving and restoring them around calls into protected functions.

use std::collections::{BTreeSet, HashMap, HashSet};

use aspis_ir::{
    BlockId, Builder, Callee, FuncId, InstId, InstKind, IntPred, Module, Value,
    split_block_before,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use super::{
    CfcReport, SignatureTable, create_sig_err_block, entry_debug_loc,
    interpose_verification_block, is_err_block_name, starts_with_landing_pad, two_way_condition,
    validate_terminators,
};
use crate::annotations::{Annotation, AnnotationIndex, LinkageMap};
use crate::compile_set::eligible_functions;
use crate::config::HardeningConfig;
use crate::error::PassError;
use crate::persistence::{RASM_CSV, persist_compiled_functions, read_compiled_functions};

/// The front-end initializes both signature globals to this value; the
/// prequel block recognizes it and installs the entry signatures.
const INIT_SIGNATURE: u32 = 0u32.wrapping_sub(0xDEAD);

const PASS: &str = "rasm-verify";

/// Inter-procedural state: the annotated signature globals plus the blocks
/// that were split so a protected call ends them.
struct InterState {
    runtime: Value,
    ret: Value,
    eligible: HashSet<FuncId>,
    /// Call-ending block to `(call, continuation block)`.
    call_bbs: HashMap<BlockId, (InstId, BlockId)>,
    /// Entry blocks captured before any instrumentation.
    entry_map: HashMap<FuncId, BlockId>,
}

pub fn run(m: &mut Module, cfg: &HardeningConfig) -> Result<CfcReport, PassError> {
    let ann = AnnotationIndex::scan(m);
    let linkage = LinkageMap::build(m);
    let previously = read_compiled_functions(&cfg.state_dir, RASM_CSV)?;
    let fns: Vec<FuncId> = eligible_functions(m, &ann, &HashSet::new())
        .into_iter()
        .filter(|f| !previously.contains(&m.func(*f).name))
        .collect();
    validate_terminators(m, &fns, PASS)?;

    let inter = if cfg.intra_function_cfc {
        Some(setup_interprocedural(m, &ann, &fns)?)
    } else {
        None
    };

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut table = SignatureTable::default();
    for &f in &fns {
        for b in m.func(f).blocks.clone() {
            if !is_err_block_name(m, b) {
                table.assign(&mut rng, b);
            }
        }
    }
    let total = table.ct.len() as u32;

    let mut verify_map = HashMap::new();
    let mut compiled: BTreeSet<String> = previously;
    for &f in &fns {
        debug!(func = %m.func(f).name, "protecting control flow");
        compiled.insert(m.func(f).name.clone());
        instrument_function(
            m,
            f,
            &table,
            total,
            &linkage,
            inter.as_ref(),
            &mut verify_map,
        )?;
    }
    persist_compiled_functions(&cfg.state_dir, RASM_CSV, &compiled)?;
    Ok(CfcReport {
        table,
        compiled: compiled.into_iter().collect(),
        verify_blocks: verify_map,
    })
}

fn setup_interprocedural(
    m: &mut Module,
    ann: &AnnotationIndex,
    fns: &[FuncId],
) -> Result<InterState, PassError> {
    let mut runtime = None;
    let mut ret = None;
    for g in m.global_ids() {
        match ann.get(Value::Global(g)) {
            Some(Annotation::RuntimeSig) => runtime = Some(g),
            Some(Annotation::RunAdjSig) => ret = Some(g),
            _ => {}
        }
    }
    let (runtime, ret) = match (runtime, ret) {
        (Some(a), Some(b)) => (Value::Global(a), Value::Global(b)),
        _ => {
            return Err(PassError::MalformedIr {
                pass: PASS,
                what: "inter-procedural mode needs runtime_sig and run_adj_sig globals".into(),
            });
        }
    };

    let eligible: HashSet<FuncId> = fns.iter().copied().collect();
    // Split every protected call out of the middle of its block so the call
    // ends the block and the continuation starts a signed one.
    let mut sites = Vec::new();
    for &callee in fns {
        for site in m.call_sites_of(callee) {
            if matches!(m.inst(site).kind, InstKind::Call { .. }) {
                sites.push(site);
            }
        }
    }
    let mut call_bbs = HashMap::new();
    for site in sites {
        let (block, pos) = m.inst_pos(site);
        let Some(&next) = m.block(block).insts.get(pos + 1) else {
            continue;
        };
        let pred = split_block_before(m, next);
        call_bbs.insert(pred, (site, m.inst(next).parent));
    }
    let entry_map = fns.iter().map(|&f| (f, m.entry(f))).collect();
    Ok(InterState {
        runtime,
        ret,
        eligible,
        call_bbs,
        entry_map,
    })
}

fn instrument_function(
    m: &mut Module,
    f: FuncId,
    table: &SignatureTable,
    total: u32,
    linkage: &LinkageMap,
    inter: Option<&InterState>,
    verify_map: &mut HashMap<BlockId, BlockId>,
) -> Result<(), PassError> {
    let i32t = m.tys.i32;
    let i1 = m.tys.i1;
    let dbg = entry_debug_loc(m, f);
    let entry = m.entry(f);
    let entry_ct = table.ct[&entry];
    let entry_sr = table.sr[&entry];

    let (runtime_cell, ret_cell) = match inter {
        None => {
            // Per-function stack cells, installed at the top of the entry.
            let ct_c = Value::Const(m.const_int(i32t, entry_ct as u64));
            let ret_c = Value::Const(m.const_int(i32t, total.wrapping_add(entry_ct) as u64));
            let mut b = Builder::at_first_insertion_point(m, entry);
            let rt = b.alloca(i32t);
            let rs = b.alloca(i32t);
            b.store(ct_c, Value::Inst(rt));
            b.store(ret_c, Value::Inst(rs));
            b.m.inst_mut(rt).name = Some("runtime_sig".into());
            b.m.inst_mut(rs).name = Some("ret_sig".into());
            (Value::Inst(rt), Value::Inst(rs))
        }
        Some(st) => {
            // Prequel: install entry signatures only when the globals still
            // hold their initialization pattern (i.e. nobody called us).
            let sum_c = Value::Const(m.const_int(i32t, entry_ct.wrapping_add(entry_sr) as u64));
            let ret_c = Value::Const(m.const_int(i32t, total.wrapping_add(entry_ct) as u64));
            let init_c = Value::Const(m.const_int(i32t, INIT_SIGNATURE as u64));
            let prequel = m.insert_block_before(f, entry, "RASM_prequel_BB");
            let mut b = Builder::at_end(m, prequel);
            let sig_v = Value::Inst(b.load(i32t, st.runtime));
            let ret_v = Value::Inst(b.load(i32t, st.ret));
            let cond1 = Value::Inst(b.icmp(IntPred::Eq, sig_v, ret_v));
            let cond2 = Value::Inst(b.icmp(IntPred::Eq, sig_v, init_c));
            let fresh = Value::Inst(b.and(i1, cond1, cond2));
            let new_sig = Value::Inst(b.select(i32t, fresh, sum_c, sig_v));
            let new_ret = Value::Inst(b.select(i32t, fresh, ret_c, ret_v));
            b.store(new_sig, st.runtime);
            b.store(new_ret, st.ret);
            b.br(entry);
            (st.runtime, st.ret)
        }
    };

    let err = create_sig_err_block(m, f, linkage, dbg)?;

    let blocks: Vec<BlockId> = m
        .func(f)
        .blocks
        .iter()
        .copied()
        .filter(|b| table.contains(*b))
        .collect();
    for block in blocks {
        protect_block(
            m, f, block, table, runtime_cell, ret_cell, err, inter, verify_map,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn protect_block(
    m: &mut Module,
    f: FuncId,
    block: BlockId,
    table: &SignatureTable,
    runtime_cell: Value,
    ret_cell: Value,
    err: BlockId,
    inter: Option<&InterState>,
    verify_map: &mut HashMap<BlockId, BlockId>,
) -> Result<(), PassError> {
    let i32t = m.tys.i32;
    let ct = table.ct[&block];
    let sr = table.sr[&block];

    // Entry blocks hold the unconditional initialization instead of a
    // check; landing pads cannot be preceded by a block, so the signature
    // is overwritten in place.
    if block != m.entry(f) {
        if starts_with_landing_pad(m, block) {
            let ct_c = Value::Const(m.const_int(i32t, ct as u64));
            Builder::at_first_insertion_point(m, block).store(ct_c, runtime_cell);
        } else {
            let sr_c = Value::Const(m.const_int(i32t, sr as u64));
            let ct_c = Value::Const(m.const_int(i32t, ct as u64));
            let verify = interpose_verification_block(m, block, "RASM_Verification_BB");
            let mut b = Builder::at_end(m, verify);
            let cur = b.load(i32t, runtime_cell);
            b.m.inst_mut(cur).name = Some("rasm_sig".into());
            let upd = Value::Inst(b.sub(i32t, Value::Inst(cur), sr_c));
            b.store(upd, runtime_cell);
            let cmp = Value::Inst(b.icmp(IntPred::Eq, upd, ct_c));
            b.cond_br(cmp, block, err);
            verify_map.insert(verify, block);
        }
    }

    // A protected call ending this block carries the signature into the
    // callee and parks the return signature for the continuation.
    if let Some(st) = inter {
        if let Some(&(call, cont)) = st.call_bbs.get(&block) {
            if let Some(Callee::Direct(callee)) = m.inst(call).callee() {
                if st.eligible.contains(&callee) && !m.inst_is_dead(call) {
                    let callee_entry = st.entry_map[&callee];
                    let callee_sum = table.entry_sum(callee_entry).unwrap_or(0);
                    let ret_target = table.entry_sum(cont).unwrap_or(0);
                    let callee_c = Value::Const(m.const_int(i32t, callee_sum as u64));
                    let ret_c = Value::Const(m.const_int(i32t, ret_target as u64));
                    let mut b = Builder::before(m, call);
                    let backup = b.load(i32t, st.ret);
                    b.m.inst_mut(backup).name = Some("ret_sig_backup".into());
                    b.store(callee_c, st.runtime);
                    b.store(ret_c, st.ret);
                    b.set_insert_point_after(call);
                    b.store(Value::Inst(backup), st.ret);
                    return Ok(());
                }
            }
        }
    }

    let Some(term) = m.terminator(block) else {
        return Ok(());
    };

    if matches!(m.inst(term).kind, InstKind::Ret) {
        // Interpose the return check between the body and the `ret`.
        split_block_before(m, term);
        let check = m.insert_block_before(f, block, "RASM_ret_Verification_BB");
        for p in m.preds(block) {
            if p == check {
                continue;
            }
            if let Some(t) = m.terminator(p) {
                m.inst_mut(t).replace_successor(block, check);
            }
        }
        let ct_c = Value::Const(m.const_int(i32t, ct as u64));
        let mut b = Builder::at_end(m, check);
        let ret_v = Value::Inst(b.load(i32t, ret_cell));
        let adj = Value::Inst(b.sub(i32t, ct_c, ret_v));
        let cur = Value::Inst(b.load(i32t, runtime_cell));
        let new_sig = Value::Inst(b.sub(i32t, cur, adj));
        b.store(new_sig, runtime_cell);
        let cmp = Value::Inst(b.icmp(IntPred::Eq, new_sig, ret_v));
        b.cond_br(cmp, block, err);
        return Ok(());
    }

    // Ordinary edges: subtract CT(src) - (CT(dst) + SR(dst)) before the
    // terminator. Invoke counts as one-successor; its unwind edge carries
    // no signature guarantee.
    let successors = match &m.inst(term).kind {
        InstKind::Invoke { normal, .. } => vec![*normal],
        _ => m.inst(term).successors(),
    };
    let sig_sum = |m: &Module, verify_map: &HashMap<BlockId, BlockId>, s: BlockId| {
        let real = verify_map.get(&s).copied().unwrap_or(s);
        table.entry_sum(real)
    };
    match successors.len() {
        0 => {}
        1 => {
            // Adjustments toward unsigned blocks (error paths) are skipped;
            // those paths terminate in the handler anyway.
            if let Some(sum) = sig_sum(m, verify_map, successors[0]) {
                let adj = ct.wrapping_sub(sum);
                let adj_c = Value::Const(m.const_int(i32t, adj as u64));
                let mut b = Builder::before(m, term);
                let cur = Value::Inst(b.load(i32t, runtime_cell));
                let new_sig = Value::Inst(b.sub(i32t, cur, adj_c));
                b.store(new_sig, runtime_cell);
            }
        }
        2 => {
            let (cond, on_true, on_false) = two_way_condition(m, term)?;
            let adj_t = sig_sum(m, verify_map, on_true)
                .map(|s| ct.wrapping_sub(s))
                .unwrap_or(0);
            let adj_f = sig_sum(m, verify_map, on_false)
                .map(|s| ct.wrapping_sub(s))
                .unwrap_or(0);
            let adj_t_c = Value::Const(m.const_int(i32t, adj_t as u64));
            let adj_f_c = Value::Const(m.const_int(i32t, adj_f as u64));
            let mut b = Builder::before(m, term);
            let sel = Value::Inst(b.select(i32t, cond, adj_t_c, adj_f_c));
            let cur = Value::Inst(b.load(i32t, runtime_cell));
            let new_sig = Value::Inst(b.sub(i32t, cur, sel));
            b.store(new_sig, runtime_cell);
        }
        n => {
            return Err(PassError::MalformedIr {
                pass: PASS,
                what: format!("terminator with {n} successors survived validation"),
            });
        }
    }
    Ok(())
}
