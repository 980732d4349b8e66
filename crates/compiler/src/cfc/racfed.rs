//! Random Additive Control-Flow Error Detection.
//!
//! On top of the block-entry checks RASM performs, RACFED seeds every block
//! of three or more original instructions with per-instruction random
//! additive updates, so a fault that skips or repeats instructions inside a
//! block also desynchronizes the signature. The runtime signature lives in
//! a module-level cell; protected functions back it up on entry and restore
//! it on return, with a freshly drawn random return value checked before
//! the `ret`.

use std::collections::{BTreeSet, HashMap};

use aspis_ir::{
    BlockId, Builder, FuncId, GlobalVar, InstId, InstKind, IntPred, Linkage, Module, Value,
    split_block_before,
};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tracing::debug;

use super::{
    CfcReport, SIG_MAX, SIG_MIN, SignatureTable, create_sig_err_block, entry_debug_loc,
    interpose_verification_block, is_err_block_name, starts_with_landing_pad, two_way_condition,
    validate_terminators,
};
use crate::annotations::{Annotation, AnnotationIndex, LinkageMap};
use crate::compile_set::eligible_functions;
use crate::config::HardeningConfig;
use crate::error::PassError;
use crate::persistence::{RACFED_CSV, persist_compiled_functions, read_compiled_functions};

const PASS: &str = "racfed-verify";

/// Name of the module-level signature cell when none is annotated.
const SIGNATURE_GLOBAL: &str = "signature";

pub fn run(m: &mut Module, cfg: &HardeningConfig) -> Result<CfcReport, PassError> {
    let ann = AnnotationIndex::scan(m);
    let linkage = LinkageMap::build(m);
    let previously = read_compiled_functions(&cfg.state_dir, RACFED_CSV)?;
    let fns: Vec<FuncId> = eligible_functions(m, &ann, &std::collections::HashSet::new())
        .into_iter()
        .filter(|f| !previously.contains(&m.func(*f).name))
        .collect();
    validate_terminators(m, &fns, PASS)?;

    let sig_cell = signature_cell(m, &ann);
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut table = SignatureTable::default();
    let mut sums: HashMap<BlockId, u64> = HashMap::new();
    let mut verify_map = HashMap::new();
    let mut compiled: BTreeSet<String> = previously;

    for &f in &fns {
        debug!(func = %m.func(f).name, "protecting control flow");
        compiled.insert(m.func(f).name.clone());
        for b in m.func(f).blocks.clone() {
            if !is_err_block_name(m, b) {
                table.assign(&mut rng, b);
            }
        }
        insert_intra_updates(m, f, &table, sig_cell, &mut rng, &mut sums);

        let i64t = m.tys.i64;
        let entry = m.entry(f);
        let is_main = m.func(f).name == "main";
        let entry_ct = table.ct[&entry];
        let ct_c = Value::Const(m.const_int(i64t, entry_ct as u64));
        let mut backup = None;
        {
            let mut b = Builder::at_first_insertion_point(m, entry);
            if !is_main {
                let bk = b.load(i64t, sig_cell);
                b.m.inst_mut(bk).name = Some("backup_run_sig".into());
                backup = Some(bk);
            }
            b.store(ct_c, sig_cell);
        }

        let dbg = entry_debug_loc(m, f);
        let err = create_sig_err_block(m, f, &linkage, dbg)?;

        let blocks: Vec<BlockId> = m
            .func(f)
            .blocks
            .iter()
            .copied()
            .filter(|b| *b != err)
            .collect();
        for block in blocks {
            check_jump_signature(m, f, block, &mut table, sig_cell, err, &mut verify_map);
            let ret_term =
                check_on_return(m, f, block, &table, &sums, sig_cell, err, &mut rng);
            update_before_jump(m, block, &table, &sums, sig_cell)?;
            if let (Some(ret), Some(bk), false) = (ret_term, backup, is_main) {
                Builder::before(m, ret).store(Value::Inst(bk), sig_cell);
            }
        }
    }

    persist_compiled_functions(&cfg.state_dir, RACFED_CSV, &compiled)?;
    Ok(CfcReport {
        table,
        compiled: compiled.into_iter().collect(),
        verify_blocks: verify_map,
    })
}

/// The annotated `runtime_sig` global, or a synthesized `signature` cell.
fn signature_cell(m: &mut Module, ann: &AnnotationIndex) -> Value {
    for g in m.global_ids() {
        if ann.is(Value::Global(g), Annotation::RuntimeSig) {
            return Value::Global(g);
        }
    }
    if let Some(g) = m.global_by_name(SIGNATURE_GLOBAL) {
        return Value::Global(g);
    }
    let i64t = m.tys.i64;
    let zero = m.const_int(i64t, 0);
    let mut gv = GlobalVar::new(SIGNATURE_GLOBAL, i64t);
    gv.linkage = Linkage::External;
    gv.init = Some(zero);
    Value::Global(m.add_global(gv))
}

/// Instructions whose execution the intra-block updates witness.
fn original_instructions(m: &Module, block: BlockId) -> Vec<InstId> {
    m.block(block)
        .insts
        .iter()
        .copied()
        .filter(|&i| {
            let inst = m.inst(i);
            !inst.is_phi()
                && !inst.is_terminator()
                && !matches!(inst.kind, InstKind::LandingPad { .. })
        })
        .collect()
}

fn insert_intra_updates(
    m: &mut Module,
    f: FuncId,
    table: &SignatureTable,
    sig_cell: Value,
    rng: &mut StdRng,
    sums: &mut HashMap<BlockId, u64>,
) {
    let i64t = m.tys.i64;
    for block in m.func(f).blocks.clone() {
        if !table.contains(block) {
            continue;
        }
        let originals = original_instructions(m, block);
        if originals.len() <= 2 {
            continue;
        }
        let mut partial: u64 = 0;
        for i in originals {
            let k = rng.gen_range(SIG_MIN..=SIG_MAX) as u64;
            partial = partial.wrapping_add(k);
            let k_c = Value::Const(m.const_int(i64t, k));
            let mut b = Builder::after(m, i);
            let cur = Value::Inst(b.load(i64t, sig_cell));
            let add = b.add(i64t, cur, k_c);
            b.m.inst_mut(add).name = Some("sig_add".into());
            b.store(Value::Inst(add), sig_cell);
        }
        sums.insert(block, partial);
    }
}

/// Block-entry verification: subtract `SR`, compare against `CT`. Landing
/// pads and data-check verification blocks get the signature overwritten in
/// place instead.
fn check_jump_signature(
    m: &mut Module,
    f: FuncId,
    block: BlockId,
    table: &mut SignatureTable,
    sig_cell: Value,
    err: BlockId,
    verify_map: &mut HashMap<BlockId, BlockId>,
) {
    if block == m.entry(f) || !table.contains(block) {
        return;
    }
    let i64t = m.tys.i64;
    let ct = table.ct[&block];
    let in_place = starts_with_landing_pad(m, block)
        || m.block(block).name.to_ascii_lowercase().contains("verification");
    if in_place {
        if m.block(block).insts.is_empty() {
            return;
        }
        let ct_c = Value::Const(m.const_int(i64t, ct as u64));
        Builder::at_first_insertion_point(m, block).store(ct_c, sig_cell);
        return;
    }
    let sr = table.sr[&block];
    let sr_c = Value::Const(m.const_int(i64t, sr as u64));
    let ct_c = Value::Const(m.const_int(i64t, ct as u64));
    let verify = interpose_verification_block(m, block, "RACFED_Verification_BB");
    let mut b = Builder::at_end(m, verify);
    let cur = b.load(i64t, sig_cell);
    b.m.inst_mut(cur).name = Some("racfed_sig".into());
    let upd = Value::Inst(b.sub(i64t, Value::Inst(cur), sr_c));
    b.store(upd, sig_cell);
    let cmp = Value::Inst(b.icmp(IntPred::Eq, upd, ct_c));
    b.cond_br(cmp, block, err);
    // Predecessors may now branch to the verification block; it answers to
    // the same signature requirements as the block it protects.
    table.alias(verify, block);
    verify_map.insert(verify, block);
}

/// Return check: a freshly drawn random return value `R` with adjustment
/// `(CT + sum) - R`, verified in a control block spliced before the `ret`.
#[allow(clippy::too_many_arguments)]
fn check_on_return(
    m: &mut Module,
    f: FuncId,
    block: BlockId,
    table: &SignatureTable,
    sums: &HashMap<BlockId, u64>,
    sig_cell: Value,
    err: BlockId,
    rng: &mut StdRng,
) -> Option<InstId> {
    let term = m.terminator(block)?;
    if !matches!(m.inst(term).kind, InstKind::Ret) || !table.contains(block) {
        return None;
    }
    let i64t = m.tys.i64;
    let ct = table.ct[&block] as u64;
    let sum = sums.get(&block).copied().unwrap_or(0);
    let r = rng.gen_range(SIG_MIN..=SIG_MAX) as u64;
    let adj = ct.wrapping_add(sum).wrapping_sub(r);

    split_block_before(m, term);
    let control = m.insert_block_before(f, block, "RACFED_ret_verification_BB");
    for p in m.preds(block) {
        if p == control {
            continue;
        }
        if let Some(t) = m.terminator(p) {
            m.inst_mut(t).replace_successor(block, control);
        }
    }
    let adj_c = Value::Const(m.const_int(i64t, adj));
    let r_c = Value::Const(m.const_int(i64t, r));
    let mut b = Builder::at_end(m, control);
    let sig = b.load(i64t, sig_cell);
    b.m.inst_mut(sig).name = Some("checking_sign".into());
    let cmp_val = b.sub(i64t, Value::Inst(sig), adj_c);
    b.m.inst_mut(cmp_val).name = Some("checking_value".into());
    let cmp = Value::Inst(b.icmp(IntPred::Eq, Value::Inst(cmp_val), r_c));
    b.cond_br(cmp, block, err);
    Some(term)
}

/// Edge update: `sig += (CT(dst) + SR(dst)) - (CT(src) + sum(src))`.
fn update_before_jump(
    m: &mut Module,
    block: BlockId,
    table: &SignatureTable,
    sums: &HashMap<BlockId, u64>,
    sig_cell: Value,
) -> Result<(), PassError> {
    let Some(term) = m.terminator(block) else {
        return Ok(());
    };
    if !table.contains(block) {
        return Ok(());
    }
    let i64t = m.tys.i64;
    let source = (table.ct[&block] as u64).wrapping_add(sums.get(&block).copied().unwrap_or(0));
    let adj_for = |dst: BlockId| -> Option<u64> {
        // Unsigned destinations are error paths; leave the signature alone.
        let expected = table.entry_sum(dst)? as u64;
        Some(expected.wrapping_sub(source))
    };

    let successors = match &m.inst(term).kind {
        InstKind::Br { dest } => vec![*dest],
        InstKind::CondBr { .. } | InstKind::Switch { .. } => m.inst(term).successors(),
        InstKind::Invoke { normal, .. } => vec![*normal],
        _ => return Ok(()),
    };

    match successors.len() {
        1 => {
            if let Some(adj) = adj_for(successors[0]) {
                let adj_c = Value::Const(m.const_int(i64t, adj));
                let mut b = Builder::before(m, term);
                let cur = b.load(i64t, sig_cell);
                b.m.inst_mut(cur).name = Some("current".into());
                let new_sig = b.add(i64t, Value::Inst(cur), adj_c);
                b.m.inst_mut(new_sig).name = Some("racfed_newsig".into());
                b.store(Value::Inst(new_sig), sig_cell);
            }
            Ok(())
        }
        2 => {
            let (cond, on_true, on_false) = two_way_condition(m, term)?;
            let adj_t = adj_for(on_true).unwrap_or(0);
            let adj_f = adj_for(on_false).unwrap_or(0);
            let adj_t_c = Value::Const(m.const_int(i64t, adj_t));
            let adj_f_c = Value::Const(m.const_int(i64t, adj_f));
            let mut b = Builder::before(m, term);
            let sel = Value::Inst(b.select(i64t, cond, adj_t_c, adj_f_c));
            let cur = Value::Inst(b.load(i64t, sig_cell));
            let new_sig = b.add(i64t, cur, sel);
            b.m.inst_mut(new_sig).name = Some("racfed_newsig".into());
            b.store(Value::Inst(new_sig), sig_cell);
            Ok(())
        }
        n => Err(PassError::MalformedIr {
            pass: PASS,
            what: format!("terminator with {n} successors survived validation"),
        }),
    }
}
