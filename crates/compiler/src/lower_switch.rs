//! Switch lowering.
//!
//! The control-flow protectors require branch-shaped terminators; this pass
//! expands every `switch` into a chain of equality tests, patching phi
//! incoming edges onto the test block that now feeds them.

use aspis_ir::{
    BlockId, Builder, FuncId, InstId, InstKind, IntPred, Module, Value,
};

use crate::config::HardeningConfig;
use crate::error::PassError;

pub fn run(m: &mut Module, _cfg: &HardeningConfig) -> Result<(), PassError> {
    let fns: Vec<FuncId> = m.func_ids().collect();
    for f in fns {
        for block in m.func(f).blocks.clone() {
            let Some(term) = m.terminator(block) else {
                continue;
            };
            if let InstKind::Switch { default, cases } = m.inst(term).kind.clone() {
                lower_switch(m, f, block, term, default, cases);
            }
        }
    }
    Ok(())
}

fn lower_switch(
    m: &mut Module,
    f: FuncId,
    block: BlockId,
    term: InstId,
    default: BlockId,
    cases: Vec<(u64, BlockId)>,
) {
    let cond = m.inst(term).operands[0];
    let cond_ty = m.value_type(cond);
    let dbg = m.inst(term).dbg;
    let base_name = m.block(block).name.clone();
    m.erase_inst(term);

    if cases.is_empty() {
        let mut b = Builder::at_end(m, block);
        b.set_dbg(dbg);
        b.br(default);
        return;
    }

    // One test block per case; the last test falls through to the default.
    let mut tests = vec![block];
    let mut cur = block;
    for i in 1..cases.len() {
        cur = m.insert_block_after(f, cur, format!("{base_name}.case{i}"));
        tests.push(cur);
    }
    for (i, (value, dest)) in cases.iter().enumerate() {
        let on_false = if i + 1 == cases.len() {
            default
        } else {
            tests[i + 1]
        };
        let case_c = Value::Const(m.const_int(cond_ty, *value));
        let mut b = Builder::at_end(m, tests[i]);
        b.set_dbg(dbg);
        let eq = Value::Inst(b.icmp(IntPred::Eq, cond, case_c));
        b.cond_br(eq, *dest, on_false);
    }

    // Successor phis that named the switch block now receive one entry per
    // test block that actually reaches them.
    let mut targets: Vec<BlockId> = cases.iter().map(|(_, d)| *d).collect();
    targets.push(default);
    targets.sort();
    targets.dedup();
    for target in targets {
        let new_preds: Vec<BlockId> = tests
            .iter()
            .copied()
            .filter(|t| m.succs(*t).contains(&target))
            .collect();
        for pi in m.block(target).insts.clone() {
            if !m.inst(pi).is_phi() {
                break;
            }
            let pairs = m.inst(pi).phi_incoming();
            if !pairs.iter().any(|(_, b)| *b == block) {
                continue;
            }
            let mut values = Vec::new();
            let mut blocks = Vec::new();
            for (v, src) in pairs {
                if src == block {
                    for &t in &new_preds {
                        values.push(v);
                        blocks.push(t);
                    }
                } else {
                    values.push(v);
                    blocks.push(src);
                }
            }
            let inst = m.inst_mut(pi);
            inst.operands = values;
            inst.kind = InstKind::Phi { blocks };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspis_ir::{
        FnAttrs, Function, Linkage, MemoryEffects, RetAttrs, verify_module,
    };

    #[test]
    fn test_switch_becomes_compare_chain() {
        let mut m = Module::new("t");
        let i32t = m.tys.i32;
        let f = m.add_function(Function {
            name: "pick".into(),
            dbg_name: None,
            ret_ty: i32t,
            params: vec![],
            vararg: false,
            linkage: Linkage::External,
            attrs: FnAttrs::default(),
            ret_attrs: RetAttrs::default(),
            mem_effects: MemoryEffects::Unknown,
            blocks: vec![],
        });
        let entry = m.new_block(f, "entry");
        let c0 = m.new_block(f, "case0");
        let c1 = m.new_block(f, "case1");
        let dflt = m.new_block(f, "default");
        let merge = m.new_block(f, "merge");
        let disc = Value::Const(m.const_i32(1));
        Builder::at_end(&mut m, entry).switch(disc, dflt, vec![(0, c0), (1, c1)]);
        for b in [c0, c1, dflt] {
            Builder::at_end(&mut m, b).br(merge);
        }
        let hundred = Value::Const(m.const_i32(100));
        let two_hundred = Value::Const(m.const_i32(200));
        let zero = Value::Const(m.const_i32(0));
        let mut b = Builder::at_end(&mut m, merge);
        let phi = b.phi(i32t, vec![(hundred, c0), (two_hundred, c1), (zero, dflt)]);
        b.ret(Value::Inst(phi));

        run(&mut m, &HardeningConfig::default()).unwrap();
        verify_module(&m).unwrap();
        // no switches remain
        for blk in m.func(f).blocks.clone() {
            let t = m.terminator(blk).unwrap();
            assert!(!matches!(m.inst(t).kind, InstKind::Switch { .. }));
        }
    }
}
