//! Structural verifier.
//!
//! Checks the invariants the transformation passes rely on and that the
//! test-suite asserts after every pipeline stage. This is not a full IR
//! validator; it targets the properties a broken pass would violate first.

use std::collections::HashSet;

use crate::instr::InstKind;
use crate::module::Module;
use crate::value::{FuncId, Value};

/// Verifies every function body in the module, collecting violations.
pub fn verify_module(m: &Module) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    for f in m.func_ids() {
        verify_function(m, f, &mut errs);
    }
    if errs.is_empty() { Ok(()) } else { Err(errs) }
}

fn verify_function(m: &Module, f: FuncId, errs: &mut Vec<String>) {
    let func = m.func(f);
    if func.is_declaration() {
        return;
    }
    let fname = &func.name;

    let block_set: HashSet<_> = func.blocks.iter().copied().collect();
    let mut inst_set = HashSet::new();
    for &b in &func.blocks {
        if m.block_is_dead(b) {
            errs.push(format!("{fname}: dead block {:?} still listed", b));
        }
        for &i in &m.block(b).insts {
            inst_set.insert(i);
        }
    }

    for &b in &func.blocks {
        let bname = &m.block(b).name;
        let insts = &m.block(b).insts;
        match insts.last() {
            None => errs.push(format!("{fname}/{bname}: empty block")),
            Some(&last) => {
                if !m.inst(last).is_terminator() {
                    errs.push(format!("{fname}/{bname}: missing terminator"));
                }
            }
        }
        let mut past_header = false;
        for (pos, &i) in insts.iter().enumerate() {
            let inst = m.inst(i);
            if inst.dead {
                errs.push(format!("{fname}/{bname}: dead instruction in block"));
            }
            if inst.parent != b {
                errs.push(format!("{fname}/{bname}: instruction with stale parent"));
            }
            if inst.is_terminator() && pos + 1 != insts.len() {
                errs.push(format!("{fname}/{bname}: terminator not last"));
            }
            let is_header =
                inst.is_phi() || matches!(inst.kind, InstKind::LandingPad { .. });
            if is_header && past_header {
                errs.push(format!("{fname}/{bname}: phi after first non-phi"));
            }
            if !is_header {
                past_header = true;
            }

            for &op in &inst.operands {
                match op {
                    Value::Inst(d) => {
                        if m.inst_is_dead(d) {
                            errs.push(format!("{fname}/{bname}: operand references erased instruction"));
                        } else if !inst_set.contains(&d) {
                            errs.push(format!("{fname}/{bname}: operand defined outside function"));
                        }
                    }
                    Value::Arg(af, idx) => {
                        if af != f {
                            errs.push(format!("{fname}/{bname}: argument of another function"));
                        } else if idx as usize >= func.params.len() {
                            errs.push(format!("{fname}/{bname}: argument index out of range"));
                        }
                    }
                    _ => {}
                }
            }

            for s in inst.successors() {
                if !block_set.contains(&s) {
                    errs.push(format!("{fname}/{bname}: branch to foreign block"));
                } else if m.block_is_dead(s) {
                    errs.push(format!("{fname}/{bname}: branch to erased block"));
                }
            }

            match &inst.kind {
                InstKind::Store { .. } => {
                    if inst.operands.len() != 2 {
                        errs.push(format!("{fname}/{bname}: store arity"));
                    } else if !m.types.is_pointer(m.value_type(inst.operands[1])) {
                        errs.push(format!("{fname}/{bname}: store through non-pointer"));
                    }
                }
                InstKind::Load { .. } => {
                    if inst.operands.len() != 1
                        || !m.types.is_pointer(m.value_type(inst.operands[0]))
                    {
                        errs.push(format!("{fname}/{bname}: malformed load"));
                    }
                }
                InstKind::Icmp(_) | InstKind::Fcmp(_) | InstKind::Bin(_) => {
                    if inst.operands.len() == 2 {
                        let a = m.value_type(inst.operands[0]);
                        let b2 = m.value_type(inst.operands[1]);
                        if a != b2 {
                            errs.push(format!(
                                "{fname}/{bname}: mismatched operand types on binary op"
                            ));
                        }
                    } else {
                        errs.push(format!("{fname}/{bname}: binary arity"));
                    }
                }
                InstKind::Phi { blocks } => {
                    if blocks.len() != inst.operands.len() {
                        errs.push(format!("{fname}/{bname}: phi arity"));
                    }
                    let preds: HashSet<_> = m.preds(b).into_iter().collect();
                    for pb in blocks {
                        if !preds.contains(pb) {
                            errs.push(format!(
                                "{fname}/{bname}: phi incoming from non-predecessor {}",
                                m.block(*pb).name
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{FnAttrs, Linkage, MemoryEffects, RetAttrs};
    use crate::builder::Builder;
    use crate::module::Function;

    #[test]
    fn test_missing_terminator_reported() {
        let mut m = Module::new("t");
        let i32t = m.tys.i32;
        let f = m.add_function(Function {
            name: "f".into(),
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
        let bb = m.new_block(f, "entry");
        let c = Value::Const(m.const_i32(0));
        let mut b = Builder::at_end(&mut m, bb);
        b.add(i32t, c, c);
        let errs = verify_module(&m).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("missing terminator")));
    }

    #[test]
    fn test_wellformed_module_passes() {
        let mut m = Module::new("t");
        let i32t = m.tys.i32;
        let f = m.add_function(Function {
            name: "f".into(),
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
        let bb = m.new_block(f, "entry");
        let c = Value::Const(m.const_i32(0));
        let mut b = Builder::at_end(&mut m, bb);
        b.ret(c);
        assert!(verify_module(&m).is_ok());
    }
}
