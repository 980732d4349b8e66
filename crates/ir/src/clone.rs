//! Instruction and function cloning, value remapping, block splitting.

use std::collections::HashMap;

use crate::instr::{Callee, Inst, InstKind};
use crate::module::Module;
use crate::value::{BlockId, FuncId, InstId, Value};

/// Remapping table used while cloning bodies.
pub type ValueMap = HashMap<Value, Value>;

pub fn remap_value(map: &ValueMap, v: Value) -> Value {
    *map.get(&v).unwrap_or(&v)
}

/// Clones `src` (kind, type, operands, name, debug location) into a fresh
/// arena slot without attaching it to any block.
fn clone_inst_detached(m: &mut Module, src: InstId) -> Inst {
    let inst = m.inst(src);
    Inst {
        kind: inst.kind.clone(),
        ty: inst.ty,
        operands: inst.operands.clone(),
        parent: inst.parent,
        name: inst.name.clone(),
        dbg: inst.dbg,
        dead: false,
    }
}

/// Clones `src` and inserts the clone immediately after it.
pub fn clone_inst_after(m: &mut Module, src: InstId) -> InstId {
    let inst = clone_inst_detached(m, src);
    let (block, pos) = m.inst_pos(src);
    m.insert_inst(block, pos + 1, inst)
}

/// Clones `src` and inserts the clone at `(block, at)`.
pub fn clone_inst_at(m: &mut Module, src: InstId, block: BlockId, at: usize) -> InstId {
    let inst = clone_inst_detached(m, src);
    m.insert_inst(block, at, inst)
}

/// Rewrites the operands, phi blocks, successor blocks and indirect callee of
/// `inst` through the given maps.
pub fn remap_inst(
    m: &mut Module,
    inst: InstId,
    vmap: &ValueMap,
    block_map: &HashMap<BlockId, BlockId>,
) {
    let i = m.inst_mut(inst);
    for op in i.operands.iter_mut() {
        if let Some(new) = vmap.get(op) {
            *op = *new;
        }
    }
    if let Some(Callee::Indirect(cv)) = i.callee() {
        if let Some(new) = vmap.get(&cv) {
            i.set_callee(Callee::Indirect(*new));
        }
    }
    let patch = |b: &mut BlockId| {
        if let Some(new) = block_map.get(b) {
            *b = *new;
        }
    };
    match &mut i.kind {
        InstKind::Br { dest } => patch(dest),
        InstKind::CondBr {
            then_dest,
            else_dest,
        } => {
            patch(then_dest);
            patch(else_dest);
        }
        InstKind::Switch { default, cases } => {
            patch(default);
            for (_, b) in cases.iter_mut() {
                patch(b);
            }
        }
        InstKind::IndirectBr { dests } => dests.iter_mut().for_each(patch),
        InstKind::Invoke { normal, unwind, .. } => {
            patch(normal);
            patch(unwind);
        }
        InstKind::Phi { blocks } => blocks.iter_mut().for_each(patch),
        _ => {}
    }
}

/// Clones the body of `src` into `dst` (which must have no blocks yet),
/// remapping values through `arg_map` (typically old-arg to new-arg) plus the
/// freshly-built instruction map. Returns the final value map.
pub fn clone_function_body(m: &mut Module, src: FuncId, dst: FuncId, arg_map: &ValueMap) -> ValueMap {
    debug_assert!(m.func(dst).blocks.is_empty());
    let src_blocks = m.func(src).blocks.clone();

    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    for &b in &src_blocks {
        let name = m.block(b).name.clone();
        let nb = m.new_block(dst, name);
        block_map.insert(b, nb);
    }

    let mut vmap: ValueMap = arg_map.clone();
    let mut cloned: Vec<InstId> = Vec::new();
    for &b in &src_blocks {
        let insts = m.block(b).insts.clone();
        let nb = block_map[&b];
        for i in insts {
            let at = m.block(nb).insts.len();
            let ni = clone_inst_at(m, i, nb, at);
            vmap.insert(Value::Inst(i), Value::Inst(ni));
            cloned.push(ni);
        }
    }
    // Second pass: operands may reference instructions cloned later
    // (phis, back edges), so remap only after the whole body exists.
    for ni in cloned {
        remap_inst(m, ni, &vmap, &block_map);
    }
    vmap
}

/// Splits the block containing `inst` so that `inst` becomes the first
/// instruction of the original block; the instructions before it move into a
/// fresh predecessor, which ends with an unconditional branch to the original
/// block. All former predecessors are retargeted to the new block. Returns
/// the new predecessor.
pub fn split_block_before(m: &mut Module, inst: InstId) -> BlockId {
    debug_assert!(!m.inst(inst).is_phi(), "cannot split before a phi");
    let (block, pos) = m.inst_pos(inst);
    let func = m.block(block).parent;
    let preds = m.preds(block);

    let name = format!("{}.split", m.block(block).name);
    let pred = m.insert_block_before(func, block, name);

    let moved: Vec<InstId> = m.block(block).insts[..pos].to_vec();
    m.block_mut(block).insts.drain(..pos);
    for i in &moved {
        m.inst_mut(*i).parent = pred;
    }
    m.block_mut(pred).insts = moved;

    for p in preds {
        if let Some(t) = m.terminator(p) {
            m.inst_mut(t).replace_successor(block, pred);
        }
    }
    let void = m.tys.void;
    m.push_inst(
        pred,
        Inst {
            kind: InstKind::Br { dest: block },
            ty: void,
            operands: vec![],
            parent: pred,
            name: None,
            dbg: None,
            dead: false,
        },
    );
    pred
}
