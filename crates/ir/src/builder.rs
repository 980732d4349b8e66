//! Instruction builder with a movable insertion point.

use crate::debug::DebugLoc;
use crate::instr::{AtomicOp, BinOp, Callee, CastOp, FloatPred, Inst, InstKind, IntPred};
use crate::module::Module;
use crate::types::TypeId;
use crate::value::{BlockId, InstId, Value};

/// Builds instructions at a `(block, index)` insertion point, advancing the
/// point past each created instruction.
pub struct Builder<'m> {
    pub m: &'m mut Module,
    block: BlockId,
    at: usize,
    dbg: Option<DebugLoc>,
}

impl<'m> Builder<'m> {
    /// Insertion point just before `inst`.
    pub fn before(m: &'m mut Module, inst: InstId) -> Self {
        let (block, at) = m.inst_pos(inst);
        Builder {
            m,
            block,
            at,
            dbg: None,
        }
    }

    /// Insertion point just after `inst`.
    pub fn after(m: &'m mut Module, inst: InstId) -> Self {
        let (block, at) = m.inst_pos(inst);
        Builder {
            m,
            block,
            at: at + 1,
            dbg: None,
        }
    }

    pub fn at_end(m: &'m mut Module, block: BlockId) -> Self {
        let at = m.block(block).insts.len();
        Builder {
            m,
            block,
            at,
            dbg: None,
        }
    }

    pub fn at_start(m: &'m mut Module, block: BlockId) -> Self {
        Builder {
            m,
            block,
            at: 0,
            dbg: None,
        }
    }

    /// First insertion point of a block: after phis and landing pads.
    pub fn at_first_insertion_point(m: &'m mut Module, block: BlockId) -> Self {
        let mut at = 0;
        for &i in &m.block(block).insts {
            let inst = m.inst(i);
            if inst.is_phi() || matches!(inst.kind, InstKind::LandingPad { .. }) {
                at += 1;
            } else {
                break;
            }
        }
        Builder {
            m,
            block,
            at,
            dbg: None,
        }
    }

    pub fn set_dbg(&mut self, dbg: Option<DebugLoc>) -> &mut Self {
        self.dbg = dbg;
        self
    }

    pub fn set_insert_point_before(&mut self, inst: InstId) {
        let (block, at) = self.m.inst_pos(inst);
        self.block = block;
        self.at = at;
    }

    pub fn set_insert_point_after(&mut self, inst: InstId) {
        let (block, at) = self.m.inst_pos(inst);
        self.block = block;
        self.at = at + 1;
    }

    pub fn emit(&mut self, kind: InstKind, ty: TypeId, operands: Vec<Value>) -> InstId {
        let inst = Inst {
            kind,
            ty,
            operands,
            parent: self.block,
            name: None,
            dbg: self.dbg,
            dead: false,
        };
        let id = self.m.insert_inst(self.block, self.at, inst);
        self.at += 1;
        id
    }

    pub fn emit_named(
        &mut self,
        kind: InstKind,
        ty: TypeId,
        operands: Vec<Value>,
        name: impl Into<String>,
    ) -> InstId {
        let id = self.emit(kind, ty, operands);
        self.m.inst_mut(id).name = Some(name.into());
        id
    }

    // ---- memory ----

    pub fn alloca(&mut self, alloc_ty: TypeId) -> InstId {
        let ptr = self.m.tys.ptr;
        self.emit(InstKind::Alloca { alloc_ty }, ptr, vec![])
    }

    pub fn load(&mut self, ty: TypeId, ptr: Value) -> InstId {
        self.emit(InstKind::Load { volatile: false }, ty, vec![ptr])
    }

    pub fn load_volatile(&mut self, ty: TypeId, ptr: Value) -> InstId {
        self.emit(InstKind::Load { volatile: true }, ty, vec![ptr])
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Store { volatile: false }, void, vec![value, ptr])
    }

    pub fn store_volatile(&mut self, value: Value, ptr: Value) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Store { volatile: true }, void, vec![value, ptr])
    }

    pub fn gep(&mut self, source_elem: TypeId, base: Value, indices: Vec<Value>) -> InstId {
        let ptr = self.m.tys.ptr;
        let mut ops = vec![base];
        ops.extend(indices);
        self.emit(InstKind::Gep { source_elem }, ptr, ops)
    }

    pub fn atomic_rmw(&mut self, op: AtomicOp, ty: TypeId, ptr: Value, value: Value) -> InstId {
        self.emit(InstKind::AtomicRmw { op }, ty, vec![ptr, value])
    }

    // ---- arithmetic and comparison ----

    pub fn bin(&mut self, op: BinOp, ty: TypeId, lhs: Value, rhs: Value) -> InstId {
        self.emit(InstKind::Bin(op), ty, vec![lhs, rhs])
    }

    pub fn add(&mut self, ty: TypeId, lhs: Value, rhs: Value) -> InstId {
        self.bin(BinOp::Add, ty, lhs, rhs)
    }

    pub fn sub(&mut self, ty: TypeId, lhs: Value, rhs: Value) -> InstId {
        self.bin(BinOp::Sub, ty, lhs, rhs)
    }

    pub fn and(&mut self, ty: TypeId, lhs: Value, rhs: Value) -> InstId {
        self.bin(BinOp::And, ty, lhs, rhs)
    }

    pub fn cast(&mut self, op: CastOp, to: TypeId, value: Value) -> InstId {
        self.emit(InstKind::Cast(op), to, vec![value])
    }

    pub fn icmp(&mut self, pred: IntPred, lhs: Value, rhs: Value) -> InstId {
        let i1 = self.m.tys.i1;
        self.emit(InstKind::Icmp(pred), i1, vec![lhs, rhs])
    }

    pub fn fcmp(&mut self, pred: FloatPred, lhs: Value, rhs: Value) -> InstId {
        let i1 = self.m.tys.i1;
        self.emit(InstKind::Fcmp(pred), i1, vec![lhs, rhs])
    }

    pub fn select(&mut self, ty: TypeId, cond: Value, t: Value, f: Value) -> InstId {
        self.emit(InstKind::Select, ty, vec![cond, t, f])
    }

    pub fn extract_value(&mut self, ty: TypeId, agg: Value, indices: Vec<u32>) -> InstId {
        self.emit(InstKind::ExtractValue { indices }, ty, vec![agg])
    }

    pub fn phi(&mut self, ty: TypeId, incoming: Vec<(Value, BlockId)>) -> InstId {
        let (values, blocks): (Vec<Value>, Vec<BlockId>) = incoming.into_iter().unzip();
        self.emit(InstKind::Phi { blocks }, ty, values)
    }

    // ---- calls ----

    pub fn call(&mut self, callee: Callee, ret_ty: TypeId, args: Vec<Value>) -> InstId {
        self.emit(InstKind::Call { callee }, ret_ty, args)
    }

    pub fn invoke(
        &mut self,
        callee: Callee,
        ret_ty: TypeId,
        args: Vec<Value>,
        normal: BlockId,
        unwind: BlockId,
    ) -> InstId {
        self.emit(
            InstKind::Invoke {
                callee,
                normal,
                unwind,
            },
            ret_ty,
            args,
        )
    }

    // ---- terminators ----

    pub fn br(&mut self, dest: BlockId) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Br { dest }, void, vec![])
    }

    pub fn cond_br(&mut self, cond: Value, then_dest: BlockId, else_dest: BlockId) -> InstId {
        let void = self.m.tys.void;
        self.emit(
            InstKind::CondBr {
                then_dest,
                else_dest,
            },
            void,
            vec![cond],
        )
    }

    pub fn switch(
        &mut self,
        cond: Value,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    ) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Switch { default, cases }, void, vec![cond])
    }

    pub fn ret(&mut self, value: Value) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Ret, void, vec![value])
    }

    pub fn ret_void(&mut self) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Ret, void, vec![])
    }

    pub fn unreachable(&mut self) -> InstId {
        let void = self.m.tys.void;
        self.emit(InstKind::Unreachable, void, vec![])
    }
}
