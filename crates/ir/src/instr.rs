//! Instructions.
//!
//! An instruction owns its opcode-specific payload (`InstKind`), a value
//! operand list, a result type, an optional name and an optional debug
//! location. Branch targets live in the kind, not in the operand list, so
//! operand rewiring (shadow substitution) never touches control flow.

use serde::{Deserialize, Serialize};

use crate::debug::DebugLoc;
use crate::types::TypeId;
use crate::value::{BlockId, FuncId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpToSi,
    SiToFp,
    Bitcast,
    PtrToInt,
    IntToPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloatPred {
    /// Ordered equal.
    Oeq,
    /// Unordered equal: equal or either operand is NaN.
    Ueq,
    One,
    Olt,
    Ogt,
    Ole,
    Oge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    Xchg,
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Call target: statically-known function or a first-class pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Direct(FuncId),
    Indirect(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    /// Stack allocation of `alloc_ty`; result is a pointer.
    Alloca { alloc_ty: TypeId },
    /// Operands: `[ptr]`; result type is the loaded type.
    Load { volatile: bool },
    /// Operands: `[value, ptr]`.
    Store { volatile: bool },
    /// Operands: `[lhs, rhs]`.
    Bin(BinOp),
    /// Operands: `[value]`; result type is the target type.
    Cast(CastOp),
    /// Operands: `[lhs, rhs]`; result is i1.
    Icmp(IntPred),
    /// Operands: `[lhs, rhs]`; result is i1.
    Fcmp(FloatPred),
    /// Operands: `[base, idx...]`; result is a pointer.
    Gep { source_elem: TypeId },
    /// Incoming blocks parallel to the operand list.
    Phi { blocks: Vec<BlockId> },
    /// Operands: `[cond, if_true, if_false]`.
    Select,
    /// Operands: `[aggregate]`.
    ExtractValue { indices: Vec<u32> },
    /// Operands: `[aggregate, element]`.
    InsertValue { indices: Vec<u32> },
    /// Operands are the call arguments.
    Call { callee: Callee },
    /// Terminator. Operands are the call arguments.
    Invoke {
        callee: Callee,
        normal: BlockId,
        unwind: BlockId,
    },
    /// First instruction of an unwind destination.
    LandingPad { cleanup: bool },
    /// Operands: `[ptr, value]`; result is the previous stored value.
    AtomicRmw { op: AtomicOp },
    /// Operands: `[ptr, expected, replacement]`.
    CmpXchg,
    Br { dest: BlockId },
    /// Operands: `[cond]`.
    CondBr {
        then_dest: BlockId,
        else_dest: BlockId,
    },
    /// Operands: `[discriminant]`.
    Switch {
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },
    /// Operands: `[address]`.
    IndirectBr { dests: Vec<BlockId> },
    /// Operands: `[]` for `ret void`, `[value]` otherwise.
    Ret,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    pub ty: TypeId,
    pub operands: Vec<Value>,
    pub parent: BlockId,
    pub name: Option<String>,
    pub dbg: Option<DebugLoc>,
    pub(crate) dead: bool,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::IndirectBr { .. }
                | InstKind::Invoke { .. }
                | InstKind::Ret
                | InstKind::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, InstKind::Call { .. } | InstKind::Invoke { .. })
    }

    pub fn callee(&self) -> Option<Callee> {
        match &self.kind {
            InstKind::Call { callee } | InstKind::Invoke { callee, .. } => Some(*callee),
            _ => None,
        }
    }

    pub fn set_callee(&mut self, callee: Callee) {
        match &mut self.kind {
            InstKind::Call { callee: c } | InstKind::Invoke { callee: c, .. } => *c = callee,
            _ => {}
        }
    }

    /// Successor blocks of a terminator, normal destinations first.
    pub fn successors(&self) -> Vec<BlockId> {
        match &self.kind {
            InstKind::Br { dest } => vec![*dest],
            InstKind::CondBr {
                then_dest,
                else_dest,
            } => vec![*then_dest, *else_dest],
            InstKind::Switch { default, cases } => {
                let mut out = vec![*default];
                out.extend(cases.iter().map(|(_, b)| *b));
                out
            }
            InstKind::IndirectBr { dests } => dests.clone(),
            InstKind::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            _ => Vec::new(),
        }
    }

    /// Rewrites every successor edge equal to `from` so it targets `to`.
    pub fn replace_successor(&mut self, from: BlockId, to: BlockId) {
        let patch = |b: &mut BlockId| {
            if *b == from {
                *b = to;
            }
        };
        match &mut self.kind {
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
            InstKind::IndirectBr { dests } => {
                for b in dests.iter_mut() {
                    patch(b);
                }
            }
            InstKind::Invoke { normal, unwind, .. } => {
                patch(normal);
                patch(unwind);
            }
            _ => {}
        }
    }

    /// Incoming `(value, block)` pairs of a phi.
    pub fn phi_incoming(&self) -> Vec<(Value, BlockId)> {
        match &self.kind {
            InstKind::Phi { blocks } => self
                .operands
                .iter()
                .copied()
                .zip(blocks.iter().copied())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn phi_add_incoming(&mut self, value: Value, block: BlockId) {
        if let InstKind::Phi { blocks } = &mut self.kind {
            self.operands.push(value);
            blocks.push(block);
        }
    }

    /// Rewrites phi incoming-block references from `from` to `to`.
    pub fn phi_replace_incoming_block(&mut self, from: BlockId, to: BlockId) {
        if let InstKind::Phi { blocks } = &mut self.kind {
            for b in blocks.iter_mut() {
                if *b == from {
                    *b = to;
                }
            }
        }
    }
}
