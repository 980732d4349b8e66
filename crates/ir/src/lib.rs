//! In-memory typed SSA IR.
//!
//! This crate is the host-IR surface the ASPIS hardening passes operate on:
//! modules, functions, basic blocks and instructions stored in arenas and
//! addressed by copyable ids, so whole modules are cheap to clone (the pass
//! pipeline stages every transformation on a clone and commits on success)
//! and serialize (modules cross the CLI boundary as JSON).
//!
//! Design points that matter to the passes:
//!
//! - Pointers are opaque; dereferencing instructions carry element types.
//! - Branch targets live in the instruction kind, not in the operand list,
//!   so operand rewiring never disturbs control flow.
//! - Erased blocks/instructions are tombstoned, keeping ids stable.
//! - There are no use lists; uses are found by scanning, which the
//!   module-sized workloads here never notice.

pub mod attrs;
pub mod builder;
pub mod clone;
pub mod consts;
pub mod debug;
pub mod instr;
pub mod module;
pub mod printer;
pub mod types;
pub mod value;
pub mod verify;

pub use attrs::{FnAttrs, Linkage, MemoryEffects, ParamAttrs, RetAttrs, ThreadLocalMode};
pub use builder::Builder;
pub use clone::{ValueMap, clone_function_body, clone_inst_after, clone_inst_at, split_block_before};
pub use consts::{Const, ConstPool};
pub use debug::{DebugLoc, find_nearest_debug_loc};
pub use instr::{
    AtomicOp, BinOp, Callee, CastOp, FloatPred, Inst, InstKind, IntPred,
};
pub use module::{
    ANNOTATIONS_GLOBAL, Block, Function, GlobalVar, METADATA_SECTION, Module, Param,
};
pub use printer::{inst_string, type_string, value_string};
pub use types::{CommonTypes, Type, TypeId, TypePool};
pub use value::{BlockId, ConstId, FuncId, GlobalId, InstId, Value};
pub use verify::verify_module;
