//! Module, function, block and global-variable containers.
//!
//! Everything lives in arenas owned by the [`Module`]; handles are plain
//! indices, so the whole IR is `Clone` and serializable. Erased blocks and
//! instructions are tombstoned rather than reclaimed, which keeps every
//! outstanding id valid for the lifetime of the module.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::attrs::{FnAttrs, Linkage, MemoryEffects, ParamAttrs, RetAttrs, ThreadLocalMode};
use crate::consts::{Const, ConstPool};
use crate::instr::{Callee, Inst};
use crate::types::{CommonTypes, Type, TypeId, TypePool};
use crate::value::{BlockId, ConstId, FuncId, GlobalId, InstId, Value};

/// Name of the well-known annotation global.
pub const ANNOTATIONS_GLOBAL: &str = "llvm.global.annotations";
/// Section name that marks metadata globals.
pub const METADATA_SECTION: &str = "llvm.metadata";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
    pub attrs: ParamAttrs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Source-level name from the debug subprogram, when distinct from the
    /// symbol name.
    pub dbg_name: Option<String>,
    pub ret_ty: TypeId,
    pub params: Vec<Param>,
    pub vararg: bool,
    pub linkage: Linkage,
    pub attrs: FnAttrs,
    pub ret_attrs: RetAttrs,
    pub mem_effects: MemoryEffects,
    /// Blocks in layout order; the first is the entry.
    pub blocks: Vec<BlockId>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub parent: FuncId,
    pub insts: Vec<InstId>,
    pub(crate) dead: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVar {
    pub name: String,
    pub value_ty: TypeId,
    pub is_const: bool,
    pub linkage: Linkage,
    pub init: Option<ConstId>,
    pub section: Option<String>,
    pub align: Option<u32>,
    pub thread_local: ThreadLocalMode,
    pub addr_space: u32,
    pub dso_local: bool,
    pub externally_init: bool,
}

impl GlobalVar {
    /// A plain module-internal variable of the given type, no initializer.
    pub fn new(name: impl Into<String>, value_ty: TypeId) -> Self {
        GlobalVar {
            name: name.into(),
            value_ty,
            is_const: false,
            linkage: Linkage::Internal,
            init: None,
            section: None,
            align: None,
            thread_local: ThreadLocalMode::NotThreadLocal,
            addr_space: 0,
            dso_local: true,
            externally_init: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub types: TypePool,
    pub tys: CommonTypes,
    pub consts: ConstPool,
    funcs: Vec<Function>,
    global_storage: Vec<GlobalVar>,
    /// Layout order of globals; insertion position is meaningful for the
    /// duplicated-data memory maps.
    global_order: Vec<GlobalId>,
    blocks: Vec<Block>,
    insts: Vec<Inst>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        let mut types = TypePool::default();
        let tys = CommonTypes::build(&mut types);
        Module {
            name: name.into(),
            types,
            tys,
            consts: ConstPool::default(),
            funcs: Vec::new(),
            global_storage: Vec::new(),
            global_order: Vec::new(),
            blocks: Vec::new(),
            insts: Vec::new(),
        }
    }

    // ---- types ----

    pub fn intern_type(&mut self, ty: Type) -> TypeId {
        self.types.intern(ty)
    }

    pub fn array_type(&mut self, elem: TypeId, len: u64) -> TypeId {
        self.types.intern(Type::Array { elem, len })
    }

    pub fn struct_type(&mut self, fields: Vec<TypeId>) -> TypeId {
        self.types.intern(Type::Struct { fields })
    }

    // ---- constants ----

    pub fn const_int(&mut self, ty: TypeId, value: u64) -> ConstId {
        self.consts.intern(Const::Int { ty, value })
    }

    pub fn const_i32(&mut self, value: i64) -> ConstId {
        let ty = self.tys.i32;
        self.const_int(ty, value as u32 as u64)
    }

    pub fn const_i64(&mut self, value: i64) -> ConstId {
        let ty = self.tys.i64;
        self.const_int(ty, value as u64)
    }

    pub fn const_bool(&mut self, value: bool) -> ConstId {
        let ty = self.tys.i1;
        self.const_int(ty, value as u64)
    }

    pub fn const_f64(&mut self, value: f64) -> ConstId {
        let ty = self.tys.f64;
        self.consts.intern(Const::Float {
            ty,
            bits: value.to_bits(),
        })
    }

    pub fn const_null(&mut self) -> ConstId {
        self.consts.intern(Const::Null)
    }

    pub fn const_undef(&mut self, ty: TypeId) -> ConstId {
        self.consts.intern(Const::Undef(ty))
    }

    pub fn const_bytes(&mut self, data: Vec<u8>) -> ConstId {
        let i8t = self.tys.i8;
        let ty = self.array_type(i8t, data.len() as u64);
        self.consts.intern(Const::Bytes { ty, data })
    }

    pub fn const_array(&mut self, elem: TypeId, elems: Vec<ConstId>) -> ConstId {
        let ty = self.array_type(elem, elems.len() as u64);
        self.consts.intern(Const::Array { ty, elems })
    }

    pub fn const_struct(&mut self, fields: Vec<ConstId>) -> ConstId {
        let field_tys: Vec<TypeId> = fields.iter().map(|f| self.const_type(*f)).collect();
        let ty = self.struct_type(field_tys);
        self.consts.intern(Const::Struct { ty, fields })
    }

    pub fn const_ref(&mut self, v: Value) -> ConstId {
        self.consts.intern(Const::Ref(v))
    }

    pub fn const_gep(&mut self, base: ConstId, source_elem: TypeId, indices: Vec<u64>) -> ConstId {
        self.consts.intern(Const::Gep {
            base,
            source_elem,
            indices,
        })
    }

    pub fn const_get(&self, id: ConstId) -> &Const {
        self.consts.get(id)
    }

    pub fn const_type(&self, id: ConstId) -> TypeId {
        match self.consts.get(id) {
            Const::Int { ty, .. }
            | Const::Float { ty, .. }
            | Const::Bytes { ty, .. }
            | Const::Array { ty, .. }
            | Const::Struct { ty, .. } => *ty,
            Const::Undef(ty) => *ty,
            Const::Null | Const::Ref(_) | Const::Gep { .. } => self.tys.ptr,
        }
    }

    // ---- functions ----

    pub fn add_function(&mut self, f: Function) -> FuncId {
        self.funcs.push(f);
        FuncId((self.funcs.len() - 1) as u32)
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.index()]
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> + use<> {
        (0..self.funcs.len() as u32).map(FuncId)
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn entry(&self, f: FuncId) -> BlockId {
        self.func(f).blocks[0]
    }

    // ---- globals ----

    pub fn add_global(&mut self, g: GlobalVar) -> GlobalId {
        let id = GlobalId(self.global_storage.len() as u32);
        self.global_storage.push(g);
        self.global_order.push(id);
        id
    }

    /// Inserts a global immediately before `before` in layout order.
    pub fn insert_global_before(&mut self, before: GlobalId, g: GlobalVar) -> GlobalId {
        let id = GlobalId(self.global_storage.len() as u32);
        self.global_storage.push(g);
        let pos = self
            .global_order
            .iter()
            .position(|x| *x == before)
            .unwrap_or(0);
        self.global_order.insert(pos, id);
        id
    }

    /// Inserts a global before every other global in layout order.
    pub fn insert_global_first(&mut self, g: GlobalVar) -> GlobalId {
        let id = GlobalId(self.global_storage.len() as u32);
        self.global_storage.push(g);
        self.global_order.insert(0, id);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.global_storage[id.index()]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVar {
        &mut self.global_storage[id.index()]
    }

    pub fn global_ids(&self) -> Vec<GlobalId> {
        self.global_order.clone()
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.global_storage
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    // ---- blocks ----

    pub fn new_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        let id = self.alloc_block(func, name);
        self.funcs[func.index()].blocks.push(id);
        id
    }

    /// Creates a block placed immediately before `before` in `func`'s layout.
    pub fn insert_block_before(
        &mut self,
        func: FuncId,
        before: BlockId,
        name: impl Into<String>,
    ) -> BlockId {
        let id = self.alloc_block(func, name);
        let blocks = &mut self.funcs[func.index()].blocks;
        let pos = blocks.iter().position(|b| *b == before).unwrap_or(0);
        blocks.insert(pos, id);
        id
    }

    /// Creates a block placed immediately after `after` in `func`'s layout.
    pub fn insert_block_after(
        &mut self,
        func: FuncId,
        after: BlockId,
        name: impl Into<String>,
    ) -> BlockId {
        let id = self.alloc_block(func, name);
        let blocks = &mut self.funcs[func.index()].blocks;
        let pos = blocks
            .iter()
            .position(|b| *b == after)
            .map(|p| p + 1)
            .unwrap_or(blocks.len());
        blocks.insert(pos, id);
        id
    }

    fn alloc_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.into(),
            parent: func,
            insts: Vec::new(),
            dead: false,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn block_is_dead(&self, id: BlockId) -> bool {
        self.blocks[id.index()].dead
    }

    /// Detaches a block from its function and tombstones it and its
    /// instructions.
    pub fn erase_block(&mut self, id: BlockId) {
        let parent = self.blocks[id.index()].parent;
        self.funcs[parent.index()].blocks.retain(|b| *b != id);
        let insts = std::mem::take(&mut self.blocks[id.index()].insts);
        for i in insts {
            self.insts[i.index()].dead = true;
        }
        self.blocks[id.index()].dead = true;
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.block(block).insts.last()?;
        if self.inst(last).is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    // ---- instructions ----

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub fn inst_is_dead(&self, id: InstId) -> bool {
        self.insts[id.index()].dead
    }

    /// Appends a raw instruction to the arena without placing it in a block.
    pub(crate) fn alloc_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    /// Inserts `inst` into `block` at position `at`.
    pub fn insert_inst(&mut self, block: BlockId, at: usize, mut inst: Inst) -> InstId {
        inst.parent = block;
        let id = self.alloc_inst(inst);
        self.blocks[block.index()].insts.insert(at, id);
        id
    }

    pub fn push_inst(&mut self, block: BlockId, inst: Inst) -> InstId {
        let at = self.block(block).insts.len();
        self.insert_inst(block, at, inst)
    }

    /// Removes an instruction from its block and tombstones it.
    pub fn erase_inst(&mut self, id: InstId) {
        let parent = self.insts[id.index()].parent;
        self.blocks[parent.index()].insts.retain(|i| *i != id);
        self.insts[id.index()].dead = true;
    }

    /// Position of `inst` inside its parent block.
    pub fn inst_pos(&self, id: InstId) -> (BlockId, usize) {
        let parent = self.inst(id).parent;
        let pos = self
            .block(parent)
            .insts
            .iter()
            .position(|i| *i == id)
            .expect("instruction not in its parent block");
        (parent, pos)
    }

    // ---- values ----

    pub fn value_type(&self, v: Value) -> TypeId {
        match v {
            Value::Inst(i) => self.inst(i).ty,
            Value::Arg(f, i) => self.func(f).params[i as usize].ty,
            Value::Global(_) | Value::Func(_) => self.tys.ptr,
            Value::Const(c) => self.const_type(c),
        }
    }

    /// A printable identifier for diagnostics and fault-injection hooks.
    pub fn value_name(&self, v: Value) -> Option<String> {
        match v {
            Value::Inst(i) => self.inst(i).name.clone(),
            Value::Arg(f, i) => Some(self.func(f).params[i as usize].name.clone()),
            Value::Global(g) => Some(self.global(g).name.clone()),
            Value::Func(f) => Some(self.func(f).name.clone()),
            Value::Const(_) => None,
        }
    }

    // ---- uses ----

    fn inst_references(&self, id: InstId, v: Value) -> bool {
        let inst = self.inst(id);
        if inst.operands.contains(&v) {
            return true;
        }
        matches!(inst.callee(), Some(Callee::Indirect(cv)) if cv == v)
    }

    /// Instructions inside `func` that reference `v` as an operand or as an
    /// indirect callee. Computed by scanning; the IR keeps no use lists.
    pub fn users_of_in(&self, func: FuncId, v: Value) -> Vec<InstId> {
        let mut out = Vec::new();
        for &b in &self.func(func).blocks {
            for &i in &self.block(b).insts {
                if self.inst_references(i, v) {
                    out.push(i);
                }
            }
        }
        out
    }

    /// Module-wide use scan.
    pub fn users_of(&self, v: Value) -> Vec<InstId> {
        let mut out = Vec::new();
        for f in self.func_ids() {
            out.extend(self.users_of_in(f, v));
        }
        out
    }

    /// Direct call and invoke sites targeting `callee`, module-wide.
    pub fn call_sites_of(&self, callee: FuncId) -> Vec<InstId> {
        let mut out = Vec::new();
        for f in self.func_ids() {
            for &b in &self.func(f).blocks {
                for &i in &self.block(b).insts {
                    if self.inst(i).callee() == Some(Callee::Direct(callee)) {
                        out.push(i);
                    }
                }
            }
        }
        out
    }

    /// Rewrites every operand and indirect-callee reference to `old` inside
    /// `func` so it references `new` instead.
    pub fn replace_uses_in(&mut self, func: FuncId, old: Value, new: Value) {
        for id in self.users_of_in(func, old) {
            let inst = self.inst_mut(id);
            for op in inst.operands.iter_mut() {
                if *op == old {
                    *op = new;
                }
            }
            if let Some(Callee::Indirect(cv)) = inst.callee() {
                if cv == old {
                    inst.set_callee(Callee::Indirect(new));
                }
            }
        }
    }

    // ---- CFG ----

    pub fn succs(&self, block: BlockId) -> Vec<BlockId> {
        match self.terminator(block) {
            Some(t) => self.inst(t).successors(),
            None => Vec::new(),
        }
    }

    pub fn preds(&self, block: BlockId) -> Vec<BlockId> {
        let func = self.block(block).parent;
        let mut out = Vec::new();
        for &b in &self.func(func).blocks {
            if self.succs(b).contains(&block) {
                out.push(b);
            }
        }
        out
    }

    /// Blocks reachable from `start` by following successor edges,
    /// including `start` itself.
    pub fn reachable_from(&self, start: BlockId) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        seen.insert(start);
        while let Some(b) = queue.pop_front() {
            for s in self.succs(b) {
                if seen.insert(s) {
                    queue.push_back(s);
                }
            }
        }
        seen
    }
}
