//! The execution engine.

use std::collections::{HashMap, HashSet};
use std::fmt;

use aspis_ir::{
    AtomicOp, BinOp, Callee, CastOp, FloatPred, FuncId, GlobalId, InstId, InstKind, IntPred,
    Module, Type, TypeId, Value,
};
use tracing::trace;

use crate::value::{Memory, PtrVal, Val, sext, zero_of};

#[derive(Debug)]
pub enum ExecError {
    /// A registered fault handler was reached.
    Trap { handler: String },
    UnreachableReached { func: String },
    OutOfFuel,
    CallDepthExceeded,
    MissingHost(String),
    BadMemory(String),
    Unsupported(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Trap { handler } => write!(f, "trapped into {handler}"),
            ExecError::UnreachableReached { func } => {
                write!(f, "reached unreachable in {func}")
            }
            ExecError::OutOfFuel => write!(f, "step budget exhausted"),
            ExecError::CallDepthExceeded => write!(f, "call depth exceeded"),
            ExecError::MissingHost(n) => write!(f, "no host hook for external {n}"),
            ExecError::BadMemory(w) => write!(f, "bad memory access: {w}"),
            ExecError::Unsupported(w) => write!(f, "unsupported operation: {w}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Identifies a value definition for fault injection.
pub struct FaultSite<'a> {
    pub func: &'a str,
    pub value: &'a str,
    pub occurrence: u64,
}

pub type FaultHook = Box<dyn FnMut(&FaultSite<'_>, &mut Val)>;
pub type HostFn<'m> = Box<dyn FnMut(&mut Machine<'m>, &[Val]) -> Result<Val, ExecError> + 'm>;

const DEFAULT_FUEL: u64 = 50_000_000;
const MAX_CALL_DEPTH: u32 = 512;

struct Frame {
    func: FuncId,
    args: Vec<Val>,
    regs: HashMap<InstId, Val>,
    prev_block: Option<aspis_ir::BlockId>,
}

/// Interprets one module. Globals are materialized once at construction;
/// external functions resolve to registered host hooks.
pub struct Machine<'m> {
    pub m: &'m Module,
    pub mem: Memory,
    globals: HashMap<GlobalId, usize>,
    hosts: HashMap<String, Option<HostFn<'m>>>,
    trap_symbols: HashSet<String>,
    fault_hook: Option<FaultHook>,
    occurrences: HashMap<(String, String), u64>,
    fuel: u64,
    depth: u32,
}

impl<'m> Machine<'m> {
    pub fn new(m: &'m Module) -> Self {
        let mut mach = Machine {
            m,
            mem: Memory::default(),
            globals: HashMap::new(),
            hosts: HashMap::new(),
            trap_symbols: ["DataCorruption_Handler", "SigMismatch_Handler"]
                .into_iter()
                .map(String::from)
                .collect(),
            fault_hook: None,
            occurrences: HashMap::new(),
            fuel: DEFAULT_FUEL,
            depth: 0,
        };
        for g in m.global_ids() {
            let gv = m.global(g);
            let slots = match gv.init {
                Some(init) => mach.flatten_const(init),
                None => zero_of(&m.types, gv.value_ty),
            };
            let alloc = mach.mem.alloc(slots);
            mach.globals.insert(g, alloc);
        }
        mach
    }

    pub fn set_fuel(&mut self, fuel: u64) {
        self.fuel = fuel;
    }

    pub fn register_host(
        &mut self,
        name: impl Into<String>,
        f: impl FnMut(&mut Machine<'m>, &[Val]) -> Result<Val, ExecError> + 'm,
    ) {
        self.hosts.insert(name.into(), Some(Box::new(f)));
    }

    /// Symbols whose invocation ends the run with [`ExecError::Trap`].
    pub fn add_trap_symbol(&mut self, name: impl Into<String>) {
        self.trap_symbols.insert(name.into());
    }

    pub fn set_fault_hook(&mut self, hook: FaultHook) {
        self.fault_hook = Some(hook);
    }

    /// Reads the first slot of a named global, for test assertions.
    pub fn global_cell(&self, name: &str) -> Option<Val> {
        let g = self.m.global_by_name(name)?;
        let alloc = *self.globals.get(&g)?;
        self.mem.allocs[alloc].slots.first().cloned()
    }

    pub fn run(&mut self, entry: &str, args: Vec<Val>) -> Result<Val, ExecError> {
        let f = self
            .m
            .func_by_name(entry)
            .ok_or_else(|| ExecError::MissingHost(entry.to_string()))?;
        self.call_function(f, args)
    }

    pub fn call_function(&mut self, f: FuncId, args: Vec<Val>) -> Result<Val, ExecError> {
        let m = self.m;
        let func = m.func(f);
        if self.trap_symbols.contains(&func.name)
            || func
                .dbg_name
                .as_ref()
                .is_some_and(|n| self.trap_symbols.contains(n))
        {
            return Err(ExecError::Trap {
                handler: func.name.clone(),
            });
        }
        if func.is_declaration() {
            return self.call_external(&func.name.clone(), &args);
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ExecError::CallDepthExceeded);
        }
        self.depth += 1;
        let result = self.exec_body(f, args);
        self.depth -= 1;
        result
    }

    fn call_external(&mut self, name: &str, args: &[Val]) -> Result<Val, ExecError> {
        if name.starts_with("llvm.memcpy") {
            return self.host_memcpy(args);
        }
        if name.starts_with("llvm.memset") {
            return self.host_memset(args);
        }
        // Take the hook out so it may re-enter the machine.
        let mut hook = match self.hosts.get_mut(name) {
            Some(slot) => match slot.take() {
                Some(h) => h,
                None => return Err(ExecError::Unsupported(format!("reentrant host {name}"))),
            },
            None => return Err(ExecError::MissingHost(name.to_string())),
        };
        let result = hook(self, args);
        if let Some(slot) = self.hosts.get_mut(name) {
            *slot = Some(hook);
        }
        result
    }

    fn exec_body(&mut self, f: FuncId, args: Vec<Val>) -> Result<Val, ExecError> {
        let m = self.m;
        let mut frame = Frame {
            func: f,
            args,
            regs: HashMap::new(),
            prev_block: None,
        };
        let mut block = m.entry(f);
        'blocks: loop {
            let insts = m.block(block).insts.clone();
            for id in insts {
                if self.fuel == 0 {
                    return Err(ExecError::OutOfFuel);
                }
                self.fuel -= 1;
                trace!(func = %m.func(f).name, inst = id.index(), "step");
                let inst = m.inst(id);
                match &inst.kind {
                    InstKind::Br { dest } => {
                        frame.prev_block = Some(block);
                        block = *dest;
                        continue 'blocks;
                    }
                    InstKind::CondBr {
                        then_dest,
                        else_dest,
                    } => {
                        let c = self.operand(&frame, inst.operands[0])?;
                        frame.prev_block = Some(block);
                        block = if c.is_truthy() { *then_dest } else { *else_dest };
                        continue 'blocks;
                    }
                    InstKind::Switch { default, cases } => {
                        let d = self
                            .operand(&frame, inst.operands[0])?
                            .as_u64()
                            .ok_or_else(|| ExecError::Unsupported("switch on non-int".into()))?;
                        frame.prev_block = Some(block);
                        block = cases
                            .iter()
                            .find(|(v, _)| *v == d)
                            .map(|(_, b)| *b)
                            .unwrap_or(*default);
                        continue 'blocks;
                    }
                    InstKind::IndirectBr { .. } => {
                        return Err(ExecError::Unsupported("indirectbr".into()));
                    }
                    InstKind::Ret => {
                        return if inst.operands.is_empty() {
                            Ok(Val::Undef)
                        } else {
                            self.operand(&frame, inst.operands[0])
                        };
                    }
                    InstKind::Unreachable => {
                        return Err(ExecError::UnreachableReached {
                            func: m.func(f).name.clone(),
                        });
                    }
                    InstKind::Invoke {
                        callee, normal, ..
                    } => {
                        let argv = self.operand_list(&frame, &inst.operands)?;
                        let v = self.dispatch_call(&frame, *callee, argv)?;
                        self.define(&mut frame, id, v);
                        frame.prev_block = Some(block);
                        block = *normal;
                        continue 'blocks;
                    }
                    _ => {
                        let v = self.eval(&mut frame, id)?;
                        self.define(&mut frame, id, v);
                    }
                }
            }
            // The verifier guarantees a terminator; reaching here means the
            // block was malformed.
            return Err(ExecError::Unsupported(format!(
                "block {} fell through",
                m.block(block).name
            )));
        }
    }

    fn define(&mut self, frame: &mut Frame, id: InstId, mut v: Val) {
        let m = self.m;
        if !m.types.is_void(m.inst(id).ty) || matches!(m.inst(id).kind, InstKind::Alloca { .. }) {
            if let (Some(hook), Some(name)) = (self.fault_hook.as_mut(), &m.inst(id).name) {
                let fname = &m.func(frame.func).name;
                let key = (fname.clone(), name.clone());
                let occ = self.occurrences.entry(key).or_insert(0);
                *occ += 1;
                let site = FaultSite {
                    func: fname,
                    value: name,
                    occurrence: *occ,
                };
                hook(&site, &mut v);
            }
            frame.regs.insert(id, v);
        }
    }

    fn eval(&mut self, frame: &mut Frame, id: InstId) -> Result<Val, ExecError> {
        let m = self.m;
        let inst = m.inst(id);
        match &inst.kind {
            InstKind::Alloca { alloc_ty } => {
                let slots = zero_of(&m.types, *alloc_ty);
                let alloc = self.mem.alloc(slots);
                Ok(Val::Ptr(Some(PtrVal { alloc, offset: 0 })))
            }
            InstKind::Load { .. } => {
                let p = self.ptr_operand(frame, inst.operands[0])?;
                self.load_typed(p, inst.ty)
            }
            InstKind::Store { .. } => {
                let v = self.operand(frame, inst.operands[0])?;
                let p = self.ptr_operand(frame, inst.operands[1])?;
                self.store_typed(p, &v)?;
                Ok(Val::Undef)
            }
            InstKind::Bin(op) => {
                let a = self.operand(frame, inst.operands[0])?;
                let b = self.operand(frame, inst.operands[1])?;
                bin_op(*op, &a, &b)
            }
            InstKind::Cast(op) => {
                let v = self.operand(frame, inst.operands[0])?;
                cast_op(*op, &v, &m.types, inst.ty)
            }
            InstKind::Icmp(pred) => {
                let a = self.operand(frame, inst.operands[0])?;
                let b = self.operand(frame, inst.operands[1])?;
                icmp(*pred, &a, &b)
            }
            InstKind::Fcmp(pred) => {
                let a = self.operand(frame, inst.operands[0])?;
                let b = self.operand(frame, inst.operands[1])?;
                fcmp(*pred, &a, &b)
            }
            InstKind::Gep { source_elem } => {
                let base = self.ptr_operand(frame, inst.operands[0])?;
                let mut indices = Vec::new();
                for op in &inst.operands[1..] {
                    let v = self.operand(frame, *op)?;
                    indices.push(v.as_i64().ok_or_else(|| {
                        ExecError::Unsupported("non-integer gep index".into())
                    })?);
                }
                let off = gep_offset(&m.types, *source_elem, &indices);
                Ok(Val::Ptr(Some(PtrVal {
                    alloc: base.alloc,
                    offset: (base.offset as i64 + off) as u64,
                })))
            }
            InstKind::Phi { blocks } => {
                let prev = frame.prev_block.ok_or_else(|| {
                    ExecError::Unsupported("phi in entry block".into())
                })?;
                for (v, b) in inst.operands.iter().zip(blocks.iter()) {
                    if *b == prev {
                        return self.operand(frame, *v);
                    }
                }
                Err(ExecError::Unsupported("phi without matching edge".into()))
            }
            InstKind::Select => {
                let c = self.operand(frame, inst.operands[0])?;
                if c.is_truthy() {
                    self.operand(frame, inst.operands[1])
                } else {
                    self.operand(frame, inst.operands[2])
                }
            }
            InstKind::ExtractValue { indices } => {
                let mut v = self.operand(frame, inst.operands[0])?;
                for i in indices {
                    v = match v {
                        Val::Agg(elems) => elems
                            .get(*i as usize)
                            .cloned()
                            .ok_or_else(|| ExecError::BadMemory("extractvalue index".into()))?,
                        _ => return Err(ExecError::Unsupported("extractvalue scalar".into())),
                    };
                }
                Ok(v)
            }
            InstKind::InsertValue { indices } => {
                let mut agg = self.operand(frame, inst.operands[0])?;
                let elem = self.operand(frame, inst.operands[1])?;
                insert_into(&mut agg, indices, elem)?;
                Ok(agg)
            }
            InstKind::Call { callee } => {
                let argv = self.operand_list(frame, &inst.operands)?;
                self.dispatch_call(frame, *callee, argv)
            }
            InstKind::LandingPad { .. } => Ok(Val::Undef),
            InstKind::AtomicRmw { op } => {
                let p = self.ptr_operand(frame, inst.operands[0])?;
                let v = self.operand(frame, inst.operands[1])?;
                let old = self
                    .mem
                    .read(p)
                    .cloned()
                    .ok_or_else(|| ExecError::BadMemory("atomicrmw".into()))?;
                let new = atomic_op(*op, &old, &v)?;
                self.mem
                    .write(p, new)
                    .ok_or_else(|| ExecError::BadMemory("atomicrmw store".into()))?;
                Ok(old)
            }
            InstKind::CmpXchg => {
                let p = self.ptr_operand(frame, inst.operands[0])?;
                let expected = self.operand(frame, inst.operands[1])?;
                let replacement = self.operand(frame, inst.operands[2])?;
                let old = self
                    .mem
                    .read(p)
                    .cloned()
                    .ok_or_else(|| ExecError::BadMemory("cmpxchg".into()))?;
                if old == expected {
                    self.mem
                        .write(p, replacement)
                        .ok_or_else(|| ExecError::BadMemory("cmpxchg store".into()))?;
                }
                Ok(old)
            }
            InstKind::Br { .. }
            | InstKind::CondBr { .. }
            | InstKind::Switch { .. }
            | InstKind::IndirectBr { .. }
            | InstKind::Invoke { .. }
            | InstKind::Ret
            | InstKind::Unreachable => unreachable!("terminators handled by exec_body"),
        }
    }

    fn dispatch_call(
        &mut self,
        frame: &Frame,
        callee: Callee,
        args: Vec<Val>,
    ) -> Result<Val, ExecError> {
        match callee {
            Callee::Direct(f) => self.call_function(f, args),
            Callee::Indirect(v) => match self.operand(frame, v)? {
                Val::Fn(f) => self.call_function(f, args),
                other => Err(ExecError::Unsupported(format!(
                    "indirect call through {other:?}"
                ))),
            },
        }
    }

    fn operand_list(&mut self, frame: &Frame, ops: &[Value]) -> Result<Vec<Val>, ExecError> {
        ops.iter().map(|o| self.operand(frame, *o)).collect()
    }

    fn operand(&mut self, frame: &Frame, v: Value) -> Result<Val, ExecError> {
        match v {
            Value::Inst(i) => frame
                .regs
                .get(&i)
                .cloned()
                .ok_or_else(|| ExecError::Unsupported("use before def".into())),
            Value::Arg(_, idx) => frame
                .args
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| ExecError::BadMemory("argument index".into())),
            Value::Global(g) => {
                let alloc = self.globals[&g];
                Ok(Val::Ptr(Some(PtrVal { alloc, offset: 0 })))
            }
            Value::Func(f) => Ok(Val::Fn(f)),
            Value::Const(c) => self.const_val(c),
        }
    }

    fn ptr_operand(&mut self, frame: &Frame, v: Value) -> Result<PtrVal, ExecError> {
        match self.operand(frame, v)? {
            Val::Ptr(Some(p)) => Ok(p),
            Val::Ptr(None) => Err(ExecError::BadMemory("null dereference".into())),
            other => Err(ExecError::BadMemory(format!("not a pointer: {other:?}"))),
        }
    }

    fn const_val(&mut self, c: aspis_ir::ConstId) -> Result<Val, ExecError> {
        use aspis_ir::Const;
        let m = self.m;
        match m.const_get(c) {
            Const::Int { ty, value } => {
                let bits = match m.types.get(*ty) {
                    Type::Int(b) => *b,
                    _ => 64,
                };
                Ok(Val::int(bits, *value))
            }
            Const::Float { bits, .. } => Ok(Val::F(f64::from_bits(*bits))),
            Const::Null => Ok(Val::Ptr(None)),
            Const::Undef(_) => Ok(Val::Undef),
            Const::Bytes { data, .. } => Ok(Val::Agg(
                data.iter().map(|b| Val::int(8, *b as u64)).collect(),
            )),
            Const::Array { elems, .. } => {
                let vals: Result<Vec<Val>, ExecError> =
                    elems.clone().iter().map(|e| self.const_val(*e)).collect();
                Ok(Val::Agg(vals?))
            }
            Const::Struct { fields, .. } => {
                let vals: Result<Vec<Val>, ExecError> =
                    fields.clone().iter().map(|e| self.const_val(*e)).collect();
                Ok(Val::Agg(vals?))
            }
            Const::Ref(v) => match v {
                Value::Global(g) => {
                    let alloc = self.globals.get(g).copied().ok_or_else(|| {
                        ExecError::BadMemory("forward global reference".into())
                    })?;
                    Ok(Val::Ptr(Some(PtrVal { alloc, offset: 0 })))
                }
                Value::Func(f) => Ok(Val::Fn(*f)),
                other => Err(ExecError::Unsupported(format!("const ref to {other:?}"))),
            },
            Const::Gep {
                base,
                source_elem,
                indices,
            } => {
                let (base, source_elem) = (*base, *source_elem);
                let idx: Vec<i64> = indices.iter().map(|i| *i as i64).collect();
                let base_val = self.const_val(base)?;
                match base_val {
                    Val::Ptr(Some(p)) => {
                        let off = gep_offset(&m.types, source_elem, &idx);
                        Ok(Val::Ptr(Some(PtrVal {
                            alloc: p.alloc,
                            offset: (p.offset as i64 + off) as u64,
                        })))
                    }
                    other => Err(ExecError::Unsupported(format!(
                        "const gep over {other:?}"
                    ))),
                }
            }
        }
    }

    fn flatten_const(&mut self, c: aspis_ir::ConstId) -> Vec<Val> {
        use aspis_ir::Const;
        let m = self.m;
        match m.const_get(c) {
            Const::Bytes { data, .. } => {
                data.iter().map(|b| Val::int(8, *b as u64)).collect()
            }
            Const::Array { elems, .. } => elems
                .clone()
                .iter()
                .flat_map(|e| self.flatten_const(*e))
                .collect(),
            Const::Struct { fields, .. } => fields
                .clone()
                .iter()
                .flat_map(|e| self.flatten_const(*e))
                .collect(),
            Const::Undef(ty) => zero_of(&m.types, *ty),
            _ => match self.const_val(c) {
                Ok(v) => vec![v],
                Err(_) => vec![Val::Undef],
            },
        }
    }

    fn load_typed(&self, p: PtrVal, ty: TypeId) -> Result<Val, ExecError> {
        let m = self.m;
        let count = m.types.scalar_count(ty) as usize;
        if !m.types.is_aggregate(ty) {
            return self
                .mem
                .read(p)
                .cloned()
                .ok_or_else(|| ExecError::BadMemory("load out of range".into()));
        }
        let alloc = self
            .mem
            .allocs
            .get(p.alloc)
            .ok_or_else(|| ExecError::BadMemory("load from freed allocation".into()))?;
        let start = p.offset as usize;
        let slots = alloc
            .slots
            .get(start..start + count)
            .ok_or_else(|| ExecError::BadMemory("aggregate load out of range".into()))?;
        let mut it = slots.iter().cloned();
        Ok(build_agg(&m.types, ty, &mut it))
    }

    fn store_typed(&mut self, p: PtrVal, v: &Val) -> Result<(), ExecError> {
        let mut flat = Vec::new();
        flatten_val(v, &mut flat);
        for (i, s) in flat.into_iter().enumerate() {
            let at = PtrVal {
                alloc: p.alloc,
                offset: p.offset + i as u64,
            };
            self.mem
                .write(at, s)
                .ok_or_else(|| ExecError::BadMemory("store out of range".into()))?;
        }
        Ok(())
    }

    fn host_memcpy(&mut self, args: &[Val]) -> Result<Val, ExecError> {
        let (dst, src, len) = memory_intrinsic_args(args)?;
        let mut copied = 0u64;
        let mut i = 0u64;
        while copied < len {
            let from = PtrVal {
                alloc: src.alloc,
                offset: src.offset + i,
            };
            let slot = self
                .mem
                .read(from)
                .cloned()
                .ok_or_else(|| ExecError::BadMemory("memcpy source".into()))?;
            copied += slot.byte_width();
            let to = PtrVal {
                alloc: dst.alloc,
                offset: dst.offset + i,
            };
            self.mem
                .write(to, slot)
                .ok_or_else(|| ExecError::BadMemory("memcpy destination".into()))?;
            i += 1;
        }
        Ok(Val::Undef)
    }

    fn host_memset(&mut self, args: &[Val]) -> Result<Val, ExecError> {
        let dst = match args.first() {
            Some(Val::Ptr(Some(p))) => *p,
            _ => return Err(ExecError::BadMemory("memset destination".into())),
        };
        let byte = args
            .get(1)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ExecError::Unsupported("memset value".into()))?;
        let len = args
            .get(2)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ExecError::Unsupported("memset length".into()))?;
        for i in 0..len {
            let at = PtrVal {
                alloc: dst.alloc,
                offset: dst.offset + i,
            };
            self.mem
                .write(at, Val::int(8, byte))
                .ok_or_else(|| ExecError::BadMemory("memset destination".into()))?;
        }
        Ok(Val::Undef)
    }
}

fn memory_intrinsic_args(args: &[Val]) -> Result<(PtrVal, PtrVal, u64), ExecError> {
    match (args.first(), args.get(1), args.get(2)) {
        (Some(Val::Ptr(Some(d))), Some(Val::Ptr(Some(s))), Some(len)) => {
            let len = len
                .as_u64()
                .ok_or_else(|| ExecError::Unsupported("memcpy length".into()))?;
            Ok((*d, *s, len))
        }
        _ => Err(ExecError::BadMemory("memcpy arguments".into())),
    }
}

fn flatten_val(v: &Val, out: &mut Vec<Val>) {
    match v {
        Val::Agg(elems) => {
            for e in elems {
                flatten_val(e, out);
            }
        }
        other => out.push(other.clone()),
    }
}

fn build_agg(types: &aspis_ir::TypePool, ty: TypeId, it: &mut impl Iterator<Item = Val>) -> Val {
    match types.get(ty) {
        Type::Array { elem, len } => {
            let elems = (0..*len).map(|_| build_agg(types, *elem, it)).collect();
            Val::Agg(elems)
        }
        Type::Struct { fields } => {
            let elems = fields.iter().map(|f| build_agg(types, *f, it)).collect();
            Val::Agg(elems)
        }
        _ => it.next().unwrap_or(Val::Undef),
    }
}

fn insert_into(agg: &mut Val, indices: &[u32], elem: Val) -> Result<(), ExecError> {
    let mut cur = agg;
    for (n, i) in indices.iter().enumerate() {
        match cur {
            Val::Agg(elems) => {
                let slot = elems
                    .get_mut(*i as usize)
                    .ok_or_else(|| ExecError::BadMemory("insertvalue index".into()))?;
                if n + 1 == indices.len() {
                    *slot = elem;
                    return Ok(());
                }
                cur = slot;
            }
            _ => return Err(ExecError::Unsupported("insertvalue scalar".into())),
        }
    }
    Err(ExecError::Unsupported("insertvalue without indices".into()))
}

fn gep_offset(types: &aspis_ir::TypePool, source_elem: TypeId, indices: &[i64]) -> i64 {
    let mut off: i64 = 0;
    if let Some(first) = indices.first() {
        off += first * types.scalar_count(source_elem) as i64;
    }
    let mut ty = source_elem;
    for idx in &indices[1.min(indices.len())..] {
        match types.get(ty) {
            Type::Array { elem, .. } => {
                off += idx * types.scalar_count(*elem) as i64;
                ty = *elem;
            }
            Type::Struct { fields } => {
                let i = *idx as usize;
                off += fields
                    .iter()
                    .take(i)
                    .map(|f| types.scalar_count(*f) as i64)
                    .sum::<i64>();
                ty = fields[i];
            }
            _ => break,
        }
    }
    off
}

fn bin_op(op: BinOp, a: &Val, b: &Val) -> Result<Val, ExecError> {
    if let (Val::F(x), Val::F(y)) = (a, b) {
        let r = match op {
            BinOp::FAdd => x + y,
            BinOp::FSub => x - y,
            BinOp::FMul => x * y,
            BinOp::FDiv => x / y,
            _ => return Err(ExecError::Unsupported("int op on floats".into())),
        };
        return Ok(Val::F(r));
    }
    let (bits, x) = match a {
        Val::Int { bits, v } => (*bits, *v),
        _ => return Err(ExecError::Unsupported(format!("binary op on {a:?}"))),
    };
    let y = b
        .as_u64()
        .ok_or_else(|| ExecError::Unsupported(format!("binary op on {b:?}")))?;
    let sx = sext(bits, x);
    let sy = sext(bits, y);
    let r = match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::SDiv => {
            if sy == 0 {
                return Err(ExecError::BadMemory("division by zero".into()));
            }
            sx.wrapping_div(sy) as u64
        }
        BinOp::UDiv => {
            if y == 0 {
                return Err(ExecError::BadMemory("division by zero".into()));
            }
            x / y
        }
        BinOp::SRem => {
            if sy == 0 {
                return Err(ExecError::BadMemory("remainder by zero".into()));
            }
            sx.wrapping_rem(sy) as u64
        }
        BinOp::URem => {
            if y == 0 {
                return Err(ExecError::BadMemory("remainder by zero".into()));
            }
            x % y
        }
        BinOp::And => x & y,
        BinOp::Or => x | y,
        BinOp::Xor => x ^ y,
        BinOp::Shl => x.wrapping_shl(y as u32),
        BinOp::LShr => x.wrapping_shr(y as u32),
        BinOp::AShr => (sx >> (y as u32).min(63)) as u64,
        BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv => {
            return Err(ExecError::Unsupported("float op on ints".into()));
        }
    };
    Ok(Val::int(bits, r))
}

fn cast_op(
    op: CastOp,
    v: &Val,
    types: &aspis_ir::TypePool,
    to: TypeId,
) -> Result<Val, ExecError> {
    let to_bits = match types.get(to) {
        Type::Int(b) => *b,
        Type::Float | Type::Double => 0,
        Type::Ptr => 64,
        _ => 64,
    };
    match (op, v) {
        (CastOp::Trunc, Val::Int { v, .. }) => Ok(Val::int(to_bits, *v)),
        (CastOp::ZExt, Val::Int { v, .. }) => Ok(Val::int(to_bits, *v)),
        (CastOp::SExt, Val::Int { bits, v }) => Ok(Val::int(to_bits, sext(*bits, *v) as u64)),
        (CastOp::Bitcast, other) => Ok(other.clone()),
        (CastOp::FpToSi, Val::F(f)) => Ok(Val::int(to_bits, *f as i64 as u64)),
        (CastOp::SiToFp, Val::Int { bits, v }) => Ok(Val::F(sext(*bits, *v) as f64)),
        (CastOp::PtrToInt, Val::Ptr(None)) => Ok(Val::int(to_bits, 0)),
        (CastOp::IntToPtr, Val::Int { v: 0, .. }) => Ok(Val::Ptr(None)),
        _ => Err(ExecError::Unsupported(format!("cast {op:?} of {v:?}"))),
    }
}

fn icmp(pred: IntPred, a: &Val, b: &Val) -> Result<Val, ExecError> {
    if let (Val::Ptr(x), Val::Ptr(y)) = (a, b) {
        return match pred {
            IntPred::Eq => Ok(Val::bool(x == y)),
            IntPred::Ne => Ok(Val::bool(x != y)),
            _ => Err(ExecError::Unsupported("ordered pointer compare".into())),
        };
    }
    if let (Val::Fn(x), Val::Fn(y)) = (a, b) {
        return match pred {
            IntPred::Eq => Ok(Val::bool(x == y)),
            IntPred::Ne => Ok(Val::bool(x != y)),
            _ => Err(ExecError::Unsupported("ordered function compare".into())),
        };
    }
    let (bits, x) = match a {
        Val::Int { bits, v } => (*bits, *v),
        _ => return Err(ExecError::Unsupported(format!("icmp on {a:?}"))),
    };
    let y = b
        .as_u64()
        .ok_or_else(|| ExecError::Unsupported(format!("icmp on {b:?}")))?;
    let (sx, sy) = (sext(bits, x), sext(bits, y));
    let r = match pred {
        IntPred::Eq => x == y,
        IntPred::Ne => x != y,
        IntPred::Slt => sx < sy,
        IntPred::Sle => sx <= sy,
        IntPred::Sgt => sx > sy,
        IntPred::Sge => sx >= sy,
        IntPred::Ult => x < y,
        IntPred::Ule => x <= y,
        IntPred::Ugt => x > y,
        IntPred::Uge => x >= y,
    };
    Ok(Val::bool(r))
}

fn fcmp(pred: FloatPred, a: &Val, b: &Val) -> Result<Val, ExecError> {
    let (x, y) = match (a, b) {
        (Val::F(x), Val::F(y)) => (*x, *y),
        _ => return Err(ExecError::Unsupported("fcmp on non-floats".into())),
    };
    let unordered = x.is_nan() || y.is_nan();
    let r = match pred {
        FloatPred::Oeq => !unordered && x == y,
        FloatPred::Ueq => unordered || x == y,
        FloatPred::One => !unordered && x != y,
        FloatPred::Olt => !unordered && x < y,
        FloatPred::Ogt => !unordered && x > y,
        FloatPred::Ole => !unordered && x <= y,
        FloatPred::Oge => !unordered && x >= y,
    };
    Ok(Val::bool(r))
}

fn atomic_op(op: AtomicOp, old: &Val, v: &Val) -> Result<Val, ExecError> {
    match op {
        AtomicOp::Xchg => Ok(v.clone()),
        AtomicOp::Add => bin_op(BinOp::Add, old, v),
        AtomicOp::Sub => bin_op(BinOp::Sub, old, v),
        AtomicOp::And => bin_op(BinOp::And, old, v),
        AtomicOp::Or => bin_op(BinOp::Or, old, v),
        AtomicOp::Xor => bin_op(BinOp::Xor, old, v),
    }
}
