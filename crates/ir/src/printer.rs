//! Textual rendering of modules, LLVM-flavoured. Intended for diagnostics
//! and test output, not for round-tripping.

use std::fmt::{self, Write as _};

use crate::consts::Const;
use crate::instr::{Callee, InstKind};
use crate::module::Module;
use crate::types::{Type, TypeId};
use crate::value::{FuncId, InstId, Value};

fn fmt_type(m: &Module, ty: TypeId, out: &mut String) {
    match m.types.get(ty) {
        Type::Void => out.push_str("void"),
        Type::Int(bits) => {
            let _ = write!(out, "i{bits}");
        }
        Type::Float => out.push_str("float"),
        Type::Double => out.push_str("double"),
        Type::Ptr => out.push_str("ptr"),
        Type::Array { elem, len } => {
            let _ = write!(out, "[{len} x ");
            fmt_type(m, *elem, out);
            out.push(']');
        }
        Type::Struct { fields } => {
            out.push('{');
            for (i, f) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_type(m, *f, out);
            }
            out.push('}');
        }
    }
}

pub fn type_string(m: &Module, ty: TypeId) -> String {
    let mut s = String::new();
    fmt_type(m, ty, &mut s);
    s
}

/// Printable form of a value, with a function context for local numbering.
pub fn value_string(m: &Module, func: Option<FuncId>, v: Value) -> String {
    match v {
        Value::Inst(i) => match &m.inst(i).name {
            Some(n) => format!("%{n}"),
            None => format!("%t{}", i.index()),
        },
        Value::Arg(f, idx) => {
            let p = &m.func(f).params[idx as usize];
            format!("%{}", p.name)
        }
        Value::Global(g) => format!("@{}", m.global(g).name),
        Value::Func(f) => format!("@{}", m.func(f).name),
        Value::Const(c) => const_string(m, c, func),
    }
}

fn const_string(m: &Module, c: crate::value::ConstId, func: Option<FuncId>) -> String {
    match m.const_get(c) {
        Const::Int { value, .. } => format!("{}", *value as i64),
        Const::Float { bits, .. } => format!("{}", f64::from_bits(*bits)),
        Const::Null => "null".into(),
        Const::Undef(_) => "undef".into(),
        Const::Bytes { data, .. } => format!("c{:?}", String::from_utf8_lossy(data)),
        Const::Array { elems, .. } => {
            let inner: Vec<String> = elems.iter().map(|e| const_string(m, *e, func)).collect();
            format!("[{}]", inner.join(", "))
        }
        Const::Struct { fields, .. } => {
            let inner: Vec<String> = fields.iter().map(|e| const_string(m, *e, func)).collect();
            format!("{{{}}}", inner.join(", "))
        }
        Const::Ref(v) => value_string(m, func, *v),
        Const::Gep {
            base,
            source_elem,
            indices,
        } => {
            let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
            format!(
                "getelementptr({}, {}, {})",
                type_string(m, *source_elem),
                const_string(m, *base, func),
                idx.join(", ")
            )
        }
    }
}

pub fn inst_string(m: &Module, func: FuncId, id: InstId) -> String {
    let inst = m.inst(id);
    let f = Some(func);
    let mut s = String::new();
    if !m.types.is_void(inst.ty) {
        let _ = write!(s, "{} = ", value_string(m, f, Value::Inst(id)));
    }
    let ops = |s: &mut String| {
        let rendered: Vec<String> = inst
            .operands
            .iter()
            .map(|o| value_string(m, f, *o))
            .collect();
        s.push_str(&rendered.join(", "));
    };
    match &inst.kind {
        InstKind::Alloca { alloc_ty } => {
            let _ = write!(s, "alloca {}", type_string(m, *alloc_ty));
        }
        InstKind::Load { volatile } => {
            let _ = write!(
                s,
                "load{} {}, ",
                if *volatile { " volatile" } else { "" },
                type_string(m, inst.ty)
            );
            ops(&mut s);
        }
        InstKind::Store { volatile } => {
            let _ = write!(s, "store{} ", if *volatile { " volatile" } else { "" });
            ops(&mut s);
        }
        InstKind::Bin(op) => {
            let _ = write!(s, "{op:?} ");
            ops(&mut s);
        }
        InstKind::Cast(op) => {
            let _ = write!(s, "{op:?} ");
            ops(&mut s);
            let _ = write!(s, " to {}", type_string(m, inst.ty));
        }
        InstKind::Icmp(p) => {
            let _ = write!(s, "icmp {p:?} ");
            ops(&mut s);
        }
        InstKind::Fcmp(p) => {
            let _ = write!(s, "fcmp {p:?} ");
            ops(&mut s);
        }
        InstKind::Gep { source_elem } => {
            let _ = write!(s, "getelementptr {}, ", type_string(m, *source_elem));
            ops(&mut s);
        }
        InstKind::Phi { blocks } => {
            s.push_str("phi ");
            let parts: Vec<String> = inst
                .operands
                .iter()
                .zip(blocks.iter())
                .map(|(v, b)| {
                    format!("[ {}, %{} ]", value_string(m, f, *v), m.block(*b).name)
                })
                .collect();
            s.push_str(&parts.join(", "));
        }
        InstKind::Select => {
            s.push_str("select ");
            ops(&mut s);
        }
        InstKind::ExtractValue { indices } => {
            s.push_str("extractvalue ");
            ops(&mut s);
            let _ = write!(s, ", {indices:?}");
        }
        InstKind::InsertValue { indices } => {
            s.push_str("insertvalue ");
            ops(&mut s);
            let _ = write!(s, ", {indices:?}");
        }
        InstKind::Call { callee } => {
            let target = match callee {
                Callee::Direct(cf) => format!("@{}", m.func(*cf).name),
                Callee::Indirect(v) => value_string(m, f, *v),
            };
            let _ = write!(s, "call {} {target}(", type_string(m, inst.ty));
            ops(&mut s);
            s.push(')');
        }
        InstKind::Invoke {
            callee,
            normal,
            unwind,
        } => {
            let target = match callee {
                Callee::Direct(cf) => format!("@{}", m.func(*cf).name),
                Callee::Indirect(v) => value_string(m, f, *v),
            };
            let _ = write!(s, "invoke {} {target}(", type_string(m, inst.ty));
            ops(&mut s);
            let _ = write!(
                s,
                ") to %{} unwind %{}",
                m.block(*normal).name,
                m.block(*unwind).name
            );
        }
        InstKind::LandingPad { cleanup } => {
            let _ = write!(s, "landingpad cleanup={cleanup}");
        }
        InstKind::AtomicRmw { op } => {
            let _ = write!(s, "atomicrmw {op:?} ");
            ops(&mut s);
        }
        InstKind::CmpXchg => {
            s.push_str("cmpxchg ");
            ops(&mut s);
        }
        InstKind::Br { dest } => {
            let _ = write!(s, "br label %{}", m.block(*dest).name);
        }
        InstKind::CondBr {
            then_dest,
            else_dest,
        } => {
            let _ = write!(
                s,
                "br {}, label %{}, label %{}",
                value_string(m, f, inst.operands[0]),
                m.block(*then_dest).name,
                m.block(*else_dest).name
            );
        }
        InstKind::Switch { default, cases } => {
            let _ = write!(
                s,
                "switch {}, label %{} [",
                value_string(m, f, inst.operands[0]),
                m.block(*default).name
            );
            for (v, b) in cases {
                let _ = write!(s, " {v}: %{}", m.block(*b).name);
            }
            s.push_str(" ]");
        }
        InstKind::IndirectBr { dests } => {
            let names: Vec<String> =
                dests.iter().map(|b| format!("%{}", m.block(*b).name)).collect();
            let _ = write!(
                s,
                "indirectbr {}, [{}]",
                value_string(m, f, inst.operands[0]),
                names.join(", ")
            );
        }
        InstKind::Ret => {
            if inst.operands.is_empty() {
                s.push_str("ret void");
            } else {
                let _ = write!(s, "ret {}", value_string(m, f, inst.operands[0]));
            }
        }
        InstKind::Unreachable => s.push_str("unreachable"),
    }
    s
}

impl fmt::Display for Module {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "; module {}", self.name)?;
        for g in self.global_ids() {
            let gv = self.global(g);
            write!(
                out,
                "@{} = {:?} global {}",
                gv.name,
                gv.linkage,
                type_string(self, gv.value_ty)
            )?;
            if let Some(init) = gv.init {
                write!(out, " {}", const_string(self, init, None))?;
            }
            if let Some(sec) = &gv.section {
                write!(out, ", section \"{sec}\"")?;
            }
            writeln!(out)?;
        }
        for f in self.func_ids() {
            let func = self.func(f);
            let params: Vec<String> = func
                .params
                .iter()
                .map(|p| format!("{} %{}", type_string(self, p.ty), p.name))
                .collect();
            let head = if func.is_declaration() {
                "declare"
            } else {
                "define"
            };
            writeln!(
                out,
                "{head} {} @{}({}) {{",
                type_string(self, func.ret_ty),
                func.name,
                params.join(", ")
            )?;
            for &b in &func.blocks {
                writeln!(out, "{}:", self.block(b).name)?;
                for &i in &self.block(b).insts {
                    writeln!(out, "  {}", inst_string(self, f, i))?;
                }
            }
            writeln!(out, "}}")?;
        }
        Ok(())
    }
}
