//! `_dup` function synthesis.

use aspis_ir::{FuncId, Function, Module, Param, Value, ValueMap, clone_function_body};

use super::globals::DUP_SUFFIX;
use crate::config::HardeningConfig;

/// Clones `f` into `<name>_dup` with every parameter duplicated.
///
/// Sequential layout appends the shadow parameters after the originals
/// (`p1..pn, p1'..pn'`); alternating layout interleaves them. The body is
/// cloned with each original parameter mapped to its first-appearance slot;
/// the second-appearance slots become the shadows during instruction
/// duplication.
pub(super) fn create_dup_function(m: &mut Module, f: FuncId, cfg: &HardeningConfig) -> FuncId {
    let src = m.func(f).clone();
    let n = src.params.len();

    let mut params: Vec<Param> = Vec::with_capacity(2 * n);
    for (i, p) in src.params.iter().enumerate() {
        let copy = Param {
            name: format!("{}{}", p.name, DUP_SUFFIX),
            ty: p.ty,
            attrs: p.attrs,
        };
        if cfg.alternate_memmap {
            params.push(p.clone());
            params.push(copy);
        } else {
            params.insert(i, p.clone());
            params.push(copy);
        }
    }

    let dup = m.add_function(Function {
        name: format!("{}{}", src.name, DUP_SUFFIX),
        dbg_name: src.dbg_name.clone(),
        ret_ty: src.ret_ty,
        params,
        vararg: src.vararg,
        linkage: src.linkage,
        attrs: src.attrs,
        ret_attrs: src.ret_attrs,
        mem_effects: src.mem_effects,
        blocks: vec![],
    });

    let mut arg_map = ValueMap::new();
    for i in 0..n as u32 {
        let slot = if cfg.alternate_memmap { 2 * i } else { i };
        arg_map.insert(Value::Arg(f, i), Value::Arg(dup, slot));
    }
    clone_function_body(m, f, dup, &arg_map);
    dup
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspis_ir::{
        Builder, FnAttrs, InstKind, Linkage, MemoryEffects, ParamAttrs, RetAttrs,
    };

    fn two_arg_fn(m: &mut Module) -> FuncId {
        let i32t = m.tys.i32;
        let f = m.add_function(Function {
            name: "add2".into(),
            dbg_name: None,
            ret_ty: i32t,
            params: vec![
                Param {
                    name: "a".into(),
                    ty: i32t,
                    attrs: ParamAttrs::default(),
                },
                Param {
                    name: "b".into(),
                    ty: i32t,
                    attrs: ParamAttrs::default(),
                },
            ],
            vararg: false,
            linkage: Linkage::Internal,
            attrs: FnAttrs::default(),
            ret_attrs: RetAttrs::default(),
            mem_effects: MemoryEffects::Unknown,
            blocks: vec![],
        });
        let bb = m.new_block(f, "entry");
        let mut b = Builder::at_end(m, bb);
        let sum = b.add(i32t, Value::Arg(f, 0), Value::Arg(f, 1));
        b.ret(Value::Inst(sum));
        f
    }

    #[test]
    fn test_sequential_layout_appends_shadows() {
        let mut m = Module::new("t");
        let f = two_arg_fn(&mut m);
        let dup = create_dup_function(&mut m, f, &HardeningConfig::default());
        let names: Vec<&str> = m.func(dup).params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a_dup", "b_dup"]);

        // body uses the first-appearance slots
        let entry = m.func(dup).blocks[0];
        let sum = m.block(entry).insts[0];
        assert!(matches!(m.inst(sum).kind, InstKind::Bin(_)));
        assert_eq!(
            m.inst(sum).operands,
            vec![Value::Arg(dup, 0), Value::Arg(dup, 1)]
        );
    }

    #[test]
    fn test_alternating_layout_interleaves() {
        let mut m = Module::new("t");
        let f = two_arg_fn(&mut m);
        let cfg = HardeningConfig::default().with_alternate_memmap(true);
        let dup = create_dup_function(&mut m, f, &cfg);
        let names: Vec<&str> = m.func(dup).params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a_dup", "b", "b_dup"]);
        let entry = m.func(dup).blocks[0];
        let sum = m.block(entry).insts[0];
        assert_eq!(
            m.inst(sum).operands,
            vec![Value::Arg(dup, 0), Value::Arg(dup, 2)]
        );
    }
}
