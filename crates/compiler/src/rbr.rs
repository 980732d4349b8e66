//! Return-by-reference rewriting.
//!
//! Every eligible function returning a value gets a void-returning `_ret`
//! clone taking an extra out-pointer parameter; returns become volatile
//! stores through that pointer, and every direct call site is rewritten to
//! pass a local slot and load the result back. Return values then
//! participate in the duplicated-data discipline like any other memory.

use std::collections::HashSet;

use aspis_ir::{
    Builder, Callee, FuncId, Function, InstId, InstKind, MemoryEffects, Module, Param,
    ParamAttrs, RetAttrs, Value, ValueMap, clone_function_body,
};
use tracing::debug;

use crate::annotations::AnnotationIndex;
use crate::compile_set::eligible_functions;
use crate::config::HardeningConfig;
use crate::error::PassError;

/// Suffix of the rewritten clones.
pub const RET_SUFFIX: &str = "_ret";

pub struct RbrReport {
    /// `(original, rewritten)` pairs.
    pub rewritten: Vec<(FuncId, FuncId)>,
}

pub fn run(m: &mut Module, _cfg: &HardeningConfig) -> Result<RbrReport, PassError> {
    let ann = AnnotationIndex::scan(m);
    let fns = eligible_functions(m, &ann, &HashSet::new());
    let mut rewritten = Vec::new();
    for f in fns {
        if m.types.is_void(m.func(f).ret_ty) || m.func(f).name.ends_with(RET_SUFFIX) {
            continue;
        }
        // Already lowered on a previous run.
        if m.func_by_name(&format!("{}{}", m.func(f).name, RET_SUFFIX)).is_some() {
            continue;
        }
        let new_fn = update_fn_signature(m, f);
        update_function_calls(m, f, new_fn)?;
        debug!(func = %m.func(f).name, "lowered return to out-pointer");
        rewritten.push((f, new_fn));
    }
    Ok(RbrReport { rewritten })
}

/// Clones `f` into a void function whose last parameter is a pointer to the
/// old return type, stripping attributes the new signature invalidates.
fn update_fn_signature(m: &mut Module, f: FuncId) -> FuncId {
    let src = m.func(f).clone();
    let ptr = m.tys.ptr;
    let void = m.tys.void;

    let mut params = src.params.clone();
    // The out-pointer invalidates `returned`/`sret` claims on other params.
    for p in params.iter_mut() {
        p.attrs.remove(ParamAttrs::RETURNED);
        p.attrs.remove(ParamAttrs::STRUCT_RET);
    }
    params.push(Param {
        name: "ret_val".to_string(),
        ty: ptr,
        attrs: ParamAttrs::default(),
    });

    let new_fn = m.add_function(Function {
        name: format!("{}{}", src.name, RET_SUFFIX),
        dbg_name: src.dbg_name.clone(),
        ret_ty: void,
        params,
        vararg: src.vararg,
        linkage: src.linkage,
        attrs: src.attrs,
        // Return-value attributes no longer apply, and the callee now
        // writes caller memory.
        ret_attrs: RetAttrs::default(),
        mem_effects: MemoryEffects::Unknown,
        blocks: vec![],
    });

    let mut arg_map = ValueMap::new();
    for i in 0..src.params.len() as u32 {
        arg_map.insert(Value::Arg(f, i), Value::Arg(new_fn, i));
    }
    clone_function_body(m, f, new_fn, &arg_map);
    update_ret_instructions(m, new_fn);
    new_fn
}

/// Replaces every `ret v` with `store volatile v, ret_val; ret void`.
fn update_ret_instructions(m: &mut Module, f: FuncId) {
    let out_ptr = Value::Arg(f, (m.func(f).params.len() - 1) as u32);
    for block in m.func(f).blocks.clone() {
        let Some(term) = m.terminator(block) else {
            continue;
        };
        if !matches!(m.inst(term).kind, InstKind::Ret) || m.inst(term).operands.is_empty() {
            continue;
        }
        let value = m.inst(term).operands[0];
        let dbg = m.inst(term).dbg;
        m.erase_inst(term);
        let mut b = Builder::at_end(m, block);
        b.set_dbg(dbg);
        b.store_volatile(value, out_ptr);
        b.ret_void();
    }
}

/// Rewrites all direct call sites of `f` to call `new_fn`, routing the
/// result through an alloca.
fn update_function_calls(m: &mut Module, f: FuncId, new_fn: FuncId) -> Result<(), PassError> {
    for site in m.call_sites_of(f) {
        rewrite_call_site(m, site, new_fn)?;
    }
    Ok(())
}

fn rewrite_call_site(m: &mut Module, site: InstId, new_fn: FuncId) -> Result<(), PassError> {
    let caller = m.block(m.inst(site).parent).parent;
    let ret_ty = m.inst(site).ty;
    let dbg = m.inst(site).dbg;
    let mut args = m.inst(site).operands.clone();

    // When the result feeds straight into a store to a local slot, reuse
    // that slot as the out-pointer and drop the store.
    let mut slot = None;
    for user in m.users_of_in(caller, Value::Inst(site)) {
        let u = m.inst(user);
        if matches!(u.kind, InstKind::Store { .. }) && u.operands[0] == Value::Inst(site) {
            if let Value::Inst(ptr) = u.operands[1] {
                if matches!(m.inst(ptr).kind, InstKind::Alloca { .. }) {
                    slot = Some((user, ptr));
                    break;
                }
            }
        }
    }

    let (out_ptr, load_volatile) = match slot {
        Some((store, ptr)) => {
            m.erase_inst(store);
            (Value::Inst(ptr), false)
        }
        None => {
            let entry = m.entry(caller);
            let ptr = Builder::at_start(m, entry).alloca(ret_ty);
            (Value::Inst(ptr), true)
        }
    };
    args.push(out_ptr);

    let void_ty = m.tys.void;
    let load = match m.inst(site).kind.clone() {
        InstKind::Call { .. } => {
            let mut b = Builder::before(m, site);
            b.set_dbg(dbg);
            b.call(Callee::Direct(new_fn), void_ty, args);
            if load_volatile {
                b.load_volatile(ret_ty, out_ptr)
            } else {
                b.load(ret_ty, out_ptr)
            }
        }
        InstKind::Invoke { normal, unwind, .. } => {
            let mut b = Builder::before(m, site);
            b.set_dbg(dbg);
            b.invoke(Callee::Direct(new_fn), void_ty, args, normal, unwind);
            let mut b = Builder::at_first_insertion_point(m, normal);
            b.set_dbg(dbg);
            if load_volatile {
                b.load_volatile(ret_ty, out_ptr)
            } else {
                b.load(ret_ty, out_ptr)
            }
        }
        other => {
            return Err(PassError::UnsupportedCall {
                func: m.func(caller).name.clone(),
                what: format!("{other:?}"),
            });
        }
    };
    m.replace_uses_in(caller, Value::Inst(site), Value::Inst(load));
    m.erase_inst(site);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspis_ir::{FnAttrs, Linkage, verify_module};

    fn int_fn(m: &mut Module, name: &str, value: i64) -> FuncId {
        let i32t = m.tys.i32;
        let f = m.add_function(Function {
            name: name.into(),
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
        let c = Value::Const(m.const_i32(value));
        Builder::at_end(m, bb).ret(c);
        f
    }

    #[test]
    fn test_rewrites_signature_and_callers() {
        let mut m = Module::new("t");
        let i32t = m.tys.i32;
        let callee = int_fn(&mut m, "answer", 42);

        let main = m.add_function(Function {
            name: "main".into(),
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
        let bb = m.new_block(main, "entry");
        let mut b = Builder::at_end(&mut m, bb);
        let call = b.call(Callee::Direct(callee), i32t, vec![]);
        b.ret(Value::Inst(call));

        run(&mut m, &HardeningConfig::default()).unwrap();
        verify_module(&m).unwrap();

        let answer_ret = m.func_by_name("answer_ret").expect("clone exists");
        let fr = m.func(answer_ret);
        assert!(m.types.is_void(fr.ret_ty));
        assert_eq!(fr.params.len(), 1);
        assert!(m.types.is_pointer(fr.params[0].ty));
        assert_eq!(fr.mem_effects, MemoryEffects::Unknown);

        // the clone stores through the out-pointer
        let clone_entry = fr.blocks[0];
        let has_volatile_store = m.block(clone_entry).insts.iter().any(|&i| {
            matches!(m.inst(i).kind, InstKind::Store { volatile: true })
        });
        assert!(has_volatile_store);

        // the caller now calls the clone and loads the result; the second
        // site lives in main's own `_ret` clone
        assert!(m.call_sites_of(callee).is_empty());
        assert_eq!(m.call_sites_of(answer_ret).len(), 2);
    }

    #[test]
    fn test_void_functions_untouched() {
        let mut m = Module::new("t");
        let void = m.tys.void;
        let f = m.add_function(Function {
            name: "quiet".into(),
            dbg_name: None,
            ret_ty: void,
            params: vec![],
            vararg: false,
            linkage: Linkage::External,
            attrs: FnAttrs::default(),
            ret_attrs: RetAttrs::default(),
            mem_effects: MemoryEffects::Unknown,
            blocks: vec![],
        });
        let bb = m.new_block(f, "entry");
        Builder::at_end(&mut m, bb).ret_void();
        let report = run(&mut m, &HardeningConfig::default()).unwrap();
        assert!(report.rewritten.is_empty());
        assert!(m.func_by_name("quiet_ret").is_none());
    }
}
