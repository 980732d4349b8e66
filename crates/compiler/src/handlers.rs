//! Fault-handler materialization.
//!
//! Checks branch to per-function error blocks, which call one of two
//! module-level handlers. References are resolved through the linkage index
//! (the front-end may have mangled the symbol); absent handlers are
//! synthesized with a self-looping body so a module is self-contained for
//! testing. `noinline` keeps the fault visible at runtime.

use aspis_ir::{
    Builder, FnAttrs, FuncId, Function, Linkage, MemoryEffects, Module, RetAttrs,
};
use tracing::debug;

use crate::annotations::LinkageMap;
use crate::error::PassError;

/// Source-level name of the data-corruption handler.
pub const DATA_CORRUPTION_HANDLER: &str = "DataCorruption_Handler";
/// Source-level name of the signature-mismatch handler.
pub const SIG_MISMATCH_HANDLER: &str = "SigMismatch_Handler";

/// Resolves `source_name` through the linkage index, synthesizing the
/// handler when the module has none.
pub fn ensure_handler(
    m: &mut Module,
    linkage: &LinkageMap,
    source_name: &str,
) -> Result<FuncId, PassError> {
    if let Some(symbol) = linkage.resolve(source_name) {
        return m
            .func_by_name(symbol)
            .ok_or_else(|| PassError::MissingHandler {
                name: source_name.to_string(),
            });
    }
    if let Some(f) = m.func_by_name(source_name) {
        return Ok(f);
    }
    debug!(handler = source_name, "synthesizing missing fault handler");
    Ok(materialize(m, source_name))
}

fn materialize(m: &mut Module, name: &str) -> FuncId {
    let void = m.tys.void;
    let f = m.add_function(Function {
        name: name.to_string(),
        dbg_name: Some(name.to_string()),
        ret_ty: void,
        params: vec![],
        vararg: false,
        linkage: Linkage::External,
        attrs: FnAttrs::NOINLINE,
        ret_attrs: RetAttrs::default(),
        mem_effects: MemoryEffects::Unknown,
        blocks: vec![],
    });
    let bb = m.new_block(f, "spin");
    Builder::at_end(m, bb).br(bb);
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::LinkageMap;

    #[test]
    fn test_materializes_missing_handler() {
        let mut m = Module::new("t");
        let linkage = LinkageMap::build(&m);
        let f = ensure_handler(&mut m, &linkage, DATA_CORRUPTION_HANDLER).unwrap();
        let func = m.func(f);
        assert_eq!(func.name, DATA_CORRUPTION_HANDLER);
        assert!(func.attrs.contains(FnAttrs::NOINLINE));
        // self loop
        let bb = func.blocks[0];
        assert_eq!(m.succs(bb), vec![bb]);
    }

    #[test]
    fn test_resolves_through_linkage() {
        let mut m = Module::new("t");
        let void = m.tys.void;
        let f = m.add_function(Function {
            name: "_Z8handlersv".into(),
            dbg_name: Some(SIG_MISMATCH_HANDLER.into()),
            ret_ty: void,
            params: vec![],
            vararg: false,
            linkage: Linkage::External,
            attrs: FnAttrs::default(),
            ret_attrs: RetAttrs::default(),
            mem_effects: MemoryEffects::Unknown,
            blocks: vec![],
        });
        let linkage = LinkageMap::build(&m);
        let resolved = ensure_handler(&mut m, &linkage, SIG_MISMATCH_HANDLER).unwrap();
        assert_eq!(resolved, f);
    }
}
