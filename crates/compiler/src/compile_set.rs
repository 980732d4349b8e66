//! The compile-set oracle: which functions a pass may transform.

use std::collections::HashSet;

use aspis_ir::{FuncId, Module, Value, clone_function_body};

use crate::annotations::{Annotation, AnnotationIndex};
use crate::handlers::{DATA_CORRUPTION_HANDLER, SIG_MISMATCH_HANDLER};

/// Suffix given to the pristine clones archived before EDDI runs.
pub const ORIGINAL_SUFFIX: &str = "_original";

/// Decides whether `f` is eligible for transformation: it has a body, is not
/// excluded by annotation, is not an archived pristine clone, and is not one
/// of the fault handlers or the `aspis.*` profiling helpers.
pub fn should_compile(
    m: &Module,
    f: FuncId,
    ann: &AnnotationIndex,
    archive: &HashSet<FuncId>,
) -> bool {
    let func = m.func(f);
    if func.is_declaration() || archive.contains(&f) {
        return false;
    }
    if func.name.ends_with(ORIGINAL_SUFFIX) {
        return false;
    }
    if ann.is(Value::Func(f), Annotation::Exclude) {
        return false;
    }
    let reserved = [DATA_CORRUPTION_HANDLER, SIG_MISMATCH_HANDLER];
    if reserved.contains(&func.name.as_str()) {
        return false;
    }
    if let Some(dbg) = &func.dbg_name {
        if reserved.contains(&dbg.as_str()) {
            return false;
        }
    }
    if func.name.starts_with("aspis.") || func.name.starts_with("llvm.") {
        return false;
    }
    true
}

/// Functions currently eligible, in module order.
pub fn eligible_functions(
    m: &Module,
    ann: &AnnotationIndex,
    archive: &HashSet<FuncId>,
) -> Vec<FuncId> {
    m.func_ids()
        .filter(|f| should_compile(m, *f, ann, archive))
        .collect()
}

/// Clones every function in `fns` verbatim into a `<name>_original` sibling
/// and returns the archive set. Re-running a pass then skips the archived
/// clones, making the pipeline idempotent.
pub fn archive_originals(m: &mut Module, fns: &[FuncId]) -> HashSet<FuncId> {
    let mut archive = HashSet::new();
    for &f in fns {
        let src = m.func(f).clone();
        let archived = m.add_function(aspis_ir::Function {
            name: format!("{}{}", src.name, ORIGINAL_SUFFIX),
            dbg_name: src.dbg_name.clone(),
            blocks: vec![],
            ..src
        });
        let mut arg_map = aspis_ir::ValueMap::new();
        for i in 0..m.func(f).params.len() as u32 {
            arg_map.insert(Value::Arg(f, i), Value::Arg(archived, i));
        }
        clone_function_body(m, f, archived, &arg_map);
        archive.insert(archived);
    }
    archive
}
