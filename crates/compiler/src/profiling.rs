//! Check-coverage profiling.
//!
//! `aspis-insert-check-profile` marks the transformed module for a
//! companion profiler: synchronization points call `aspis.syncpt`,
//! control-flow verification blocks call `aspis.cfcpt`, and data-check
//! comparison groups are bracketed by `aspis.datacheck.begin`/`.end`.
//! `aspis-check-profile` reads the markers back and reports per-function
//! coverage.

use std::collections::HashSet;

use aspis_ir::{
    Builder, Callee, FnAttrs, FuncId, Function, InstKind, Linkage, MemoryEffects, Module,
    RetAttrs,
};
use tracing::info;

use crate::annotations::AnnotationIndex;
use crate::compile_set::eligible_functions;
use crate::config::HardeningConfig;
use crate::error::PassError;

pub const SYNCPT: &str = "aspis.syncpt";
pub const CFCPT: &str = "aspis.cfcpt";
pub const DATACHECK_BEGIN: &str = "aspis.datacheck.begin";
pub const DATACHECK_END: &str = "aspis.datacheck.end";

#[derive(Debug, Clone, Default)]
pub struct FunctionProfile {
    pub name: String,
    pub sync_points: usize,
    pub cfc_points: usize,
    pub data_checks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub functions: Vec<FunctionProfile>,
}

fn helper(m: &mut Module, name: &str) -> FuncId {
    if let Some(f) = m.func_by_name(name) {
        return f;
    }
    let void = m.tys.void;
    m.add_function(Function {
        name: name.to_string(),
        dbg_name: None,
        ret_ty: void,
        params: vec![],
        vararg: false,
        linkage: Linkage::External,
        attrs: FnAttrs::NOINLINE,
        ret_attrs: RetAttrs::default(),
        mem_effects: MemoryEffects::Unknown,
        blocks: vec![],
    })
}

fn is_data_check_block(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("verification") && !lower.contains("rasm") && !lower.contains("racfed")
}

fn is_cfc_block(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("rasm") || lower.contains("racfed")
}

/// Inserts the profiling markers. A no-op unless `enable_profiling` is on.
pub fn insert_check_profile(m: &mut Module, cfg: &HardeningConfig) -> Result<(), PassError> {
    if !cfg.enable_profiling {
        return Ok(());
    }
    let ann = AnnotationIndex::scan(m);
    let fns = eligible_functions(m, &ann, &HashSet::new());
    let syncpt = helper(m, SYNCPT);
    let cfcpt = helper(m, CFCPT);
    let begin = helper(m, DATACHECK_BEGIN);
    let end = helper(m, DATACHECK_END);
    let void = m.tys.void;

    for f in fns {
        for block in m.func(f).blocks.clone() {
            let name = m.block(block).name.clone();
            if is_data_check_block(&name) {
                Builder::at_start(m, block).call(Callee::Direct(begin), void, vec![]);
                if let Some(term) = m.terminator(block) {
                    Builder::before(m, term).call(Callee::Direct(end), void, vec![]);
                }
                continue;
            }
            if is_cfc_block(&name) {
                Builder::at_start(m, block).call(Callee::Direct(cfcpt), void, vec![]);
                continue;
            }
            // synchronization points: stores and multi-way terminators
            for i in m.block(block).insts.clone() {
                let inst = m.inst(i);
                let is_sync = matches!(inst.kind, InstKind::Store { .. })
                    || (inst.is_terminator() && inst.successors().len() > 1);
                if is_sync {
                    Builder::before(m, i).call(Callee::Direct(syncpt), void, vec![]);
                }
            }
        }
    }
    Ok(())
}

/// Counts the markers back out of a profiled module.
pub fn check_profile(m: &Module) -> Result<ProfileReport, PassError> {
    let marker = |name: &str| m.func_by_name(name);
    let syncpt = marker(SYNCPT);
    let cfcpt = marker(CFCPT);
    let begin = marker(DATACHECK_BEGIN);

    let mut report = ProfileReport::default();
    for f in m.func_ids() {
        if m.func(f).is_declaration() {
            continue;
        }
        let mut profile = FunctionProfile {
            name: m.func(f).name.clone(),
            ..FunctionProfile::default()
        };
        for &block in &m.func(f).blocks {
            for &i in &m.block(block).insts {
                let Some(Callee::Direct(target)) = m.inst(i).callee() else {
                    continue;
                };
                if Some(target) == syncpt {
                    profile.sync_points += 1;
                } else if Some(target) == cfcpt {
                    profile.cfc_points += 1;
                } else if Some(target) == begin {
                    profile.data_checks += 1;
                }
            }
        }
        if profile.sync_points + profile.cfc_points + profile.data_checks > 0 {
            info!(
                func = %profile.name,
                sync = profile.sync_points,
                cfc = profile.cfc_points,
                data = profile.data_checks,
                "check profile"
            );
            report.functions.push(profile);
        }
    }
    Ok(report)
}
