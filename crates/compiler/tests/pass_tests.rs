//! Pass-level integration: the standalone globals propagator, profiling
//! markers, and exception-edge handling through the whole pipeline.

mod common;

use std::collections::BTreeSet;

use aspis_ir::{
    Builder, Callee, GlobalVar, InstKind, IntPred, Module, Value, verify_module,
};
use aspisc::persistence::{EDDI_CSV, persist_compiled_functions};
use aspisc::{CfcAlgorithm, HardeningConfig, Pipeline};
use common::{name, new_func, run_program};

/// A module shaped like post-EDDI output linked against foreign code: a
/// `_dup`/`_original` family plus an uninstrumented writer function.
fn linked_module() -> Module {
    let mut m = Module::new("linked");
    let i32t = m.tys.i32;
    let void = m.tys.void;

    let zero = m.const_i32(0);
    let mut counter_gv = GlobalVar::new("counter", i32t);
    counter_gv.init = Some(zero);
    let counter = m.add_global(counter_gv);

    let consume = new_func(&mut m, "consume", void, &[("x", i32t)]);
    let bb = m.new_block(consume, "entry");
    Builder::at_end(&mut m, bb).ret_void();

    let consume_dup = new_func(&mut m, "consume_dup", void, &[("x", i32t), ("x_dup", i32t)]);
    let bb = m.new_block(consume_dup, "entry");
    Builder::at_end(&mut m, bb).ret_void();

    let hardened = new_func(&mut m, "hardened", void, &[]);
    let bb = m.new_block(hardened, "entry");
    Builder::at_end(&mut m, bb).ret_void();

    let hardened_orig = new_func(&mut m, "hardened_original", void, &[]);
    let bb = m.new_block(hardened_orig, "entry");
    Builder::at_end(&mut m, bb).ret_void();

    let writer = new_func(&mut m, "writer", void, &[]);
    let bb = m.new_block(writer, "entry");
    let five = Value::Const(m.const_i32(5));
    let mut b = Builder::at_end(&mut m, bb);
    b.store(five, Value::Global(counter));
    let v = b.load(i32t, Value::Global(counter));
    b.call(Callee::Direct(consume), void, vec![Value::Inst(v)]);
    b.call(Callee::Direct(hardened), void, vec![]);
    b.ret_void();
    name(&mut m, v, "v");
    m
}

#[test]
fn test_globals_propagator_clones_stores_and_redirects_calls() {
    let dir = tempfile::tempdir().unwrap();
    let compiled: BTreeSet<String> = ["hardened"].into_iter().map(String::from).collect();
    persist_compiled_functions(dir.path(), EDDI_CSV, &compiled).unwrap();

    let mut m = linked_module();
    let cfg = HardeningConfig::default().with_state_dir(dir.path());
    Pipeline::parse("duplicate-globals")
        .unwrap()
        .run(&mut m, &cfg)
        .unwrap();
    verify_module(&m).unwrap();

    let counter_dup = m.global_by_name("counter_dup").expect("shadow global");
    let writer = m.func_by_name("writer").unwrap();
    let entry = m.entry(writer);

    // the store got a sibling targeting the shadow
    let stores: Vec<_> = m
        .block(entry)
        .insts
        .iter()
        .filter(|&&i| matches!(m.inst(i).kind, InstKind::Store { .. }))
        .collect();
    assert_eq!(stores.len(), 2);
    assert!(
        stores
            .iter()
            .any(|&&i| m.inst(i).operands[1] == Value::Global(counter_dup))
    );

    // the load flowing into `consume` moved the call to `consume_dup`
    let consume = m.func_by_name("consume").unwrap();
    let consume_dup = m.func_by_name("consume_dup").unwrap();
    assert!(m.call_sites_of(consume).is_empty());
    let dup_calls = m.call_sites_of(consume_dup);
    assert_eq!(dup_calls.len(), 1);
    let args = &m.inst(dup_calls[0]).operands;
    assert_eq!(args.len(), 2);
    assert_ne!(args[0], args[1], "shadow argument missing");

    // calls into the compiled set were restored to the pristine clone
    let hardened = m.func_by_name("hardened").unwrap();
    let hardened_orig = m.func_by_name("hardened_original").unwrap();
    assert!(m.call_sites_of(hardened).is_empty());
    assert_eq!(m.call_sites_of(hardened_orig).len(), 1);
}

#[test]
fn test_profiling_markers_inserted_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = HardeningConfig::default().with_state_dir(dir.path());
    cfg.enable_profiling = true;
    let mut m = common::loop_module();
    Pipeline::parse("func-ret-to-ref,eddi-verify,aspis-insert-check-profile")
        .unwrap()
        .run(&mut m, &cfg)
        .unwrap();
    verify_module(&m).unwrap();
    assert!(m.func_by_name("aspis.syncpt").is_some());
    assert!(m.func_by_name("aspis.datacheck.begin").is_some());

    let report = aspisc::profiling::check_profile(&m).unwrap();
    let main = report
        .functions
        .iter()
        .find(|f| f.name == "main")
        .expect("main profiled");
    assert!(main.sync_points > 0);
    assert!(main.data_checks > 0);
}

#[test]
fn test_profiling_disabled_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HardeningConfig::default().with_state_dir(dir.path());
    let mut m = common::loop_module();
    Pipeline::parse("aspis-insert-check-profile")
        .unwrap()
        .run(&mut m, &cfg)
        .unwrap();
    assert!(m.func_by_name("aspis.syncpt").is_none());
}

/// `invoke`/landing-pad handling end to end.
fn invoke_module() -> Module {
    let mut m = Module::new("invoke");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);

    let compute = new_func(&mut m, "compute", i32t, &[]);
    let bb = m.new_block(compute, "entry");
    let seven = Value::Const(m.const_i32(7));
    Builder::at_end(&mut m, bb).ret(seven);

    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let normal = m.new_block(main, "normal");
    let lpad = m.new_block(main, "lpad");
    let ptr_ty = m.tys.ptr;
    let zero = Value::Const(m.const_i32(0));
    let one = Value::Const(m.const_i32(1));
    let nine = Value::Const(m.const_i32(9));

    let mut b = Builder::at_end(&mut m, entry);
    let r = b.invoke(Callee::Direct(compute), i32t, vec![], normal, lpad);
    name(&mut m, r, "r");

    let mut b = Builder::at_end(&mut m, normal);
    b.call(Callee::Direct(print), void, vec![Value::Inst(r)]);
    b.ret(zero);

    let mut b = Builder::at_end(&mut m, lpad);
    b.emit(InstKind::LandingPad { cleanup: true }, ptr_ty, vec![]);
    b.call(Callee::Direct(print), void, vec![nine]);
    b.ret(one);
    m
}

#[test]
fn test_invoke_and_landing_pad_survive_pipeline() {
    let reference = invoke_module();
    let (ref_out, ref_result) = run_program(&reference, None);
    ref_result.unwrap();
    assert_eq!(ref_out, vec!["7"]);

    for cfc in [CfcAlgorithm::Rasm, CfcAlgorithm::Racfed] {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HardeningConfig::default()
            .with_state_dir(dir.path())
            .with_cfc(cfc);
        let mut m = invoke_module();
        aspisc::harden_module(&mut m, &cfg).unwrap();
        verify_module(&m).unwrap();
        let (out, result) = run_program(&m, None);
        result.unwrap_or_else(|e| panic!("hardened invoke trapped ({cfc:?}): {e}"));
        assert_eq!(out, vec!["7"]);
    }
}

#[test]
fn test_two_target_switch_allowed_by_rasm() {
    // default + one case stays within the two-successor rule, no lowering
    // needed.
    let mut m = Module::new("sw2");
    let i32t = m.tys.i32;
    let void = m.tys.void;
    let print = new_func(&mut m, "print", void, &[("v", i32t)]);
    let main = new_func(&mut m, "main", i32t, &[]);
    let entry = m.new_block(main, "entry");
    let hit = m.new_block(main, "hit");
    let miss = m.new_block(main, "miss");
    let one = Value::Const(m.const_i32(1));
    let zero = Value::Const(m.const_i32(0));
    let mut b = Builder::at_end(&mut m, entry);
    let slot = b.alloca(i32t);
    b.store(one, Value::Inst(slot));
    let v = b.load(i32t, Value::Inst(slot));
    b.switch(Value::Inst(v), miss, vec![(1, hit)]);
    let mut b = Builder::at_end(&mut m, hit);
    b.call(Callee::Direct(print), void, vec![one]);
    b.ret(zero);
    let mut b = Builder::at_end(&mut m, miss);
    b.call(Callee::Direct(print), void, vec![zero]);
    b.ret(zero);

    let dir = tempfile::tempdir().unwrap();
    let cfg = HardeningConfig::default().with_state_dir(dir.path());
    Pipeline::parse("rasm-verify")
        .unwrap()
        .run(&mut m, &cfg)
        .unwrap();
    verify_module(&m).unwrap();
    let (out, result) = run_program(&m, None);
    result.unwrap();
    assert_eq!(out, vec!["1"]);
}

#[test]
fn test_handlers_materialized_once() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HardeningConfig::default().with_state_dir(dir.path());
    let mut m = common::fact_module();
    aspisc::harden_module(&mut m, &cfg).unwrap();
    let count = m
        .func_ids()
        .filter(|f| m.func(*f).name == "DataCorruption_Handler")
        .count();
    assert_eq!(count, 1);
    let count = m
        .func_ids()
        .filter(|f| m.func(*f).name == "SigMismatch_Handler")
        .count();
    assert_eq!(count, 1);

    // comparison predicate choice: integer pairs compare with `eq`
    let has_int_eq_check = m.func_ids().any(|f| {
        m.func(f).blocks.iter().any(|&bb| {
            m.block(bb).name.contains("VerificationBB")
                && m.block(bb)
                    .insts
                    .iter()
                    .any(|&i| matches!(m.inst(i).kind, InstKind::Icmp(IntPred::Eq)))
        })
    });
    assert!(has_int_eq_check);
}
