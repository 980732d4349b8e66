//! Fault-injection properties: a single bit flip in either half of a
//! duplicated pair is caught at the next synchronization point, and a
//! corrupted runtime signature diverts to the signature handler.

mod common;

use aspis_interp::ExecError;
use aspisc::{CfcAlgorithm, HardeningConfig, harden_module};
use common::{FaultSpec, run_program};

fn harden(build: fn() -> aspis_ir::Module, cfc: CfcAlgorithm) -> aspis_ir::Module {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HardeningConfig::default()
        .with_state_dir(dir.path())
        .with_cfc(cfc);
    let mut m = build();
    harden_module(&mut m, &cfg).unwrap();
    m
}

fn expect_trap(m: &aspis_ir::Module, fault: FaultSpec, handler: &str) {
    let (_, result) = run_program(m, Some(fault));
    match result {
        Err(ExecError::Trap { handler: h }) => {
            assert_eq!(h, handler, "fault routed to the wrong handler");
        }
        other => panic!("fault escaped detection: {other:?}"),
    }
}

#[test]
fn test_flip_in_shadow_stream_traps() {
    let m = harden(common::counter_module, CfcAlgorithm::None);
    // main calls incr_dup; corrupt the shadow of the first increment
    // before its store check.
    expect_trap(
        &m,
        FaultSpec {
            func: "incr_dup",
            value: "cv1_dup",
            occurrence: 1,
            bit: 3,
        },
        "DataCorruption_Handler",
    );
}

#[test]
fn test_flip_in_original_stream_traps() {
    let m = harden(common::counter_module, CfcAlgorithm::None);
    expect_trap(
        &m,
        FaultSpec {
            func: "incr_dup",
            value: "cv1",
            occurrence: 1,
            bit: 0,
        },
        "DataCorruption_Handler",
    );
}

#[test]
fn test_flip_of_branch_condition_shadow_traps() {
    let m = harden(common::fact_module, CfcAlgorithm::None);
    // The recursion check inside the duplicated factorial.
    expect_trap(
        &m,
        FaultSpec {
            func: "fact_ret_dup",
            value: "cmp_dup",
            occurrence: 1,
            bit: 0,
        },
        "DataCorruption_Handler",
    );
}

#[test]
fn test_corrupted_rasm_signature_traps() {
    let m = harden(common::fact_module, CfcAlgorithm::Rasm);
    expect_trap(
        &m,
        FaultSpec {
            func: "fact_ret_dup",
            value: "rasm_sig",
            occurrence: 1,
            bit: 5,
        },
        "SigMismatch_Handler",
    );
}

#[test]
fn test_corrupted_racfed_signature_traps() {
    let m = harden(common::fact_module, CfcAlgorithm::Racfed);
    expect_trap(
        &m,
        FaultSpec {
            func: "fact_ret_dup",
            value: "racfed_sig",
            occurrence: 1,
            bit: 9,
        },
        "SigMismatch_Handler",
    );
}

#[test]
fn test_corrupted_intra_block_update_traps() {
    let m = harden(common::loop_module, CfcAlgorithm::Racfed);
    // Any intra-block signature add feeding the next verification.
    expect_trap(
        &m,
        FaultSpec {
            func: "main",
            value: "sig_add",
            occurrence: 1,
            bit: 12,
        },
        "SigMismatch_Handler",
    );
}

#[test]
fn test_fault_free_run_never_traps() {
    for cfc in [CfcAlgorithm::Rasm, CfcAlgorithm::Racfed] {
        let m = harden(common::loop_module, cfc);
        let (out, result) = run_program(&m, None);
        result.expect("clean run");
        assert_eq!(out, vec!["2"]);
    }
}
