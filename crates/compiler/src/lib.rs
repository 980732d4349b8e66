//! ASPIS compiler passes.
//!
//! Hardens an IR module against transient faults by combining three
//! transformations:
//!
//! 1. **Return-by-reference rewriting** ([`rbr`]): non-void functions
//!    become void clones writing their result through an out-pointer, so
//!    return values live in memory the duplication discipline covers.
//! 2. **EDDI** ([`eddi`]): globals, function signatures and instructions
//!    are duplicated into an original/shadow pair graph, with equality
//!    checks at synchronization points branching to a per-function error
//!    block on divergence.
//! 3. **Control-flow checking** ([`cfc`]): every basic block is assigned
//!    random compile-time signatures, maintained at runtime by additive
//!    updates on each edge and verified at block entry, in either the RASM
//!    or RACFED discipline.
//!
//! Passes compose by name through [`Pipeline`]; [`harden_module`] runs the
//! canonical order for a configuration:
//!
//! ```rust,ignore
//! use aspisc::{HardeningConfig, harden_module};
//!
//! let cfg = HardeningConfig::default();
//! let report = harden_module(&mut module, &cfg)?;
//! assert!(report.eddi.is_some());
//! ```
//!
//! Fault handlers (`DataCorruption_Handler`, `SigMismatch_Handler`) are
//! resolved through debug-subprogram names and synthesized when absent, so
//! a hardened module is always self-contained.

pub mod annotations;
pub mod cfc;
pub mod compile_set;
pub mod config;
pub mod dup_globals;
pub mod eddi;
pub mod error;
pub mod handlers;
pub mod lower_switch;
pub mod persistence;
pub mod pipeline;
pub mod profiling;
pub mod rbr;

pub use cfc::{CfcReport, SignatureTable};
pub use config::{CfcAlgorithm, HardeningConfig};
pub use eddi::{EddiReport, ShadowMap};
pub use error::PassError;
pub use pipeline::{PassKind, Pipeline, PipelineReport, canonical_passes};

use aspis_ir::Module;

/// Runs the canonical hardening pipeline over `m`.
pub fn harden_module(m: &mut Module, cfg: &HardeningConfig) -> Result<PipelineReport, PassError> {
    Pipeline::new(canonical_passes(cfg)).run(m, cfg)
}
