//! Hardening configuration.
//!
//! Options can be set programmatically (builder style), loaded from a TOML
//! file, or overridden by CLI flags. Unknown keys in a file are rejected.

use std::path::PathBuf;

use serde::Deserialize;

/// Which control-flow checking algorithm the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CfcAlgorithm {
    None,
    Rasm,
    Racfed,
}

/// Module-wide options for the hardening passes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HardeningConfig {
    /// Alternating (`true`) vs sequential (`false`) layout for duplicated
    /// globals, duplicated function parameters, duplicated allocas and
    /// doubled call-argument lists.
    pub alternate_memmap: bool,

    /// Section applied to duplicated uninitialized globals under the
    /// sequential layout.
    pub duplicate_sec: String,

    /// Emit profiling helper declarations and synchronization-point markers.
    pub enable_profiling: bool,

    /// Carry debug locations from nearby instructions onto synthesized ones.
    pub debug_enabled: bool,

    /// Consistency checks before stores.
    pub check_stores: bool,
    /// Consistency checks before multi-successor terminators.
    pub check_branches: bool,
    /// Consistency checks before calls.
    pub check_calls: bool,
    /// Consistency checks before returns.
    pub check_returns: bool,

    /// Control-flow checking algorithm run by `harden_module`.
    pub cfc: CfcAlgorithm,

    /// Inter-procedural RASM: save/restore signatures around calls through
    /// the `runtime_sig` / `run_adj_sig` annotated globals.
    pub intra_function_cfc: bool,

    /// Intrinsics whose calls are cloned rather than checked around.
    pub duplicated_intrinsics: Vec<String>,

    /// Seed for compile-time signature assignment. Fixed by default so
    /// rebuilds are reproducible.
    pub seed: u64,

    /// Directory holding the compiled-function CSVs.
    pub state_dir: PathBuf,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        HardeningConfig {
            alternate_memmap: false,
            duplicate_sec: ".dup_data".to_string(),
            enable_profiling: false,
            debug_enabled: false,
            check_stores: true,
            check_branches: true,
            check_calls: false,
            check_returns: false,
            cfc: CfcAlgorithm::Rasm,
            intra_function_cfc: false,
            duplicated_intrinsics: vec!["llvm.memcpy".to_string(), "llvm.memset".to_string()],
            seed: 0xA5715,
            state_dir: PathBuf::from("."),
        }
    }
}

impl HardeningConfig {
    pub fn new() -> Self {
        HardeningConfig::default()
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("failed to parse hardening config: {e}"))
    }

    pub fn with_alternate_memmap(mut self, on: bool) -> Self {
        self.alternate_memmap = on;
        self
    }

    pub fn with_cfc(mut self, algo: CfcAlgorithm) -> Self {
        self.cfc = algo;
        self
    }

    pub fn with_checks(mut self, stores: bool, branches: bool, calls: bool, returns: bool) -> Self {
        self.check_stores = stores;
        self.check_branches = branches;
        self.check_calls = calls;
        self.check_returns = returns;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// True when calls to `name` must be cloned as duplicatable intrinsics.
    pub fn is_duplicated_intrinsic(&self, name: &str) -> bool {
        self.duplicated_intrinsics
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    }
}
