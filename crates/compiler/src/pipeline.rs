//! Pass registry and staged execution.
//!
//! Passes are addressable by the names the driver surface exposes. Each
//! pass runs on a clone of the module and the result is committed only on
//! success, so a fatal diagnostic leaves the input module exactly as it
//! was at the start of the failing pass.

use aspis_ir::Module;
use tracing::info;

use crate::cfc::{self, CfcReport};
use crate::config::{CfcAlgorithm, HardeningConfig};
use crate::dup_globals::{self, DupGlobalsReport};
use crate::eddi::{self, EddiReport};
use crate::error::PassError;
use crate::lower_switch;
use crate::profiling::{self, ProfileReport};
use crate::rbr::{self, RbrReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    FuncRetToRef,
    Eddi,
    DuplicateGlobals,
    LowerSwitch,
    Rasm,
    Racfed,
    CheckProfile,
    InsertCheckProfile,
}

impl PassKind {
    pub const ALL: [PassKind; 8] = [
        PassKind::FuncRetToRef,
        PassKind::Eddi,
        PassKind::DuplicateGlobals,
        PassKind::LowerSwitch,
        PassKind::Rasm,
        PassKind::Racfed,
        PassKind::CheckProfile,
        PassKind::InsertCheckProfile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PassKind::FuncRetToRef => "func-ret-to-ref",
            PassKind::Eddi => "eddi-verify",
            PassKind::DuplicateGlobals => "duplicate-globals",
            PassKind::LowerSwitch => "lower-switch",
            PassKind::Rasm => "rasm-verify",
            PassKind::Racfed => "racfed-verify",
            PassKind::CheckProfile => "aspis-check-profile",
            PassKind::InsertCheckProfile => "aspis-insert-check-profile",
        }
    }

    pub fn parse(name: &str) -> Option<PassKind> {
        PassKind::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// What the executed passes reported back.
#[derive(Default)]
pub struct PipelineReport {
    pub rbr: Option<RbrReport>,
    pub eddi: Option<EddiReport>,
    pub dup_globals: Option<DupGlobalsReport>,
    pub cfc: Option<CfcReport>,
    pub profile: Option<ProfileReport>,
}

pub struct Pipeline {
    passes: Vec<PassKind>,
}

impl Pipeline {
    pub fn new(passes: Vec<PassKind>) -> Self {
        Pipeline { passes }
    }

    /// Parses a comma-separated pass list (`eddi-verify,rasm-verify`).
    pub fn parse(spec: &str) -> Result<Self, PassError> {
        let mut passes = Vec::new();
        for name in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match PassKind::parse(name) {
                Some(p) => passes.push(p),
                None => {
                    return Err(PassError::MalformedIr {
                        pass: "pipeline",
                        what: format!("unknown pass name {name}"),
                    });
                }
            }
        }
        Ok(Pipeline::new(passes))
    }

    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    pub fn run(
        &self,
        m: &mut Module,
        cfg: &HardeningConfig,
    ) -> Result<PipelineReport, PassError> {
        let mut report = PipelineReport::default();
        for &pass in &self.passes {
            info!(pass = pass.name(), "running");
            let mut staged = m.clone();
            match pass {
                PassKind::FuncRetToRef => report.rbr = Some(rbr::run(&mut staged, cfg)?),
                PassKind::Eddi => report.eddi = Some(eddi::run(&mut staged, cfg)?),
                PassKind::DuplicateGlobals => {
                    report.dup_globals = Some(dup_globals::run(&mut staged, cfg)?);
                }
                PassKind::LowerSwitch => lower_switch::run(&mut staged, cfg)?,
                PassKind::Rasm => report.cfc = Some(cfc::rasm::run(&mut staged, cfg)?),
                PassKind::Racfed => report.cfc = Some(cfc::racfed::run(&mut staged, cfg)?),
                PassKind::CheckProfile => {
                    report.profile = Some(profiling::check_profile(&staged)?);
                }
                PassKind::InsertCheckProfile => {
                    profiling::insert_check_profile(&mut staged, cfg)?;
                }
            }
            *m = staged;
        }
        Ok(report)
    }
}

/// The canonical hardening order: return lowering, data duplication, switch
/// lowering, then the configured control-flow protector and optional
/// profiling markers.
pub fn canonical_passes(cfg: &HardeningConfig) -> Vec<PassKind> {
    let mut passes = vec![PassKind::FuncRetToRef, PassKind::Eddi, PassKind::LowerSwitch];
    match cfg.cfc {
        CfcAlgorithm::Rasm => passes.push(PassKind::Rasm),
        CfcAlgorithm::Racfed => passes.push(PassKind::Racfed),
        CfcAlgorithm::None => {}
    }
    if cfg.enable_profiling {
        passes.push(PassKind::InsertCheckProfile);
    }
    passes
}
