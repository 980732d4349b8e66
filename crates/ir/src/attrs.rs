//! Linkage, attribute sets and memory-effect summaries.
//!
//! Attribute kinds are a closed set over bitflags rather than an open string
//! space, so signature rewrites can strip exactly the kinds they must strip.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    External,
    Internal,
    Private,
    Weak,
    LinkOnce,
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadLocalMode {
    NotThreadLocal,
    GeneralDynamic,
    LocalExec,
}

bitflags! {
    /// Function-level attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FnAttrs: u32 {
        const NOINLINE      = 1 << 0;
        const ALWAYS_INLINE = 1 << 1;
        const NOUNWIND      = 1 << 2;
        const NORETURN      = 1 << 3;
        const OPTNONE       = 1 << 4;
        const COLD          = 1 << 5;
    }
}

impl Default for FnAttrs {
    fn default() -> Self {
        FnAttrs::empty()
    }
}

bitflags! {
    /// Per-parameter attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParamAttrs: u32 {
        const ZEXT       = 1 << 0;
        const SEXT       = 1 << 1;
        const NOUNDEF    = 1 << 2;
        const RETURNED   = 1 << 3;
        const STRUCT_RET = 1 << 4;
        const BYVAL      = 1 << 5;
        const NOCAPTURE  = 1 << 6;
        const NONNULL    = 1 << 7;
    }
}

impl Default for ParamAttrs {
    fn default() -> Self {
        ParamAttrs::empty()
    }
}

bitflags! {
    /// Return-value attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RetAttrs: u32 {
        const ZEXT    = 1 << 0;
        const SEXT    = 1 << 1;
        const NOUNDEF = 1 << 2;
        const NONNULL = 1 << 3;
    }
}

impl Default for RetAttrs {
    fn default() -> Self {
        RetAttrs::empty()
    }
}

/// Coarse memory-effect summary of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemoryEffects {
    None,
    ReadOnly,
    WriteOnly,
    /// May read and write anything.
    #[default]
    Unknown,
}
