//! Value handles and arena ids.

use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Handle to an instruction in the module arena.
    InstId
);
arena_id!(
    /// Handle to a basic block in the module arena.
    BlockId
);
arena_id!(
    /// Handle to a function.
    FuncId
);
arena_id!(
    /// Handle to a global variable.
    GlobalId
);
arena_id!(
    /// Handle to an interned constant.
    ConstId
);

/// An SSA value: anything an instruction operand can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Inst(InstId),
    /// `Arg(f, i)` is the i-th formal parameter of function `f`.
    Arg(FuncId, u32),
    Global(GlobalId),
    Func(FuncId),
    Const(ConstId),
}

impl From<InstId> for Value {
    fn from(id: InstId) -> Self {
        Value::Inst(id)
    }
}

impl From<GlobalId> for Value {
    fn from(id: GlobalId) -> Self {
        Value::Global(id)
    }
}

impl From<ConstId> for Value {
    fn from(id: ConstId) -> Self {
        Value::Const(id)
    }
}

impl Value {
    pub fn as_inst(self) -> Option<InstId> {
        match self {
            Value::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_inst(self) -> bool {
        matches!(self, Value::Inst(_))
    }

    pub fn is_const(self) -> bool {
        matches!(self, Value::Const(_))
    }
}
