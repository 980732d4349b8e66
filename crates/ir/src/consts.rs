//! Constant pool.
//!
//! Constants are interned and immutable. `Ref` takes the address of a global
//! or function; `Gep` is the inline constant-expression form of
//! `getelementptr`, which the duplication pass rebuilds with a substituted
//! base when the pointee has a shadow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TypeId;
use crate::value::{ConstId, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Const {
    Int {
        ty: TypeId,
        value: u64,
    },
    Float {
        ty: TypeId,
        bits: u64,
    },
    /// Null pointer.
    Null,
    Undef(TypeId),
    /// Constant data array of i8 (string-like initializers).
    Bytes {
        ty: TypeId,
        data: Vec<u8>,
    },
    Array {
        ty: TypeId,
        elems: Vec<ConstId>,
    },
    Struct {
        ty: TypeId,
        fields: Vec<ConstId>,
    },
    /// Address of a global or function.
    Ref(Value),
    /// Inline constant GEP over a constant base pointer.
    Gep {
        base: ConstId,
        source_elem: TypeId,
        indices: Vec<u64>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstPool {
    consts: Vec<Const>,
    #[serde(skip)]
    index: HashMap<Const, ConstId>,
}

impl ConstPool {
    pub fn intern(&mut self, c: Const) -> ConstId {
        // The reverse index is not serialized; rebuild it when a
        // deserialized pool is first mutated.
        if self.index.len() != self.consts.len() {
            self.index = self
                .consts
                .iter()
                .enumerate()
                .map(|(i, c)| (c.clone(), ConstId(i as u32)))
                .collect();
        }
        if let Some(id) = self.index.get(&c) {
            return *id;
        }
        let id = ConstId(self.consts.len() as u32);
        self.consts.push(c.clone());
        self.index.insert(c, id);
        id
    }

    pub fn get(&self, id: ConstId) -> &Const {
        &self.consts[id.index()]
    }

    pub fn len(&self) -> usize {
        self.consts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Type, TypePool};

    #[test]
    fn test_intern_dedupes() {
        let mut tys = TypePool::default();
        let i32t = tys.intern(Type::Int(32));
        let mut pool = ConstPool::default();
        let a = pool.intern(Const::Int { ty: i32t, value: 7 });
        let b = pool.intern(Const::Int { ty: i32t, value: 7 });
        let c = pool.intern(Const::Int { ty: i32t, value: 8 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }
}
