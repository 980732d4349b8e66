//! Annotation and linkage indexes.
//!
//! The front-end records per-value annotations in the well-known
//! `llvm.global.annotations` array: constant structs whose first field is
//! the address of the annotated function or global and whose second field
//! points at (or directly holds) the annotation string. One scan populates
//! the index; unknown annotation strings warn and are ignored.

use std::collections::HashMap;

use aspis_ir::{ANNOTATIONS_GLOBAL, Const, ConstId, Module, Value};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Annotation {
    ToDuplicate,
    Exclude,
    RuntimeSig,
    RunAdjSig,
}

impl Annotation {
    fn parse(s: &str) -> Option<Annotation> {
        // Annotation strings are matched by prefix; the front-end may append
        // payloads after the marker.
        if s.starts_with("to_duplicate") {
            Some(Annotation::ToDuplicate)
        } else if s.starts_with("exclude") {
            Some(Annotation::Exclude)
        } else if s.starts_with("runtime_sig") {
            Some(Annotation::RuntimeSig)
        } else if s.starts_with("run_adj_sig") {
            Some(Annotation::RunAdjSig)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationIndex {
    map: HashMap<Value, Annotation>,
}

impl AnnotationIndex {
    /// Scans the annotation global once.
    pub fn scan(m: &Module) -> Self {
        let mut index = AnnotationIndex::default();
        let Some(g) = m.global_by_name(ANNOTATIONS_GLOBAL) else {
            return index;
        };
        let Some(init) = m.global(g).init else {
            return index;
        };
        let entries: Vec<ConstId> = match m.const_get(init) {
            Const::Array { elems, .. } => elems.clone(),
            Const::Struct { .. } => vec![init],
            _ => return index,
        };
        for entry in entries {
            let Const::Struct { fields, .. } = m.const_get(entry) else {
                continue;
            };
            if fields.len() < 2 {
                continue;
            }
            let Const::Ref(target) = m.const_get(fields[0]) else {
                continue;
            };
            let Some(text) = annotation_string(m, fields[1]) else {
                continue;
            };
            match Annotation::parse(&text) {
                Some(ann) => {
                    index.map.insert(*target, ann);
                }
                None => warn!(annotation = %text, "ignoring unknown annotation"),
            }
        }
        index
    }

    pub fn get(&self, v: Value) -> Option<Annotation> {
        self.map.get(&v).copied()
    }

    pub fn is(&self, v: Value, ann: Annotation) -> bool {
        self.get(v) == Some(ann)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Globals carrying the given annotation.
    pub fn globals_with(&self, ann: Annotation) -> Vec<aspis_ir::GlobalId> {
        let mut out: Vec<_> = self
            .map
            .iter()
            .filter_map(|(v, a)| match (v, a) {
                (Value::Global(g), a) if *a == ann => Some(*g),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }
}

/// The annotation string itself, or through one level of global indirection
/// (the front-end emits a pointer to a private string constant).
fn annotation_string(m: &Module, field: ConstId) -> Option<String> {
    let bytes = match m.const_get(field) {
        Const::Bytes { data, .. } => data.clone(),
        Const::Ref(Value::Global(g)) => match m.global(*g).init.map(|i| m.const_get(i)) {
            Some(Const::Bytes { data, .. }) => data.clone(),
            _ => return None,
        },
        _ => return None,
    };
    let trimmed: Vec<u8> = bytes.into_iter().take_while(|b| *b != 0).collect();
    String::from_utf8(trimmed).ok()
}

/// Appends an annotation entry targeting `target`. This is the writer side
/// of the contract the front-end follows; the tests use it to build
/// annotated inputs.
pub fn add_annotation(m: &mut Module, target: Value, text: &str) {
    let bytes = m.const_bytes(format!("{text}\0").into_bytes());
    let target_ref = m.const_ref(target);
    let entry = m.const_struct(vec![target_ref, bytes]);

    let mut entries = Vec::new();
    if let Some(g) = m.global_by_name(ANNOTATIONS_GLOBAL) {
        if let Some(init) = m.global(g).init {
            if let Const::Array { elems, .. } = m.const_get(init) {
                entries = elems.clone();
            }
        }
    }
    entries.push(entry);
    let elem_ty = m.const_type(entry);
    let init = m.const_array(elem_ty, entries);

    match m.global_by_name(ANNOTATIONS_GLOBAL) {
        Some(g) => {
            let value_ty = m.const_type(init);
            let gv = m.global_mut(g);
            gv.init = Some(init);
            gv.value_ty = value_ty;
        }
        None => {
            let value_ty = m.const_type(init);
            let mut gv = aspis_ir::GlobalVar::new(ANNOTATIONS_GLOBAL, value_ty);
            gv.init = Some(init);
            gv.section = Some(aspis_ir::METADATA_SECTION.to_string());
            gv.is_const = true;
            m.add_global(gv);
        }
    }
}

/// Source-level name to symbol names, read from debug subprograms. The
/// error-handler wiring resolves `DataCorruption_Handler` and
/// `SigMismatch_Handler` through this map.
#[derive(Debug, Clone, Default)]
pub struct LinkageMap {
    map: HashMap<String, Vec<String>>,
}

impl LinkageMap {
    pub fn build(m: &Module) -> Self {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for f in m.func_ids() {
            let func = m.func(f);
            let source = func.dbg_name.clone().unwrap_or_else(|| func.name.clone());
            map.entry(source).or_default().push(func.name.clone());
        }
        LinkageMap { map }
    }

    /// First symbol registered under the source-level name.
    pub fn resolve(&self, source_name: &str) -> Option<&str> {
        self.map
            .get(source_name)
            .and_then(|syms| syms.first())
            .map(String::as_str)
    }

    pub fn symbols(&self, source_name: &str) -> &[String] {
        self.map
            .get(source_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
