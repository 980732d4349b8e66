//! Global-variable duplication.

use aspis_ir::{METADATA_SECTION, Module, Type, Value};
use tracing::debug;

use super::ShadowMap;
use crate::annotations::{Annotation, AnnotationIndex};
use crate::config::HardeningConfig;

/// Shadow-name suffix shared by globals, functions and instructions.
pub const DUP_SUFFIX: &str = "_dup";

/// Duplicates eligible globals and registers the pairs.
///
/// A global is duplicated when it is not constant, not aggregate- or
/// pointer-valued, not metadata, not excluded and not already a shadow;
/// `to_duplicate` overrides the shape filter. Under the sequential layout
/// all shadows land before the first original global and uninitialized
/// shadows get the configured duplicate section; under the alternating
/// layout each shadow sits immediately before its original.
pub(super) fn duplicate_globals(
    m: &mut Module,
    ann: &AnnotationIndex,
    cfg: &HardeningConfig,
    shadow: &mut ShadowMap,
) {
    let ids = m.global_ids();
    let first = ids.first().copied();
    for g in ids {
        let v = Value::Global(g);
        match ann.get(v) {
            Some(Annotation::RuntimeSig) | Some(Annotation::RunAdjSig) => continue,
            Some(Annotation::Exclude) => continue,
            _ => {}
        }
        let gv = m.global(g);
        if gv.name.ends_with(DUP_SUFFIX) || gv.section.as_deref() == Some(METADATA_SECTION) {
            continue;
        }
        let shape_skip = gv.is_const
            || matches!(
                m.types.get(gv.value_ty),
                Type::Struct { .. } | Type::Array { .. } | Type::Ptr
            );
        if shape_skip && !ann.is(v, Annotation::ToDuplicate) {
            continue;
        }

        let dup_name = format!("{}{}", gv.name, DUP_SUFFIX);
        if let Some(existing) = m.global_by_name(&dup_name) {
            // A rerun or a previous pass already made the clone; reuse it.
            shadow.insert_pair(v, Value::Global(existing));
            continue;
        }

        let mut copy = gv.clone();
        copy.name = dup_name;
        copy.section = None;
        if !cfg.alternate_memmap && gv.section.is_none() && gv.init.is_none() {
            copy.section = Some(cfg.duplicate_sec.clone());
        }
        let copy_id = if cfg.alternate_memmap {
            m.insert_global_before(g, copy)
        } else {
            match first {
                Some(anchor) => m.insert_global_before(anchor, copy),
                None => m.add_global(copy),
            }
        };
        debug!(global = %m.global(g).name, "duplicated global");
        shadow.insert_pair(v, Value::Global(copy_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::add_annotation;
    use aspis_ir::GlobalVar;

    fn setup() -> (Module, AnnotationIndex, HardeningConfig, ShadowMap) {
        (
            Module::new("t"),
            AnnotationIndex::default(),
            HardeningConfig::default(),
            ShadowMap::default(),
        )
    }

    #[test]
    fn test_scalar_global_duplicated_with_section() {
        let (mut m, _, cfg, mut shadow) = setup();
        let i32t = m.tys.i32;
        let g = m.add_global(GlobalVar::new("counter", i32t));
        let ann = AnnotationIndex::scan(&m);
        duplicate_globals(&mut m, &ann, &cfg, &mut shadow);

        let dup = m.global_by_name("counter_dup").expect("shadow exists");
        assert_eq!(shadow.shadow(Value::Global(g)), Some(Value::Global(dup)));
        // uninitialized + sequential layout: distinguished section,
        // placed before the original
        assert_eq!(m.global(dup).section.as_deref(), Some(".dup_data"));
        let order = m.global_ids();
        assert!(
            order.iter().position(|x| *x == dup).unwrap()
                < order.iter().position(|x| *x == g).unwrap()
        );
    }

    #[test]
    fn test_shape_filter_skips_arrays_unless_forced() {
        let (mut m, _, cfg, mut shadow) = setup();
        let i32t = m.tys.i32;
        let arr = m.array_type(i32t, 4);
        let skipped = m.add_global(GlobalVar::new("table", arr));
        let forced = m.add_global(GlobalVar::new("key", arr));
        add_annotation(&mut m, Value::Global(forced), "to_duplicate");
        let ann = AnnotationIndex::scan(&m);
        duplicate_globals(&mut m, &ann, &cfg, &mut shadow);

        assert!(m.global_by_name("table_dup").is_none());
        assert!(m.global_by_name("key_dup").is_some());
        assert!(!shadow.contains(Value::Global(skipped)));
    }

    #[test]
    fn test_existing_dup_reused() {
        let (mut m, _, cfg, mut shadow) = setup();
        let i32t = m.tys.i32;
        let g = m.add_global(GlobalVar::new("x", i32t));
        let pre = m.add_global(GlobalVar::new("x_dup", i32t));
        let ann = AnnotationIndex::scan(&m);
        duplicate_globals(&mut m, &ann, &cfg, &mut shadow);
        assert_eq!(shadow.shadow(Value::Global(g)), Some(Value::Global(pre)));
        // and the pre-existing shadow itself spawned no shadow
        assert!(m.global_by_name("x_dup_dup").is_none());
    }

    #[test]
    fn test_alternating_layout_places_shadow_adjacent() {
        let (mut m, _, cfg, mut shadow) = setup();
        let cfg = cfg.with_alternate_memmap(true);
        let i32t = m.tys.i32;
        let a = m.add_global(GlobalVar::new("a", i32t));
        let b = m.add_global(GlobalVar::new("b", i32t));
        let ann = AnnotationIndex::scan(&m);
        duplicate_globals(&mut m, &ann, &cfg, &mut shadow);
        let order: Vec<String> = m
            .global_ids()
            .iter()
            .map(|g| m.global(*g).name.clone())
            .collect();
        assert_eq!(order, vec!["a_dup", "a", "b_dup", "b"]);
        let _ = (a, b);
    }
}
