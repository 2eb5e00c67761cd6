//! The handle side of a collection.
//!
//! A collector calls these in order: the pinning and normal roots and the
//! dependent handle fixed point while marking, then the weak passes, then the
//! pointer updates if it relocated anything, and finally aging. Each GC thread
//! passes its own [`ScanContext`] and only visits the tables it owns.

use super::callbacks::*;
use super::handle_type::{HandleType, VariableHandleMask, VariableHandleType};
use crate::table::{AgeMapViolation, HandleSlotRef, HandleTable, HandleTableMap, ScanFlags};
use crate::vm::{HandleTracer, ObjectModel, ScanContext, VMBinding};

fn scan_flags(sc: &ScanContext) -> ScanFlags {
    if sc.concurrent {
        ScanFlags::ASYNC
    } else {
        ScanFlags::NORMAL
    }
}

/// Run `callback` on the handles of `types` in every table `sc` owns.
#[allow(clippy::too_many_arguments)]
fn scan_types(
    map: &HandleTableMap,
    types: &[HandleType],
    condemned: u8,
    max_gen: u8,
    flags: ScanFlags,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
    callback: HandleCallback,
) -> DependentHandleContext {
    let types = HandleType::numbers(types);
    let tables = map.tables_for_scan(sc);
    let mut cx = TraceContext::new(sc, tracer);
    for table in tables {
        table.scan_handles_for_gc(&types, condemned, max_gen, flags, &mut |slot| {
            callback(slot, &mut cx)
        });
    }
    cx.dependent
}

/// Run `callback` on the variable handles whose current behaviour is in `mask`.
#[allow(clippy::too_many_arguments)]
fn scan_variable_handles(
    map: &HandleTableMap,
    mask: VariableHandleMask,
    condemned: u8,
    max_gen: u8,
    flags: ScanFlags,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
    callback: HandleCallback,
) {
    let types = [HandleType::Variable.as_u8()];
    let tables = map.tables_for_scan(sc);
    let mut cx = TraceContext::new(sc, tracer);
    for table in tables {
        table.scan_handles_for_gc(
            &types,
            condemned,
            max_gen,
            flags | ScanFlags::EXTRA_INFO,
            &mut |slot| {
                if mask.matches(slot.extra_info()) {
                    callback(slot, &mut cx)
                }
            },
        );
    }
}

/// Promote and pin the referents of pinning handles.
pub fn trace_pinning_roots<VM: VMBinding>(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Tracing pinning handle roots, condemned {}", condemned);
    let flags = scan_flags(sc);
    scan_types(map, &[HandleType::Pinned], condemned, max_gen, flags, sc, tracer, pin_object);
    scan_types(
        map,
        &[HandleType::AsyncPinned],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        async_pin_object::<VM>,
    );
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::Pinned),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        pin_object,
    );
}

/// Promote the referents of strong handles, and of ref-counted handles the
/// runtime reports as active. Sized-ref handles are promoted here too, unless
/// this is a blocking full collection, which measures them with
/// [`scan_sized_ref_handles`] instead.
pub fn trace_normal_roots<VM: VMBinding>(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Tracing normal handle roots, condemned {}", condemned);
    let flags = scan_flags(sc);
    let types: &[HandleType] = if condemned >= max_gen && !sc.concurrent {
        &[HandleType::Strong]
    } else {
        &[HandleType::Strong, HandleType::SizedRef]
    };
    scan_types(map, types, condemned, max_gen, flags, sc, tracer, promote_object);
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::Strong),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        promote_object,
    );
    // A concurrent collection cannot trust the reference counts.
    if !sc.concurrent {
        scan_types(
            map,
            &[HandleType::RefCounted],
            condemned,
            max_gen,
            flags,
            sc,
            tracer,
            promote_ref_counted::<VM>,
        );
    }
}

/// Promote the referents of sized-ref handles one at a time, recording in
/// each handle's extra info the bytes its referent kept alive.
pub fn scan_sized_ref_handles(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Measuring sized-ref handles");
    let flags = scan_flags(sc) | ScanFlags::EXTRA_INFO;
    scan_types(
        map,
        &[HandleType::SizedRef],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        calculate_sized_ref_size,
    );
}

/// Clear short weak handles whose referents were not promoted.
pub fn check_alive(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Clearing dead short weak handles");
    let flags = scan_flags(sc);
    scan_types(
        map,
        &[HandleType::WeakShort, HandleType::WeakInterop],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        check_promoted,
    );
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::WeakShort),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        check_promoted,
    );
}

/// Clear long weak handles, and ref-counted handles, whose referents were not
/// promoted. Runs after finalization has resurrected what it needs.
pub fn check_reachable(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Clearing dead long weak handles");
    let flags = scan_flags(sc);
    scan_types(
        map,
        &[HandleType::WeakLong, HandleType::RefCounted],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        check_promoted,
    );
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::WeakLong),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        check_promoted,
    );
}

/// Promote the secondaries of dependent handles whose primaries are
/// promoted, rescanning until a pass promotes nothing.
///
/// The collector must drain its mark stack and call this again while the
/// result reports both a promotion and unpromoted primaries, since marking
/// from a new secondary can make more primaries reachable.
pub fn scan_dependent_handles_for_promotion(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) -> DependentHandleContext {
    let flags = scan_flags(sc) | ScanFlags::EXTRA_INFO;
    let mut result = DependentHandleContext::default();
    let mut passes = 0;
    loop {
        let pass = scan_types(
            map,
            &[HandleType::Dependent],
            condemned,
            max_gen,
            flags,
            sc,
            tracer,
            promote_dependent_handle,
        );
        passes += 1;
        result.promoted |= pass.promoted;
        result.unpromoted_primaries = pass.unpromoted_primaries;
        if !pass.promoted || !pass.unpromoted_primaries {
            break;
        }
    }
    debug!(
        "Dependent handle promotion took {} passes: {:?}",
        passes, result
    );
    result
}

/// Clear dependent handles whose primaries died.
pub fn scan_dependent_handles_for_clearing(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    let flags = scan_flags(sc) | ScanFlags::EXTRA_INFO;
    scan_types(
        map,
        &[HandleType::Dependent],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        clear_dependent_handle,
    );
}

/// Relocate both objects of every dependent handle.
pub fn scan_dependent_handles_for_relocation(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    let flags = scan_flags(sc) | ScanFlags::EXTRA_INFO;
    scan_types(
        map,
        &[HandleType::Dependent],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        update_dependent_handle,
    );
}

/// Relocate the referents of the handles that do not pin.
pub fn update_pointers(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    debug!("Updating handle referents, condemned {}", condemned);
    let flags = scan_flags(sc);
    scan_types(
        map,
        &[
            HandleType::WeakShort,
            HandleType::WeakLong,
            HandleType::Strong,
            HandleType::RefCounted,
            HandleType::WeakInterop,
            HandleType::SizedRef,
        ],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        update_pointer,
    );
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::WeakShort)
            .with(VariableHandleType::WeakLong)
            .with(VariableHandleType::Strong),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        update_pointer,
    );
}

/// Report the referents of pinning handles to the relocation phase, which
/// leaves them in place.
pub fn update_pinned_pointers(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &mut ScanContext,
    tracer: &mut dyn HandleTracer,
) {
    let flags = scan_flags(sc);
    scan_types(
        map,
        &[HandleType::Pinned, HandleType::AsyncPinned],
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        update_pointer_pinned,
    );
    scan_variable_handles(
        map,
        VariableHandleMask::of(VariableHandleType::Pinned),
        condemned,
        max_gen,
        flags,
        sc,
        tracer,
        update_pointer_pinned,
    );
}

/// Age the clumps a collection of generations `0..=condemned` condemned.
pub fn age_handles(map: &HandleTableMap, condemned: u8, max_gen: u8, sc: &ScanContext) {
    debug!("Aging handles, condemned {}", condemned);
    let types = HandleType::all();
    for table in map.tables_for_scan(sc) {
        table.age_handles(types, condemned, max_gen, scan_flags(sc));
    }
}

/// The youngest generation a handle can keep alive.
fn min_generation<VM: VMBinding>(slot: &HandleSlotRef) -> u8 {
    match HandleType::from_u8(slot.handle_type()) {
        Some(ty) if ty.info().always_young => 0,
        _ => slot
            .object()
            .map_or(u8::MAX, VM::VMObjectModel::generation_of),
    }
}

/// Recompute the age of the condemned clumps from what their handles refer
/// to now. Used after a collection that did not promote survivors.
pub fn rejuvenate_handles<VM: VMBinding>(
    map: &HandleTableMap,
    condemned: u8,
    max_gen: u8,
    sc: &ScanContext,
) {
    debug!("Rejuvenating handles, condemned {}", condemned);
    let types = HandleType::all();
    for table in map.tables_for_scan(sc) {
        table.reset_age_map(
            types,
            condemned,
            max_gen,
            scan_flags(sc) | ScanFlags::EXTRA_INFO,
            &mut min_generation::<VM>,
        );
    }
}

/// Visit every live handle of every table `sc` owns, for diagnostics. The
/// callback sees the extra info of types that have one.
pub fn scan_pointers_for_diagnostics(
    map: &HandleTableMap,
    sc: &ScanContext,
    callback: &mut dyn FnMut(HandleType, &HandleSlotRef),
) {
    let types = HandleType::all();
    for table in map.tables_for_scan(sc) {
        table.enum_handles(types, ScanFlags::EXTRA_INFO, &mut |slot| {
            if let Some(ty) = HandleType::from_u8(slot.handle_type()) {
                callback(ty, slot);
            }
        });
    }
}

/// Check the age map of every table `sc` owns. Returns the handles whose
/// clump is older than what they keep alive.
pub fn verify_handle_tables<VM: VMBinding>(
    map: &HandleTableMap,
    max_gen: u8,
    sc: &ScanContext,
) -> Vec<AgeMapViolation> {
    let types = HandleType::all();
    let mut violations = Vec::new();
    for table in map.tables_for_scan(sc) {
        violations.extend(verify_table::<VM>(table, types, max_gen));
    }
    if !violations.is_empty() {
        warn!("Found {} age map violations", violations.len());
    }
    violations
}

fn verify_table<VM: VMBinding>(
    table: &HandleTable,
    types: &[u8],
    max_gen: u8,
) -> Vec<AgeMapViolation> {
    table.find_age_map_violations(types, max_gen, &mut |slot| {
        let primary = slot
            .object()
            .map_or(u8::MAX, VM::VMObjectModel::generation_of);
        if slot.handle_type() != HandleType::Dependent.as_u8() {
            return primary;
        }
        dependent_secondary(slot.extra_info())
            .map_or(primary, |s| primary.min(VM::VMObjectModel::generation_of(s)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::HandleTableBucket;
    use crate::util::test_util::mock_vm::{MockObject, MockTracer, MockVM, MOCK_MAX_GEN};

    fn map_with_table() -> HandleTableMap {
        let map = HandleTableMap::new(4);
        map.insert_bucket(HandleTableBucket::new(HandleType::type_flags(), 0, 1).unwrap());
        map
    }

    fn table(map: &HandleTableMap) -> &HandleTable {
        map.get_bucket(0).unwrap().table(0)
    }

    fn create(
        map: &HandleTableMap,
        ty: HandleType,
        object: MockObject,
        extra_info: usize,
    ) -> crate::table::ObjectHandle {
        table(map)
            .create_handle::<MockVM>(ty.as_u8(), Some(object.to_ref()), extra_info)
            .unwrap()
    }

    #[test]
    fn full_collection_leaves_sized_refs_to_their_own_pass() {
        let map = map_with_table();
        create(&map, HandleType::SizedRef, MockObject::new(1, 0), 0);
        create(&map, HandleType::Strong, MockObject::new(2, 0), 0);
        let mut sc = ScanContext::new();

        let mut tracer = MockTracer::new(MOCK_MAX_GEN);
        trace_normal_roots::<MockVM>(&map, MOCK_MAX_GEN, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(!tracer.promoted.contains(&1));
        assert!(tracer.promoted.contains(&2));
        scan_sized_ref_handles(&map, MOCK_MAX_GEN, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(tracer.promoted.contains(&1));

        let mut tracer = MockTracer::new(0);
        trace_normal_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(tracer.promoted.contains(&1));
    }

    #[test]
    fn variable_handles_follow_their_current_type() {
        let map = map_with_table();
        let weak = create(
            &map,
            HandleType::Variable,
            MockObject::new(1, 0),
            VariableHandleType::WeakShort.bits(),
        );
        create(
            &map,
            HandleType::Variable,
            MockObject::new(2, 0),
            VariableHandleType::Strong.bits(),
        );
        create(
            &map,
            HandleType::Variable,
            MockObject::new(3, 0),
            VariableHandleType::Pinned.bits(),
        );
        let mut sc = ScanContext::new();
        let mut tracer = MockTracer::new(0);
        trace_pinning_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert_eq!(tracer.pinned.iter().copied().collect::<Vec<_>>(), vec![3]);
        trace_normal_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(tracer.promoted.contains(&2));
        assert!(!tracer.promoted.contains(&1));
        check_alive(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(weak.is_null());
    }

    #[test]
    fn ref_counted_handles_are_weak_once_inactive() {
        let map = map_with_table();
        let active = create(&map, HandleType::RefCounted, MockObject::flagged(1, 0), 0);
        let inactive = create(&map, HandleType::RefCounted, MockObject::new(2, 0), 0);
        let mut sc = ScanContext::new();
        let mut tracer = MockTracer::new(0);
        trace_normal_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        check_reachable(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(!active.is_null());
        assert!(inactive.is_null());
    }

    #[test]
    fn concurrent_collection_skips_ref_counts() {
        let map = map_with_table();
        create(&map, HandleType::RefCounted, MockObject::flagged(1, 0), 0);
        let mut sc = ScanContext::new();
        sc.concurrent = true;
        let mut tracer = MockTracer::new(0);
        trace_normal_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert!(tracer.promoted.is_empty());
    }

    #[test]
    fn relocation_leaves_pinned_referents_in_place() {
        let map = map_with_table();
        let pinned_object = MockObject::new(1, 0);
        let strong_object = MockObject::new(2, 0);
        let pinned = create(&map, HandleType::Pinned, pinned_object, 0);
        let strong = create(&map, HandleType::Strong, strong_object, 0);
        let mut sc = ScanContext::new();
        let mut tracer = MockTracer::new(0);
        trace_pinning_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        trace_normal_roots::<MockVM>(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);

        sc.promotion = false;
        update_pinned_pointers(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        update_pointers(&map, 0, MOCK_MAX_GEN, &mut sc, &mut tracer);
        assert_eq!(pinned.fetch(), Some(pinned_object.to_ref()));
        assert_eq!(strong.fetch(), Some(strong_object.promoted().to_ref()));
    }

    #[test]
    fn diagnostics_see_every_type() {
        let map = map_with_table();
        create(&map, HandleType::Strong, MockObject::new(1, 0), 0);
        create(
            &map,
            HandleType::Dependent,
            MockObject::new(2, 0),
            dependent_extra_info(Some(MockObject::new(3, 0).to_ref())),
        );
        let sc = ScanContext::new();
        let mut seen = vec![];
        scan_pointers_for_diagnostics(&map, &sc, &mut |ty, slot| {
            seen.push((ty, slot.extra_info() != 0));
        });
        seen.sort_by_key(|(ty, _)| ty.as_u8());
        assert_eq!(
            seen,
            vec![(HandleType::Strong, false), (HandleType::Dependent, true)]
        );
    }

    #[test]
    fn aging_keeps_the_age_map_sound() {
        let map = map_with_table();
        let young = create(&map, HandleType::Strong, MockObject::new(1, 0), 0);
        let sc = ScanContext::new();
        assert!(verify_handle_tables::<MockVM>(&map, MOCK_MAX_GEN, &sc).is_empty());

        // Aging without promoting the referent leaves the clump claiming an
        // older generation than its object.
        age_handles(&map, 0, MOCK_MAX_GEN, &sc);
        assert_eq!(young.clump_age(), 1);
        let violations = verify_handle_tables::<MockVM>(&map, MOCK_MAX_GEN, &sc);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].handle, young);

        rejuvenate_handles::<MockVM>(&map, MOCK_MAX_GEN, MOCK_MAX_GEN, &sc);
        assert_eq!(young.clump_age(), 0);
        assert!(verify_handle_tables::<MockVM>(&map, MOCK_MAX_GEN, &sc).is_empty());
    }

    #[test]
    fn dependent_handles_force_young_clumps() {
        let map = map_with_table();
        let dependent = create(
            &map,
            HandleType::Dependent,
            MockObject::new(1, 2),
            dependent_extra_info(Some(MockObject::new(2, 2).to_ref())),
        );
        let strong = create(&map, HandleType::Strong, MockObject::new(3, 2), 0);
        let sc = ScanContext::new();
        for _ in 0..3 {
            age_handles(&map, MOCK_MAX_GEN, MOCK_MAX_GEN, &sc);
        }
        assert_eq!(dependent.clump_age(), 3);
        assert_eq!(strong.clump_age(), 3);

        rejuvenate_handles::<MockVM>(&map, MOCK_MAX_GEN, MOCK_MAX_GEN, &sc);
        assert_eq!(dependent.clump_age(), 0);
        assert_eq!(strong.clump_age(), 2);
    }
}
