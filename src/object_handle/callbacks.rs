//! What each handle type does when a collector scan visits one of its handles.

use crate::table::HandleSlotRef;
use crate::util::{Address, ObjectReference};
use crate::vm::{HandleTracer, Interop, PromoteFlags, ScanContext, VMBinding};

/// Progress of one pass over the dependent handles.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DependentHandleContext {
    /// A secondary was promoted in this pass.
    pub promoted: bool,
    /// A non-null primary was seen that has not been promoted (yet).
    pub unpromoted_primaries: bool,
}

/// Everything a per-handle callback works with.
pub(crate) struct TraceContext<'a> {
    pub sc: &'a mut ScanContext,
    pub tracer: &'a mut dyn HandleTracer,
    pub dependent: DependentHandleContext,
}

impl<'a> TraceContext<'a> {
    pub fn new(sc: &'a mut ScanContext, tracer: &'a mut dyn HandleTracer) -> Self {
        TraceContext {
            sc,
            tracer,
            dependent: DependentHandleContext::default(),
        }
    }

    fn promote(&mut self, object: ObjectReference, flags: PromoteFlags) -> ObjectReference {
        self.tracer.promote(object, self.sc, flags)
    }

    fn is_promoted(&self, object: ObjectReference) -> bool {
        self.tracer.is_promoted(object)
    }
}

pub(crate) type HandleCallback = fn(&HandleSlotRef, &mut TraceContext);

fn object_from_extra_info(raw: usize) -> Option<ObjectReference> {
    ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
}

fn extra_info_from_object(object: Option<ObjectReference>) -> usize {
    object.map_or(0, |o| o.to_raw_address().as_usize())
}

/// Pass the referent to the collector and store back where it ended up.
fn promote_slot(slot: &HandleSlotRef, cx: &mut TraceContext, flags: PromoteFlags) {
    if let Some(object) = slot.object() {
        let new = cx.promote(object, flags);
        if new != object {
            slot.set_object(Some(new));
        }
    }
}

pub(crate) fn promote_object(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::NONE);
}

pub(crate) fn pin_object(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::PINNED);
}

/// Pin the referent, and every object the runtime says it keeps pinned.
pub(crate) fn async_pin_object<VM: VMBinding>(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::PINNED);
    if let Some(object) = slot.object() {
        VM::VMInterop::for_each_async_pinned_object(object, &mut |nested| {
            cx.promote(nested, PromoteFlags::PINNED)
        });
    }
}

pub(crate) fn promote_ref_counted<VM: VMBinding>(slot: &HandleSlotRef, cx: &mut TraceContext) {
    if let Some(object) = slot.object() {
        if !cx.is_promoted(object) && VM::VMInterop::is_ref_counted_handle_active(object) {
            promote_slot(slot, cx, PromoteFlags::NONE);
        }
    }
}

/// Clear a weak handle whose referent was not promoted.
pub(crate) fn check_promoted(slot: &HandleSlotRef, cx: &mut TraceContext) {
    if let Some(object) = slot.object() {
        if !cx.is_promoted(object) {
            trace!("Clearing {:?}, {:?} is dead", slot.handle(), object);
            slot.set_object(None);
        }
    }
}

/// Promote the referent and record in the extra info how many bytes that
/// promoted.
pub(crate) fn calculate_sized_ref_size(slot: &HandleSlotRef, cx: &mut TraceContext) {
    let thread = cx.sc.thread_number;
    let before = cx.tracer.promoted_bytes(thread);
    promote_slot(slot, cx, PromoteFlags::NONE);
    let after = cx.tracer.promoted_bytes(thread);
    slot.set_extra_info(after.saturating_sub(before));
}

pub(crate) fn update_pointer(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::NONE);
}

pub(crate) fn update_pointer_pinned(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::PINNED);
}

/// Promote the secondary of a dependent handle whose primary is promoted.
pub(crate) fn promote_dependent_handle(slot: &HandleSlotRef, cx: &mut TraceContext) {
    let Some(primary) = slot.object() else {
        return;
    };
    if !cx.is_promoted(primary) {
        cx.dependent.unpromoted_primaries = true;
        return;
    }
    if let Some(secondary) = object_from_extra_info(slot.extra_info()) {
        if !cx.is_promoted(secondary) {
            let new = cx.promote(secondary, PromoteFlags::NONE);
            if new != secondary {
                slot.set_extra_info(extra_info_from_object(Some(new)));
            }
            // The secondary may be the primary of another dependent handle.
            cx.dependent.promoted = true;
        }
    }
}

/// Clear both objects of a dependent handle whose primary is dead.
pub(crate) fn clear_dependent_handle(slot: &HandleSlotRef, cx: &mut TraceContext) {
    let Some(primary) = slot.object() else {
        return;
    };
    if !cx.is_promoted(primary) {
        trace!("Clearing dependent {:?}, {:?} is dead", slot.handle(), primary);
        slot.set_object(None);
        slot.set_extra_info(0);
    } else if let Some(secondary) = object_from_extra_info(slot.extra_info()) {
        debug_assert!(
            cx.is_promoted(secondary),
            "{:?} has a live primary but a dead secondary",
            slot.handle()
        );
    }
}

pub(crate) fn update_dependent_handle(slot: &HandleSlotRef, cx: &mut TraceContext) {
    promote_slot(slot, cx, PromoteFlags::NONE);
    if let Some(secondary) = object_from_extra_info(slot.extra_info()) {
        let new = cx.promote(secondary, PromoteFlags::NONE);
        if new != secondary {
            slot.set_extra_info(extra_info_from_object(Some(new)));
        }
    }
}

/// The secondary object of a dependent handle, from its extra info.
pub(crate) fn dependent_secondary(raw: usize) -> Option<ObjectReference> {
    object_from_extra_info(raw)
}

pub(crate) fn dependent_extra_info(secondary: Option<ObjectReference>) -> usize {
    extra_info_from_object(secondary)
}
