use crate::table::handle_table::HandleTable;
use crate::table::segment::Segment;
use crate::table::HandleTypeFlags;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use crate::vm::{ObjectModel, VMBinding};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicUsize, Ordering};

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

static_assertions::const_assert!(HANDLE_HANDLES_PER_SEGMENT <= SLOT_MASK as usize);

/// An opaque handle: the identity of one slot in a handle table.
///
/// A handle encodes the id of its segment and the index of its slot within
/// the segment. The id is offset by one so that a handle is never zero and
/// `Option<ObjectHandle>` is as small as the handle itself. Everything else
/// about a handle (its type, its table, its extra info) is looked up through
/// the segment.
///
/// Handles are `Copy`. Using a handle after it has been destroyed, or after
/// its table has been destroyed, is a logic error that may panic.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(NonZeroU64);

impl ObjectHandle {
    pub(crate) fn new(segment_id: u32, slot_index: usize) -> ObjectHandle {
        debug_assert!(slot_index < HANDLE_HANDLES_PER_SEGMENT);
        let raw = ((segment_id as u64 + 1) << SLOT_BITS) | slot_index as u64;
        // The segment part is at least one.
        ObjectHandle(unsafe { NonZeroU64::new_unchecked(raw) })
    }

    /// The raw bits of the handle, suitable for passing through foreign code.
    pub fn as_raw(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a handle from [`ObjectHandle::as_raw`]. Returns `None` for zero
    /// or for a value with an impossible slot index.
    pub fn from_raw(raw: u64) -> Option<ObjectHandle> {
        if (raw & SLOT_MASK) as usize >= HANDLE_HANDLES_PER_SEGMENT || raw >> SLOT_BITS == 0 {
            return None;
        }
        NonZeroU64::new(raw).map(ObjectHandle)
    }

    pub(crate) fn segment_id(self) -> u32 {
        ((self.0.get() >> SLOT_BITS) - 1) as u32
    }

    pub(crate) fn slot_index(self) -> usize {
        (self.0.get() & SLOT_MASK) as usize
    }

    pub(crate) fn block_index(self) -> usize {
        self.slot_index() / HANDLE_HANDLES_PER_BLOCK
    }

    pub(crate) fn segment(self) -> &'static Segment {
        Segment::lookup(self.segment_id())
            .unwrap_or_else(|| panic!("{:?} refers to a freed segment", self))
    }

    fn slot(self) -> &'static AtomicUsize {
        self.segment().value_slot(self.slot_index())
    }

    /// The type of the handle, recovered from the type of its block.
    pub fn handle_type(self) -> u8 {
        self.segment().block_type(self.block_index())
    }

    /// The table that owns the handle.
    pub fn table(self) -> &'static HandleTable {
        self.segment().table()
    }

    /// Read the referent. Returns `None` if the handle is null.
    pub fn fetch(self) -> Option<ObjectReference> {
        let raw = self.slot().load(Ordering::Acquire);
        debug_assert_ne!(raw, DESTROYED_HANDLE_VALUE, "fetch from destroyed {:?}", self);
        ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
    }

    pub fn is_null(self) -> bool {
        self.slot().load(Ordering::Relaxed) == 0
    }

    /// Store `object` in the handle, updating the age map first.
    pub fn assign<VM: VMBinding>(self, object: Option<ObjectReference>) {
        if let Some(object) = object {
            self.write_barrier::<VM>(object);
        }
        self.slot().store(raw_value(object), Ordering::Release);
    }

    /// Store `object` in a handle that is known to be null.
    pub fn first_assign<VM: VMBinding>(self, object: Option<ObjectReference>) {
        debug_assert!(self.is_null(), "first assignment to non-null {:?}", self);
        self.assign::<VM>(object);
    }

    /// Atomically store `new` if the handle holds `expected`. Returns the
    /// value the handle held before the operation.
    pub fn compare_exchange<VM: VMBinding>(
        self,
        new: Option<ObjectReference>,
        expected: Option<ObjectReference>,
    ) -> Option<ObjectReference> {
        if let Some(object) = new {
            self.write_barrier::<VM>(object);
        }
        let previous = match self.slot().compare_exchange(
            raw_value(expected),
            raw_value(new),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        ObjectReference::from_raw_address(unsafe { Address::from_usize(previous) })
    }

    /// Record that the handle now refers to `object`.
    ///
    /// A clump whose recorded age is older than the generation of a newly
    /// stored referent is reset to age 0, so that the next ephemeral scan
    /// visits it. Handle types flagged [`HandleTypeFlags::ALWAYS_YOUNG`] reset
    /// their clump on every store.
    pub fn write_barrier<VM: VMBinding>(self, object: ObjectReference) {
        let segment = self.segment();
        let index = self.slot_index();
        let age = segment.clump_age(index);
        if age == 0 {
            return;
        }
        let ty = segment.block_type(index / HANDLE_HANDLES_PER_BLOCK);
        let generation = if segment
            .table()
            .type_flags(ty)
            .contains(HandleTypeFlags::ALWAYS_YOUNG)
        {
            0
        } else {
            VM::VMObjectModel::generation_of(object)
        };
        if age > generation {
            segment.clear_clump_age(index);
        }
    }

    /// The age recorded for the handle's clump.
    pub fn clump_age(self) -> u8 {
        self.segment().clump_age(self.slot_index())
    }

    pub(crate) fn extra_info_slot(self) -> Option<&'static AtomicUsize> {
        self.segment().user_data_slot(self.slot_index())
    }

    /// The extra info of the handle, or 0 if its type carries none.
    pub fn extra_info(self) -> usize {
        self.extra_info_slot()
            .map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    /// Set the extra info of a handle of type `ty`. Returns false, storing
    /// nothing, if the handle's type carries no extra info.
    pub fn set_extra_info(self, ty: u8, value: usize) -> bool {
        debug_assert_eq!(self.handle_type(), ty, "{:?} has the wrong type", self);
        match self.extra_info_slot() {
            Some(slot) => {
                slot.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Atomically replace the extra info of a handle of type `ty` if it equals
    /// `expected`. Returns the previous value, or 0 if the type carries none.
    pub fn compare_exchange_extra_info(self, ty: u8, expected: usize, new: usize) -> usize {
        debug_assert_eq!(self.handle_type(), ty, "{:?} has the wrong type", self);
        match self.extra_info_slot() {
            Some(slot) => {
                match slot.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(previous) | Err(previous) => previous,
                }
            }
            None => 0,
        }
    }
}

fn raw_value(object: Option<ObjectReference>) -> usize {
    object.map_or(0, |o| o.to_raw_address().as_usize())
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({}:{})", self.segment_id(), self.slot_index())
    }
}
