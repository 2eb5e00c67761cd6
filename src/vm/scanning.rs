use crate::util::ObjectReference;

/// Flags passed to [`HandleTracer::promote`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromoteFlags(u32);

impl PromoteFlags {
    pub const NONE: PromoteFlags = PromoteFlags(0);
    /// The reference may point into the middle of an object.
    pub const INTERIOR: PromoteFlags = PromoteFlags(1);
    /// The referent must not move in this collection.
    pub const PINNED: PromoteFlags = PromoteFlags(2);

    pub fn contains(self, other: PromoteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PromoteFlags {
    type Output = PromoteFlags;
    fn bitor(self, rhs: PromoteFlags) -> PromoteFlags {
        PromoteFlags(self.0 | rhs.0)
    }
}

/// Per-thread state of a collector thread taking part in a handle scan.
#[derive(Clone, Debug)]
pub struct ScanContext {
    /// Which GC thread this is. In server mode this selects the tables scanned.
    pub thread_number: usize,
    /// How many GC threads scan handles in parallel.
    pub thread_count: usize,
    /// True while marking, false while relocating.
    pub promotion: bool,
    /// True if the collection runs concurrently with mutators.
    pub concurrent: bool,
}

impl ScanContext {
    /// A context for a single-threaded, stop-the-world scan.
    pub fn new() -> Self {
        ScanContext {
            thread_number: 0,
            thread_count: 1,
            promotion: true,
            concurrent: false,
        }
    }

    /// Should this thread scan the table at `index` of a bucket with `table_count` tables?
    pub fn owns_table(&self, index: usize, table_count: usize) -> bool {
        if table_count == 1 {
            // A workstation bucket is scanned by thread 0 only.
            return self.thread_number == 0;
        }
        index % self.thread_count.max(1) == self.thread_number
    }
}

impl Default for ScanContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector side of a handle scan.
///
/// The handle table never decides liveness itself. During marking it asks the
/// collector to promote referents and to report whether an object has been
/// promoted. During relocation, `promote` returns the new location of the
/// object and the handle is updated in place.
pub trait HandleTracer {
    /// Promote (mark, or copy) `object` and return its current location.
    fn promote(
        &mut self,
        object: ObjectReference,
        context: &mut ScanContext,
        flags: PromoteFlags,
    ) -> ObjectReference;

    /// Has `object` been promoted in the current collection?
    fn is_promoted(&self, object: ObjectReference) -> bool;

    /// Total bytes promoted so far by the given GC thread. Sized-ref handles
    /// record the growth of this counter across the promotion of their referent.
    fn promoted_bytes(&self, _thread_number: usize) -> usize {
        0
    }
}
