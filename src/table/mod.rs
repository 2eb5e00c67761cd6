//! The generic handle table engine.
//!
//! Handles live in 64 KiB segments that are carved into 64-handle blocks. A
//! block belongs to one handle type at a time, and the blocks of a type are
//! linked into a per-segment allocation chain. Every table caches a few handles
//! per type so that single handle allocation and release rarely take the
//! table lock. During a collection the scanning engine visits the blocks of the
//! requested types, using a per-clump age map to skip clumps that cannot refer
//! to the condemned generations.
//!
//! This layer knows nothing about handle semantics. Types are small integers,
//! and the only per-type knowledge is a set of [`HandleTypeFlags`].

mod allocation;
mod bucket;
mod cache;
mod handle;
mod handle_table;
mod scan;
mod segment;

pub use self::bucket::HandleTableBucket;
pub use self::bucket::HandleTableMap;
pub use self::handle::ObjectHandle;
pub use self::handle_table::HandleTable;
pub use self::scan::build_age_mask;
pub use self::scan::compute_clump_mask;
pub use self::scan::AgeMapViolation;
pub use self::scan::HandleSlotRef;
pub use self::scan::ScanCallback;
pub use self::scan::ScanFlags;

/// Per-type flags a table is created with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleTypeFlags(u8);

impl HandleTypeFlags {
    pub const NONE: HandleTypeFlags = HandleTypeFlags(0);
    /// Each handle of the type owns a pointer-sized extra info value.
    pub const EXTRA_INFO: HandleTypeFlags = HandleTypeFlags(1);
    /// Handles of the type can keep objects other than their referent alive,
    /// so a store always resets their clump to the youngest age.
    pub const ALWAYS_YOUNG: HandleTypeFlags = HandleTypeFlags(2);

    pub const fn union(self, other: HandleTypeFlags) -> HandleTypeFlags {
        HandleTypeFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: HandleTypeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}
