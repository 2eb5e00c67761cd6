use crate::table::allocation::sort_for_free;
use crate::table::cache::HandleTypeCache;
use crate::table::handle::ObjectHandle;
use crate::table::segment::Segment;
use crate::table::HandleTypeFlags;
use crate::util::constants::*;
use crate::util::ObjectReference;
use crate::vm::VMBinding;
use crossbeam::utils::CachePadded;
use spin::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// The part of a table that the table lock protects.
pub(crate) struct TableState {
    /// Segments in allocation order. The first segment is never freed.
    pub(crate) segments: Vec<&'static Segment>,
    /// The segment an asynchronous scan is currently visiting with the lock
    /// dropped. It must not be freed.
    pub(crate) async_scan_segment: Option<u32>,
}

/// A handle table: a set of segments holding handles of up to
/// [`HANDLE_MAX_PUBLIC_TYPES`] types, with a per-type cache in front.
///
/// A table is pinned in memory (it is always boxed) because its segments
/// point back at it.
pub struct HandleTable {
    type_flags: Box<[HandleTypeFlags]>,
    /// Index of the table's bucket in the map.
    index: AtomicU32,
    /// The owner of the table, such as an application domain.
    owner_index: u32,
    state: Mutex<TableState>,
    /// Handles handed out by the segments, including those sitting in caches.
    count: AtomicUsize,
    pub(crate) caches: Box<[CachePadded<HandleTypeCache>]>,
    pub(crate) quick_cache: Box<[CachePadded<AtomicU64>]>,
}

impl HandleTable {
    /// Create a table for handles of `type_flags.len()` types, with its first
    /// segment. Returns `None` if there are more than
    /// `HANDLE_MAX_PUBLIC_TYPES` types or the segment cannot be allocated.
    pub fn new(type_flags: &[HandleTypeFlags], owner_index: u32) -> Option<Box<HandleTable>> {
        debug_assert!(
            type_flags.len() <= HANDLE_MAX_PUBLIC_TYPES,
            "a table supports at most {} handle types",
            HANDLE_MAX_PUBLIC_TYPES
        );
        if type_flags.len() > HANDLE_MAX_PUBLIC_TYPES {
            error!("Cannot create a table for {} handle types", type_flags.len());
            return None;
        }
        let table = Box::new(HandleTable {
            type_flags: type_flags.into(),
            index: AtomicU32::new(0),
            owner_index,
            state: Mutex::new(TableState {
                segments: Vec::new(),
                async_scan_segment: None,
            }),
            count: AtomicUsize::new(0),
            caches: type_flags
                .iter()
                .map(|_| CachePadded::new(HandleTypeCache::new()))
                .collect(),
            quick_cache: type_flags
                .iter()
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        });
        let segment = Segment::alloc(&table)?;
        table.lock_state().segments.push(segment);
        debug!(
            "Created handle table for owner {} with {} types",
            owner_index,
            type_flags.len()
        );
        Some(table)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock()
    }

    pub fn type_count(&self) -> usize {
        self.type_flags.len()
    }

    pub fn type_flags(&self, ty: u8) -> HandleTypeFlags {
        self.type_flags
            .get(ty as usize)
            .copied()
            .unwrap_or(HandleTypeFlags::NONE)
    }

    pub fn type_has_extra_info(&self, ty: u8) -> bool {
        self.type_flags(ty).contains(HandleTypeFlags::EXTRA_INFO)
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub fn owner_index(&self) -> u32 {
        self.owner_index
    }

    fn is_supported_type(&self, ty: u8) -> bool {
        let supported = (ty as usize) < self.type_flags.len();
        debug_assert!(supported, "handle type {} is not supported by this table", ty);
        supported
    }

    /// Create a handle of type `ty` referring to `object`. For types with
    /// extra info, `extra_info` is stored before the referent, so a scan never
    /// sees the referent with stale extra info.
    pub fn create_handle<VM: VMBinding>(
        &self,
        ty: u8,
        object: Option<ObjectReference>,
        extra_info: usize,
    ) -> Option<ObjectHandle> {
        if !self.is_supported_type(ty) {
            return None;
        }
        let handle = match self.alloc_single_from_cache(ty) {
            Some(handle) => handle,
            None => {
                warn!("Out of memory creating a handle of type {}", ty);
                return None;
            }
        };
        if extra_info != 0 {
            debug_assert!(self.type_has_extra_info(ty), "type {} carries no extra info", ty);
            handle.set_extra_info(ty, extra_info);
        }
        handle.first_assign::<VM>(object);
        trace!("Created {:?} of type {} for {:?}", handle, ty, object);
        Some(handle)
    }

    pub fn destroy_handle(&self, ty: u8, handle: ObjectHandle) {
        debug_assert_eq!(handle.handle_type(), ty, "{:?} destroyed as the wrong type", handle);
        debug_assert!(self.contains_handle(handle));
        trace!("Destroying {:?} of type {}", handle, ty);
        self.free_single_to_cache(ty, handle);
    }

    pub fn destroy_handle_of_unknown_type(&self, handle: ObjectHandle) {
        self.destroy_handle(handle.handle_type(), handle);
    }

    /// Create up to `count` null handles of type `ty`. Fewer are returned only
    /// if memory runs out.
    pub fn create_handles(&self, ty: u8, count: usize) -> Vec<ObjectHandle> {
        if !self.is_supported_type(ty) {
            return Vec::new();
        }
        let mut handles = Vec::with_capacity(count);
        if count > SMALL_ALLOC_COUNT {
            let mut state = self.lock_state();
            self.alloc_bulk_handles_locked(&mut state, ty, count, &mut handles);
        }
        while handles.len() < count {
            match self.alloc_single_from_cache(ty) {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        if handles.len() < count {
            warn!("Created only {} of {} handles of type {}", handles.len(), count, ty);
        }
        handles
    }

    pub fn destroy_handles(&self, ty: u8, handles: &[ObjectHandle]) {
        if handles.len() > SMALL_ALLOC_COUNT {
            let mut state = self.lock_state();
            self.free_bulk_unprepared_handles_locked(&mut state, ty, handles);
        } else {
            for &handle in handles {
                self.destroy_handle(ty, handle);
            }
        }
    }

    /// Number of handles in use, not counting handles sitting in caches.
    pub fn count_handles(&self) -> usize {
        let cached: usize = self.caches.iter().map(|c| c.cached_count()).sum();
        let quick = self
            .quick_cache
            .iter()
            .filter(|q| q.load(Ordering::Relaxed) != 0)
            .count();
        self.count.load(Ordering::Relaxed).saturating_sub(cached + quick)
    }

    /// Number of handles of type `ty` in use, not counting cached ones.
    pub fn count_handles_of_type(&self, ty: u8) -> usize {
        if !self.is_supported_type(ty) {
            return 0;
        }
        let allocated: usize = {
            let state = self.lock_state();
            state
                .segments
                .iter()
                .map(|segment| {
                    (0..segment.empty_line())
                        .filter(|&block| segment.block_type(block) == ty)
                        .map(|block| segment.live_handles_in_block(block))
                        .sum::<usize>()
                })
                .sum()
        };
        let cache = &self.caches[ty as usize];
        let quick = (self.quick_cache[ty as usize].load(Ordering::Relaxed) != 0) as usize;
        allocated.saturating_sub(cache.cached_count() + quick)
    }

    pub fn contains_handle(&self, handle: ObjectHandle) -> bool {
        Segment::lookup(handle.segment_id()).map_or(false, |s| std::ptr::eq(s.table(), self))
    }

    /// Allocate handles straight from the segments, adding segments as
    /// needed. Returns the number appended to `out`.
    pub(crate) fn alloc_bulk_handles_locked(
        &self,
        state: &mut TableState,
        ty: u8,
        count: usize,
        out: &mut Vec<ObjectHandle>,
    ) -> usize {
        let mut remaining = count;
        for segment in state.segments.iter() {
            remaining -= segment.alloc_handles(ty, remaining, out);
            if remaining == 0 {
                break;
            }
        }
        while remaining > 0 {
            let sequence = state.segments.last().map_or(0, |s| s.sequence().wrapping_add(1));
            let segment = match Segment::alloc(self) {
                Some(segment) => segment,
                None => break,
            };
            segment.sequence.store(sequence, Ordering::Relaxed);
            state.segments.push(segment);
            remaining -= segment.alloc_handles(ty, remaining, out);
        }
        let allocated = count - remaining;
        self.count.fetch_add(allocated, Ordering::Relaxed);
        allocated
    }

    /// Free handles whose values are already cleared. Handles of the same
    /// segment should be adjacent, as [`sort_for_free`] arranges.
    pub(crate) fn free_bulk_prepared_handles_locked(
        &self,
        _state: &mut TableState,
        ty: u8,
        handles: &[ObjectHandle],
    ) {
        self.count.fetch_sub(handles.len(), Ordering::Relaxed);
        let mut rest = handles;
        while let Some(first) = rest.first() {
            let run = rest
                .iter()
                .take_while(|h| h.segment_id() == first.segment_id())
                .count();
            let segment = first.segment();
            debug_assert!(std::ptr::eq(segment.table(), self));
            segment.free_handles(ty, &rest[..run]);
            rest = &rest[run..];
        }
    }

    pub(crate) fn free_bulk_unprepared_handles_locked(
        &self,
        state: &mut TableState,
        ty: u8,
        handles: &[ObjectHandle],
    ) {
        let mut prepared = handles.to_vec();
        sort_for_free(&mut prepared);
        for handle in prepared.iter() {
            handle.segment().value_slot(handle.slot_index()).store(0, Ordering::Relaxed);
        }
        self.free_bulk_prepared_handles_locked(state, ty, &prepared);
    }

    /// Can `segment` be released right now? The first segment stays for the
    /// life of the table. A segment under an asynchronous scan, or with locked
    /// blocks, stays until the scan is done.
    pub(crate) fn can_free_segment_now(&self, state: &TableState, segment: &Segment) -> bool {
        state
            .segments
            .first()
            .map_or(false, |first| first.id() != segment.id())
            && state.async_scan_segment != Some(segment.id())
            && !segment.has_locked_blocks()
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        let index = self.index();
        let state = self.state.get_mut();
        debug!(
            "Destroying handle table {} with {} segments",
            index,
            state.segments.len()
        );
        for segment in state.segments.drain(..) {
            unsafe { Segment::free(segment) };
        }
    }
}
