//! The per-type handle cache.
//!
//! Each type has a reserve bank that single allocations take from and a free
//! bank that single frees put into, plus a one-slot quick cache in front of
//! both. Taking a slot is one atomic decrement (reserve) or increment (free)
//! of the bank's index; only when a bank runs dry or fills up does a thread
//! take the table lock and rebalance the banks against each other or against
//! the table.
//!
//! A slot is claimed by moving an index, and filled or emptied afterwards, so
//! a reader may find a claimed slot that is not yet written. Readers spin until
//! the slot is non-zero, writers until it is zero.

use crate::table::allocation::sort_for_free;
use crate::table::handle::ObjectHandle;
use crate::table::handle_table::{HandleTable, TableState};
use crate::util::constants::*;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

pub(crate) struct HandleTypeCache {
    /// Handles ready for allocation live in `[0, reserve_index)`.
    reserve_bank: [AtomicU64; HANDLES_PER_CACHE_BANK],
    reserve_index: AtomicIsize,
    /// Freed handles live in `[0, free_index)`.
    free_bank: [AtomicU64; HANDLES_PER_CACHE_BANK],
    free_index: AtomicIsize,
}

const BANK: isize = HANDLES_PER_CACHE_BANK as isize;

impl HandleTypeCache {
    pub(crate) fn new() -> Self {
        HandleTypeCache {
            reserve_bank: std::array::from_fn(|_| AtomicU64::new(0)),
            reserve_index: AtomicIsize::new(0),
            free_bank: std::array::from_fn(|_| AtomicU64::new(0)),
            free_index: AtomicIsize::new(0),
        }
    }

    /// Number of handles sitting in both banks.
    pub(crate) fn cached_count(&self) -> usize {
        let reserve = self.reserve_index.load(Ordering::Relaxed).clamp(0, BANK);
        let free = self.free_index.load(Ordering::Relaxed).clamp(0, BANK);
        (reserve + free) as usize
    }
}

fn sync_read_and_zero(slot: &AtomicU64) -> ObjectHandle {
    loop {
        if let Some(handle) = ObjectHandle::from_raw(slot.swap(0, Ordering::Acquire)) {
            return handle;
        }
        std::hint::spin_loop();
    }
}

fn sync_write(slot: &AtomicU64, handle: ObjectHandle) {
    while slot
        .compare_exchange_weak(0, handle.as_raw(), Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

impl HandleTable {
    /// Allocate one handle of type `ty`, from the quick cache or the reserve
    /// bank if possible. The handle is returned null.
    pub(crate) fn alloc_single_from_cache(&self, ty: u8) -> Option<ObjectHandle> {
        let quick = &self.quick_cache[ty as usize];
        let handle = if quick.load(Ordering::Relaxed) != 0 {
            ObjectHandle::from_raw(quick.swap(0, Ordering::Acquire))
        } else {
            None
        };
        let handle = match handle {
            Some(handle) => Some(handle),
            None => {
                let cache = &self.caches[ty as usize];
                let index = cache.reserve_index.fetch_sub(1, Ordering::AcqRel) - 1;
                if index >= 0 {
                    Some(sync_read_and_zero(&cache.reserve_bank[index as usize]))
                } else {
                    self.cache_miss_on_alloc(ty)
                }
            }
        };
        if let Some(handle) = handle {
            handle.segment().value_slot(handle.slot_index()).store(0, Ordering::Relaxed);
        }
        handle
    }

    /// Return one handle of type `ty` to the cache. The handle's value and
    /// extra info are cleared here.
    pub(crate) fn free_single_to_cache(&self, ty: u8, handle: ObjectHandle) {
        let segment = handle.segment();
        let poison = if cfg!(any(debug_assertions, feature = "extreme_assertions")) {
            DESTROYED_HANDLE_VALUE
        } else {
            0
        };
        segment
            .value_slot(handle.slot_index())
            .store(poison, Ordering::Relaxed);
        if let Some(slot) = handle.extra_info_slot() {
            slot.store(0, Ordering::Relaxed);
        }

        let quick = &self.quick_cache[ty as usize];
        let mut handle = handle;
        if quick.load(Ordering::Relaxed) == 0 {
            match ObjectHandle::from_raw(quick.swap(handle.as_raw(), Ordering::AcqRel)) {
                None => return,
                Some(displaced) => handle = displaced,
            }
        }

        let cache = &self.caches[ty as usize];
        let index = cache.free_index.fetch_add(1, Ordering::AcqRel);
        if index < BANK {
            sync_write(&cache.free_bank[index as usize], handle);
        } else {
            self.cache_miss_on_free(ty, handle);
        }
    }

    fn cache_miss_on_alloc(&self, ty: u8) -> Option<ObjectHandle> {
        let mut state = self.lock_state();
        let cache = &self.caches[ty as usize];
        let index = cache.reserve_index.fetch_sub(1, Ordering::AcqRel) - 1;
        if index >= 0 {
            return Some(sync_read_and_zero(&cache.reserve_bank[index as usize]));
        }
        // Close the free bank to mutators while its contents move.
        let free = cache.free_index.swap(BANK, Ordering::AcqRel);
        self.quick_rebalance(&mut state, ty, 0, free.clamp(0, BANK) as usize, true, None)
    }

    fn cache_miss_on_free(&self, ty: u8, handle: ObjectHandle) {
        let mut state = self.lock_state();
        let cache = &self.caches[ty as usize];
        let index = cache.free_index.fetch_add(1, Ordering::AcqRel);
        if index < BANK {
            sync_write(&cache.free_bank[index as usize], handle);
            return;
        }
        // Close the reserve bank to mutators while its contents move.
        let reserve = cache.reserve_index.swap(0, Ordering::AcqRel);
        self.quick_rebalance(
            &mut state,
            ty,
            reserve.clamp(0, BANK) as usize,
            BANK as usize,
            false,
            Some(handle),
        );
    }

    /// Move handles from the free bank to the reserve bank. Falls back to a
    /// full rebalance if the cache would end up too empty or too full.
    ///
    /// Both banks must be closed to mutators: `reserve_avail` and `free_avail`
    /// are the handles claimed-or-present in each.
    fn quick_rebalance(
        &self,
        state: &mut TableState,
        ty: u8,
        mut reserve_avail: usize,
        free_avail: usize,
        want_out: bool,
        extra_in: Option<ObjectHandle>,
    ) -> Option<ObjectHandle> {
        let total = reserve_avail + free_avail + extra_in.is_some() as usize;
        if !(REBALANCE_LOWATER_MARK..=REBALANCE_HIWATER_MARK).contains(&total) {
            return self.full_rebalance(state, ty, reserve_avail, free_avail, want_out, extra_in);
        }

        let cache = &self.caches[ty as usize];
        let transfer = free_avail.min(HANDLES_PER_CACHE_BANK - reserve_avail);
        let mut free_left = free_avail;
        for _ in 0..transfer {
            free_left -= 1;
            let handle = sync_read_and_zero(&cache.free_bank[free_left]);
            sync_write(&cache.reserve_bank[reserve_avail], handle);
            reserve_avail += 1;
        }

        if let Some(handle) = extra_in {
            if reserve_avail < HANDLES_PER_CACHE_BANK {
                sync_write(&cache.reserve_bank[reserve_avail], handle);
                reserve_avail += 1;
            } else {
                sync_write(&cache.free_bank[free_left], handle);
                free_left += 1;
            }
        }

        let out = if want_out {
            if reserve_avail > 0 {
                reserve_avail -= 1;
                Some(sync_read_and_zero(&cache.reserve_bank[reserve_avail]))
            } else {
                free_left -= 1;
                Some(sync_read_and_zero(&cache.free_bank[free_left]))
            }
        } else {
            None
        };

        trace!(
            "Quick rebalance of type {} cache: reserve {}, free {}",
            ty,
            reserve_avail,
            free_left
        );
        cache.free_index.store(free_left as isize, Ordering::Release);
        cache.reserve_index.store(reserve_avail as isize, Ordering::Release);
        out
    }

    /// Gather every cached handle, top up from or give back to the table so
    /// that one bank's worth remains, and redistribute.
    fn full_rebalance(
        &self,
        state: &mut TableState,
        ty: u8,
        reserve_avail: usize,
        free_avail: usize,
        want_out: bool,
        extra_in: Option<ObjectHandle>,
    ) -> Option<ObjectHandle> {
        let cache = &self.caches[ty as usize];
        let mut handles = Vec::with_capacity(HANDLE_CACHE_TYPE_SIZE + 1);
        handles.extend(extra_in);
        for slot in cache.reserve_bank[..reserve_avail].iter() {
            handles.push(sync_read_and_zero(slot));
        }
        for slot in cache.free_bank[..free_avail].iter() {
            handles.push(sync_read_and_zero(slot));
        }

        if handles.len() < REBALANCE_LOWATER_MARK {
            let wanted = HANDLES_PER_CACHE_BANK - handles.len() + want_out as usize;
            let got = self.alloc_bulk_handles_locked(state, ty, wanted, &mut handles);
            if got < wanted {
                warn!("Handle cache of type {} refilled with {} of {} handles", ty, got, wanted);
            }
        } else if handles.len() > REBALANCE_HIWATER_MARK {
            let excess = handles.len() - HANDLES_PER_CACHE_BANK;
            sort_for_free(&mut handles);
            self.free_bulk_prepared_handles_locked(state, ty, &handles[..excess]);
            handles.drain(..excess);
        }

        let out = if want_out { handles.pop() } else { None };

        // Up to a bank's worth goes to the reserve bank, the rest to the free bank.
        let overflow = handles.len().saturating_sub(HANDLES_PER_CACHE_BANK);
        for (slot, &handle) in cache.free_bank.iter().zip(handles[..overflow].iter()) {
            sync_write(slot, handle);
        }
        cache.free_index.store(overflow as isize, Ordering::Release);
        let reserve = &handles[overflow..];
        for (slot, &handle) in cache.reserve_bank.iter().zip(reserve.iter()) {
            sync_write(slot, handle);
        }
        cache.reserve_index.store(reserve.len() as isize, Ordering::Release);

        debug!(
            "Full rebalance of type {} cache in table {}: reserve {}, free {}",
            ty,
            self.index(),
            reserve.len(),
            overflow
        );
        out
    }
}
