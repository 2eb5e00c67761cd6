//! Block and handle allocation within a segment.
//!
//! Everything here runs with the owning table's lock held. The lock is what
//! makes the read-modify-write sequences on chain links, free masks and free
//! counts safe; the atomics only make the individual fields readable by
//! lock-free readers (type lookups and asynchronous scans).

use crate::table::handle::ObjectHandle;
use crate::table::segment::Segment;
use crate::util::constants::*;
use crate::util::memory;
use crate::util::Address;
use std::cmp::Reverse;
use std::sync::atomic::Ordering;

impl Segment {
    fn insert_block_from_free_list_worker(&self, ty: u8, mut update_hint: bool) -> Option<u8> {
        let block = self.free_list.load(Ordering::Relaxed);
        if block == BLOCK_INVALID {
            return None;
        }

        if block >= self.empty_line.load(Ordering::Relaxed) {
            let commit_line = self.commit_line.load(Ordering::Relaxed);
            if block >= commit_line {
                let start = self.values_start() + commit_line as usize * HANDLE_BYTES_PER_BLOCK;
                if let Err(e) = memory::commit(start, BYTES_IN_PAGE) {
                    warn!("Failed to commit handle blocks in segment {}: {}", self.id(), e);
                    return None;
                }
                self.decommit_line.store(commit_line, Ordering::Relaxed);
                self.commit_line.store(
                    commit_line + (BYTES_IN_PAGE / HANDLE_BYTES_PER_BLOCK) as u8,
                    Ordering::Relaxed,
                );
                trace!(
                    "Segment {} committed blocks up to {}",
                    self.id(),
                    self.commit_line.load(Ordering::Relaxed)
                );
            }
            self.empty_line.store(block + 1, Ordering::Relaxed);
        }

        let b = block as usize;
        self.free_list
            .store(self.allocation[b].load(Ordering::Relaxed), Ordering::Relaxed);
        self.generation[b].store(u32::MAX, Ordering::Relaxed);
        // Publish the type before the block becomes reachable from a chain.
        self.block_type[b].store(ty, Ordering::Release);

        let t = ty as usize;
        let old_tail = self.tail[t].load(Ordering::Relaxed);
        if old_tail == BLOCK_INVALID {
            self.allocation[b].store(block, Ordering::Relaxed);
            update_hint = true;
        } else {
            let head = self.allocation[old_tail as usize].load(Ordering::Relaxed);
            self.allocation[b].store(head, Ordering::Relaxed);
            self.allocation[old_tail as usize].store(block, Ordering::Relaxed);
            self.resort_chains.store(true, Ordering::Relaxed);
        }
        self.tail[t].store(block, Ordering::Relaxed);
        if update_hint {
            self.hint[t].store(block, Ordering::Relaxed);
        }
        self.free_count[t].fetch_add(HANDLE_HANDLES_PER_BLOCK as u32, Ordering::Relaxed);
        Some(block)
    }

    /// Move a block from the free list into the chain of `ty`. Types with
    /// extra info get a data block from the same segment as well, or nothing.
    pub(crate) fn insert_block_from_free_list(&self, ty: u8, update_hint: bool) -> Option<u8> {
        if !self.table().type_has_extra_info(ty) {
            return self.insert_block_from_free_list_worker(ty, update_hint);
        }

        // Both blocks must come from this segment.
        let first = self.free_list.load(Ordering::Relaxed);
        if first == BLOCK_INVALID
            || self.allocation[first as usize].load(Ordering::Relaxed) == BLOCK_INVALID
        {
            return None;
        }

        // The data block is taken first so it sorts before its handle block.
        let data = self.insert_block_from_free_list_worker(HNDTYPE_INTERNAL_DATABLOCK, false);
        let block = self.insert_block_from_free_list_worker(ty, update_hint);
        match (block, data) {
            (Some(block), Some(data)) => {
                let first_slot = data as usize * HANDLE_HANDLES_PER_BLOCK;
                for i in first_slot..first_slot + HANDLE_HANDLES_PER_BLOCK {
                    self.value_slot(i).store(0, Ordering::Relaxed);
                }
                // Data blocks never hand out handles. The lock keeps them from
                // being reclaimed as empty.
                self.lock_block(data as usize);
                self.user_data[block as usize].store(data, Ordering::Release);
                Some(block)
            }
            (block, data) => {
                if block.is_some() {
                    self.remove_free_blocks(ty);
                }
                if data.is_some() {
                    self.remove_free_blocks(HNDTYPE_INTERNAL_DATABLOCK);
                }
                None
            }
        }
    }

    /// Return every empty, unlocked block of the chain of `ty` to the free
    /// list. Returns true if empty blocks were left behind because they are
    /// locked.
    pub(crate) fn remove_free_blocks(&self, ty: u8) -> bool {
        let chain = self.chain_blocks(ty);
        if chain.is_empty() {
            return false;
        }

        let mut scavenge_later = false;
        let mut cleanup_user_data = false;
        let mut kept = Vec::with_capacity(chain.len());
        let mut freed = Vec::new();
        for &block in chain.iter() {
            let b = block as usize;
            if !self.is_block_empty(b) {
                kept.push(block);
            } else if self.block_is_locked(b) {
                scavenge_later = true;
                kept.push(block);
            } else {
                let data = self.user_data[b].swap(BLOCK_INVALID, Ordering::AcqRel);
                if data != BLOCK_INVALID {
                    self.unlock_block(data as usize);
                    cleanup_user_data = true;
                }
                self.block_type[b].store(TYPE_INVALID, Ordering::Release);
                freed.push(block);
            }
        }
        if freed.is_empty() {
            return scavenge_later;
        }

        self.link_chain(ty, &kept);

        // Keep the relative order of the freed blocks until the next resort.
        for pair in freed.windows(2) {
            self.allocation[pair[0] as usize].store(pair[1], Ordering::Relaxed);
        }
        let last = freed[freed.len() - 1] as usize;
        self.allocation[last].store(self.free_list.load(Ordering::Relaxed), Ordering::Relaxed);
        self.free_list.store(freed[0], Ordering::Relaxed);

        self.free_count[ty as usize].fetch_sub(
            (freed.len() * HANDLE_HANDLES_PER_BLOCK) as u32,
            Ordering::Relaxed,
        );
        self.resort_chains.store(true, Ordering::Relaxed);
        trace!(
            "Segment {} returned {} blocks of type {} to the free list",
            self.id(),
            freed.len(),
            ty
        );

        if cleanup_user_data {
            self.remove_free_blocks(HNDTYPE_INTERNAL_DATABLOCK);
        }
        scavenge_later
    }

    /// Rebuild every chain in block order, fullest blocks first, and rebuild
    /// the free list in ascending order. Empty blocks that could not be freed
    /// earlier because they were locked are reclaimed first if possible.
    pub(crate) fn resort_chains(&self) {
        self.resort_chains.store(false, Ordering::Relaxed);

        if self.needs_scavenging.swap(false, Ordering::Relaxed) {
            let mut cleanup_user_data = false;
            for b in 0..self.empty_line() {
                let ty = self.block_type(b);
                if ty as usize >= HANDLE_MAX_PUBLIC_TYPES
                    || !self.is_block_empty(b)
                    || self.block_is_locked(b)
                {
                    continue;
                }
                let data = self.user_data[b].swap(BLOCK_INVALID, Ordering::AcqRel);
                if data != BLOCK_INVALID {
                    self.unlock_block(data as usize);
                    cleanup_user_data = true;
                }
                self.block_type[b].store(TYPE_INVALID, Ordering::Release);
                self.free_count[ty as usize]
                    .fetch_sub(HANDLE_HANDLES_PER_BLOCK as u32, Ordering::Relaxed);
            }
            if cleanup_user_data {
                self.remove_free_blocks(HNDTYPE_INTERNAL_DATABLOCK);
            }
        }

        let mut chains: Vec<Vec<u8>> = vec![Vec::new(); HANDLE_MAX_INTERNAL_TYPES];
        let mut free = Vec::new();
        let mut empty_line = HANDLE_BLOCKS_PER_SEGMENT;
        for b in (0..HANDLE_BLOCKS_PER_SEGMENT).rev() {
            let ty = self.block_type(b);
            if ty == TYPE_INVALID {
                if empty_line == b + 1 {
                    empty_line = b;
                }
                free.push(b as u8);
            } else {
                debug_assert!((ty as usize) < HANDLE_MAX_INTERNAL_TYPES);
                chains[ty as usize].push(b as u8);
            }
        }

        for (ty, chain) in chains.iter_mut().enumerate() {
            chain.sort_by_key(|&b| (Reverse(self.live_handles_in_block(b as usize)), b));
            // Also moves the hint back into the chain if it was scavenged.
            self.link_chain(ty as u8, chain);
        }

        free.reverse();
        for pair in free.windows(2) {
            self.allocation[pair[0] as usize].store(pair[1], Ordering::Relaxed);
        }
        if let Some(&last) = free.last() {
            self.allocation[last as usize].store(BLOCK_INVALID, Ordering::Relaxed);
        }
        self.free_list
            .store(free.first().copied().unwrap_or(BLOCK_INVALID), Ordering::Relaxed);
        self.empty_line.store(empty_line as u8, Ordering::Relaxed);
    }

    /// The committed range `[lo, hi)` above the empty line that can be
    /// returned to the OS. Only segments whose empty line has dropped below
    /// the decommit line qualify, so a segment hovering around a page
    /// boundary does not commit and decommit the same page repeatedly.
    fn excess_pages(&self) -> Option<(Address, Address)> {
        let empty_line = self.empty_line.load(Ordering::Relaxed) as usize;
        let decommit_line = self.decommit_line.load(Ordering::Relaxed) as usize;
        if empty_line >= decommit_line {
            return None;
        }
        let base = self.values_start();
        let lo = (base + empty_line * HANDLE_BYTES_PER_BLOCK).align_up(BYTES_IN_PAGE);
        let hi = base + self.commit_line.load(Ordering::Relaxed) as usize * HANDLE_BYTES_PER_BLOCK;
        (hi > lo).then_some((lo, hi))
    }

    pub(crate) fn needs_to_trim_excess_pages(&self) -> bool {
        self.excess_pages().is_some()
    }

    /// Decommit whole pages above the empty line.
    pub(crate) fn trim_excess_pages(&self) {
        let Some((lo, hi)) = self.excess_pages() else {
            return;
        };
        let base = self.values_start();
        if let Err(e) = memory::decommit(lo, hi - lo) {
            warn!("Failed to decommit handle blocks in segment {}: {}", self.id(), e);
            return;
        }

        let commit_line = (lo - base) / HANDLE_BYTES_PER_BLOCK;
        self.commit_line.store(commit_line as u8, Ordering::Relaxed);
        let decommit_line = if lo - base > BYTES_IN_PAGE {
            (lo - base - BYTES_IN_PAGE) / HANDLE_BYTES_PER_BLOCK
        } else {
            0
        };
        self.decommit_line.store(decommit_line as u8, Ordering::Relaxed);
        debug!(
            "Segment {} decommitted {} bytes, commit line now {}",
            self.id(),
            hi - lo,
            commit_line
        );
    }

    /// Take up to `count` free handles from one block.
    fn alloc_handles_from_block(&self, block: usize, count: usize, out: &mut Vec<ObjectHandle>) -> usize {
        let mut remaining = count;
        for m in 0..HANDLE_MASKS_PER_BLOCK {
            if remaining == 0 {
                break;
            }
            let mask = &self.free_mask[block * HANDLE_MASKS_PER_BLOCK + m];
            let mut free = mask.load(Ordering::Relaxed);
            let mut taken = 0u32;
            while free != 0 && remaining > 0 {
                let bit = free.trailing_zeros();
                free &= free - 1;
                taken |= 1 << bit;
                let index = block * HANDLE_HANDLES_PER_BLOCK + m * HANDLE_HANDLES_PER_MASK + bit as usize;
                out.push(self.handle_at(index));
                remaining -= 1;
            }
            if taken != 0 {
                mask.fetch_and(!taken, Ordering::Relaxed);
            }
        }
        count - remaining
    }

    /// Allocate from the blocks already in the chain of `ty`, starting at the hint.
    fn alloc_handles_from_chain(&self, ty: u8, count: usize, out: &mut Vec<ObjectHandle>) -> usize {
        let t = ty as usize;
        let count = count.min(self.free_count[t].load(Ordering::Relaxed) as usize);
        if count == 0 {
            return 0;
        }

        let start = self.hint[t].load(Ordering::Relaxed);
        let mut block = start;
        let mut remaining = count;
        loop {
            remaining -= self.alloc_handles_from_block(block as usize, remaining, out);
            if remaining == 0 {
                self.hint[t].store(block, Ordering::Relaxed);
                break;
            }
            block = self.allocation[block as usize].load(Ordering::Relaxed);
            if block == start {
                debug_assert!(false, "free count of type {} is out of sync", ty);
                break;
            }
        }
        let allocated = count - remaining;
        self.free_count[t].fetch_sub(allocated as u32, Ordering::Relaxed);
        allocated
    }

    /// Allocate by moving fresh blocks from the free list into the chain of `ty`.
    fn alloc_handles_from_free_list(&self, ty: u8, count: usize, out: &mut Vec<ObjectHandle>) -> usize {
        let mut remaining = count;
        while remaining > 0 {
            let block = match self.insert_block_from_free_list(ty, remaining == count) {
                Some(block) => block as usize,
                None => break,
            };
            remaining -= self.alloc_handles_from_block(block, remaining.min(HANDLE_HANDLES_PER_BLOCK), out);
        }
        let allocated = count - remaining;
        self.free_count[ty as usize].fetch_sub(allocated as u32, Ordering::Relaxed);
        allocated
    }

    /// Allocate up to `count` handles of type `ty` from this segment,
    /// appending them to `out`. Returns the number allocated.
    pub(crate) fn alloc_handles(&self, ty: u8, count: usize, out: &mut Vec<ObjectHandle>) -> usize {
        let satisfied = self.alloc_handles_from_chain(ty, count, out);
        if satisfied < count {
            satisfied + self.alloc_handles_from_free_list(ty, count - satisfied, out)
        } else {
            satisfied
        }
    }

    /// Free a run of handles of type `ty` that all live in this segment.
    /// Blocks that become empty are returned to the free list.
    pub(crate) fn free_handles(&self, ty: u8, handles: &[ObjectHandle]) {
        let mut actually_freed = 0u32;
        let mut scan_for_free_blocks = false;
        for &handle in handles {
            debug_assert_eq!(handle.segment_id(), self.id());
            let index = handle.slot_index();
            let block = index / HANDLE_HANDLES_PER_BLOCK;
            debug_assert_eq!(self.block_type(block), ty, "{:?} freed as the wrong type", handle);

            if let Some(slot) = self.user_data_slot(index) {
                slot.store(0, Ordering::Relaxed);
            }
            self.value_slot(index).store(0, Ordering::Relaxed);

            let bit = 1u32 << (index % HANDLE_HANDLES_PER_MASK);
            let previous = self.free_mask[index / HANDLE_HANDLES_PER_MASK].fetch_or(bit, Ordering::Relaxed);
            if previous & bit != 0 {
                debug_assert!(false, "{:?} freed twice", handle);
                warn!("Ignoring double free of {:?}", handle);
                continue;
            }
            actually_freed += 1;
            if previous | bit == MASK_EMPTY && self.is_block_empty(block) && !self.block_is_locked(block) {
                scan_for_free_blocks = true;
            }
        }
        self.free_count[ty as usize].fetch_add(actually_freed, Ordering::Relaxed);

        if scan_for_free_blocks && self.remove_free_blocks(ty) {
            self.resort_chains.store(true, Ordering::Relaxed);
            self.needs_scavenging.store(true, Ordering::Relaxed);
        }
    }
}

/// Sort handles into the order they should be freed in: later segments
/// first, and within a segment higher slots first. Freeing in this order
/// returns whole blocks to the free list sooner.
pub(crate) fn sort_for_free(handles: &mut [ObjectHandle]) {
    handles.sort_by_cached_key(|h| {
        let sequence = Segment::lookup(h.segment_id()).map_or(0, |s| s.sequence());
        (
            Reverse(sequence),
            Reverse(h.segment_id()),
            Reverse(h.slot_index()),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::handle_table::HandleTable;
    use crate::table::HandleTypeFlags;

    const TY: u8 = 0;
    const TY_EXTRA: u8 = 1;

    fn table() -> Box<HandleTable> {
        HandleTable::new(&[HandleTypeFlags::NONE, HandleTypeFlags::EXTRA_INFO], 0).unwrap()
    }

    fn segment(table: &HandleTable) -> &'static Segment {
        Segment::alloc(table).unwrap()
    }

    #[test]
    fn first_allocation_takes_block_zero() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        assert_eq!(segment.alloc_handles(TY, 3, &mut out), 3);
        let slots: Vec<usize> = out.iter().map(|h| h.slot_index()).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(segment.block_type(0), TY);
        assert_eq!(segment.empty_line(), 1);
        assert_eq!(segment.free_count[TY as usize].load(Ordering::Relaxed), 61);
        assert_eq!(segment.chain_blocks(TY), vec![0]);
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn large_allocation_spans_blocks_and_commits_pages() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        let count = HANDLE_HANDLES_PER_BLOCK * 10;
        assert_eq!(segment.alloc_handles(TY, count, &mut out), count);
        assert_eq!(segment.empty_line(), 10);
        assert_eq!(segment.commit_line.load(Ordering::Relaxed), 16);
        assert_eq!(segment.decommit_line.load(Ordering::Relaxed), 8);
        for h in out.iter() {
            assert!(h.is_null());
        }
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn extra_info_type_gets_a_locked_data_block() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        assert_eq!(segment.alloc_handles(TY_EXTRA, 1, &mut out), 1);
        assert_eq!(segment.block_type(0), HNDTYPE_INTERNAL_DATABLOCK);
        assert_eq!(segment.block_type(1), TY_EXTRA);
        assert_eq!(segment.user_data[1].load(Ordering::Relaxed), 0);
        assert!(segment.block_is_locked(0));
        assert_eq!(out[0].block_index(), 1);
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn freeing_a_whole_block_returns_it_and_its_data_block() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        segment.alloc_handles(TY_EXTRA, 5, &mut out);
        segment.free_handles(TY_EXTRA, &out);
        assert_eq!(segment.block_type(1), TYPE_INVALID);
        assert_eq!(segment.block_type(0), TYPE_INVALID);
        assert!(!segment.block_is_locked(0));
        assert_eq!(segment.tail[TY_EXTRA as usize].load(Ordering::Relaxed), BLOCK_INVALID);
        assert_eq!(segment.free_count[TY_EXTRA as usize].load(Ordering::Relaxed), 0);
        assert!(segment.resort_chains.load(Ordering::Relaxed));

        segment.resort_chains();
        assert_eq!(segment.empty_line(), 0);
        assert_eq!(segment.free_list.load(Ordering::Relaxed), 0);
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn locked_empty_block_is_scavenged_by_resort() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        segment.alloc_handles(TY, 2, &mut out);
        segment.lock_block(0);
        segment.free_handles(TY, &out);
        assert_eq!(segment.block_type(0), TY);

        // The free path does not see empty locked blocks; mark it the way a
        // concurrent free during an async scan would.
        assert!(segment.remove_free_blocks(TY));
        segment.needs_scavenging.store(true, Ordering::Relaxed);
        segment.unlock_block(0);
        segment.resort_chains();
        assert_eq!(segment.block_type(0), TYPE_INVALID);
        assert_eq!(segment.free_count[TY as usize].load(Ordering::Relaxed), 0);
        assert_eq!(segment.empty_line(), 0);
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn resort_puts_fuller_blocks_first() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        segment.alloc_handles(TY, HANDLE_HANDLES_PER_BLOCK * 3, &mut out);
        // Leave block 0 with 1 live handle, block 1 with 64 and block 2 with 10.
        let (block0, rest) = out.split_at(HANDLE_HANDLES_PER_BLOCK);
        let (_, block2) = rest.split_at(HANDLE_HANDLES_PER_BLOCK);
        segment.free_handles(TY, &block0[1..]);
        segment.free_handles(TY, &block2[10..]);
        segment.resort_chains();
        assert_eq!(segment.chain_blocks(TY), vec![1, 2, 0]);
        assert_eq!(segment.tail[TY as usize].load(Ordering::Relaxed), 0);
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn trim_decommits_pages_above_the_empty_line() {
        let table = table();
        let segment = segment(&table);
        let mut out = vec![];
        segment.alloc_handles(TY, HANDLE_HANDLES_PER_BLOCK * 20, &mut out);
        assert_eq!(segment.commit_line.load(Ordering::Relaxed), 24);
        let (keep, release) = out.split_at(HANDLE_HANDLES_PER_BLOCK);
        segment.free_handles(TY, release);
        segment.resort_chains();
        assert_eq!(segment.empty_line(), 1);
        assert!(segment.needs_to_trim_excess_pages());
        segment.trim_excess_pages();
        assert!(!segment.needs_to_trim_excess_pages());
        assert_eq!(segment.commit_line.load(Ordering::Relaxed), 8);
        assert_eq!(segment.decommit_line.load(Ordering::Relaxed), 0);
        // The kept block is still usable.
        assert!(keep[0].is_null());
        unsafe { Segment::free(segment) };
    }

    #[test]
    fn free_order_is_descending_within_a_segment() {
        let mut handles = vec![
            ObjectHandle::new(7, 3),
            ObjectHandle::new(7, 100),
            ObjectHandle::new(7, 42),
        ];
        sort_for_free(&mut handles);
        let slots: Vec<usize> = handles.iter().map(|h| h.slot_index()).collect();
        assert_eq!(slots, vec![100, 42, 3]);
    }
}
