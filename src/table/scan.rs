//! The scanning engine.
//!
//! A scan picks the segments of a table with a segment iterator, picks the
//! blocks of the requested types within each segment, and hands runs of
//! consecutive blocks to a block handler. Handlers visit handles, age the age
//! map, or rebuild it.
//!
//! The age map has one byte per clump of 16 handles, four to a block word. The
//! byte is a conservative lower bound on the generation of every object the
//! clump refers to, so an ephemeral collection of generations `0..=n` only
//! needs clumps whose age is at most `n`. The arithmetic below works on all
//! four bytes of a word at once.

use crate::table::handle::ObjectHandle;
use crate::table::handle_table::{HandleTable, TableState};
use crate::table::segment::Segment;
use crate::util::constants::*;
use crate::util::{Address, ObjectReference};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a scan runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFlags(u32);

impl ScanFlags {
    pub const NORMAL: ScanFlags = ScanFlags(0);
    /// Age the clumps that were scanned.
    pub const AGE: ScanFlags = ScanFlags(1);
    /// Drop the table lock while visiting handles.
    pub const ASYNC: ScanFlags = ScanFlags(2);
    /// Give the callback access to each handle's extra info.
    pub const EXTRA_INFO: ScanFlags = ScanFlags(4);

    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ScanFlags {
    type Output = ScanFlags;
    fn bitor(self, rhs: ScanFlags) -> ScanFlags {
        ScanFlags(self.0 | rhs.0)
    }
}

/// A live handle as seen by a scan callback.
pub struct HandleSlotRef<'a> {
    handle: ObjectHandle,
    handle_type: u8,
    value: &'a AtomicUsize,
    extra: Option<&'a AtomicUsize>,
}

impl<'a> HandleSlotRef<'a> {
    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn handle_type(&self) -> u8 {
        self.handle_type
    }

    /// The referent. Scans never visit null handles, but a concurrent store
    /// may null a handle after the scan has picked it up.
    pub fn object(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw_address(unsafe {
            Address::from_usize(self.value.load(Ordering::Acquire))
        })
    }

    /// Overwrite the referent without going through the write barrier, as
    /// the collector does when it clears or relocates.
    pub fn set_object(&self, object: Option<ObjectReference>) {
        let raw = object.map_or(0, |o| o.to_raw_address().as_usize());
        self.value.store(raw, Ordering::Release);
    }

    pub fn has_extra_info(&self) -> bool {
        self.extra.is_some()
    }

    /// The extra info, or 0 if the scan was not asked for it or the type has none.
    pub fn extra_info(&self) -> usize {
        self.extra.map_or(0, |slot| slot.load(Ordering::Acquire))
    }

    pub fn set_extra_info(&self, value: usize) {
        if let Some(slot) = self.extra {
            slot.store(value, Ordering::Release);
        } else {
            debug_assert!(false, "{:?} has no extra info", self.handle);
        }
    }
}

pub type ScanCallback<'a> = dyn FnMut(&HandleSlotRef) + 'a;

/// A clump whose age is wrong for one of its referents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AgeMapViolation {
    pub handle: ObjectHandle,
    pub clump_age: u8,
    pub generation: u8,
}

/// The word to subtract from a generation word to find the clumps that must
/// be scanned when collecting generations `0..=condemned`.
pub fn build_age_mask(condemned: u8, max_gen: u8) -> u32 {
    let threshold = if condemned >= max_gen {
        GEN_MAX_AGE as u32 + 1
    } else {
        condemned as u32 + 1
    };
    threshold * GEN_INC_SHIFT
}

/// Sets the high bit of every byte of `generation` whose clump age is below
/// the per-byte threshold in `age_mask`.
pub fn compute_clump_mask(generation: u32, age_mask: u32) -> u32 {
    !(((generation & GEN_CLAMP) | GEN_HIGH_BITS) - age_mask) & GEN_HIGH_BITS
}

/// One in the low bit of every byte flagged in `clump_mask`.
fn clump_addends(clump_mask: u32) -> u32 {
    clump_mask >> 7
}

/// Age the clumps flagged in `clump_mask` by one, stopping at [`GEN_MAX_AGE`].
fn age_clumps(generation: &std::sync::atomic::AtomicU32, clump_mask: u32) {
    let max_age_mask = GEN_MAX_AGE as u32 * GEN_INC_SHIFT;
    // The write barrier may clear a byte concurrently.
    let _ = generation.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |word| {
        let below_max = compute_clump_mask(word, max_age_mask);
        let mask = clump_mask & below_max;
        (mask != 0).then(|| word + clump_addends(mask))
    });
}

fn is_live_value(raw: usize) -> bool {
    raw != 0 && raw != DESTROYED_HANDLE_VALUE
}

/// Which segments a scan visits, and what housekeeping it does on the way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SegmentIterator {
    /// Every segment as it is.
    Quick,
    /// Resort segments whose chains are out of order first.
    Standard,
    /// Also trim excess pages and free empty segments.
    Full,
}

impl SegmentIterator {
    fn for_generation(condemned: u8, max_gen: u8) -> SegmentIterator {
        if condemned >= max_gen {
            SegmentIterator::Full
        } else if condemned == 0 {
            SegmentIterator::Quick
        } else {
            SegmentIterator::Standard
        }
    }
}

enum BlockHandler<'a, 'b> {
    /// Visit every live handle.
    Scan(&'a mut ScanCallback<'b>),
    /// Visit live handles in clumps young enough for the age mask.
    ScanEphemeral(&'a mut ScanCallback<'b>),
    /// Age every clump.
    Age,
    /// Age clumps young enough for the age mask.
    AgeEphemeral,
    /// Set each clump young enough for the age mask to the youngest
    /// generation its handles refer to.
    ResetAgeMap(&'a mut dyn FnMut(&HandleSlotRef) -> u8),
    /// Report handles whose clump is older than their referent.
    Verify {
        max_gen: u8,
        generation_of: &'a mut dyn FnMut(&HandleSlotRef) -> u8,
        violations: &'a mut Vec<AgeMapViolation>,
    },
}

struct BlockScan<'s> {
    segment: &'s Segment,
    flags: ScanFlags,
    age_mask: u32,
}

impl<'s> BlockScan<'s> {
    fn slot_ref(&self, index: usize, ty: u8) -> Option<HandleSlotRef<'s>> {
        let value = self.segment.value_slot(index);
        if !is_live_value(value.load(Ordering::Relaxed)) {
            return None;
        }
        let extra = if self.flags.contains(ScanFlags::EXTRA_INFO) {
            self.segment.user_data_slot(index)
        } else {
            None
        };
        Some(HandleSlotRef {
            handle: self.segment.handle_at(index),
            handle_type: ty,
            value,
            extra,
        })
    }

    fn visit_range(&self, first: usize, count: usize, ty: u8, f: &mut dyn FnMut(&HandleSlotRef)) {
        for index in first..first + count {
            if let Some(slot) = self.slot_ref(index, ty) {
                f(&slot);
            }
        }
    }

    fn run(&self, handler: &mut BlockHandler, first_block: usize, block_count: usize) {
        for block in first_block..first_block + block_count {
            self.run_block(handler, block);
        }
    }

    fn run_block(&self, handler: &mut BlockHandler, block: usize) {
        let segment = self.segment;
        let ty = segment.block_type(block);
        let generation = &segment.generation[block];
        let first = block * HANDLE_HANDLES_PER_BLOCK;
        let age = self.flags.contains(ScanFlags::AGE);
        match handler {
            BlockHandler::Scan(callback) => {
                self.visit_range(first, HANDLE_HANDLES_PER_BLOCK, ty, &mut **callback);
                if age {
                    age_clumps(generation, GEN_HIGH_BITS);
                }
            }
            BlockHandler::ScanEphemeral(callback) => {
                let clump_mask =
                    compute_clump_mask(generation.load(Ordering::Relaxed), self.age_mask);
                if clump_mask == 0 {
                    return;
                }
                for clump in 0..HANDLE_CLUMPS_PER_BLOCK {
                    if clump_mask & (0x80 << (clump * 8)) != 0 {
                        let start = first + clump * HANDLE_HANDLES_PER_CLUMP;
                        self.visit_range(start, HANDLE_HANDLES_PER_CLUMP, ty, &mut **callback);
                    }
                }
                if age {
                    age_clumps(generation, clump_mask);
                }
            }
            BlockHandler::Age => age_clumps(generation, GEN_HIGH_BITS),
            BlockHandler::AgeEphemeral => {
                let clump_mask =
                    compute_clump_mask(generation.load(Ordering::Relaxed), self.age_mask);
                age_clumps(generation, clump_mask);
            }
            BlockHandler::ResetAgeMap(min_generation) => {
                let min_generation = &mut **min_generation;
                let clump_mask =
                    compute_clump_mask(generation.load(Ordering::Relaxed), self.age_mask);
                for clump in 0..HANDLE_CLUMPS_PER_BLOCK {
                    if clump_mask & (0x80 << (clump * 8)) == 0 {
                        continue;
                    }
                    let start = first + clump * HANDLE_HANDLES_PER_CLUMP;
                    let mut youngest = GEN_MAX_AGE;
                    self.visit_range(start, HANDLE_HANDLES_PER_CLUMP, ty, &mut |slot| {
                        youngest = youngest.min(min_generation(slot));
                    });
                    let shift = clump * 8;
                    let _ = generation.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |word| {
                        Some((word & !(0xFF << shift)) | ((youngest as u32) << shift))
                    });
                }
            }
            BlockHandler::Verify {
                max_gen,
                generation_of,
                violations,
            } => {
                let max_gen = *max_gen;
                let generation_of = &mut **generation_of;
                for index in first..first + HANDLE_HANDLES_PER_BLOCK {
                    let Some(slot) = self.slot_ref(index, ty) else {
                        continue;
                    };
                    let clump_age = segment.clump_age(index);
                    let generation = generation_of(&slot);
                    if generation < max_gen && (clump_age & GEN_MAX_AGE) > generation {
                        violations.push(AgeMapViolation {
                            handle: slot.handle(),
                            clump_age,
                            generation,
                        });
                    }
                }
            }
        }
    }
}

/// Runs of consecutive blocks of the given types in `segment`.
fn block_runs(segment: &Segment, types: &[u8]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut push = |block: usize| match runs.last_mut() {
        Some((first, count)) if *first + *count == block => *count += 1,
        _ => runs.push((block, 1)),
    };
    if let [ty] = types {
        for block in segment.chain_blocks(*ty) {
            push(block as usize);
        }
    } else {
        for block in 0..segment.empty_line() {
            if types.contains(&segment.block_type(block)) {
                push(block);
            }
        }
    }
    runs
}

impl HandleTable {
    /// The segment after `previous` (or the first segment), doing the
    /// iterator's housekeeping on it.
    fn next_segment(
        &self,
        state: &mut TableState,
        previous: Option<&'static Segment>,
        iterator: SegmentIterator,
    ) -> Option<&'static Segment> {
        let mut position = match previous {
            None => 0,
            Some(previous) => {
                state
                    .segments
                    .iter()
                    .position(|s| s.id() == previous.id())?
                    + 1
            }
        };
        loop {
            let segment = *state.segments.get(position)?;
            if iterator != SegmentIterator::Quick && segment.resort_chains.load(Ordering::Relaxed) {
                segment.resort_chains();
            }
            if iterator == SegmentIterator::Full {
                if segment.empty_line() == 0 && self.can_free_segment_now(state, segment) {
                    state.segments.remove(position);
                    unsafe { Segment::free(segment) };
                    continue;
                }
                if segment.needs_to_trim_excess_pages() {
                    segment.trim_excess_pages();
                }
                segment.sequence.store(position as u8, Ordering::Relaxed);
            }
            return Some(segment);
        }
    }

    fn scan_with_handler(
        &self,
        types: &[u8],
        iterator: SegmentIterator,
        flags: ScanFlags,
        age_mask: u32,
        handler: &mut BlockHandler,
    ) {
        if flags.contains(ScanFlags::ASYNC) {
            self.scan_async(types, iterator, flags, age_mask, handler);
            return;
        }
        let mut state = self.lock_state();
        let mut segment = self.next_segment(&mut state, None, iterator);
        while let Some(current) = segment {
            let scan = BlockScan {
                segment: current,
                flags,
                age_mask,
            };
            for (first, count) in block_runs(current, types) {
                scan.run(handler, first, count);
            }
            segment = self.next_segment(&mut state, Some(current), iterator);
        }
    }

    /// Visit one segment at a time without holding the table lock. The blocks
    /// to visit are picked and locked under the lock, so they cannot be freed
    /// or retyped while the callback runs.
    fn scan_async(
        &self,
        types: &[u8],
        iterator: SegmentIterator,
        flags: ScanFlags,
        age_mask: u32,
        handler: &mut BlockHandler,
    ) {
        let mut state = self.lock_state();
        let mut segment = self.next_segment(&mut state, None, iterator);
        while let Some(current) = segment {
            state.async_scan_segment = Some(current.id());
            let runs = block_runs(current, types);
            for &(first, count) in runs.iter() {
                (first..first + count).for_each(|block| current.lock_block(block));
            }
            drop(state);

            trace!(
                "Asynchronously scanning {} block runs of segment {}",
                runs.len(),
                current.id()
            );
            let scan = BlockScan {
                segment: current,
                flags,
                age_mask,
            };
            for &(first, count) in runs.iter() {
                scan.run(handler, first, count);
            }

            state = self.lock_state();
            for &(first, count) in runs.iter() {
                (first..first + count).for_each(|block| current.unlock_block(block));
            }
            segment = self.next_segment(&mut state, Some(current), iterator);
        }
        state.async_scan_segment = None;
    }

    /// Visit the live handles of `types` that may refer to generations
    /// `0..=condemned`. A collection of `max_gen` or older visits every
    /// handle.
    ///
    /// Without [`ScanFlags::ASYNC`] the table lock is held throughout, so the
    /// callback must not create or destroy handles in bulk in this table.
    pub fn scan_handles_for_gc(
        &self,
        types: &[u8],
        condemned: u8,
        max_gen: u8,
        flags: ScanFlags,
        callback: &mut ScanCallback,
    ) {
        let iterator = SegmentIterator::for_generation(condemned, max_gen);
        let age_mask = build_age_mask(condemned, max_gen);
        let mut handler = if condemned >= max_gen {
            BlockHandler::Scan(callback)
        } else {
            BlockHandler::ScanEphemeral(callback)
        };
        self.scan_with_handler(types, iterator, flags, age_mask, &mut handler);
    }

    /// Visit every live handle of `types`, for diagnostics.
    pub fn enum_handles(&self, types: &[u8], flags: ScanFlags, callback: &mut ScanCallback) {
        let flags = ScanFlags(flags.0 & !ScanFlags::AGE.0);
        let mut handler = BlockHandler::Scan(callback);
        self.scan_with_handler(types, SegmentIterator::Quick, flags, 0, &mut handler);
    }

    /// Age the clumps of `types` that were condemned by a collection of
    /// generations `0..=condemned`.
    pub fn age_handles(&self, types: &[u8], condemned: u8, max_gen: u8, flags: ScanFlags) {
        let iterator = SegmentIterator::for_generation(condemned, max_gen);
        let mut handler = if condemned >= max_gen {
            BlockHandler::Age
        } else {
            BlockHandler::AgeEphemeral
        };
        let age_mask = build_age_mask(condemned, max_gen);
        self.scan_with_handler(types, iterator, flags, age_mask, &mut handler);
    }

    /// Recompute the age of every clump of `types` that may refer to
    /// generations `0..=condemned`, from the generations of the objects its
    /// handles refer to. Clumps with no live handles get [`GEN_MAX_AGE`].
    pub fn reset_age_map(
        &self,
        types: &[u8],
        condemned: u8,
        max_gen: u8,
        flags: ScanFlags,
        min_generation: &mut dyn FnMut(&HandleSlotRef) -> u8,
    ) {
        let iterator = SegmentIterator::for_generation(condemned, max_gen);
        let age_mask = build_age_mask(condemned, max_gen);
        let mut handler = BlockHandler::ResetAgeMap(min_generation);
        self.scan_with_handler(types, iterator, flags, age_mask, &mut handler);
    }

    /// Find handles of `types` whose clump claims an age older than the
    /// generation of what they refer to.
    pub fn find_age_map_violations(
        &self,
        types: &[u8],
        max_gen: u8,
        generation_of: &mut dyn FnMut(&HandleSlotRef) -> u8,
    ) -> Vec<AgeMapViolation> {
        let mut violations = Vec::new();
        let mut handler = BlockHandler::Verify {
            max_gen,
            generation_of,
            violations: &mut violations,
        };
        self.scan_with_handler(
            types,
            SegmentIterator::Quick,
            ScanFlags::EXTRA_INFO,
            0,
            &mut handler,
        );
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::HandleTypeFlags;
    use crate::util::test_util::mock_vm::{MockObject, MockVM};
    use crate::util::test_util::panic_after;

    const STRONG: u8 = 0;
    const WITH_INFO: u8 = 1;
    const OTHER: u8 = 2;
    const MAX_GEN: u8 = 2;

    fn table() -> Box<HandleTable> {
        HandleTable::new(
            &[
                HandleTypeFlags::NONE,
                HandleTypeFlags::EXTRA_INFO,
                HandleTypeFlags::NONE,
            ],
            0,
        )
        .unwrap()
    }

    fn collect(table: &HandleTable, types: &[u8], condemned: u8, flags: ScanFlags) -> Vec<ObjectHandle> {
        let mut seen = vec![];
        table.scan_handles_for_gc(types, condemned, MAX_GEN, flags, &mut |slot| {
            seen.push(slot.handle())
        });
        seen.sort();
        seen
    }

    #[test]
    fn age_mask_thresholds() {
        assert_eq!(build_age_mask(0, 2), 0x0101_0101);
        assert_eq!(build_age_mask(1, 2), 0x0202_0202);
        assert_eq!(build_age_mask(2, 2), 0x4040_4040);
        assert_eq!(build_age_mask(5, 2), 0x4040_4040);
    }

    #[test]
    fn clump_mask_selects_young_clumps() {
        // Ages 0, 1, 2 and never-aged, lowest clump first.
        let word = 0xFF02_0100;
        assert_eq!(compute_clump_mask(word, build_age_mask(0, 2)), 0x0000_0080);
        assert_eq!(compute_clump_mask(word, build_age_mask(1, 2)), 0x0000_8080);
        assert_eq!(compute_clump_mask(word, build_age_mask(2, 2)), 0x8080_8080);
    }

    #[test]
    fn aging_saturates_and_skips_never_aged_clumps() {
        let word = std::sync::atomic::AtomicU32::new(0xFF3F_0100);
        age_clumps(&word, GEN_HIGH_BITS);
        assert_eq!(word.load(Ordering::Relaxed), 0xFF3F_0201);
    }

    #[test]
    fn full_scan_visits_only_live_handles_of_requested_types() {
        let table = table();
        let object = MockObject::new(1, 2).to_ref();
        let strong: Vec<_> = (0..5)
            .map(|_| table.create_handle::<MockVM>(STRONG, Some(object), 0).unwrap())
            .collect();
        let _null = table.create_handle::<MockVM>(STRONG, None, 0).unwrap();
        let _other = table.create_handle::<MockVM>(OTHER, Some(object), 0).unwrap();
        let destroyed = table.create_handle::<MockVM>(STRONG, Some(object), 0).unwrap();
        table.destroy_handle(STRONG, destroyed);

        let mut expected = strong.clone();
        expected.sort();
        assert_eq!(collect(&table, &[STRONG], MAX_GEN, ScanFlags::NORMAL), expected);
        assert_eq!(collect(&table, &[STRONG, OTHER], MAX_GEN, ScanFlags::NORMAL).len(), 6);
    }

    #[test]
    fn ephemeral_scan_skips_old_clumps() {
        let table = table();
        let old = MockObject::new(1, 2).to_ref();
        let handle = table.create_handle::<MockVM>(STRONG, Some(old), 0).unwrap();
        // The barrier leaves the clump at the referent's generation or younger.
        assert!(handle.clump_age() <= 2);

        // Age twice: the clump becomes 2, older than anything gen 0 or 1 can reach.
        table.age_handles(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL);
        table.age_handles(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL);
        assert!(handle.clump_age() >= 2);
        assert!(collect(&table, &[STRONG], 0, ScanFlags::NORMAL).is_empty());
        assert!(collect(&table, &[STRONG], 1, ScanFlags::NORMAL).is_empty());
        assert_eq!(collect(&table, &[STRONG], MAX_GEN, ScanFlags::NORMAL), vec![handle]);

        // Storing a young object makes the clump visible again.
        handle.assign::<MockVM>(Some(MockObject::new(2, 0).to_ref()));
        assert_eq!(handle.clump_age(), 0);
        assert_eq!(collect(&table, &[STRONG], 0, ScanFlags::NORMAL), vec![handle]);
    }

    #[test]
    fn scanning_with_age_flag_ages_scanned_clumps() {
        let table = table();
        let handle = table
            .create_handle::<MockVM>(STRONG, Some(MockObject::new(1, 0).to_ref()), 0)
            .unwrap();
        assert_eq!(handle.clump_age(), 0);
        collect(&table, &[STRONG], 0, ScanFlags::AGE);
        assert_eq!(handle.clump_age(), 1);
        collect(&table, &[STRONG], 0, ScanFlags::AGE);
        assert_eq!(handle.clump_age(), 1);
    }

    #[test]
    fn extra_info_is_visible_only_when_asked_for() {
        let table = table();
        let object = MockObject::new(1, 0).to_ref();
        table.create_handle::<MockVM>(WITH_INFO, Some(object), 42).unwrap();
        let mut infos = vec![];
        table.enum_handles(&[WITH_INFO], ScanFlags::EXTRA_INFO, &mut |slot| {
            infos.push((slot.has_extra_info(), slot.extra_info()))
        });
        assert_eq!(infos, vec![(true, 42)]);
        infos.clear();
        table.enum_handles(&[WITH_INFO], ScanFlags::NORMAL, &mut |slot| {
            infos.push((slot.has_extra_info(), slot.extra_info()))
        });
        assert_eq!(infos, vec![(false, 0)]);
    }

    #[test]
    fn async_scan_allows_destroying_handles_from_the_callback() {
        // A scan that kept the table locked would spin forever here.
        panic_after(10_000, || {
            let table = table();
            let object = MockObject::new(1, 2).to_ref();
            let handles: Vec<_> = (0..200)
                .map(|_| table.create_handle::<MockVM>(STRONG, Some(object), 0).unwrap())
                .collect();
            let mut visited = 0;
            table.scan_handles_for_gc(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::ASYNC, &mut |slot| {
                visited += 1;
                table.destroy_handle(STRONG, slot.handle());
            });
            assert_eq!(visited, handles.len());
            assert_eq!(table.count_handles(), 0);
            assert_eq!(table.lock_state().async_scan_segment, None);
            for segment in table.lock_state().segments.iter() {
                assert!(!segment.has_locked_blocks());
            }
        })
    }

    #[test]
    fn relocation_through_set_object() {
        let table = table();
        let from = MockObject::new(1, 0).to_ref();
        let to = MockObject::new(1, 1).to_ref();
        let handle = table.create_handle::<MockVM>(STRONG, Some(from), 0).unwrap();
        table.scan_handles_for_gc(&[STRONG], 0, MAX_GEN, ScanFlags::NORMAL, &mut |slot| {
            if slot.object() == Some(from) {
                slot.set_object(Some(to));
            }
        });
        assert_eq!(handle.fetch(), Some(to));
    }

    #[test]
    fn reset_age_map_uses_youngest_referent() {
        let table = table();
        // Bulk creation hands out consecutive slots, so both share a clump.
        let handles = table.create_handles(STRONG, HANDLE_HANDLES_PER_CLUMP);
        let (a, b) = (handles[0], handles[1]);
        a.assign::<MockVM>(Some(MockObject::new(1, 2).to_ref()));
        b.assign::<MockVM>(Some(MockObject::new(2, 1).to_ref()));
        table.reset_age_map(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL, &mut |slot| {
            MockObject::from_ref(slot.object().unwrap()).generation()
        });
        assert_eq!(a.clump_age(), 1);

        table.destroy_handle(STRONG, b);
        table.reset_age_map(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL, &mut |slot| {
            MockObject::from_ref(slot.object().unwrap()).generation()
        });
        assert_eq!(a.clump_age(), 2);
    }

    #[test]
    fn verify_reports_clumps_older_than_their_referents() {
        let table = table();
        let handle = table
            .create_handle::<MockVM>(STRONG, Some(MockObject::new(1, 0).to_ref()), 0)
            .unwrap();
        let mut generation_of =
            |slot: &HandleSlotRef| MockObject::from_ref(slot.object().unwrap()).generation();
        assert!(table
            .find_age_map_violations(&[STRONG], MAX_GEN, &mut generation_of)
            .is_empty());

        // Aging without promoting the referent breaks the invariant.
        table.age_handles(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL);
        let violations = table.find_age_map_violations(&[STRONG], MAX_GEN, &mut generation_of);
        assert_eq!(
            violations,
            vec![AgeMapViolation {
                handle,
                clump_age: 1,
                generation: 0
            }]
        );
    }

    #[test]
    fn full_iterator_frees_empty_segments_and_renumbers() {
        let table = table();
        let handles = table.create_handles(STRONG, HANDLE_HANDLES_PER_SEGMENT * 2 + 1);
        assert_eq!(table.lock_state().segments.len(), 3);
        // Empty the middle segment.
        let middle: Vec<ObjectHandle> = handles
            .iter()
            .copied()
            .filter(|h| h.segment_id() == handles[HANDLE_HANDLES_PER_SEGMENT].segment_id())
            .collect();
        table.destroy_handles(STRONG, &middle);

        table.scan_handles_for_gc(&[STRONG], MAX_GEN, MAX_GEN, ScanFlags::NORMAL, &mut |_| {});
        let state = table.lock_state();
        assert_eq!(state.segments.len(), 2);
        let sequences: Vec<u8> = state.segments.iter().map(|s| s.sequence()).collect();
        assert_eq!(sequences, vec![0, 1]);
    }
}
