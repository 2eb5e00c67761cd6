use crate::table::handle::ObjectHandle;
use crate::table::handle_table::HandleTable;
use crate::util::constants::*;
use crate::util::directory::Directory;
use crate::util::memory;
use crate::util::Address;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Slots per node of the segment registry.
const SEGMENT_DIRECTORY_NODE_SIZE: usize = 256;

lazy_static! {
    /// Every live segment, indexed by segment id. A handle names its segment by
    /// id, so finding the segment of a handle is a directory lookup.
    static ref SEGMENTS: Directory<Segment> = Directory::new(SEGMENT_DIRECTORY_NODE_SIZE);
}

/// The header of a segment, plus its reservation of handle storage.
///
/// All block metadata is kept in parallel arrays indexed by block number.
/// Chain links, watermarks and counts are only written with the owning table's
/// lock held. Block types and free masks are also read without the lock (by
/// handle type lookups and by asynchronous scans), and the age map is written
/// by the lock-free write barrier, so every field is atomic.
pub struct Segment {
    /// Four clump age bytes per block, lowest clump in the lowest byte.
    pub(crate) generation: [AtomicU32; HANDLE_BLOCKS_PER_SEGMENT],
    /// Next block in the block's chain (a type chain or the free list).
    pub(crate) allocation: [AtomicU8; HANDLE_BLOCKS_PER_SEGMENT],
    /// One bit per handle, set when the handle is free.
    pub(crate) free_mask: [AtomicU32; HANDLE_MASKS_PER_SEGMENT],
    /// Type of each block, or `TYPE_INVALID` if the block is free.
    pub(crate) block_type: [AtomicU8; HANDLE_BLOCKS_PER_SEGMENT],
    /// The data block holding extra info for each handle block.
    pub(crate) user_data: [AtomicU8; HANDLE_BLOCKS_PER_SEGMENT],
    /// Lock count of each block. A locked block is never freed or retyped.
    pub(crate) locks: [AtomicU8; HANDLE_BLOCKS_PER_SEGMENT],
    /// Last block of each type chain. The chain is circular, so the head is
    /// the tail's successor.
    pub(crate) tail: [AtomicU8; HANDLE_MAX_INTERNAL_TYPES],
    /// Where to start looking for free handles in each type chain.
    pub(crate) hint: [AtomicU8; HANDLE_MAX_INTERNAL_TYPES],
    /// Number of free handles in each type chain.
    pub(crate) free_count: [AtomicU32; HANDLE_MAX_INTERNAL_TYPES],
    /// Head of the free block list.
    pub(crate) free_list: AtomicU8,
    /// Every block at or above this line is free.
    pub(crate) empty_line: AtomicU8,
    /// Blocks below this line are committed.
    pub(crate) commit_line: AtomicU8,
    /// Blocks at or above this line may be decommitted once they are empty.
    pub(crate) decommit_line: AtomicU8,
    /// Position of the segment in its table, used to order frees.
    pub(crate) sequence: AtomicU8,
    pub(crate) resort_chains: AtomicBool,
    pub(crate) needs_scavenging: AtomicBool,
    table: NonNull<HandleTable>,
    id: AtomicU32,
    values: Address,
}

// The table pointer is only dereferenced while the table is alive: a table
// frees its segments before it is dropped.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

fn atomic_u8_array<const N: usize>(value: u8) -> [AtomicU8; N] {
    std::array::from_fn(|_| AtomicU8::new(value))
}

fn atomic_u32_array<const N: usize>(value: u32) -> [AtomicU32; N] {
    std::array::from_fn(|_| AtomicU32::new(value))
}

impl Segment {
    /// Allocate a segment for `table`, with its first page of handle blocks
    /// committed. Returns `None` if the OS refuses the memory.
    pub(crate) fn alloc(table: &HandleTable) -> Option<&'static Segment> {
        let values = match memory::reserve(HANDLE_VALUE_BYTES_PER_SEGMENT) {
            Ok(values) => values,
            Err(e) => {
                warn!("Failed to reserve a handle segment: {}", e);
                return None;
            }
        };
        if let Err(e) = memory::commit(values, BYTES_IN_PAGE) {
            warn!("Failed to commit a handle segment: {}", e);
            if let Err(e) = memory::release(values, HANDLE_VALUE_BYTES_PER_SEGMENT) {
                warn!("Failed to release a handle segment: {}", e);
            }
            return None;
        }

        let segment = Box::new(Segment {
            generation: atomic_u32_array(u32::MAX),
            allocation: std::array::from_fn(|i| {
                // prelink the free chain
                let next = if i + 1 < HANDLE_BLOCKS_PER_SEGMENT {
                    (i + 1) as u8
                } else {
                    BLOCK_INVALID
                };
                AtomicU8::new(next)
            }),
            free_mask: atomic_u32_array(MASK_EMPTY),
            block_type: atomic_u8_array(TYPE_INVALID),
            user_data: atomic_u8_array(BLOCK_INVALID),
            locks: atomic_u8_array(0),
            tail: atomic_u8_array(BLOCK_INVALID),
            hint: atomic_u8_array(BLOCK_INVALID),
            free_count: atomic_u32_array(0),
            free_list: AtomicU8::new(0),
            empty_line: AtomicU8::new(0),
            commit_line: AtomicU8::new((BYTES_IN_PAGE / HANDLE_BYTES_PER_BLOCK) as u8),
            decommit_line: AtomicU8::new(0),
            sequence: AtomicU8::new(0),
            resort_chains: AtomicBool::new(false),
            needs_scavenging: AtomicBool::new(false),
            table: NonNull::from(table),
            id: AtomicU32::new(u32::MAX),
            values,
        });

        let id = SEGMENTS.insert(segment);
        let segment = SEGMENTS.get(id)?;
        segment.id.store(id as u32, Ordering::Release);
        debug!(
            "Allocated handle segment {} at {} for table {}",
            id,
            values,
            table.index()
        );
        Some(segment)
    }

    /// Release a segment. The segment must already be unlinked from its table.
    ///
    /// # Safety
    /// No reference to the segment, and no handle in it, may be used afterwards.
    pub(crate) unsafe fn free(segment: &'static Segment) {
        let id = segment.id();
        debug!("Freeing handle segment {}", id);
        drop(SEGMENTS.remove(id as usize));
    }

    /// Find a live segment by id.
    pub(crate) fn lookup(id: u32) -> Option<&'static Segment> {
        SEGMENTS.get(id as usize)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn table(&self) -> &HandleTable {
        unsafe { self.table.as_ref() }
    }

    pub(crate) fn sequence(&self) -> u8 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn values_start(&self) -> Address {
        self.values
    }

    pub(crate) fn empty_line(&self) -> usize {
        self.empty_line.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn block_type(&self, block: usize) -> u8 {
        self.block_type[block].load(Ordering::Acquire)
    }

    pub(crate) fn handle_at(&self, index: usize) -> ObjectHandle {
        ObjectHandle::new(self.id(), index)
    }

    /// The value slot of the handle at `index`. The slot's block must be committed.
    pub(crate) fn value_slot(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < HANDLE_HANDLES_PER_SEGMENT);
        debug_assert!(
            index / HANDLE_HANDLES_PER_BLOCK < self.commit_line.load(Ordering::Relaxed) as usize
        );
        unsafe { (self.values + index * BYTES_IN_ADDRESS).as_atomic_word() }
    }

    /// The extra info slot of the handle at `index`, if its block has a data block.
    pub(crate) fn user_data_slot(&self, index: usize) -> Option<&AtomicUsize> {
        let block = index / HANDLE_HANDLES_PER_BLOCK;
        let data = self.user_data[block].load(Ordering::Acquire);
        if data == BLOCK_INVALID {
            return None;
        }
        debug_assert_eq!(self.block_type(data as usize), HNDTYPE_INTERNAL_DATABLOCK);
        Some(self.value_slot(
            data as usize * HANDLE_HANDLES_PER_BLOCK + index % HANDLE_HANDLES_PER_BLOCK,
        ))
    }

    /// The age byte of the clump containing the handle at `index`.
    pub(crate) fn clump_age(&self, index: usize) -> u8 {
        let block = index / HANDLE_HANDLES_PER_BLOCK;
        let clump = (index % HANDLE_HANDLES_PER_BLOCK) / HANDLE_HANDLES_PER_CLUMP;
        (self.generation[block].load(Ordering::Relaxed) >> (clump * 8)) as u8
    }

    /// Reset the age byte of the clump containing the handle at `index` to 0.
    pub(crate) fn clear_clump_age(&self, index: usize) {
        let block = index / HANDLE_HANDLES_PER_BLOCK;
        let clump = (index % HANDLE_HANDLES_PER_BLOCK) / HANDLE_HANDLES_PER_CLUMP;
        self.generation[block].fetch_and(!(0xFFu32 << (clump * 8)), Ordering::Relaxed);
    }

    pub(crate) fn block_is_locked(&self, block: usize) -> bool {
        self.locks[block].load(Ordering::Relaxed) != 0
    }

    pub(crate) fn lock_block(&self, block: usize) {
        let previous = self.locks[block].fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous < u8::MAX, "block lock count overflow");
    }

    pub(crate) fn unlock_block(&self, block: usize) {
        let previous = self.locks[block].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unlocking an unlocked block");
    }

    pub(crate) fn has_locked_blocks(&self) -> bool {
        (0..HANDLE_BLOCKS_PER_SEGMENT).any(|block| self.block_is_locked(block))
    }

    /// Are all handles of the block free?
    pub(crate) fn is_block_empty(&self, block: usize) -> bool {
        let first = block * HANDLE_MASKS_PER_BLOCK;
        self.free_mask[first..first + HANDLE_MASKS_PER_BLOCK]
            .iter()
            .all(|mask| mask.load(Ordering::Relaxed) == MASK_EMPTY)
    }

    /// Number of handles in use in the block.
    pub(crate) fn live_handles_in_block(&self, block: usize) -> usize {
        let first = block * HANDLE_MASKS_PER_BLOCK;
        self.free_mask[first..first + HANDLE_MASKS_PER_BLOCK]
            .iter()
            .map(|mask| mask.load(Ordering::Relaxed).count_zeros() as usize)
            .sum()
    }

    /// The blocks of a type chain, head first.
    pub(crate) fn chain_blocks(&self, ty: u8) -> Vec<u8> {
        let mut blocks = Vec::new();
        let tail = self.tail[ty as usize].load(Ordering::Relaxed);
        if tail == BLOCK_INVALID {
            return blocks;
        }
        let head = self.allocation[tail as usize].load(Ordering::Relaxed);
        let mut block = head;
        loop {
            blocks.push(block);
            if block == tail || blocks.len() > HANDLE_BLOCKS_PER_SEGMENT {
                break;
            }
            block = self.allocation[block as usize].load(Ordering::Relaxed);
        }
        debug_assert!(
            blocks.len() <= HANDLE_BLOCKS_PER_SEGMENT,
            "type chain {} is not circular",
            ty
        );
        blocks
    }

    /// Link `blocks` into a circular type chain in the given order. The hint
    /// is kept if it still points into the chain.
    pub(crate) fn link_chain(&self, ty: u8, blocks: &[u8]) {
        let ty = ty as usize;
        let (head, tail) = match (blocks.first(), blocks.last()) {
            (Some(&head), Some(&tail)) => (head, tail),
            _ => {
                self.tail[ty].store(BLOCK_INVALID, Ordering::Relaxed);
                self.hint[ty].store(BLOCK_INVALID, Ordering::Relaxed);
                return;
            }
        };
        for pair in blocks.windows(2) {
            self.allocation[pair[0] as usize].store(pair[1], Ordering::Relaxed);
        }
        self.allocation[tail as usize].store(head, Ordering::Relaxed);
        self.tail[ty].store(tail, Ordering::Relaxed);
        let hint = self.hint[ty].load(Ordering::Relaxed);
        if !blocks.contains(&hint) {
            self.hint[ty].store(head, Ordering::Relaxed);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = memory::release(self.values, HANDLE_VALUE_BYTES_PER_SEGMENT) {
            warn!("Failed to release handle segment {}: {}", self.id(), e);
        }
    }
}
