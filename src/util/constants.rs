//! Geometry of the handle table.
//!
//! These values are tuned for 64 KiB segments and 64-handle blocks. The
//! invariants the rest of the crate relies on are asserted at the bottom of
//! this file, so a port to another geometry only needs to keep them true.

/******************
 * Primitive sizes
 ******************/

#[cfg(target_pointer_width = "32")]
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

pub const LOG_BYTES_IN_PAGE: u8 = 12;
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/****************************************************************************
 * Segments, blocks, clumps and masks
 ****************************************************************************/

/// Nominal size of a segment: one header page followed by handle blocks.
pub const HANDLE_SEGMENT_SIZE: usize = 0x10000;
/// Space reserved for the segment header.
pub const HANDLE_HEADER_SIZE: usize = BYTES_IN_PAGE;

pub const HANDLE_HANDLES_PER_BLOCK: usize = 64;
pub const HANDLE_BYTES_PER_BLOCK: usize = HANDLE_HANDLES_PER_BLOCK * BYTES_IN_ADDRESS;
pub const HANDLE_BLOCKS_PER_SEGMENT: usize =
    (HANDLE_SEGMENT_SIZE - HANDLE_HEADER_SIZE) / HANDLE_BYTES_PER_BLOCK;
pub const HANDLE_HANDLES_PER_SEGMENT: usize = HANDLE_BLOCKS_PER_SEGMENT * HANDLE_HANDLES_PER_BLOCK;
/// Bytes of handle storage reserved per segment.
pub const HANDLE_VALUE_BYTES_PER_SEGMENT: usize =
    HANDLE_BLOCKS_PER_SEGMENT * HANDLE_BYTES_PER_BLOCK;

/// A clump shares one write barrier age byte.
pub const HANDLE_HANDLES_PER_CLUMP: usize = 16;
pub const HANDLE_CLUMPS_PER_BLOCK: usize = HANDLE_HANDLES_PER_BLOCK / HANDLE_HANDLES_PER_CLUMP;
pub const HANDLE_CLUMPS_PER_SEGMENT: usize = HANDLE_CLUMPS_PER_BLOCK * HANDLE_BLOCKS_PER_SEGMENT;

/// A mask is one 32-bit word of the free bitmap.
pub const HANDLE_HANDLES_PER_MASK: usize = 32;
pub const HANDLE_MASKS_PER_BLOCK: usize = HANDLE_HANDLES_PER_BLOCK / HANDLE_HANDLES_PER_MASK;
pub const HANDLE_MASKS_PER_SEGMENT: usize = HANDLE_MASKS_PER_BLOCK * HANDLE_BLOCKS_PER_SEGMENT;

/// Every bit set: all handles in the mask are free.
pub const MASK_EMPTY: u32 = 0xFFFF_FFFF;
/// No bit set: all handles in the mask are in use.
pub const MASK_FULL: u32 = 0;

/// Block index that means "no block".
pub const BLOCK_INVALID: u8 = 0xFF;
/// Block type byte of a free block.
pub const TYPE_INVALID: u8 = 0xFF;

/// Total number of block types, including the internal user data type.
pub const HANDLE_MAX_INTERNAL_TYPES: usize = 12;
/// Number of block types a table may be created with.
pub const HANDLE_MAX_PUBLIC_TYPES: usize = HANDLE_MAX_INTERNAL_TYPES - 1;
/// Block type used for blocks that hold extra info for a handle block.
pub const HNDTYPE_INTERNAL_DATABLOCK: u8 = HANDLE_MAX_PUBLIC_TYPES as u8;

/****************************************************************************
 * Handle type cache
 ****************************************************************************/

pub const HANDLE_CACHE_TYPE_SIZE: usize = 128;
pub const HANDLES_PER_CACHE_BANK: usize = HANDLE_CACHE_TYPE_SIZE / 2;
pub const REBALANCE_TOLERANCE: usize = HANDLES_PER_CACHE_BANK / 3;
pub const REBALANCE_LOWATER_MARK: usize = HANDLES_PER_CACHE_BANK - REBALANCE_TOLERANCE;
pub const REBALANCE_HIWATER_MARK: usize = HANDLES_PER_CACHE_BANK + REBALANCE_TOLERANCE;
/// Requests at or below this count go through the cache rather than the bulk path.
pub const SMALL_ALLOC_COUNT: usize = HANDLES_PER_CACHE_BANK / 10;

/****************************************************************************
 * Age map
 ****************************************************************************/

/// Largest age a clump can reach.
pub const GEN_MAX_AGE: u8 = 0x3F;
/// Clears the "never aged" bits of every age byte in a generation word.
pub const GEN_CLAMP: u32 = 0x3F3F_3F3F;
/// The high bit of every byte in a generation word.
pub const GEN_HIGH_BITS: u32 = 0x8080_8080;
/// One in the low bit of every byte in a generation word.
pub const GEN_INC_SHIFT: u32 = 0x0101_0101;
/// Age byte of a clump that has never been aged.
pub const GEN_INVALID: u8 = 0xFF;

/****************************************************************************
 * Map
 ****************************************************************************/

/// Default number of slots in a directory node.
pub const INITIAL_HANDLE_TABLE_ARRAY_SIZE: usize = 10;

/// The value a destroyed handle holds while it sits in a cache bank.
#[cfg(target_pointer_width = "64")]
pub const DESTROYED_HANDLE_VALUE: usize = 0xcccc_cccc_cccc_ccc0;
#[cfg(target_pointer_width = "32")]
pub const DESTROYED_HANDLE_VALUE: usize = 0xcccc_ccc0;

static_assertions::const_assert!(HANDLE_BLOCKS_PER_SEGMENT < BLOCK_INVALID as usize);
static_assertions::const_assert!(HANDLE_MAX_INTERNAL_TYPES < TYPE_INVALID as usize);
static_assertions::const_assert_eq!(HANDLE_CLUMPS_PER_BLOCK, 4);
static_assertions::const_assert_eq!(HANDLE_MASKS_PER_BLOCK, 2);
static_assertions::const_assert_eq!(HANDLE_BYTES_PER_BLOCK % BYTES_IN_ADDRESS, 0);
static_assertions::const_assert!(REBALANCE_HIWATER_MARK <= HANDLE_CACHE_TYPE_SIZE);
static_assertions::const_assert!(SMALL_ALLOC_COUNT > 0);
