//! Utilities used by the handle tables.

/// Representation of addresses and object references.
pub mod address;
/// Geometry of segments, blocks and caches.
pub mod constants;
/// A lock-free directory indexed by small integers.
pub mod directory;
/// Logger initialization
pub mod logger;
/// Reserving and committing the memory segments live in.
pub mod memory;
/// Handle manager options.
pub mod options;

#[cfg(test)]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
