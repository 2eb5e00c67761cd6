//! Thin wrappers over the OS virtual memory calls used for segment storage.
//!
//! A segment reserves its whole handle area up front with no access rights,
//! then commits and decommits it a page at a time as blocks come into use.

use crate::util::Address;
use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
use std::io::Result;

/// Reserve `size` bytes of address space anywhere. The range is not
/// accessible until it is committed.
pub fn reserve(size: usize) -> Result<Address> {
    let prot = PROT_NONE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ptr))
    }
}

/// Make a reserved range readable and writable. Freshly committed memory
/// reads as zero.
pub fn commit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, PROT_READ | PROT_WRITE) },
        0,
    )
}

/// Return the physical pages of a committed range to the OS and make it
/// inaccessible again. A later commit of the same range reads as zero.
pub fn decommit(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )?;
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, PROT_NONE) },
        0,
    )
}

/// Release a reservation.
pub fn release(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
