//! Memory management for Meson user processes.
//!
//! An [`AddressSpace`] couples an ordered [`RegionMap`] with a software
//! [`PageTable`]. Pages are materialized lazily by [`AddressSpace::fault`],
//! shared copy-on-write by [`AddressSpace::fork_into`], and touched by the
//! kernel only through the user-copy routines, which resolve faults the same
//! way a user access would.
//!
//! Physical memory comes from a [`PageProvider`]; every [`Frame`] is
//! reference counted and returned to its provider when the last mapping
//! drops it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod page;
pub mod pagetable;
pub mod region;
pub mod tlb;

use core::fmt;

pub use address_space::{AddressSpace, PhysWord, VmLimits, page_len};
pub use page::{Frame, HeapPageProvider, PageCache, PageProvider};
pub use pagetable::{PageTable, Pte, PteFlags};
pub use region::{Backing, Region, RegionMap, RegionPerms};
pub use tlb::{NoShootdown, ShootdownLog, ShootdownRequest, TlbShootdown};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Mask of the offset bits within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Lowest address a user mapping may occupy.
pub const USERMIN: usize = 0x40_0000;

/// One past the highest user address (end of the canonical lower half).
pub const USEREND: usize = 0x0000_8000_0000_0000;

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Rounds `addr` up to the next page boundary.
///
/// Returns `None` if the result would overflow.
#[inline]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Errors from address space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A page could not be allocated, or a page/region quota was exceeded.
    NoMemory,
    /// The kernel touched a user address that is not mapped or not allowed.
    Fault,
    /// A user access that no region permits.
    Segv,
    /// Malformed request: misaligned, overlapping or split across regions.
    Invalid,
    /// A user string had no terminator within the allowed length.
    NameTooLong,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory"),
            Self::Fault => write!(f, "bad user address"),
            Self::Segv => write!(f, "segmentation fault"),
            Self::Invalid => write!(f, "invalid address range"),
            Self::NameTooLong => write!(f, "user string too long"),
        }
    }
}
