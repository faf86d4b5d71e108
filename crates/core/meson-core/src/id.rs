//! Type-safe identifiers for kernel resources.
//!
//! These newtypes keep process ids, thread ids and CPU ids from being mixed
//! up at compile time. All three travel through the syscall ABI as plain
//! integers, so each one converts to and from its raw value.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The init process. Orphans are re-parented to it.
    pub const INIT: Self = Self(1);

    /// Creates a new `Pid`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier.
///
/// Thread ids share one namespace with process ids: the first thread of a
/// process carries the same number as its pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Tid(u32);

impl Tid {
    /// Creates a new `Tid`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<Pid> for Tid {
    fn from(pid: Pid) -> Self {
        Self(pid.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a new `CpuId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic allocator for pid/tid numbers.
///
/// Numbers are never reused while the allocator lives, so a stale id held by
/// user space can never name a newer process.
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    /// Creates an allocator whose first id is `first`.
    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Hands out the next id.
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrip() {
        let pid = Pid::new(42);
        assert_eq!(pid.as_u32(), 42);
    }

    #[test]
    fn pid_display() {
        let pid = Pid::new(1);
        assert_eq!(format!("{pid}"), "1");
    }

    #[test]
    fn pid_ordering() {
        assert!(Pid::new(1) < Pid::new(2));
    }

    #[test]
    fn tid_from_pid_keeps_number() {
        let tid = Tid::from(Pid::new(9));
        assert_eq!(tid.as_u32(), 9);
    }

    #[test]
    fn cpu_id_roundtrip() {
        let id = CpuId::new(7);
        assert_eq!(id.as_u32(), 7);
    }

    #[test]
    fn id_allocator_is_monotonic() {
        let ids = IdAllocator::starting_at(1);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }
}
