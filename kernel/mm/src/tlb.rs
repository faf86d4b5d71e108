//! TLB shootdown requests.
//!
//! The memory manager never flushes TLBs itself. When it removes or demotes
//! present mappings it hands one request to a [`TlbShootdown`] sink naming
//! every CPU that is currently running the address space. The request is
//! issued while the address space lock is still held.

use alloc::vec::Vec;

use meson_core::id::CpuId;
use meson_core::sync::SpinLock;

/// Sink for TLB invalidation requests.
pub trait TlbShootdown: Send + Sync {
    /// Invalidates `pages` pages starting at `start` on every CPU in `cpus`.
    fn shootdown(&self, cpus: &[CpuId], start: usize, pages: usize);
}

/// Shootdown sink for address spaces that never run on a CPU.
pub struct NoShootdown;

impl TlbShootdown for NoShootdown {
    fn shootdown(&self, _cpus: &[CpuId], _start: usize, _pages: usize) {}
}

/// One recorded shootdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShootdownRequest {
    /// Target CPUs.
    pub cpus: Vec<CpuId>,
    /// First invalidated address.
    pub start: usize,
    /// Number of pages.
    pub pages: usize,
}

/// A shootdown sink that remembers every request it receives.
#[derive(Default)]
pub struct ShootdownLog {
    requests: SpinLock<Vec<ShootdownRequest>>,
}

impl ShootdownLog {
    /// Creates an empty log.
    pub const fn new() -> Self {
        Self {
            requests: SpinLock::named("shootdown_log", Vec::new()),
        }
    }

    /// Removes and returns every request recorded so far.
    pub fn take(&self) -> Vec<ShootdownRequest> {
        core::mem::take(&mut *self.requests.lock())
    }
}

impl TlbShootdown for ShootdownLog {
    fn shootdown(&self, cpus: &[CpuId], start: usize, pages: usize) {
        self.requests.lock().push(ShootdownRequest {
            cpus: cpus.to_vec(),
            start,
            pages,
        });
    }
}
