//! Physical frames and the providers that hand them out.
//!
//! A [`Frame`] is a reference-counted page of memory: cloning it takes a
//! reference, dropping it releases one, and the page returns to its
//! [`PageProvider`] when the count reaches zero. Page tables, page caches
//! and in-flight kernel copies all hold frames the same way, so a frame
//! that is still mapped anywhere can never be freed.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use meson_core::sync::SpinLock;

use crate::{PAGE_SIZE, VmError};

struct FrameInner {
    paddr: u64,
    data: SpinLock<Box<[u8]>>,
    live: Arc<AtomicUsize>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Release);
    }
}

/// A reference-counted physical page.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    fn new(paddr: u64, live: Arc<AtomicUsize>) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                paddr,
                data: SpinLock::named("frame", vec![0u8; PAGE_SIZE].into_boxed_slice()),
                live,
            }),
        }
    }

    /// Returns the physical address of the page.
    pub fn paddr(&self) -> u64 {
        self.inner.paddr
    }

    /// Returns how many references to this page exist.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns `true` if both handles name the same page.
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copies bytes out of the page starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.inner.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies bytes into the page starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the page.
    pub fn write(&self, offset: usize, src: &[u8]) {
        let mut data = self.inner.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Fills `[offset, PAGE_SIZE)` with zeroes.
    pub fn zero_from(&self, offset: usize) {
        let mut data = self.inner.data.lock();
        data[offset..].fill(0);
    }

    /// Replaces the page contents with a copy of `other`.
    pub fn copy_from(&self, other: &Frame) {
        if self.ptr_eq(other) {
            return;
        }
        let src = other.inner.data.lock();
        let mut dst = self.inner.data.lock();
        dst.copy_from_slice(&src);
    }

    /// Atomically loads the little-endian `u32` at `offset`.
    ///
    /// The page lock makes the load atomic with respect to every other
    /// kernel access.
    pub fn load_u32(&self, offset: usize) -> u32 {
        let data = self.inner.data.lock();
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[offset..offset + 4]);
        u32::from_le_bytes(word)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("paddr", &format_args!("{:#x}", self.paddr()))
            .field("refs", &self.refcount())
            .finish()
    }
}

/// Source of zeroed physical pages.
pub trait PageProvider: Send + Sync {
    /// Allocates one zeroed page, or `None` when memory is exhausted.
    fn alloc_zeroed(&self) -> Option<Frame>;
}

/// A [`PageProvider`] backed by the kernel heap, with a hard page limit.
///
/// Physical addresses are synthesized from a monotonic counter, so every
/// frame ever handed out has a distinct address.
pub struct HeapPageProvider {
    limit: usize,
    live: Arc<AtomicUsize>,
    next_paddr: AtomicU64,
}

impl HeapPageProvider {
    /// First synthesized physical address.
    const PADDR_BASE: u64 = 0x10_0000;

    /// Creates a provider that allows at most `limit` live pages.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            live: Arc::new(AtomicUsize::new(0)),
            next_paddr: AtomicU64::new(Self::PADDR_BASE),
        }
    }

    /// Returns the number of pages currently allocated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Returns the page limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl PageProvider for HeapPageProvider {
    fn alloc_zeroed(&self) -> Option<Frame> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()?;
        let paddr = self.next_paddr.fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        Some(Frame::new(paddr, self.live.clone()))
    }
}

/// Pages of a file, as seen by file-backed mappings.
///
/// The cache owns one reference to each page it returns, so a mapping that
/// is still present always keeps the frame shared with the cache. Private
/// mappings must therefore never write through a cache page.
pub trait PageCache: Send + Sync {
    /// Returns the page holding file bytes `[offset, offset + PAGE_SIZE)`.
    ///
    /// `offset` is page aligned.
    fn page(&self, offset: usize) -> Result<Frame, VmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_counts_live_frames() {
        let provider = HeapPageProvider::new(4);
        let a = provider.alloc_zeroed().unwrap();
        let b = a.clone();
        assert_eq!(provider.live(), 1);
        assert_eq!(a.refcount(), 2);
        drop(a);
        assert_eq!(provider.live(), 1);
        drop(b);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn provider_enforces_limit() {
        let provider = HeapPageProvider::new(2);
        let _a = provider.alloc_zeroed().unwrap();
        let b = provider.alloc_zeroed().unwrap();
        assert!(provider.alloc_zeroed().is_none());
        drop(b);
        assert!(provider.alloc_zeroed().is_some());
    }

    #[test]
    fn distinct_physical_addresses() {
        let provider = HeapPageProvider::new(8);
        let a = provider.alloc_zeroed().unwrap();
        let b = provider.alloc_zeroed().unwrap();
        assert_ne!(a.paddr(), b.paddr());
        assert_eq!(a.paddr() % PAGE_SIZE as u64, 0);
    }

    #[test]
    fn frame_read_write_copy() {
        let provider = HeapPageProvider::new(8);
        let a = provider.alloc_zeroed().unwrap();
        a.write(10, b"hello");
        let b = provider.alloc_zeroed().unwrap();
        b.copy_from(&a);
        let mut out = [0u8; 5];
        b.read(10, &mut out);
        assert_eq!(&out, b"hello");

        b.zero_from(12);
        b.read(10, &mut out);
        assert_eq!(&out, b"he\0\0\0");

        a.write(0, &7u32.to_le_bytes());
        assert_eq!(a.load_u32(0), 7);
    }
}
