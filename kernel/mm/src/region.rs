//! Virtual memory regions.
//!
//! A [`Region`] describes what a range of user addresses is allowed to be
//! and where its pages come from. The [`RegionMap`] keeps regions ordered by
//! start address and guarantees that no two of them overlap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use crate::page::PageCache;
use crate::{PAGE_MASK, PAGE_SIZE, USEREND, USERMIN, VmError, page_round_down};

bitflags::bitflags! {
    /// Access rights granted by a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        /// User mode may access the region. Guard pages lack this.
        const USER  = 1 << 0;
        /// User mode may write the region.
        const WRITE = 1 << 1;
    }
}

/// Where a region's pages come from.
#[derive(Clone)]
pub enum Backing {
    /// Private zero-filled memory.
    Anon,
    /// Zero-filled memory shared across fork.
    SharedAnon,
    /// Private copy-on-write view of file pages.
    File {
        /// The file's page cache.
        cache: Arc<dyn PageCache>,
        /// File offset of the region's first byte (page aligned).
        offset: usize,
    },
    /// Shared view of file pages; writes reach the page cache.
    SharedFile {
        /// The file's page cache.
        cache: Arc<dyn PageCache>,
        /// File offset of the region's first byte (page aligned).
        offset: usize,
    },
}

impl Backing {
    /// Returns `true` for mappings that stay shared across fork.
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::SharedAnon | Self::SharedFile { .. })
    }

    /// The same backing, starting `delta` bytes further in.
    fn advanced(&self, delta: usize) -> Self {
        match self {
            Self::Anon => Self::Anon,
            Self::SharedAnon => Self::SharedAnon,
            Self::File { cache, offset } => Self::File {
                cache: cache.clone(),
                offset: offset + delta,
            },
            Self::SharedFile { cache, offset } => Self::SharedFile {
                cache: cache.clone(),
                offset: offset + delta,
            },
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anon => write!(f, "Anon"),
            Self::SharedAnon => write!(f, "SharedAnon"),
            Self::File { offset, .. } => write!(f, "File(+{offset:#x})"),
            Self::SharedFile { offset, .. } => write!(f, "SharedFile(+{offset:#x})"),
        }
    }
}

/// A contiguous, page-aligned range of user addresses.
#[derive(Debug, Clone)]
pub struct Region {
    /// First address.
    pub start: usize,
    /// Length in bytes (page multiple, non-zero).
    pub len: usize,
    /// Access rights.
    pub perms: RegionPerms,
    /// Page source.
    pub backing: Backing,
}

impl Region {
    /// One past the last address.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Returns `true` if `va` lies inside the region.
    pub fn contains(&self, va: usize) -> bool {
        va >= self.start && va < self.end()
    }

    /// Number of pages covered.
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// File offset of the page containing `va`, for file-backed regions.
    pub fn file_offset(&self, va: usize) -> Option<usize> {
        match &self.backing {
            Backing::File { offset, .. } | Backing::SharedFile { offset, .. } => {
                Some(offset + (page_round_down(va) - self.start))
            }
            Backing::Anon | Backing::SharedAnon => None,
        }
    }

    /// The sub-region `[start, start + len)` of this one.
    fn slice(&self, start: usize, len: usize) -> Self {
        Self {
            start,
            len,
            perms: self.perms,
            backing: self.backing.advanced(start - self.start),
        }
    }
}

/// Non-overlapping regions keyed by start address.
#[derive(Debug, Default)]
pub struct RegionMap {
    regions: BTreeMap<usize, Region>,
    pages: usize,
}

impl RegionMap {
    /// Creates an empty map.
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            pages: 0,
        }
    }

    /// Finds the region containing `va`.
    pub fn lookup(&self, va: usize) -> Option<&Region> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    /// Inserts a region.
    ///
    /// # Errors
    ///
    /// [`VmError::Invalid`] if the region is empty, misaligned or overlaps
    /// an existing one.
    pub fn insert(&mut self, region: Region) -> Result<(), VmError> {
        if region.len == 0 || (region.start | region.len) & PAGE_MASK != 0 {
            return Err(VmError::Invalid);
        }
        let end = region.start.checked_add(region.len).ok_or(VmError::Invalid)?;
        if self.overlaps(region.start, end) {
            return Err(VmError::Invalid);
        }
        self.pages += region.pages();
        self.regions.insert(region.start, region);
        Ok(())
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        if let Some((_, before)) = self.regions.range(..end).next_back() {
            return before.end() > start;
        }
        false
    }

    /// Removes `[start, start + len)`, which must lie inside one region.
    ///
    /// Removing the middle of a region splits it in two; that needs a free
    /// region slot under `max_regions`.
    ///
    /// # Errors
    ///
    /// [`VmError::Invalid`] if the range is not inside a single region,
    /// [`VmError::NoMemory`] if a split would exceed `max_regions`.
    pub fn remove(&mut self, start: usize, len: usize, max_regions: usize) -> Result<(), VmError> {
        let end = start.checked_add(len).ok_or(VmError::Invalid)?;
        let region = self.lookup(start).ok_or(VmError::Invalid)?;
        if len == 0 || end > region.end() {
            return Err(VmError::Invalid);
        }
        let head = (region.start < start).then(|| region.slice(region.start, start - region.start));
        let tail = (end < region.end()).then(|| region.slice(end, region.end() - end));
        if head.is_some() && tail.is_some() && self.regions.len() + 1 > max_regions {
            return Err(VmError::NoMemory);
        }

        let key = region.start;
        self.regions.remove(&key);
        self.pages -= len / PAGE_SIZE;
        for piece in [head, tail].into_iter().flatten() {
            self.regions.insert(piece.start, piece);
        }
        Ok(())
    }

    /// Finds the lowest free, page-aligned range of `len` bytes at or above
    /// `hint` (and never below [`USERMIN`]).
    pub fn unused_va(&self, hint: usize, len: usize) -> Option<usize> {
        let mut candidate = page_round_down(hint).max(USERMIN);
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start >= candidate.checked_add(len)? {
                break;
            }
            candidate = region.end();
        }
        (candidate.checked_add(len)? <= USEREND).then_some(candidate)
    }

    /// Iterates over regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns `true` if there are no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total pages covered by all regions.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: usize, len: usize) -> Region {
        Region {
            start,
            len,
            perms: RegionPerms::USER | RegionPerms::WRITE,
            backing: Backing::Anon,
        }
    }

    fn assert_disjoint(map: &RegionMap) {
        let mut prev_end = 0;
        for r in map.iter() {
            assert!(r.start >= prev_end, "region {:#x} overlaps", r.start);
            prev_end = r.end();
        }
    }

    #[test]
    fn lookup_finds_containing_region() {
        let mut map = RegionMap::new();
        map.insert(anon(0x40_0000, 0x2000)).unwrap();
        assert_eq!(map.lookup(0x40_1fff).unwrap().start, 0x40_0000);
        assert!(map.lookup(0x40_2000).is_none());
        assert!(map.lookup(0x3f_ffff).is_none());
    }

    #[test]
    fn overlapping_insert_rejected() {
        let mut map = RegionMap::new();
        map.insert(anon(0x40_0000, 0x3000)).unwrap();
        assert_eq!(map.insert(anon(0x40_2000, 0x1000)), Err(VmError::Invalid));
        assert_eq!(map.insert(anon(0x3f_f000, 0x2000)), Err(VmError::Invalid));
        map.insert(anon(0x40_3000, 0x1000)).unwrap();
        assert_disjoint(&map);
    }

    #[test]
    fn unused_va_never_overlaps() {
        let mut map = RegionMap::new();
        map.insert(anon(0x40_0000, 0x1000)).unwrap();
        map.insert(anon(0x40_3000, 0x1000)).unwrap();
        for len in [0x1000, 0x2000, 0x3000, 0x1000, 0x5000] {
            let va = map.unused_va(0, len).unwrap();
            map.insert(anon(va, len)).unwrap();
            assert_disjoint(&map);
        }
        assert_eq!(map.lookup(0x40_1000).unwrap().len, 0x1000);
    }

    #[test]
    fn unused_va_respects_hint() {
        let map = RegionMap::new();
        assert_eq!(map.unused_va(0, 0x1000), Some(USERMIN));
        assert_eq!(map.unused_va(0x80_0123, 0x1000), Some(0x80_0000));
        assert_eq!(map.unused_va(USEREND - 0x1000, 0x2000), None);
    }

    #[test]
    fn remove_splits_and_shifts_file_offset() {
        struct NoCache;
        impl PageCache for NoCache {
            fn page(&self, _offset: usize) -> Result<crate::page::Frame, VmError> {
                Err(VmError::Fault)
            }
        }
        let mut map = RegionMap::new();
        map.insert(Region {
            start: 0x40_0000,
            len: 0x4000,
            perms: RegionPerms::USER,
            backing: Backing::File {
                cache: Arc::new(NoCache),
                offset: 0x1000,
            },
        })
        .unwrap();
        map.remove(0x40_1000, 0x1000, 8).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.pages(), 3);
        let tail = map.lookup(0x40_2000).unwrap();
        assert_eq!(tail.start, 0x40_2000);
        assert_eq!(tail.file_offset(0x40_2000), Some(0x3000));
    }

    #[test]
    fn remove_across_regions_rejected() {
        let mut map = RegionMap::new();
        map.insert(anon(0x40_0000, 0x1000)).unwrap();
        map.insert(anon(0x40_1000, 0x1000)).unwrap();
        assert_eq!(map.remove(0x40_0000, 0x2000, 8), Err(VmError::Invalid));
    }

    #[test]
    fn split_respects_region_quota() {
        let mut map = RegionMap::new();
        map.insert(anon(0x40_0000, 0x3000)).unwrap();
        assert_eq!(map.remove(0x40_1000, 0x1000, 1), Err(VmError::NoMemory));
        map.remove(0x40_0000, 0x1000, 1).unwrap();
        assert_eq!(map.lookup(0x40_1000).unwrap().start, 0x40_1000);
    }
}
