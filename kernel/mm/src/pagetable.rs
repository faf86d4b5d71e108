//! Software page table.
//!
//! Maps page-aligned user virtual addresses to a [`Frame`] plus
//! [`PteFlags`]. A missing entry is a non-present page.

use alloc::collections::BTreeMap;

use crate::page::Frame;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// The entry maps a page.
        const PRESENT  = 1 << 0;
        /// The page is writable from user mode.
        const WRITABLE = 1 << 1;
        /// The page is accessible from user mode.
        const USER     = 1 << 2;
        /// The page is shared copy-on-write; a write fault copies it.
        const COW      = 1 << 9;
    }
}

/// A present page table entry.
#[derive(Debug, Clone)]
pub struct Pte {
    /// The mapped page.
    pub frame: Frame,
    /// Entry flags.
    pub flags: PteFlags,
}

/// Virtual page → entry map for one address space.
#[derive(Debug, Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    /// Creates an empty page table.
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Looks up the entry for the page at `va`.
    pub fn get(&self, va: usize) -> Option<&Pte> {
        self.entries.get(&va)
    }

    /// Mutable lookup of the entry for the page at `va`.
    pub fn get_mut(&mut self, va: usize) -> Option<&mut Pte> {
        self.entries.get_mut(&va)
    }

    /// Installs an entry, returning the one it replaced.
    pub fn map(&mut self, va: usize, frame: Frame, flags: PteFlags) -> Option<Pte> {
        self.entries.insert(
            va,
            Pte {
                frame,
                flags: flags | PteFlags::PRESENT,
            },
        )
    }

    /// Removes the entry for the page at `va`.
    pub fn unmap(&mut self, va: usize) -> Option<Pte> {
        self.entries.remove(&va)
    }

    /// Removes every entry in `[start, end)` and returns how many there were.
    ///
    /// Dropping the removed entries releases their frame references.
    pub fn unmap_range(&mut self, start: usize, end: usize) -> usize {
        let mut tail = self.entries.split_off(&start);
        let mut rest = tail.split_off(&end);
        let removed = tail.len();
        self.entries.append(&mut rest);
        removed
    }

    /// Iterates over entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Pte)> {
        self.entries.iter().map(|(&va, pte)| (va, pte))
    }

    /// Iterates mutably over entries in address order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Pte)> {
        self.entries.iter_mut().map(|(&va, pte)| (va, pte))
    }

    /// Number of present pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{HeapPageProvider, PageProvider};

    #[test]
    fn unmap_range_keeps_neighbours() {
        let provider = HeapPageProvider::new(8);
        let mut pt = PageTable::new();
        for va in [0x1000, 0x2000, 0x3000, 0x4000] {
            pt.map(va, provider.alloc_zeroed().unwrap(), PteFlags::USER);
        }
        assert_eq!(pt.unmap_range(0x2000, 0x4000), 2);
        assert!(pt.get(0x1000).is_some());
        assert!(pt.get(0x2000).is_none());
        assert!(pt.get(0x3000).is_none());
        assert!(pt.get(0x4000).is_some());
        assert_eq!(provider.live(), 2);
    }

    #[test]
    fn map_sets_present() {
        let provider = HeapPageProvider::new(1);
        let mut pt = PageTable::new();
        pt.map(0x5000, provider.alloc_zeroed().unwrap(), PteFlags::USER);
        assert!(pt.get(0x5000).unwrap().flags.contains(PteFlags::PRESENT));
    }
}
