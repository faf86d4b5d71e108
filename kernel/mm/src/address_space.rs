//! User address spaces.
//!
//! An [`AddressSpace`] owns one process's regions and software page table
//! behind a single lock. Faults, fork duplication, unmapping and every
//! kernel access to user memory take that lock, so a page can never change
//! underneath a copy in progress. TLB shootdowns for removed or demoted
//! pages are issued before the lock is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::id::CpuId;
use meson_core::sync::SpinLock;

use crate::page::{Frame, PageProvider};
use crate::pagetable::{PageTable, Pte, PteFlags};
use crate::region::{Backing, Region, RegionMap, RegionPerms};
use crate::tlb::TlbShootdown;
use crate::{PAGE_MASK, PAGE_SIZE, USEREND, USERMIN, VmError, page_round_down, page_round_up};

/// Per-address-space quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    /// Maximum number of pages covered by regions.
    pub max_pages: usize,
    /// Maximum number of regions.
    pub max_regions: usize,
}

impl VmLimits {
    /// No quota beyond the address range itself.
    pub const UNLIMITED: Self = Self {
        max_pages: usize::MAX,
        max_regions: usize::MAX,
    };
}

/// A resolved user word: the page holding it plus its offset.
///
/// The physical address is stable for as long as the mapping is, which makes
/// it a usable key for futexes shared across address spaces.
#[derive(Debug, Clone)]
pub struct PhysWord {
    frame: Frame,
    offset: usize,
}

impl PhysWord {
    /// Physical address of the word.
    pub fn paddr(&self) -> u64 {
        self.frame.paddr() + self.offset as u64
    }

    /// Loads the 32-bit value at the word.
    pub fn load(&self) -> u32 {
        self.frame.load_u32(self.offset)
    }
}

struct Inner {
    table: PageTable,
    regions: RegionMap,
}

/// One process's virtual memory.
pub struct AddressSpace {
    inner: SpinLock<Inner>,
    cpus: SpinLock<Vec<CpuId>>,
    provider: Arc<dyn PageProvider>,
    tlb: Arc<dyn TlbShootdown>,
    limits: VmLimits,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(
        provider: Arc<dyn PageProvider>,
        tlb: Arc<dyn TlbShootdown>,
        limits: VmLimits,
    ) -> Self {
        Self {
            inner: SpinLock::named(
                "aspace",
                Inner {
                    table: PageTable::new(),
                    regions: RegionMap::new(),
                },
            ),
            cpus: SpinLock::named("aspace_cpus", Vec::new()),
            provider,
            tlb,
            limits,
        }
    }

    /// Creates an empty address space with the same provider, shootdown
    /// sink and quotas as this one.
    pub fn new_sibling(&self) -> Self {
        Self::new(self.provider.clone(), self.tlb.clone(), self.limits)
    }

    /// Returns the quotas.
    pub fn limits(&self) -> VmLimits {
        self.limits
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.provider
    }

    // ── CPU tracking ────────────────────────────────────────────────

    /// Records that `cpu` has started running this address space.
    pub fn activate(&self, cpu: CpuId) {
        let mut cpus = self.cpus.lock();
        if !cpus.contains(&cpu) {
            cpus.push(cpu);
        }
    }

    /// Records that `cpu` has stopped running this address space.
    pub fn deactivate(&self, cpu: CpuId) {
        self.cpus.lock().retain(|&c| c != cpu);
    }

    /// CPUs currently running this address space.
    pub fn cpus(&self) -> Vec<CpuId> {
        self.cpus.lock().clone()
    }

    fn shootdown(&self, start: usize, pages: usize) {
        let cpus = self.cpus();
        self.tlb.shootdown(&cpus, start, pages);
    }

    // ── Regions ─────────────────────────────────────────────────────

    /// Finds a free range of `len` bytes at or above `hint`.
    ///
    /// # Errors
    ///
    /// [`VmError::NoMemory`] if the user address range is exhausted.
    pub fn unused_va(&self, hint: usize, len: usize) -> Result<usize, VmError> {
        self.inner
            .lock()
            .regions
            .unused_va(hint, len)
            .ok_or(VmError::NoMemory)
    }

    /// Adds a region without mapping any page.
    ///
    /// # Errors
    ///
    /// [`VmError::NoMemory`] if the page or region quota would be exceeded,
    /// [`VmError::Invalid`] if the range is misaligned or already in use.
    pub fn insert_region(
        &self,
        start: usize,
        len: usize,
        perms: RegionPerms,
        backing: Backing,
    ) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, start, len, perms, backing)
    }

    fn insert_locked(
        &self,
        inner: &mut Inner,
        start: usize,
        len: usize,
        perms: RegionPerms,
        backing: Backing,
    ) -> Result<(), VmError> {
        if start < USERMIN || start.checked_add(len).is_none_or(|end| end > USEREND) {
            return Err(VmError::Invalid);
        }
        let pages = len / PAGE_SIZE;
        if inner.regions.pages().saturating_add(pages) > self.limits.max_pages
            || inner.regions.len() >= self.limits.max_regions
        {
            return Err(VmError::NoMemory);
        }
        inner.regions.insert(Region {
            start,
            len,
            perms,
            backing,
        })
    }

    /// Adds an anonymous region and, if `eager`, backs every page now.
    ///
    /// An eager mapping that runs out of memory part way unmaps every page
    /// it installed and removes the region again before failing.
    ///
    /// # Errors
    ///
    /// As [`insert_region`](Self::insert_region), plus [`VmError::NoMemory`]
    /// when the provider is exhausted.
    pub fn map_anon(
        &self,
        start: usize,
        len: usize,
        perms: RegionPerms,
        shared: bool,
        eager: bool,
    ) -> Result<(), VmError> {
        let backing = if shared {
            Backing::SharedAnon
        } else {
            Backing::Anon
        };
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, start, len, perms, backing)?;
        if eager {
            self.populate_locked(&mut inner, start, len, perms)?;
        }
        Ok(())
    }

    /// Picks a free range at or above `hint` and adds a region there, both
    /// under one lock, so concurrent callers always get disjoint ranges.
    /// With `eager`, an anonymous region is backed right away as in
    /// [`map_anon`](Self::map_anon); file-backed regions are always lazy.
    ///
    /// # Errors
    ///
    /// [`VmError::NoMemory`] if no free range is left, plus everything
    /// [`map_anon`](Self::map_anon) can fail with.
    pub fn map_anywhere(
        &self,
        hint: usize,
        len: usize,
        perms: RegionPerms,
        backing: Backing,
        eager: bool,
    ) -> Result<usize, VmError> {
        let zero_fill = matches!(backing, Backing::Anon | Backing::SharedAnon);
        let mut inner = self.inner.lock();
        let start = inner
            .regions
            .unused_va(hint, len)
            .ok_or(VmError::NoMemory)?;
        self.insert_locked(&mut inner, start, len, perms, backing)?;
        if eager && zero_fill {
            self.populate_locked(&mut inner, start, len, perms)?;
        }
        Ok(start)
    }

    /// Backs every page of the freshly inserted region at `start` with a
    /// zeroed frame. On exhaustion the region is torn down again.
    fn populate_locked(
        &self,
        inner: &mut Inner,
        start: usize,
        len: usize,
        perms: RegionPerms,
    ) -> Result<(), VmError> {
        let flags = perms_to_pte(perms);
        for va in (start..start + len).step_by(PAGE_SIZE) {
            let Some(frame) = self.provider.alloc_zeroed() else {
                inner.table.unmap_range(start, va);
                // The region was inserted whole, so removing it whole can
                // neither split nor miss.
                let _ = inner.regions.remove(start, len, usize::MAX);
                return Err(VmError::NoMemory);
            };
            inner.table.map(va, frame, flags);
        }
        Ok(())
    }

    /// Removes `[start, start + len)` from the region inside which it lies
    /// and unmaps its pages.
    ///
    /// # Errors
    ///
    /// [`VmError::Invalid`] if the range is not inside a single region,
    /// [`VmError::NoMemory`] if splitting the region would exceed the
    /// region quota.
    pub fn remove_range(&self, start: usize, len: usize) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        inner.regions.remove(start, len, self.limits.max_regions)?;
        let end = start + len;
        if inner.table.unmap_range(start, end) > 0 {
            self.shootdown(start, len / PAGE_SIZE);
        }
        Ok(())
    }

    /// Number of regions.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Pages covered by regions.
    pub fn region_pages(&self) -> usize {
        self.inner.lock().regions.pages()
    }

    /// Pages currently present.
    pub fn mapped_pages(&self) -> usize {
        self.inner.lock().table.len()
    }

    // ── Pages ───────────────────────────────────────────────────────

    /// Flags of the page at `va`, if present.
    pub fn pte_flags(&self, va: usize) -> Option<PteFlags> {
        self.inner
            .lock()
            .table
            .get(page_round_down(va))
            .map(|pte| pte.flags)
    }

    /// The frame mapped at `va`, if present.
    pub fn frame_at(&self, va: usize) -> Option<Frame> {
        self.inner
            .lock()
            .table
            .get(page_round_down(va))
            .map(|pte| pte.frame.clone())
    }

    /// Installs `frame` at the page `va`, which must lie inside a region.
    ///
    /// # Errors
    ///
    /// [`VmError::Invalid`] if `va` is misaligned or outside every region.
    pub fn map_frame(&self, va: usize, frame: Frame, flags: PteFlags) -> Result<(), VmError> {
        if va & PAGE_MASK != 0 {
            return Err(VmError::Invalid);
        }
        let mut inner = self.inner.lock();
        if inner.regions.lookup(va).is_none() {
            return Err(VmError::Invalid);
        }
        inner.table.map(va, frame, flags);
        Ok(())
    }

    /// Resolves a user fault at `va`.
    ///
    /// # Errors
    ///
    /// [`VmError::Segv`] if no region allows the access,
    /// [`VmError::NoMemory`] if a page could not be allocated.
    pub fn fault(&self, va: usize, write: bool) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        fault_locked(&mut inner, self.provider.as_ref(), va, write)
    }

    // ── Fork ────────────────────────────────────────────────────────

    /// Duplicates this address space into the empty `child`.
    ///
    /// Private writable pages become read-only copy-on-write in both spaces
    /// and share their frame; everything else is shared with the same flags.
    /// Returns `true` if some parent page was demoted, in which case the
    /// parent's TLBs have already been shot down.
    ///
    /// # Errors
    ///
    /// [`VmError::NoMemory`] if the child's quotas cannot hold the parent's
    /// regions.
    pub fn fork_into(&self, child: &AddressSpace) -> Result<bool, VmError> {
        let mut parent = self.inner.lock();
        let mut kid = child.inner.lock();

        for region in parent.regions.iter() {
            child.insert_locked(
                &mut kid,
                region.start,
                region.len,
                region.perms,
                region.backing.clone(),
            )?;
        }

        let Inner { table, regions } = &mut *parent;
        let mut demoted = false;
        for (va, pte) in table.iter_mut() {
            let shared = regions.lookup(va).is_some_and(|r| r.backing.is_shared());
            if !shared && pte.flags.contains(PteFlags::WRITABLE) {
                pte.flags.remove(PteFlags::WRITABLE);
                pte.flags.insert(PteFlags::COW);
                demoted = true;
            }
            kid.table.map(va, pte.frame.clone(), pte.flags);
        }

        if demoted {
            self.shootdown(USERMIN, (USEREND - USERMIN) / PAGE_SIZE);
        }
        Ok(demoted)
    }

    // ── User memory access ──────────────────────────────────────────

    /// Copies `src` to user address `va`, breaking COW as needed.
    ///
    /// # Errors
    ///
    /// [`VmError::Fault`] if any byte is not writable user memory,
    /// [`VmError::NoMemory`] if a page could not be allocated.
    pub fn copy_out(&self, va: usize, src: &[u8]) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < src.len() {
            let addr = va.checked_add(done).ok_or(VmError::Fault)?;
            let pte = user_page(&mut inner, self.provider.as_ref(), addr, true)?;
            let off = addr & PAGE_MASK;
            let n = (PAGE_SIZE - off).min(src.len() - done);
            pte.frame.write(off, &src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies user memory at `va` into `dst`.
    ///
    /// # Errors
    ///
    /// [`VmError::Fault`] if any byte is not readable user memory,
    /// [`VmError::NoMemory`] if a page could not be allocated.
    pub fn copy_in(&self, va: usize, dst: &mut [u8]) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < dst.len() {
            let addr = va.checked_add(done).ok_or(VmError::Fault)?;
            let pte = user_page(&mut inner, self.provider.as_ref(), addr, false)?;
            let off = addr & PAGE_MASK;
            let n = (PAGE_SIZE - off).min(dst.len() - done);
            pte.frame.read(off, &mut dst[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `max` bytes (terminator
    /// excluded) from `va`.
    ///
    /// # Errors
    ///
    /// [`VmError::Fault`] on a bad address, [`VmError::NameTooLong`] if no
    /// terminator appears within `max` bytes.
    pub fn read_cstr(&self, va: usize, max: usize) -> Result<Vec<u8>, VmError> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let mut page = [0u8; PAGE_SIZE];
        loop {
            let addr = va.checked_add(out.len()).ok_or(VmError::Fault)?;
            let pte = user_page(&mut inner, self.provider.as_ref(), addr, false)?;
            let off = addr & PAGE_MASK;
            let chunk = &mut page[..PAGE_SIZE - off];
            pte.frame.read(off, chunk);
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                if out.len() > max {
                    return Err(VmError::NameTooLong);
                }
                return Ok(out);
            }
            out.extend_from_slice(chunk);
            if out.len() > max {
                return Err(VmError::NameTooLong);
            }
        }
    }

    /// Reads a little-endian `u64` from user memory.
    ///
    /// # Errors
    ///
    /// As [`copy_in`](Self::copy_in).
    pub fn read_u64(&self, va: usize) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        self.copy_in(va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes a little-endian `u64` to user memory.
    ///
    /// # Errors
    ///
    /// As [`copy_out`](Self::copy_out).
    pub fn write_u64(&self, va: usize, val: u64) -> Result<(), VmError> {
        self.copy_out(va, &val.to_le_bytes())
    }

    /// Reads a little-endian `u32` from user memory.
    ///
    /// # Errors
    ///
    /// As [`copy_in`](Self::copy_in).
    pub fn read_u32(&self, va: usize) -> Result<u32, VmError> {
        let mut buf = [0u8; 4];
        self.copy_in(va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes a little-endian `u32` to user memory.
    ///
    /// # Errors
    ///
    /// As [`copy_out`](Self::copy_out).
    pub fn write_u32(&self, va: usize, val: u32) -> Result<(), VmError> {
        self.copy_out(va, &val.to_le_bytes())
    }

    /// Resolves the user word at `va` to its physical page.
    ///
    /// The page must already be present and user accessible; nothing is
    /// faulted in. A COW page in a writable region is broken first, so the
    /// key does not move when the owner later writes the word.
    ///
    /// # Errors
    ///
    /// [`VmError::Fault`] if the page is not present or not user accessible,
    /// [`VmError::NoMemory`] if breaking COW needs a page that is not there.
    pub fn translate(&self, va: usize) -> Result<PhysWord, VmError> {
        let mut inner = self.inner.lock();
        let page = page_round_down(va);
        let writable_region = inner
            .regions
            .lookup(va)
            .is_some_and(|r| r.perms.contains(RegionPerms::WRITE));
        let pte = inner.table.get_mut(page).ok_or(VmError::Fault)?;
        if !pte.flags.contains(PteFlags::USER) {
            return Err(VmError::Fault);
        }
        if pte.flags.contains(PteFlags::COW) && writable_region {
            break_cow(self.provider.as_ref(), pte)?;
        }
        Ok(PhysWord {
            frame: pte.frame.clone(),
            offset: va & PAGE_MASK,
        })
    }
}

fn perms_to_pte(perms: RegionPerms) -> PteFlags {
    let mut flags = PteFlags::PRESENT;
    if perms.contains(RegionPerms::USER) {
        flags |= PteFlags::USER;
    }
    if perms.contains(RegionPerms::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    flags
}

/// Gives the PTE `pte` a private writable frame.
///
/// The last reference to a COW frame is reused in place.
fn break_cow(provider: &dyn PageProvider, pte: &mut Pte) -> Result<(), VmError> {
    if pte.frame.refcount() > 1 {
        let copy = provider.alloc_zeroed().ok_or(VmError::NoMemory)?;
        copy.copy_from(&pte.frame);
        pte.frame = copy;
    }
    pte.flags.remove(PteFlags::COW);
    pte.flags.insert(PteFlags::WRITABLE);
    Ok(())
}

fn fault_locked(
    inner: &mut Inner,
    provider: &dyn PageProvider,
    va: usize,
    write: bool,
) -> Result<(), VmError> {
    if !(USERMIN..USEREND).contains(&va) {
        return Err(VmError::Segv);
    }
    let region = inner.regions.lookup(va).ok_or(VmError::Segv)?;
    if !region.perms.contains(RegionPerms::USER)
        || (write && !region.perms.contains(RegionPerms::WRITE))
    {
        return Err(VmError::Segv);
    }
    let page = page_round_down(va);

    if let Some(pte) = inner.table.get_mut(page) {
        if !write || pte.flags.contains(PteFlags::WRITABLE) {
            return Ok(());
        }
        if pte.flags.contains(PteFlags::COW) {
            return break_cow(provider, pte);
        }
        return Err(VmError::Segv);
    }

    let perm_flags = perms_to_pte(region.perms);
    let (frame, flags) = match &region.backing {
        Backing::Anon | Backing::SharedAnon => {
            (provider.alloc_zeroed().ok_or(VmError::NoMemory)?, perm_flags)
        }
        Backing::File { cache, .. } => {
            let offset = region.file_offset(va).ok_or(VmError::Fault)?;
            let cached = cache.page(offset)?;
            if write {
                let copy = provider.alloc_zeroed().ok_or(VmError::NoMemory)?;
                copy.copy_from(&cached);
                (copy, perm_flags)
            } else if region.perms.contains(RegionPerms::WRITE) {
                (cached, (perm_flags - PteFlags::WRITABLE) | PteFlags::COW)
            } else {
                (cached, perm_flags)
            }
        }
        Backing::SharedFile { cache, .. } => {
            let offset = region.file_offset(va).ok_or(VmError::Fault)?;
            (cache.page(offset)?, perm_flags)
        }
    };
    inner.table.map(page, frame, flags);
    Ok(())
}

/// Makes the page at `addr` accessible for a kernel copy and returns its
/// entry. Any failure other than exhaustion is a bad user address.
fn user_page<'a>(
    inner: &'a mut Inner,
    provider: &dyn PageProvider,
    addr: usize,
    write: bool,
) -> Result<&'a Pte, VmError> {
    let page = page_round_down(addr);
    let ready = inner.table.get(page).is_some_and(|pte| {
        pte.flags.contains(PteFlags::USER) && (!write || pte.flags.contains(PteFlags::WRITABLE))
    });
    if !ready {
        fault_locked(inner, provider, addr, write).map_err(|e| match e {
            VmError::NoMemory => VmError::NoMemory,
            _ => VmError::Fault,
        })?;
    }
    let pte = inner.table.get(page).ok_or(VmError::Fault)?;
    if !pte.flags.contains(PteFlags::USER) {
        return Err(VmError::Fault);
    }
    Ok(pte)
}

/// Rounds a user length up to whole pages, rejecting zero and overflow.
///
/// # Errors
///
/// [`VmError::Invalid`] for a zero or overflowing length.
pub fn page_len(len: usize) -> Result<usize, VmError> {
    match page_round_up(len) {
        Some(0) | None => Err(VmError::Invalid),
        Some(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{HeapPageProvider, PageCache};
    use crate::tlb::{NoShootdown, ShootdownLog};

    const RW: RegionPerms = RegionPerms::USER.union(RegionPerms::WRITE);

    fn space(pages: usize) -> (Arc<HeapPageProvider>, AddressSpace) {
        let provider = Arc::new(HeapPageProvider::new(pages));
        let aspace = AddressSpace::new(provider.clone(), Arc::new(NoShootdown), VmLimits::UNLIMITED);
        (provider, aspace)
    }

    struct OnePageFile {
        page: Frame,
    }

    impl PageCache for OnePageFile {
        fn page(&self, offset: usize) -> Result<Frame, VmError> {
            if offset == 0 {
                Ok(self.page.clone())
            } else {
                Err(VmError::Fault)
            }
        }
    }

    #[test]
    fn anon_fault_is_zero_filled() {
        let (_, aspace) = space(8);
        aspace.insert_region(USERMIN, 0x2000, RW, Backing::Anon).unwrap();
        let mut buf = [0xffu8; 16];
        aspace.copy_in(USERMIN + 0xff8, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(aspace.mapped_pages(), 2);
    }

    #[test]
    fn copy_past_region_end_faults() {
        let (_, aspace) = space(8);
        aspace.insert_region(USERMIN, 0x2000, RW, Backing::Anon).unwrap();
        let mut buf = [0u8; 16];
        assert!(aspace.copy_in(USERMIN + 0x1ff8, &mut buf).is_err());
        assert!(aspace.copy_out(USERMIN + 0x1ff8, &buf).is_err());
    }

    #[test]
    fn map_anywhere_skips_used_ranges() {
        let (_, aspace) = space(8);
        aspace.insert_region(USERMIN, 0x2000, RW, Backing::Anon).unwrap();
        let at = aspace.map_anywhere(USERMIN, 0x1000, RW, Backing::Anon, true).unwrap();
        assert_eq!(at, USERMIN + 0x2000);
        assert_eq!(aspace.mapped_pages(), 1);
        let lazy = aspace.map_anywhere(0, 0x3000, RW, Backing::SharedAnon, false).unwrap();
        assert_eq!(lazy, USERMIN + 0x3000);
        assert_eq!(aspace.mapped_pages(), 1);
    }

    #[test]
    fn map_anywhere_undoes_a_failed_eager_mapping() {
        let (_, aspace) = space(2);
        assert_eq!(
            aspace.map_anywhere(USERMIN, 0x3000, RW, Backing::Anon, true),
            Err(VmError::NoMemory)
        );
        assert_eq!(aspace.region_count(), 0);
        assert_eq!(aspace.mapped_pages(), 0);
    }

    #[test]
    fn concurrent_map_anywhere_is_disjoint() {
        const THREADS: usize = 4;
        const EACH: usize = 8;
        const LEN: usize = 0x2000;

        let (_, aspace) = space(0);
        let mut starts: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..EACH)
                            .map(|_| {
                                aspace
                                    .map_anywhere(USERMIN, LEN, RW, Backing::Anon, false)
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        starts.sort_unstable();
        assert_eq!(starts.len(), THREADS * EACH);
        assert!(starts.windows(2).all(|w| w[1] - w[0] >= LEN));
        assert_eq!(aspace.region_count(), THREADS * EACH);
    }

    #[test]
    fn fault_outside_region_is_segv() {
        let (_, aspace) = space(8);
        aspace.insert_region(USERMIN, 0x1000, RW, Backing::Anon).unwrap();
        assert_eq!(aspace.fault(USERMIN + 0x1000, false), Err(VmError::Segv));
        assert_eq!(aspace.fault(0x1000, false), Err(VmError::Segv));
    }

    #[test]
    fn write_fault_on_read_only_region_is_segv() {
        let (_, aspace) = space(8);
        aspace
            .insert_region(USERMIN, 0x1000, RegionPerms::USER, Backing::Anon)
            .unwrap();
        assert_eq!(aspace.fault(USERMIN, true), Err(VmError::Segv));
        assert_eq!(aspace.copy_out(USERMIN, b"x"), Err(VmError::Fault));
        assert!(aspace.fault(USERMIN, false).is_ok());
    }

    #[test]
    fn guard_page_faults() {
        let (_, aspace) = space(8);
        aspace
            .insert_region(USERMIN, 0x1000, RegionPerms::empty(), Backing::Anon)
            .unwrap();
        assert_eq!(aspace.fault(USERMIN, false), Err(VmError::Segv));
    }

    #[test]
    fn unmap_then_remap_is_zero_filled() {
        let (provider, aspace) = space(8);
        aspace.map_anon(USERMIN, 0x2000, RW, false, true).unwrap();
        aspace.copy_out(USERMIN, b"secret").unwrap();
        aspace.remove_range(USERMIN, 0x2000).unwrap();
        assert_eq!(provider.live(), 0);

        aspace.map_anon(USERMIN, 0x2000, RW, false, true).unwrap();
        let mut buf = [0xffu8; 6];
        aspace.copy_in(USERMIN, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 6]);
    }

    #[test]
    fn eager_map_unwinds_on_exhaustion() {
        let (provider, aspace) = space(2);
        assert_eq!(
            aspace.map_anon(USERMIN, 0x3000, RW, false, true),
            Err(VmError::NoMemory)
        );
        assert_eq!(provider.live(), 0);
        assert_eq!(aspace.region_count(), 0);
        assert_eq!(aspace.mapped_pages(), 0);
    }

    #[test]
    fn quotas_are_enforced() {
        let provider = Arc::new(HeapPageProvider::new(16));
        let aspace = AddressSpace::new(
            provider,
            Arc::new(NoShootdown),
            VmLimits {
                max_pages: 3,
                max_regions: 2,
            },
        );
        aspace.insert_region(USERMIN, 0x2000, RW, Backing::Anon).unwrap();
        assert_eq!(
            aspace.insert_region(USERMIN + 0x2000, 0x2000, RW, Backing::Anon),
            Err(VmError::NoMemory)
        );
        aspace.insert_region(USERMIN + 0x2000, 0x1000, RW, Backing::Anon).unwrap();
        assert_eq!(
            aspace.insert_region(USERMIN + 0x8000, 0x1000, RW, Backing::Anon),
            Err(VmError::NoMemory)
        );
    }

    #[test]
    fn fork_isolates_private_writes() {
        let (_, parent) = space(16);
        parent.map_anon(USERMIN, 0x2000, RW, false, true).unwrap();
        parent.copy_out(USERMIN, b"parent").unwrap();

        let child = parent.new_sibling();
        assert!(parent.fork_into(&child).unwrap());
        assert!(parent.pte_flags(USERMIN).unwrap().contains(PteFlags::COW));
        assert!(parent.frame_at(USERMIN).unwrap().ptr_eq(&child.frame_at(USERMIN).unwrap()));

        child.copy_out(USERMIN, b"child!").unwrap();
        let mut buf = [0u8; 6];
        parent.copy_in(USERMIN, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        child.copy_in(USERMIN, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");

        // The parent is now the only holder and reuses its frame in place.
        let before = parent.frame_at(USERMIN).unwrap().paddr();
        parent.copy_out(USERMIN, b"again!").unwrap();
        assert_eq!(parent.frame_at(USERMIN).unwrap().paddr(), before);
    }

    #[test]
    fn fork_shares_shared_mappings() {
        let (_, parent) = space(16);
        parent.map_anon(USERMIN, 0x1000, RW, true, true).unwrap();
        let child = parent.new_sibling();
        assert!(!parent.fork_into(&child).unwrap());
        child.copy_out(USERMIN, b"hi").unwrap();
        let mut buf = [0u8; 2];
        parent.copy_in(USERMIN, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn fork_flush_names_running_cpus() {
        let provider = Arc::new(HeapPageProvider::new(16));
        let log = Arc::new(ShootdownLog::new());
        let parent = AddressSpace::new(provider, log.clone(), VmLimits::UNLIMITED);
        parent.activate(CpuId::new(0));
        parent.activate(CpuId::new(3));
        parent.map_anon(USERMIN, 0x1000, RW, false, true).unwrap();
        let child = parent.new_sibling();
        parent.fork_into(&child).unwrap();

        let reqs = log.take();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].cpus, [CpuId::new(0), CpuId::new(3)]);
    }

    #[test]
    fn unmap_issues_one_shootdown() {
        let provider = Arc::new(HeapPageProvider::new(16));
        let log = Arc::new(ShootdownLog::new());
        let aspace = AddressSpace::new(provider, log.clone(), VmLimits::UNLIMITED);
        aspace.activate(CpuId::new(1));
        aspace.map_anon(USERMIN, 0x4000, RW, false, true).unwrap();
        aspace.remove_range(USERMIN + 0x1000, 0x2000).unwrap();
        let reqs = log.take();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].start, USERMIN + 0x1000);
        assert_eq!(reqs[0].pages, 2);
        assert_eq!(aspace.region_count(), 2);
    }

    #[test]
    fn file_read_fault_shares_cache_page() {
        let (provider, aspace) = space(8);
        let page = provider.alloc_zeroed().unwrap();
        page.write(0, b"file");
        let cache = Arc::new(OnePageFile { page: page.clone() });
        aspace
            .insert_region(USERMIN, 0x1000, RW, Backing::File { cache, offset: 0 })
            .unwrap();

        aspace.fault(USERMIN, false).unwrap();
        assert!(aspace.frame_at(USERMIN).unwrap().ptr_eq(&page));
        assert!(aspace.pte_flags(USERMIN).unwrap().contains(PteFlags::COW));

        aspace.copy_out(USERMIN, b"FILE").unwrap();
        let mut buf = [0u8; 4];
        page.read(0, &mut buf);
        assert_eq!(&buf, b"file");
    }

    #[test]
    fn read_cstr_limits_length() {
        let (_, aspace) = space(8);
        aspace.map_anon(USERMIN, 0x2000, RW, false, true).unwrap();
        // Straddle the page boundary.
        aspace.copy_out(USERMIN + 0xffd, b"/bin/sh\0").unwrap();
        assert_eq!(aspace.read_cstr(USERMIN + 0xffd, 64).unwrap(), b"/bin/sh");
        assert_eq!(aspace.read_cstr(USERMIN + 0xffd, 3), Err(VmError::NameTooLong));
        assert_eq!(aspace.read_cstr(USERMIN + 0x2000, 64), Err(VmError::Fault));
    }

    #[test]
    fn translate_requires_present_page() {
        let (_, aspace) = space(8);
        aspace.insert_region(USERMIN, 0x1000, RW, Backing::Anon).unwrap();
        assert_eq!(aspace.translate(USERMIN).unwrap_err(), VmError::Fault);
        aspace.write_u32(USERMIN + 8, 5).unwrap();
        let word = aspace.translate(USERMIN + 8).unwrap();
        assert_eq!(word.load(), 5);
        assert_eq!(word.paddr() & PAGE_MASK as u64, 8);
    }

    #[test]
    fn page_len_rounds() {
        assert_eq!(page_len(1), Ok(PAGE_SIZE));
        assert_eq!(page_len(0), Err(VmError::Invalid));
        assert_eq!(page_len(usize::MAX), Err(VmError::Invalid));
    }
}
