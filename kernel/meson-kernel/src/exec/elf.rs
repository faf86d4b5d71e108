//! Mapping an ELF image into an address space.
//!
//! Segments are mapped lazily from the file's page cache. The only pages
//! materialized up front are the partial page at the end of each
//! segment's file data (when BSS follows it), the entry page and the TLS
//! template.

use alloc::sync::Arc;
use alloc::vec;

use meson_elf::{ElfFile, LoadSegment, TlsSegment};
use meson_mm::{
    AddressSpace, Backing, PAGE_MASK, PAGE_SIZE, PageCache, PteFlags, RegionPerms, USERMIN,
    VmError, page_round_down, page_round_up,
};

use crate::errno::{Errno, KResult};

/// The TLS block every thread starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsImage {
    /// Read-only template new threads copy from.
    pub fresh: usize,
    /// Block size, rounded up to 8.
    pub size: usize,
    /// The first thread's writable copy.
    pub t0: usize,
}

impl TlsImage {
    /// The first thread's thread pointer: just past its block.
    pub fn thread_pointer(&self) -> usize {
        self.t0 + self.size
    }
}

/// What the loader left in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point.
    pub entry: usize,
    /// TLS, if the image has a `PT_TLS` segment.
    pub tls: Option<TlsImage>,
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "ELF64 fields on a 64-bit kernel"
)]
const fn to_usize(v: u64) -> usize {
    v as usize
}

/// Maps every loadable segment of `elf` into `aspace`.
///
/// # Errors
///
/// [`Errno::ENOEXEC`] if a segment's address and file offset disagree
/// within a page, a size overflows or the entry page cannot be read.
/// [`Errno::ENOMEM`] if memory runs out, including while bringing in the
/// entry page.
pub fn load(
    aspace: &AddressSpace,
    elf: &ElfFile<'_>,
    cache: &Arc<dyn PageCache>,
) -> KResult<LoadedImage> {
    for seg in elf.load_segments() {
        if to_usize(seg.vaddr) < USERMIN {
            continue;
        }
        load_segment(aspace, &seg, cache)?;
    }

    let entry = to_usize(elf.entry_point());
    aspace
        .fault(page_round_down(entry), false)
        .map_err(|e| match e {
            VmError::NoMemory => Errno::ENOMEM,
            _ => Errno::ENOEXEC,
        })?;

    let tls = match elf.tls_segment() {
        Some(seg) if seg.memsz > 0 => Some(load_tls(aspace, &seg)?),
        _ => None,
    };
    Ok(LoadedImage { entry, tls })
}

fn load_segment(
    aspace: &AddressSpace,
    seg: &LoadSegment,
    cache: &Arc<dyn PageCache>,
) -> KResult<()> {
    let vaddr = to_usize(seg.vaddr);
    let offset = to_usize(seg.offset);
    let filesz = to_usize(seg.filesz);
    let memsz = to_usize(seg.memsz);
    if vaddr & PAGE_MASK != offset & PAGE_MASK || memsz < filesz {
        return Err(Errno::ENOEXEC);
    }
    let start = page_round_down(vaddr);
    let data_end = vaddr.checked_add(filesz).ok_or(Errno::ENOEXEC)?;
    let file_end = page_round_up(data_end).ok_or(Errno::ENOEXEC)?;
    let mem_end = vaddr
        .checked_add(memsz)
        .and_then(page_round_up)
        .ok_or(Errno::ENOEXEC)?;

    let mut perms = RegionPerms::USER;
    let mut flags = PteFlags::PRESENT | PteFlags::USER;
    if seg.is_writable() {
        perms |= RegionPerms::WRITE;
        flags |= PteFlags::WRITABLE;
    }

    let file_offset = page_round_down(offset);
    if file_end > start {
        aspace.insert_region(
            start,
            file_end - start,
            perms,
            Backing::File {
                cache: cache.clone(),
                offset: file_offset,
            },
        )?;
    }
    if memsz == filesz {
        return Ok(());
    }

    // The page holding the end of the file data also holds the start of
    // BSS. It gets a private copy so the zeroing never reaches the cache.
    if data_end & PAGE_MASK != 0 {
        let page = page_round_down(data_end);
        let src = cache.page(file_offset + (page - start))?;
        let copy = aspace.provider().alloc_zeroed().ok_or(Errno::ENOMEM)?;
        copy.copy_from(&src);
        copy.zero_from(data_end & PAGE_MASK);
        aspace.map_frame(page, copy, flags)?;
    }
    if mem_end > file_end {
        aspace.map_anon(file_end, mem_end - file_end, perms, false, false)?;
    }
    Ok(())
}

/// Builds the read-only template and the first thread's copy-on-write
/// instance, side by side.
fn load_tls(aspace: &AddressSpace, seg: &TlsSegment) -> KResult<TlsImage> {
    let filesz = to_usize(seg.filesz);
    let size = to_usize(seg.memsz)
        .checked_next_multiple_of(8)
        .ok_or(Errno::ENOEXEC)?;
    if filesz > size {
        return Err(Errno::ENOEXEC);
    }
    let span = page_round_up(size).ok_or(Errno::ENOEXEC)?;

    let mut data = vec![0u8; filesz];
    aspace.copy_in(to_usize(seg.vaddr), &mut data)?;

    let fresh = aspace.unused_va(0, 2 * span)?;
    let t0 = fresh + span;
    aspace.insert_region(fresh, span, RegionPerms::USER, Backing::Anon)?;
    aspace.insert_region(t0, span, RegionPerms::USER | RegionPerms::WRITE, Backing::Anon)?;
    for off in (0..span).step_by(PAGE_SIZE) {
        let frame = aspace.provider().alloc_zeroed().ok_or(Errno::ENOMEM)?;
        if off < filesz {
            let end = filesz.min(off + PAGE_SIZE);
            frame.write(0, &data[off..end]);
        }
        aspace.map_frame(fresh + off, frame.clone(), PteFlags::PRESENT | PteFlags::USER)?;
        aspace.map_frame(
            t0 + off,
            frame,
            PteFlags::PRESENT | PteFlags::USER | PteFlags::COW,
        )?;
    }
    Ok(TlsImage { fresh, size, t0 })
}

#[cfg(test)]
mod tests {
    use meson_mm::{Frame, HeapPageProvider, NoShootdown, VmLimits};

    use super::*;
    use crate::testing::tiny_elf;

    /// A cache that can never produce a page.
    struct Exhausted;

    impl PageCache for Exhausted {
        fn page(&self, _offset: usize) -> Result<Frame, VmError> {
            Err(VmError::NoMemory)
        }
    }

    /// A cache whose file is shorter than its program headers claim.
    struct Truncated;

    impl PageCache for Truncated {
        fn page(&self, _offset: usize) -> Result<Frame, VmError> {
            Err(VmError::Fault)
        }
    }

    fn fresh_space() -> AddressSpace {
        AddressSpace::new(
            Arc::new(HeapPageProvider::new(16)),
            Arc::new(NoShootdown),
            VmLimits::UNLIMITED,
        )
    }

    #[test]
    fn entry_page_exhaustion_is_enomem() {
        let bytes = tiny_elf();
        let elf = ElfFile::parse(&bytes).unwrap();
        let cache: Arc<dyn PageCache> = Arc::new(Exhausted);
        assert_eq!(load(&fresh_space(), &elf, &cache).err(), Some(Errno::ENOMEM));
    }

    #[test]
    fn unreadable_entry_page_is_enoexec() {
        let bytes = tiny_elf();
        let elf = ElfFile::parse(&bytes).unwrap();
        let cache: Arc<dyn PageCache> = Arc::new(Truncated);
        assert_eq!(load(&fresh_space(), &elf, &cache).err(), Some(Errno::ENOEXEC));
    }
}
