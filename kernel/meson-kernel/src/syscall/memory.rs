//! mmap and munmap.

use meson_core::ktrace;
use meson_mm::{Backing, PAGE_MASK, RegionPerms, USERMIN, page_len};
use meson_syscall::{MAP_ANON, MAP_FIXED, MAP_PRIVATE, MAP_SHARED, PROT_READ, PROT_WRITE};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::fd::FdPerms;

/// Maps `len` bytes at an address chosen by the kernel. `prot_flags`
/// carries the protection in its upper and the flags in its lower 32 bits.
/// `addr` is only a hint and is ignored.
pub(super) fn mmap(
    cx: &CallCtx<'_>,
    _addr: usize,
    len: usize,
    prot_flags: usize,
    fd: usize,
    offset: usize,
) -> KResult<usize> {
    let prot = prot_flags >> 32;
    let flags = prot_flags & 0xffff_ffff;
    let len = page_len(len)?;

    let shared = flags & MAP_SHARED != 0;
    if shared == (flags & MAP_PRIVATE != 0) || flags & MAP_FIXED != 0 || prot & PROT_READ == 0 {
        return Err(Errno::EINVAL);
    }
    #[expect(clippy::cast_possible_wrap, reason = "fd and offset are signed in the ABI")]
    let (fd_neg, off_neg) = ((fd as isize) < 0, (offset as isize) < 0);
    let anon = flags & MAP_ANON != 0;
    if anon != fd_neg || (!anon && (off_neg || offset & PAGE_MASK != 0)) {
        return Err(Errno::EINVAL);
    }

    let mut perms = RegionPerms::USER;
    perms.set(RegionPerms::WRITE, prot & PROT_WRITE != 0);
    let proc = cx.process();
    let aspace = cx.aspace();
    let backing = if anon {
        if shared {
            Backing::SharedAnon
        } else {
            Backing::Anon
        }
    } else {
        let file = cx.fd(fd)?;
        if !file.perms.contains(FdPerms::READ) {
            return Err(Errno::EACCES);
        }
        if shared && perms.contains(RegionPerms::WRITE) && !file.perms.contains(FdPerms::WRITE) {
            return Err(Errno::EACCES);
        }
        let cache = file.ops.mmap_backing()?;
        if shared {
            Backing::SharedFile { cache, offset }
        } else {
            Backing::File { cache, offset }
        }
    };

    let start = aspace.map_anywhere(proc.mmap_cursor(), len, perms, backing, true)?;
    proc.set_mmap_cursor(start + len);
    ktrace!("proc {}: mmap {:#x}+{:#x}", proc.pid(), start, len);
    Ok(start)
}

/// Unmaps `[addr, addr + len)`, which must lie inside one region. The
/// containment check and the removal happen under the address space lock.
pub(super) fn munmap(cx: &CallCtx<'_>, addr: usize, len: usize) -> KResult<usize> {
    if addr & PAGE_MASK != 0 || addr < USERMIN {
        return Err(Errno::EINVAL);
    }
    let len = page_len(len)?;
    cx.aspace().remove_range(addr, len)?;
    Ok(0)
}
