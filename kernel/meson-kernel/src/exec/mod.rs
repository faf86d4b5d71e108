//! Replacing a process image.
//!
//! The new image is built in a fresh address space: ELF segments, TLS, a
//! stack with a guard page below it and a page holding the argument
//! strings. Only when every step has succeeded is the address space swapped
//! in and the calling thread's registers reset, so a failed exec leaves the
//! caller running its old image.

pub mod elf;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::kdebug;
use meson_elf::ElfFile;
use meson_mm::{AddressSpace, PAGE_SIZE, RegionPerms, USERMIN};

use crate::config::{
    ARGV_MAX, EXEC_HEADER_SIZE, EXEC_STACK_EAGER, EXEC_STACK_HINT, EXEC_STACK_PAGES,
};
use crate::errno::{Errno, KResult};
use crate::fd::{FdOps, close_all};
use crate::fs::{FileService, OpenFlags};
use crate::proc::frame::{RFLAGS_IF, USER_CS, USER_SS};
use crate::proc::{Reg, Thread, TrapFrame};
use crate::uio::KernelBuf;

pub use elf::{LoadedImage, TlsImage};

/// Words in the trailer at the top of the stack.
const TRAILER_WORDS: usize = 4;

/// Where a freshly built image starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStart {
    /// Entry point.
    pub entry: usize,
    /// Initial stack pointer, which is also the trailer address.
    pub sp: usize,
    /// Argument count.
    pub argc: usize,
    /// Address of the argument pointer array.
    pub argv: usize,
    /// Initial thread pointer (0 without TLS).
    pub fsbase: usize,
}

/// Reads the NULL-terminated argument vector at `argv_ptr` (none if 0).
///
/// # Errors
///
/// [`Errno::EFAULT`] on a bad pointer, [`Errno::ENAMETOOLONG`] for an
/// argument longer than a page, [`Errno::EINVAL`] for more than
/// [`ARGV_MAX`] arguments.
pub fn read_argv(aspace: &AddressSpace, argv_ptr: usize) -> KResult<Vec<Vec<u8>>> {
    let mut args = Vec::new();
    if argv_ptr == 0 {
        return Ok(args);
    }
    for i in 0..=ARGV_MAX {
        let slot = argv_ptr.checked_add(i * 8).ok_or(Errno::EFAULT)?;
        let ptr = aspace.read_u64(slot)?;
        if ptr == 0 {
            return Ok(args);
        }
        if i == ARGV_MAX {
            break;
        }
        let ptr = usize::try_from(ptr).map_err(|_| Errno::EFAULT)?;
        args.push(aspace.read_cstr(ptr, PAGE_SIZE)?);
    }
    Err(Errno::EINVAL)
}

/// Copies the strings and then their pointer array into one fresh page.
/// Returns `(argc, argv)`.
fn insert_args(aspace: &AddressSpace, args: &[Vec<u8>]) -> KResult<(usize, usize)> {
    let page = aspace.unused_va(0, PAGE_SIZE)?;
    aspace.map_anon(page, PAGE_SIZE, RegionPerms::USER | RegionPerms::WRITE, false, true)?;

    let mut off = 0;
    let mut ptrs = Vec::with_capacity(args.len() + 1);
    for arg in args {
        let need = arg.len() + 1;
        if off + need > PAGE_SIZE {
            return Err(Errno::ENOSPC);
        }
        aspace.copy_out(page + off, arg)?;
        aspace.copy_out(page + off + arg.len(), &[0])?;
        ptrs.push(page + off);
        off += need;
    }
    ptrs.push(0);

    let array = off.next_multiple_of(8);
    if array + ptrs.len() * 8 > PAGE_SIZE {
        return Err(Errno::ENOSPC);
    }
    for (i, p) in ptrs.iter().enumerate() {
        aspace.write_u64(page + array + i * 8, *p as u64)?;
    }
    Ok((args.len(), page + array))
}

/// Maps the stack below a guard page and returns its top.
fn map_stack(aspace: &AddressSpace) -> KResult<usize> {
    let len = (EXEC_STACK_PAGES + 1) * PAGE_SIZE;
    let guard = aspace.unused_va(EXEC_STACK_HINT, len)?;
    let base = guard + PAGE_SIZE;
    let top = guard + len;
    aspace.map_anon(
        base,
        EXEC_STACK_PAGES * PAGE_SIZE,
        RegionPerms::USER | RegionPerms::WRITE,
        false,
        false,
    )?;
    for i in 1..=EXEC_STACK_EAGER {
        aspace.fault(top - i * PAGE_SIZE, true)?;
    }
    Ok(top)
}

/// Builds a complete image from `file` and `args` in the empty `aspace`.
///
/// # Errors
///
/// [`Errno::EPERM`] for a header that is not a loadable ELF image,
/// [`Errno::ENOSPC`] if the arguments do not fit their page, plus the
/// loader's errors.
pub fn build_image(
    aspace: &AddressSpace,
    file: &dyn FdOps,
    args: &[Vec<u8>],
    ps_per_cycle: u64,
) -> KResult<ImageStart> {
    let mut hdr = KernelBuf::with_len(EXEC_HEADER_SIZE);
    file.pread(&mut hdr, 0)?;
    let elf = ElfFile::parse(hdr.filled()).map_err(|_| Errno::EPERM)?;
    let cache = file.mmap_backing()?;
    let image = elf::load(aspace, &elf, &cache)?;

    let top = map_stack(aspace)?;
    let (argc, argv) = insert_args(aspace, args)?;

    let sp = top - TRAILER_WORDS * 8;
    let (fresh, size, t0) = image
        .tls
        .map_or((0, 0, 0), |tls| (tls.fresh, tls.size, tls.t0));
    let trailer = [fresh as u64, size as u64, t0 as u64, ps_per_cycle];
    for (i, word) in trailer.iter().enumerate() {
        aspace.write_u64(sp + i * 8, *word)?;
    }

    Ok(ImageStart {
        entry: image.entry,
        sp,
        argc,
        argv,
        fsbase: image.tls.map_or(0, |tls| tls.thread_pointer()),
    })
}

/// Replaces the calling thread's process image with the program at `path`.
///
/// # Errors
///
/// [`Errno::EBUSY`] if the process has other threads, the file service's
/// error opening `path`, or any [`build_image`] error. The old image is
/// untouched on error.
pub fn exec(
    fs: &dyn FileService,
    thread: &Arc<Thread>,
    path: String,
    args: &[Vec<u8>],
    ps_per_cycle: u64,
) -> KResult<()> {
    let proc = thread.process();
    if proc.thread_count() > 1 {
        return Err(Errno::EBUSY);
    }

    let file = fs.open(&path, OpenFlags::empty(), 0, &proc.cwd(), 0, 0)?;
    let aspace = Arc::new(proc.aspace().new_sibling());
    let built = build_image(&aspace, file.as_ref(), args, ps_per_cycle);
    if let Err(e) = file.close() {
        kdebug!("exec {}: closing image failed: {}", path, e);
    }
    let start = match built {
        Ok(start) => start,
        Err(e) => {
            kdebug!("exec {}: failed: {}", path, e);
            return Err(e);
        }
    };

    let old = proc.replace_aspace(aspace);
    drop(old);
    close_all(proc.fds().drain_cloexec());
    thread.update_frame(|tf| {
        *tf = TrapFrame::new();
        tf[Reg::Rsp] = start.sp;
        tf[Reg::Rip] = start.entry;
        tf[Reg::Rflags] = RFLAGS_IF;
        tf[Reg::Cs] = USER_CS;
        tf[Reg::Ss] = USER_SS;
        tf[Reg::Rdi] = start.argc;
        tf[Reg::Rsi] = start.argv;
        tf[Reg::Rdx] = start.sp;
        tf[Reg::FsBase] = start.fsbase;
    });
    proc.set_mmap_cursor(USERMIN);
    kdebug!("proc {}: exec {}", proc.pid(), path);
    proc.set_name(path);
    Ok(())
}
