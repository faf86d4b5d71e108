//! Hosted test rig: an in-memory file service, an ELF image builder and a
//! [`Rig`] that wires a [`Kernel`] to the cooperative executor.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::pin;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::task::{Context, Poll, Waker};

use meson_core::sync::SpinLock;
use meson_mm::{
    AddressSpace, Frame, HeapPageProvider, NoShootdown, PAGE_SIZE, PageCache, PageProvider,
    RegionPerms, VmError,
};
use meson_syscall::{F_GETFL, F_SETFL, I_DEV, I_DIR, I_FILE, Stat, mkdev};

use crate::config::KernelConfig;
use crate::errno::{Errno, KResult};
use crate::fd::{FdFuture, FdOps, FdTable, IoCtx};
use crate::fs::{Cwd, FileService, FsError, OpenFlags};
use crate::proc::{Process, ProcessInit, Thread};
use crate::sched::{Executor, JoinHandle};
use crate::uio::UserIo;
use crate::{Kernel, SyscallOutcome};

// ── MemFs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    Dir,
    Dev(u64),
}

/// One inode. File bytes live in `data`; pages handed to mappings are
/// cached and kept in step with writes.
pub struct Node {
    ino: u64,
    kind: Kind,
    data: SpinLock<Vec<u8>>,
    pages: SpinLock<BTreeMap<usize, Frame>>,
    provider: Arc<HeapPageProvider>,
}

impl Node {
    fn stat(&self) -> Stat {
        let (ty, rdev) = match self.kind {
            Kind::File => (I_FILE, 0),
            Kind::Dir => (I_DIR, 0),
            Kind::Dev(rdev) => (I_DEV, rdev),
        };
        let size = self.data.lock().len() as u64;
        Stat {
            ino: self.ino,
            mode: ty << 16,
            size,
            rdev,
            blocks: size.div_ceil(512),
            ..Stat::default()
        }
    }

    fn read_at(&self, dst: &mut dyn UserIo, off: usize) -> KResult<usize> {
        let data = self.data.lock();
        if off >= data.len() {
            return Ok(0);
        }
        let end = data.len().min(off + dst.remain());
        dst.write_from(&data[off..end])
    }

    fn write_at(&self, src: &mut dyn UserIo, off: usize) -> KResult<usize> {
        let mut buf = vec![0u8; src.remain()];
        let n = src.read_into(&mut buf)?;
        let mut data = self.data.lock();
        if data.len() < off + n {
            data.resize(off + n, 0);
        }
        data[off..off + n].copy_from_slice(&buf[..n]);
        drop(data);
        self.refresh(off, off + n);
        Ok(n)
    }

    fn set_len(&self, len: usize) {
        let old = {
            let mut data = self.data.lock();
            let old = data.len();
            data.resize(len, 0);
            old
        };
        self.refresh(len.min(old), len.max(old));
    }

    /// Copies `[start, end)` of the file into any cached pages covering it.
    fn refresh(&self, start: usize, end: usize) {
        let data = self.data.lock();
        for (&base, frame) in self.pages.lock().iter() {
            if base + PAGE_SIZE <= start || base >= end {
                continue;
            }
            let mut page = [0u8; PAGE_SIZE];
            let avail = data.len().saturating_sub(base).min(PAGE_SIZE);
            page[..avail].copy_from_slice(&data[base..base + avail]);
            frame.write(0, &page);
        }
    }
}

impl PageCache for Node {
    fn page(&self, offset: usize) -> Result<Frame, VmError> {
        if let Some(frame) = self.pages.lock().get(&offset) {
            return Ok(frame.clone());
        }
        let frame = self.provider.alloc_zeroed().ok_or(VmError::NoMemory)?;
        {
            let data = self.data.lock();
            if offset < data.len() {
                let end = data.len().min(offset + PAGE_SIZE);
                frame.write(0, &data[offset..end]);
            }
        }
        self.pages.lock().insert(offset, frame.clone());
        Ok(frame)
    }
}

/// An open file, directory or device node.
pub struct MemHandle {
    node: Arc<Node>,
    pos: AtomicUsize,
    flags: AtomicUsize,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl FdOps for MemHandle {
    fn close(&self) -> KResult<()> {
        self.opens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Errno::EBADF)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn reopen(&self) -> KResult<()> {
        self.opens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .map_err(|_| Errno::EBADF)?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn fstat(&self) -> KResult<Stat> {
        Ok(self.node.stat())
    }

    fn read<'a>(&'a self, _cx: &'a IoCtx, dst: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move {
            if self.node.kind != Kind::File {
                return Err(Errno::EISDIR);
            }
            let pos = self.pos.load(Ordering::Acquire);
            let n = self.node.read_at(dst, pos)?;
            self.pos.store(pos + n, Ordering::Release);
            Ok(n)
        })
    }

    fn write<'a>(&'a self, _cx: &'a IoCtx, src: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move {
            if self.node.kind != Kind::File {
                return Err(Errno::EISDIR);
            }
            let pos = if self.flags.load(Ordering::Acquire) & OpenFlags::APPEND.bits() != 0 {
                self.node.data.lock().len()
            } else {
                self.pos.load(Ordering::Acquire)
            };
            let n = self.node.write_at(src, pos)?;
            self.pos.store(pos + n, Ordering::Release);
            Ok(n)
        })
    }

    fn pread(&self, dst: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        self.node.read_at(dst, offset)
    }

    fn pwrite(&self, src: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        self.node.write_at(src, offset)
    }

    fn lseek(&self, offset: isize, whence: usize) -> KResult<usize> {
        let base = match whence {
            0 => 0,
            1 => self.pos.load(Ordering::Acquire),
            2 => self.node.data.lock().len(),
            _ => return Err(Errno::EINVAL),
        };
        let pos = base.checked_add_signed(offset).ok_or(Errno::EINVAL)?;
        self.pos.store(pos, Ordering::Release);
        Ok(pos)
    }

    fn truncate(&self, len: usize) -> KResult<()> {
        if self.node.kind != Kind::File {
            return Err(Errno::EISDIR);
        }
        self.node.set_len(len);
        Ok(())
    }

    fn mmap_backing(&self) -> KResult<Arc<dyn PageCache>> {
        match self.node.kind {
            Kind::File => Ok(self.node.clone()),
            _ => Err(Errno::ENODEV),
        }
    }

    fn fcntl(&self, cmd: usize, arg: usize) -> KResult<usize> {
        match cmd {
            F_GETFL => Ok(self.flags.load(Ordering::Acquire)),
            F_SETFL => {
                self.flags.store(arg, Ordering::Release);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }
}

/// A flat in-memory filesystem keyed by canonical path.
pub struct MemFs {
    nodes: SpinLock<BTreeMap<String, Arc<Node>>>,
    next_ino: AtomicU64,
    live: Arc<AtomicUsize>,
    syncs: AtomicUsize,
    provider: Arc<HeapPageProvider>,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl MemFs {
    /// An empty filesystem holding only `/`.
    pub fn new() -> Self {
        let fs = Self {
            nodes: SpinLock::new(BTreeMap::new()),
            next_ino: AtomicU64::new(1),
            live: Arc::new(AtomicUsize::new(0)),
            syncs: AtomicUsize::new(0),
            provider: Arc::new(HeapPageProvider::new(1 << 14)),
        };
        let root = fs.node(Kind::Dir, Vec::new());
        fs.nodes.lock().insert(String::from("/"), root);
        fs
    }

    fn node(&self, kind: Kind, data: Vec<u8>) -> Arc<Node> {
        Arc::new(Node {
            ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
            kind,
            data: SpinLock::new(data),
            pages: SpinLock::new(BTreeMap::new()),
            provider: self.provider.clone(),
        })
    }

    /// Creates (or replaces) a regular file.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let node = self.node(Kind::File, data.to_vec());
        self.nodes.lock().insert(String::from(path), node);
    }

    /// The bytes of a regular file.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.lock().get(path).map(|n| n.data.lock().clone())
    }

    /// Whether `path` exists.
    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(path)
    }

    /// Opens not yet closed, across all handles.
    pub fn open_handles(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of `sync` calls seen.
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::Acquire)
    }

    fn lookup(&self, path: &str) -> Result<Arc<Node>, FsError> {
        self.nodes.lock().get(path).cloned().ok_or(FsError::NotFound)
    }

    fn check_parent(&self, path: &str) -> Result<(), FsError> {
        match self.lookup(parent(path))?.kind {
            Kind::Dir => Ok(()),
            _ => Err(FsError::NotADirectory),
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileService for MemFs {
    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        _mode: usize,
        _cwd: &str,
        major: usize,
        minor: usize,
    ) -> Result<Arc<dyn FdOps>, FsError> {
        let node = match self.lookup(path) {
            Ok(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                return Err(FsError::AlreadyExists);
            }
            Ok(node) => node,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                self.check_parent(path)?;
                let kind = if major == 0 {
                    Kind::File
                } else {
                    Kind::Dev(mkdev(major, minor).ok_or(FsError::InvalidArgument)?)
                };
                let node = self.node(kind, Vec::new());
                self.nodes.lock().insert(String::from(path), node.clone());
                node
            }
            Err(e) => return Err(e),
        };
        match node.kind {
            Kind::Dir if flags.writable() => return Err(FsError::IsADirectory),
            Kind::File | Kind::Dev(_) if flags.contains(OpenFlags::DIRECTORY) => {
                return Err(FsError::NotADirectory);
            }
            Kind::File if flags.contains(OpenFlags::TRUNC) => node.set_len(0),
            _ => {}
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemHandle {
            node,
            pos: AtomicUsize::new(0),
            flags: AtomicUsize::new(flags.bits()),
            opens: AtomicUsize::new(1),
            live: self.live.clone(),
        }))
    }

    fn stat(&self, path: &str, _cwd: &str) -> Result<Stat, FsError> {
        Ok(self.lookup(path)?.stat())
    }

    fn rename(&self, old: &str, new: &str, _cwd: &str) -> Result<(), FsError> {
        self.check_parent(new)?;
        let mut nodes = self.nodes.lock();
        let node = nodes.remove(old).ok_or(FsError::NotFound)?;
        nodes.insert(String::from(new), node);
        Ok(())
    }

    fn link(&self, old: &str, new: &str, _cwd: &str) -> Result<(), FsError> {
        let node = self.lookup(old)?;
        if node.kind == Kind::Dir {
            return Err(FsError::PermissionDenied);
        }
        self.check_parent(new)?;
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(new) {
            return Err(FsError::AlreadyExists);
        }
        nodes.insert(String::from(new), node);
        Ok(())
    }

    fn unlink(&self, path: &str, _cwd: &str, dir: bool) -> Result<(), FsError> {
        let node = self.lookup(path)?;
        match (node.kind, dir) {
            (Kind::Dir, false) => return Err(FsError::IsADirectory),
            (Kind::File | Kind::Dev(_), true) => return Err(FsError::NotADirectory),
            _ => {}
        }
        let mut nodes = self.nodes.lock();
        if dir {
            let prefix = alloc::format!("{path}/");
            if nodes.keys().any(|k| k.starts_with(&prefix)) {
                return Err(FsError::NotEmpty);
            }
        }
        nodes.remove(path);
        Ok(())
    }

    fn mkdir(&self, path: &str, _mode: usize, _cwd: &str) -> Result<(), FsError> {
        if self.exists(path) {
            return Err(FsError::AlreadyExists);
        }
        self.check_parent(path)?;
        let node = self.node(Kind::Dir, Vec::new());
        self.nodes.lock().insert(String::from(path), node);
        Ok(())
    }

    fn sync(&self) -> Result<(), FsError> {
        self.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

// ── ELF images ──────────────────────────────────────────────────────

const PT_LOAD: u32 = 1;
const PT_TLS: u32 = 7;
const PF_R: u32 = 4;
const PF_W: u32 = 2;
const PF_X: u32 = 1;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// One `PT_LOAD` segment of a test image.
pub struct Segment {
    /// Load address.
    pub vaddr: u64,
    /// File bytes.
    pub data: Vec<u8>,
    /// Size in memory, at least `data.len()`.
    pub memsz: u64,
    /// Mapped writable.
    pub writable: bool,
}

impl Segment {
    /// A read-only text segment.
    pub fn text(vaddr: u64, data: &[u8]) -> Self {
        Self {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u64,
            writable: false,
        }
    }

    /// A writable data segment followed by `bss` zero bytes.
    pub fn data(vaddr: u64, data: &[u8], bss: u64) -> Self {
        Self {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u64 + bss,
            writable: true,
        }
    }
}

/// The `PT_TLS` template: `filesz` initialized bytes at `vaddr` (inside a
/// load segment) and `memsz` in total.
pub struct Tls {
    /// Template address.
    pub vaddr: u64,
    /// Initialized bytes.
    pub filesz: u64,
    /// Total block size.
    pub memsz: u64,
}

fn put_phdr(out: &mut [u8], ty: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    out[0..4].copy_from_slice(&ty.to_le_bytes());
    out[4..8].copy_from_slice(&flags.to_le_bytes());
    out[8..16].copy_from_slice(&offset.to_le_bytes());
    out[16..24].copy_from_slice(&vaddr.to_le_bytes());
    out[24..32].copy_from_slice(&vaddr.to_le_bytes());
    out[32..40].copy_from_slice(&filesz.to_le_bytes());
    out[40..48].copy_from_slice(&memsz.to_le_bytes());
}

/// Builds an x86-64 `ET_EXEC` image. Segment `i` sits at file page `i + 1`,
/// at the same in-page offset as its address.
pub fn build_elf(entry: u64, segments: &[Segment], tls: Option<Tls>) -> Vec<u8> {
    let phnum = segments.len() + usize::from(tls.is_some());
    let mut out = vec![0u8; (segments.len() + 1) * PAGE_SIZE];
    out[0..4].copy_from_slice(b"\x7fELF");
    out[4] = 2;
    out[5] = 1;
    out[6] = 1;
    out[16..18].copy_from_slice(&2u16.to_le_bytes());
    out[18..20].copy_from_slice(&62u16.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&entry.to_le_bytes());
    out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    out[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

    for (i, seg) in segments.iter().enumerate() {
        let offset = (i + 1) * PAGE_SIZE + (seg.vaddr as usize % PAGE_SIZE);
        if out.len() < offset + seg.data.len() {
            out.resize(offset + seg.data.len(), 0);
        }
        out[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
        let flags = PF_R | if seg.writable { PF_W } else { PF_X };
        let at = EHDR_SIZE + i * PHDR_SIZE;
        put_phdr(
            &mut out[at..at + PHDR_SIZE],
            PT_LOAD,
            flags,
            offset as u64,
            seg.vaddr,
            seg.data.len() as u64,
            seg.memsz,
        );
    }
    if let Some(tls) = tls {
        let at = EHDR_SIZE + segments.len() * PHDR_SIZE;
        put_phdr(
            &mut out[at..at + PHDR_SIZE],
            PT_TLS,
            PF_R,
            0,
            tls.vaddr,
            tls.filesz,
            tls.memsz,
        );
    }
    out
}

/// Address of the text segment of [`tiny_elf`].
pub const TINY_ENTRY: u64 = 0x40_1000;

/// A one-page program that is never run.
pub fn tiny_elf() -> Vec<u8> {
    build_elf(TINY_ENTRY, &[Segment::text(TINY_ENTRY, &[0xf4; 16])], None)
}

// ── Rig ─────────────────────────────────────────────────────────────

/// A kernel wired to an in-memory filesystem and the cooperative
/// executor, plus helpers to drive syscalls from tests.
pub struct Rig {
    pub kernel: Arc<Kernel>,
    pub exec: Arc<Executor>,
    pub fs: Arc<MemFs>,
    pub provider: Arc<HeapPageProvider>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(f: impl FnOnce(&mut KernelConfig)) -> Self {
        let mut config = KernelConfig::default();
        f(&mut config);
        let provider = Arc::new(HeapPageProvider::new(config.page_limit));
        let fs = Arc::new(MemFs::new());
        let exec = Arc::new(Executor::new());
        let kernel = Arc::new(Kernel::new(
            config,
            fs.clone(),
            exec.clone(),
            provider.clone(),
            Arc::new(NoShootdown),
        ));
        Self {
            kernel,
            exec,
            fs,
            provider,
        }
    }

    /// Registers pid 1 with an empty image.
    pub fn spawn_init(&self) -> Arc<Thread> {
        self.kernel.create_process(None, "init").unwrap()
    }

    /// Registers a child of `parent` with an empty image.
    pub fn spawn_child(&self, parent: &Arc<Process>) -> Arc<Thread> {
        self.kernel.create_process(Some(parent), "child").unwrap()
    }

    pub fn process_init(&self, name: &str) -> ProcessInit {
        let config = self.kernel.config();
        ProcessInit {
            name: String::from(name),
            aspace: Arc::new(AddressSpace::new(
                self.provider.clone(),
                Arc::new(NoShootdown),
                meson_mm::VmLimits {
                    max_pages: config.ulimit.pages,
                    max_regions: config.ulimit.regions,
                },
            )),
            fds: Arc::new(FdTable::new()),
            cwd: Cwd::root(),
            ulimit: config.ulimit,
        }
    }

    /// Polls `fut` to completion, running executor tasks in between.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        let mut cx = Context::from_waker(Waker::noop());
        for _ in 0..10_000 {
            if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
                return v;
            }
            self.exec.run_until_stalled();
        }
        panic!("future stalled");
    }

    /// Runs queued tasks until none is ready.
    pub fn settle(&self) {
        self.exec.run_until_stalled();
    }

    /// Maps `pages` fresh writable pages in `thread`'s process.
    pub fn map(&self, thread: &Arc<Thread>, pages: usize) -> usize {
        let aspace = thread.process().aspace();
        let len = pages * PAGE_SIZE;
        let va = aspace.unused_va(0x1000_0000, len).unwrap();
        aspace
            .map_anon(va, len, RegionPerms::USER | RegionPerms::WRITE, false, true)
            .unwrap();
        va
    }

    pub fn put(&self, thread: &Arc<Thread>, va: usize, bytes: &[u8]) {
        thread.process().aspace().copy_out(va, bytes).unwrap();
    }

    pub fn get(&self, thread: &Arc<Thread>, va: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        thread.process().aspace().copy_in(va, &mut buf).unwrap();
        buf
    }

    pub fn get_u32(&self, thread: &Arc<Thread>, va: usize) -> u32 {
        thread.process().aspace().read_u32(va).unwrap()
    }

    pub fn get_u64(&self, thread: &Arc<Thread>, va: usize) -> u64 {
        thread.process().aspace().read_u64(va).unwrap()
    }

    /// Copies `s` and a NUL into a fresh page and returns its address.
    pub fn cstr(&self, thread: &Arc<Thread>, s: &str) -> usize {
        let va = self.map(thread, 1);
        self.put(thread, va, s.as_bytes());
        self.put(thread, va + s.len(), &[0]);
        va
    }

    /// Runs one syscall to completion and returns its outcome.
    pub fn outcome(&self, thread: &Arc<Thread>, nr: usize, args: [usize; 5]) -> SyscallOutcome {
        thread.update_frame(|tf| tf.set_syscall(nr, args));
        self.block_on(self.kernel.syscall(thread))
    }

    /// Runs one syscall that must return.
    pub fn call(&self, thread: &Arc<Thread>, nr: usize, args: [usize; 5]) -> isize {
        match self.outcome(thread, nr, args) {
            SyscallOutcome::Returned(ret) => ret,
            SyscallOutcome::ThreadExited => panic!("syscall {nr} ended the thread"),
        }
    }

    /// Starts a syscall as an executor task, for calls that block.
    pub fn spawn_call(
        &self,
        thread: &Arc<Thread>,
        nr: usize,
        args: [usize; 5],
    ) -> JoinHandle<SyscallOutcome> {
        thread.update_frame(|tf| tf.set_syscall(nr, args));
        let kernel = self.kernel.clone();
        let thread = thread.clone();
        let handle = self
            .exec
            .spawn_with_handle(async move { kernel.syscall(&thread).await });
        self.settle();
        handle
    }

    /// Puts a program at `path` and makes a process of it; the thread is
    /// the one handed to the scheduler.
    pub fn boot(&self, path: &str, image: &[u8]) -> Arc<Thread> {
        self.fs.add_file(path, image);
        let thread = self.kernel.spawn_init(path, &[]).unwrap();
        self.exec.take_started();
        thread
    }

    /// Opens `path` in `thread`'s process and returns the descriptor.
    pub fn open(&self, thread: &Arc<Thread>, path: &str, flags: usize) -> usize {
        let va = self.cstr(thread, path);
        let fd = self.call(thread, meson_syscall::SYS_OPEN, [va, flags, 0, 0, 0]);
        usize::try_from(fd).unwrap_or_else(|_| panic!("open {path}: {fd}"))
    }
}

/// The raw return of a failed call.
pub fn err(e: Errno) -> isize {
    e.as_return()
}
