//! Descriptors and the per-process descriptor table.
//!
//! Every open object is an `Arc<dyn FdOps>`. The object counts its own
//! opens: [`FdOps::reopen`] on dup and fork, [`FdOps::close`] when a slot
//! lets go. Operations an object does not support fall through to default
//! methods returning the conventional errno.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;

use meson_core::kwarn;
use meson_core::sync::SpinLock;
use meson_mm::PageCache;
use meson_syscall::{SHUT_RD, SHUT_WR, Stat};

use crate::admission::Admission;
use crate::errno::{Errno, KResult};
use crate::poll::{PollMsg, Ready};
use crate::sched::KillSignal;
use crate::uio::UserIo;

/// Boxed future returned by the blocking [`FdOps`] methods.
pub type FdFuture<'a, T> = Pin<Box<dyn Future<Output = KResult<T>> + Send + 'a>>;

bitflags::bitflags! {
    /// Per-slot descriptor permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdPerms: u8 {
        /// The slot may be read.
        const READ = 1 << 0;
        /// The slot may be written.
        const WRITE = 1 << 1;
        /// Closed by exec.
        const CLOEXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Directions named by `shutdown`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShutdownHow: usize {
        /// Stop receiving.
        const READ = SHUT_RD;
        /// Stop sending.
        const WRITE = SHUT_WR;
    }
}

/// What a blocking descriptor operation needs from its caller.
pub struct IoCtx {
    /// The caller's kill signal; every wait races it.
    pub kill: Arc<KillSignal>,
    /// The heap budget, for operations that re-admit while they run.
    pub admission: Arc<Admission>,
    /// The caller's descriptor table, for passing descriptors.
    pub fds: Arc<FdTable>,
    /// The caller's `RLIMIT_NOFILE`.
    pub nofile: usize,
    /// The caller's working directory.
    pub cwd: String,
}

/// Result of [`FdOps::recvmsg`].
#[derive(Debug, Default)]
pub struct RecvInfo {
    /// Payload bytes received.
    pub bytes: usize,
    /// Source address, when the caller asked for one and the socket has it.
    pub addr: Option<Vec<u8>>,
    /// Control message bytes.
    pub control: Vec<u8>,
}

/// Operations on an open object.
pub trait FdOps: Send + Sync {
    /// Drops one open. The last close releases the object.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if the object is already released.
    fn close(&self) -> KResult<()>;

    /// Adds one open (dup, fork, descriptor passing).
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if the object is already released.
    fn reopen(&self) -> KResult<()>;

    /// Returns the object's metadata.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] unless overridden.
    fn fstat(&self) -> KResult<Stat> {
        Err(Errno::EINVAL)
    }

    /// Reads into `dst` at the current position.
    fn read<'a>(&'a self, cx: &'a IoCtx, dst: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        let _ = (cx, dst);
        Box::pin(async { Err(Errno::EBADF) })
    }

    /// Writes from `src` at the current position.
    fn write<'a>(&'a self, cx: &'a IoCtx, src: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        let _ = (cx, src);
        Box::pin(async { Err(Errno::EBADF) })
    }

    /// Reads at `offset` without moving the position.
    ///
    /// # Errors
    ///
    /// [`Errno::ESPIPE`] unless overridden.
    fn pread(&self, dst: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        let _ = (dst, offset);
        Err(Errno::ESPIPE)
    }

    /// Writes at `offset` without moving the position.
    ///
    /// # Errors
    ///
    /// [`Errno::ESPIPE`] unless overridden.
    fn pwrite(&self, src: &mut dyn UserIo, offset: usize) -> KResult<usize> {
        let _ = (src, offset);
        Err(Errno::ESPIPE)
    }

    /// Moves the position.
    ///
    /// # Errors
    ///
    /// [`Errno::ESPIPE`] unless overridden.
    fn lseek(&self, offset: isize, whence: usize) -> KResult<usize> {
        let _ = (offset, whence);
        Err(Errno::ESPIPE)
    }

    /// Sets the length.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] unless overridden.
    fn truncate(&self, len: usize) -> KResult<()> {
        let _ = len;
        Err(Errno::EINVAL)
    }

    /// The page cache behind file mappings and exec.
    ///
    /// # Errors
    ///
    /// [`Errno::ENODEV`] unless overridden.
    fn mmap_backing(&self) -> KResult<Arc<dyn PageCache>> {
        Err(Errno::ENODEV)
    }

    /// Reports readiness for `pm.events`, registering `pm` if nothing is
    /// ready and `pm.dowait` is set.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if the poller list is full.
    fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        Ok(pm.events & (Ready::READ | Ready::WRITE))
    }

    /// Descriptor-specific `fcntl` commands (`F_GETFL`, `F_SETFL`).
    ///
    /// # Errors
    ///
    /// [`Errno::ENOSYS`] unless overridden.
    fn fcntl(&self, cmd: usize, arg: usize) -> KResult<usize> {
        let _ = (cmd, arg);
        Err(Errno::ENOSYS)
    }

    /// Binds a socket to the path in `addr`.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOTSOCK`] unless overridden.
    fn bind(&self, cx: &IoCtx, addr: &[u8]) -> KResult<()> {
        let _ = (cx, addr);
        Err(Errno::ENOTSOCK)
    }

    /// Starts accepting connections.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOTSOCK`] unless overridden.
    fn listen(&self, cx: &IoCtx, backlog: isize) -> KResult<()> {
        let _ = (cx, backlog);
        Err(Errno::ENOTSOCK)
    }

    /// Connects to the path in `addr`.
    fn connect<'a>(&'a self, cx: &'a IoCtx, addr: &'a [u8]) -> FdFuture<'a, ()> {
        let _ = (cx, addr);
        Box::pin(async { Err(Errno::ENOTSOCK) })
    }

    /// Accepts one connection, returning the connected object and the
    /// peer's address.
    fn accept<'a>(&'a self, cx: &'a IoCtx) -> FdFuture<'a, (Arc<dyn FdOps>, Vec<u8>)> {
        let _ = cx;
        Box::pin(async { Err(Errno::ENOTSOCK) })
    }

    /// Sends `src` to `addr` (empty for connected sockets) with optional
    /// control bytes.
    fn sendmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        src: &'a mut dyn UserIo,
        addr: &'a [u8],
        control: &'a [u8],
    ) -> FdFuture<'a, usize> {
        let _ = (cx, src, addr, control);
        Box::pin(async { Err(Errno::ENOTSOCK) })
    }

    /// Receives into `dst`. `want_addr` asks for the source address and
    /// `control_cap` bounds the control bytes returned.
    fn recvmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        dst: &'a mut dyn UserIo,
        want_addr: bool,
        control_cap: usize,
    ) -> FdFuture<'a, RecvInfo> {
        let _ = (cx, dst, want_addr, control_cap);
        Box::pin(async { Err(Errno::ENOTSOCK) })
    }

    /// Reads a socket option, at most `cap` bytes.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOTSOCK`] unless overridden.
    fn getsockopt(&self, level: usize, opt: usize, cap: usize) -> KResult<Vec<u8>> {
        let _ = (level, opt, cap);
        Err(Errno::ENOTSOCK)
    }

    /// Sets a socket option.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOTSOCK`] unless overridden.
    fn setsockopt(&self, level: usize, opt: usize, val: &[u8]) -> KResult<()> {
        let _ = (level, opt, val);
        Err(Errno::ENOTSOCK)
    }

    /// Shuts down one or both directions.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOTSOCK`] unless overridden.
    fn shutdown(&self, how: ShutdownHow) -> KResult<()> {
        let _ = how;
        Err(Errno::ENOTSOCK)
    }
}

/// One descriptor slot: an object plus this slot's permissions.
///
/// Cloning an `Fd` borrows the object for the duration of a call; only
/// [`Fd::copy`] counts as a new open.
#[derive(Clone)]
pub struct Fd {
    /// The open object.
    pub ops: Arc<dyn FdOps>,
    /// Slot permissions.
    pub perms: FdPerms,
}

impl Fd {
    /// Wraps an already-open object.
    pub fn new(ops: Arc<dyn FdOps>, perms: FdPerms) -> Self {
        Self { ops, perms }
    }

    /// A second open of the same object.
    ///
    /// # Errors
    ///
    /// As [`FdOps::reopen`].
    pub fn copy(&self) -> KResult<Self> {
        self.ops.reopen()?;
        Ok(self.clone())
    }

    /// Gives this slot's open back to the object.
    ///
    /// # Errors
    ///
    /// As [`FdOps::close`].
    pub fn close(self) -> KResult<()> {
        self.ops.close()
    }
}

/// Closes every descriptor in `fds`, logging failures.
pub fn close_all(fds: Vec<Fd>) {
    for fd in fds {
        if let Err(e) = fd.close() {
            kwarn!("fd: close during teardown failed: {}", e);
        }
    }
}

/// A process's descriptor table.
pub struct FdTable {
    slots: SpinLock<Vec<Option<Fd>>>,
}

impl FdTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::named("fd_table", Vec::new()),
        }
    }

    /// Installs `fd` in the lowest free slot below `limit`.
    ///
    /// # Errors
    ///
    /// [`Errno::EMFILE`] if every slot below `limit` is taken; `fd` is
    /// closed then.
    pub fn insert(&self, fd: Fd, limit: usize) -> KResult<usize> {
        let mut slots = self.slots.lock();
        if let Some(n) = slots.iter().take(limit).position(Option::is_none) {
            slots[n] = Some(fd);
            return Ok(n);
        }
        if slots.len() >= limit {
            drop(slots);
            close_all(alloc::vec![fd]);
            return Err(Errno::EMFILE);
        }
        slots.push(Some(fd));
        Ok(slots.len() - 1)
    }

    /// Installs two descriptors, or neither.
    ///
    /// # Errors
    ///
    /// [`Errno::EMFILE`] if two slots are not free; both are closed then.
    pub fn insert2(&self, a: Fd, b: Fd, limit: usize) -> KResult<(usize, usize)> {
        let na = match self.insert(a, limit) {
            Ok(na) => na,
            Err(e) => {
                close_all(alloc::vec![b]);
                return Err(e);
            }
        };
        match self.insert(b, limit) {
            Ok(nb) => Ok((na, nb)),
            Err(e) => {
                let a = self.slots.lock()[na].take();
                close_all(a.into_iter().collect());
                Err(e)
            }
        }
    }

    /// Returns the descriptor in slot `n`.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if the slot is empty.
    pub fn get(&self, n: usize) -> KResult<Fd> {
        self.slots
            .lock()
            .get(n)
            .and_then(Clone::clone)
            .ok_or(Errno::EBADF)
    }

    /// Empties slot `n` and returns what it held, still open.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if the slot is empty.
    pub fn take(&self, n: usize) -> KResult<Fd> {
        self.slots
            .lock()
            .get_mut(n)
            .and_then(Option::take)
            .ok_or(Errno::EBADF)
    }

    /// Puts `fd` in slot `n`, returning the previous occupant, still open.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if `n` is not below `limit`.
    pub fn replace(&self, n: usize, fd: Fd, limit: usize) -> KResult<Option<Fd>> {
        if n >= limit {
            return Err(Errno::EBADF);
        }
        let mut slots = self.slots.lock();
        if slots.len() <= n {
            slots.resize_with(n + 1, || None);
        }
        Ok(slots[n].replace(fd))
    }

    /// Applies `f` to slot `n`'s permissions and returns the new value.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] if the slot is empty.
    pub fn update_perms(&self, n: usize, f: impl FnOnce(&mut FdPerms)) -> KResult<FdPerms> {
        let mut slots = self.slots.lock();
        let fd = slots.get_mut(n).and_then(Option::as_mut).ok_or(Errno::EBADF)?;
        f(&mut fd.perms);
        Ok(fd.perms)
    }

    /// Builds a child table in which every descriptor is reopened.
    ///
    /// # Errors
    ///
    /// The first reopen failure. Descriptors reopened before it are closed
    /// again.
    pub fn fork_copy(&self) -> KResult<Self> {
        let parent: Vec<Option<Fd>> = self.slots.lock().clone();
        let mut child = Vec::with_capacity(parent.len());
        for slot in parent {
            match slot.map(|fd| fd.copy()).transpose() {
                Ok(copy) => child.push(copy),
                Err(e) => {
                    close_all(child.into_iter().flatten().collect());
                    return Err(e);
                }
            }
        }
        Ok(Self {
            slots: SpinLock::named("fd_table", child),
        })
    }

    /// Empties every close-on-exec slot and returns the descriptors.
    pub fn drain_cloexec(&self) -> Vec<Fd> {
        let mut slots = self.slots.lock();
        let mut out = Vec::new();
        for slot in slots.iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|fd| fd.perms.contains(FdPerms::CLOEXEC))
            {
                out.extend(slot.take());
            }
        }
        out
    }

    /// Empties every slot and returns the descriptors.
    pub fn drain_all(&self) -> Vec<Fd> {
        self.slots.lock().drain(..).flatten().collect()
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        opens: AtomicUsize,
    }

    impl FdOps for Counted {
        fn close(&self) -> KResult<()> {
            self.opens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| Errno::EBADF)
        }

        fn reopen(&self) -> KResult<()> {
            self.opens.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn counted() -> (Arc<Counted>, Fd) {
        let obj = Arc::new(Counted {
            opens: AtomicUsize::new(1),
        });
        let fd = Fd::new(obj.clone(), FdPerms::READ | FdPerms::WRITE);
        (obj, fd)
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let t = FdTable::new();
        for _ in 0..3 {
            t.insert(counted().1, 8).unwrap();
        }
        t.take(1).unwrap().close().unwrap();
        assert_eq!(t.insert(counted().1, 8), Ok(1));
        assert_eq!(t.insert(counted().1, 8), Ok(3));
    }

    #[test]
    fn limit_gives_emfile() {
        let t = FdTable::new();
        t.insert(counted().1, 1).unwrap();
        let (obj, fd) = counted();
        assert_eq!(t.insert(fd, 1), Err(Errno::EMFILE));
        assert_eq!(obj.opens.load(Ordering::Acquire), 0);
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn fork_copy_reopens_every_descriptor() {
        let t = FdTable::new();
        let (obj, fd) = counted();
        t.insert(fd, 8).unwrap();
        let child = t.fork_copy().unwrap();
        assert_eq!(obj.opens.load(Ordering::Acquire), 2);
        close_all(child.drain_all());
        assert_eq!(obj.opens.load(Ordering::Acquire), 1);
    }

    #[test]
    fn cloexec_slots_drain() {
        let t = FdTable::new();
        let (_, a) = counted();
        let (_, b) = counted();
        t.insert(a, 8).unwrap();
        let nb = t.insert(b, 8).unwrap();
        t.update_perms(nb, |p| p.insert(FdPerms::CLOEXEC)).unwrap();
        assert_eq!(t.drain_cloexec().len(), 1);
        assert!(t.get(0).is_ok());
        assert_eq!(t.get(nb).err(), Some(Errno::EBADF));
    }

    #[test]
    fn default_ops_report_conventional_errors() {
        let (obj, _) = counted();
        assert_eq!(obj.lseek(0, 0), Err(Errno::ESPIPE));
        assert_eq!(obj.shutdown(ShutdownHow::READ), Err(Errno::ENOTSOCK));
        assert_eq!(obj.mmap_backing().err(), Some(Errno::ENODEV));
    }
}
