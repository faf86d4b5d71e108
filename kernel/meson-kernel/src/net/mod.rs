//! UNIX-domain sockets.
//!
//! Two socket families share one [`UnixNet`]: datagram sockets whose bound
//! endpoint is a [`Bud`], and stream sockets that rendezvous through a
//! [`Listener`] and then talk over a pair of cross-wired pipes. A bound
//! socket is named by a device node in the filesystem: `(D_SUD, bud id)`
//! for datagrams, `(D_SUS, listener id)` for streams. Registries are keyed
//! by `(id, inode)` so a stale node whose id was reused does not reach the
//! new owner.

pub mod bud;
pub mod listener;
pub mod stream;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use meson_core::sync::SpinLock;
use meson_core::{kdebug, kfatal, ktrace};
use meson_mm::AddressSpace;
use meson_syscall::{AF_UNIX, O_NONBLOCK, SOCK_DGRAM, SOCK_NONBLOCK, SOCK_STREAM, unmkdev};

use crate::admission::Quota;
use crate::config::SOCKADDR_MAX;
use crate::errno::{Errno, KResult};
use crate::fd::{FdOps, IoCtx};
use crate::fs::{FileService, OpenFlags, path};
use crate::pipe::Pipe;

pub use bud::{Bud, DgramSocket};
pub use listener::{Listener, Role};
pub use stream::StreamSocket;

/// Number of distinct device minors, and so of live ids per family.
const MINORS: usize = 256;

/// Allocator for 8-bit device minors.
struct MinorPool {
    used: [u64; MINORS / 64],
    next: usize,
}

impl MinorPool {
    const fn new() -> Self {
        Self {
            used: [0; MINORS / 64],
            next: 0,
        }
    }

    fn is_used(&self, id: usize) -> bool {
        self.used[id / 64] & (1 << (id % 64)) != 0
    }

    /// Returns the next free id after the last one handed out.
    fn alloc(&mut self) -> KResult<usize> {
        for step in 0..MINORS {
            let id = (self.next + step) % MINORS;
            if !self.is_used(id) {
                self.used[id / 64] |= 1 << (id % 64);
                self.next = (id + 1) % MINORS;
                return Ok(id);
            }
        }
        Err(Errno::ENOMEM)
    }

    fn free(&mut self, id: usize) {
        if !self.is_used(id) {
            kfatal!("net: minor {} freed twice", id);
            panic!("minor double free");
        }
        self.used[id / 64] &= !(1 << (id % 64));
    }
}

/// The kernel's UNIX-domain socket state.
pub struct UnixNet {
    fs: Arc<dyn FileService>,
    buds: SpinLock<BTreeMap<(usize, u64), Arc<Bud>>>,
    bud_ids: SpinLock<MinorPool>,
    listeners: SpinLock<BTreeMap<(usize, u64), Arc<Listener>>>,
    stream_ids: SpinLock<MinorPool>,
    sockets: Quota,
}

impl UnixNet {
    /// Creates the socket layer with room for `max_sockets` sockets.
    pub fn new(fs: Arc<dyn FileService>, max_sockets: usize) -> Arc<Self> {
        Arc::new(Self {
            fs,
            buds: SpinLock::named("bud_table", BTreeMap::new()),
            bud_ids: SpinLock::named("bud_ids", MinorPool::new()),
            listeners: SpinLock::named("listener_table", BTreeMap::new()),
            stream_ids: SpinLock::named("stream_ids", MinorPool::new()),
            sockets: Quota::new(max_sockets),
        })
    }

    /// The global socket limit.
    pub fn quota(&self) -> &Quota {
        &self.sockets
    }

    /// Creates an unbound socket for `socket(AF_UNIX, ty, 0)`. The socket
    /// holds one slot of the socket limit until its last close.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] for another domain, [`Errno::EPROTONOSUPPORT`] for
    /// another type, [`Errno::ENOMEM`] at the socket limit.
    pub fn socket(self: &Arc<Self>, domain: usize, ty: usize) -> KResult<Arc<dyn FdOps>> {
        if domain != AF_UNIX {
            return Err(Errno::EINVAL);
        }
        let options = socket_options(ty);
        let kind = base_type(ty);
        if kind != SOCK_DGRAM && kind != SOCK_STREAM {
            return Err(Errno::EPROTONOSUPPORT);
        }
        self.sockets.take()?;
        let sock: Arc<dyn FdOps> = if kind == SOCK_DGRAM {
            Arc::new(DgramSocket::new(self.clone(), options))
        } else {
            Arc::new(StreamSocket::unconnected(self.clone(), options))
        };
        Ok(sock)
    }

    /// Creates two connected stream sockets over two cross-wired pipes.
    /// One slot of the socket limit covers the pair; the first socket
    /// returns it.
    ///
    /// # Errors
    ///
    /// [`Errno::EINVAL`] for another domain, [`Errno::EPROTONOSUPPORT`]
    /// unless the type is a stream, [`Errno::ENOMEM`] at the socket limit.
    pub fn socketpair(
        self: &Arc<Self>,
        domain: usize,
        ty: usize,
    ) -> KResult<(Arc<dyn FdOps>, Arc<dyn FdOps>)> {
        if domain != AF_UNIX {
            return Err(Errno::EINVAL);
        }
        if base_type(ty) != SOCK_STREAM {
            return Err(Errno::EPROTONOSUPPORT);
        }
        let options = socket_options(ty);
        self.sockets.take()?;
        let one = Pipe::new(None);
        let two = Pipe::new(None);
        let a = StreamSocket::connected(self.clone(), one.clone(), two.clone(), options, true);
        let b = StreamSocket::connected(self.clone(), two, one, options, false);
        Ok((Arc::new(a), Arc::new(b)))
    }

    /// Creates the device node for a bound socket and returns its inode.
    fn make_node(&self, cx: &IoCtx, path: &str, major: usize, minor: usize) -> KResult<u64> {
        let node = self.fs.open(
            path,
            OpenFlags::CREAT | OpenFlags::EXCL,
            0,
            &cx.cwd,
            major,
            minor,
        )?;
        let ino = node.fstat().map(|st| st.ino);
        node.close()?;
        ino
    }

    /// Removes the node of a bind that could not complete.
    fn drop_node(&self, cx: &IoCtx, path: &str) {
        if let Err(e) = self.fs.unlink(path, &cx.cwd, false) {
            kdebug!("net: cannot remove {}: {}", path, e);
        }
    }

    /// Resolves a socket path to `(major, minor, inode)`.
    fn lookup_node(&self, cx: &IoCtx, path: &str) -> KResult<(usize, usize, u64)> {
        let st = self.fs.stat(path, &cx.cwd)?;
        let (major, minor) = unmkdev(st.rdev);
        Ok((major, minor, st.ino))
    }

    fn register_bud(&self, bud: Arc<Bud>) {
        let key = (bud.id(), bud.ino());
        if self.buds.lock().insert(key, bud).is_some() {
            kfatal!("net: bud {:?} registered twice", key);
            panic!("bud exists");
        }
        ktrace!("net: bud {} bound", key.0);
    }

    fn find_bud(&self, id: usize, ino: u64) -> Option<Arc<Bud>> {
        self.buds.lock().get(&(id, ino)).cloned()
    }

    fn remove_bud(&self, id: usize, ino: u64) {
        if self.buds.lock().remove(&(id, ino)).is_none() {
            kfatal!("net: no bud {}", id);
            panic!("no such bud");
        }
        self.bud_ids.lock().free(id);
    }

    fn register_listener(&self, listener: Arc<Listener>) {
        let key = (listener.id(), listener.ino());
        if self.listeners.lock().insert(key, listener).is_some() {
            kfatal!("net: listener {:?} registered twice", key);
            panic!("listener exists");
        }
    }

    fn find_listener(&self, id: usize, ino: u64) -> Option<Arc<Listener>> {
        self.listeners.lock().get(&(id, ino)).cloned()
    }

    fn remove_listener(&self, id: usize, ino: u64) {
        self.listeners.lock().remove(&(id, ino));
        self.stream_ids.lock().free(id);
    }

    /// Number of bound datagram endpoints.
    pub fn bud_count(&self) -> usize {
        self.buds.lock().len()
    }

    /// Number of listening stream sockets.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

fn base_type(ty: usize) -> usize {
    ty & !(SOCK_NONBLOCK | meson_syscall::SOCK_CLOEXEC)
}

fn socket_options(ty: usize) -> usize {
    if ty & SOCK_NONBLOCK != 0 { O_NONBLOCK } else { 0 }
}

/// Copies a socket address of `len` bytes from user memory. A length of
/// 0 means no address.
///
/// # Errors
///
/// [`Errno::EFAULT`] for a negative length or bad pointer,
/// [`Errno::ENOTSOCK`] for a length of [`SOCKADDR_MAX`] or more.
pub fn copy_sockaddr(aspace: &AddressSpace, va: usize, len: isize) -> KResult<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| Errno::EFAULT)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    if len >= SOCKADDR_MAX {
        return Err(Errno::ENOTSOCK);
    }
    let mut buf = vec![0u8; len];
    aspace.copy_in(va, &mut buf)?;
    Ok(buf)
}

/// The raw path of a `sockaddr_un`: the bytes after the two-byte header,
/// up to the first NUL.
///
/// # Errors
///
/// [`Errno::EINVAL`] if there is no path.
pub fn sockaddr_path(addr: &[u8]) -> KResult<&[u8]> {
    let raw = addr.get(2..).ok_or(Errno::EINVAL)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if end == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(&raw[..end])
}

/// Canonicalizes a raw socket path against the caller's cwd.
fn resolve_path(cx: &IoCtx, raw: &[u8]) -> KResult<alloc::string::String> {
    let s = core::str::from_utf8(raw).map_err(|_| Errno::EINVAL)?;
    Ok(path::resolve(&cx.cwd, s))
}

/// Builds a `sockaddr_un`: `[len, AF_UNIX, path.., 0]`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "bound paths are shorter than SOCKADDR_MAX"
)]
pub fn sockaddr_un(path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() + 3);
    out.push(path.len() as u8);
    out.push(AF_UNIX as u8);
    out.extend_from_slice(path);
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::admission::Admission;
    use crate::fd::FdTable;
    use crate::sched::KillSignal;
    use crate::testing::MemFs;

    #[test]
    fn minor_pool_wraps_and_reuses() {
        let mut pool = MinorPool::new();
        let ids: Vec<_> = (0..MINORS).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(ids[0], 0);
        assert_eq!(ids[MINORS - 1], MINORS - 1);
        assert_eq!(pool.alloc(), Err(Errno::ENOMEM));
        pool.free(17);
        assert_eq!(pool.alloc(), Ok(17));
    }

    fn io_ctx() -> IoCtx {
        IoCtx {
            kill: Arc::new(KillSignal::new()),
            admission: Arc::new(Admission::new(1 << 20)),
            fds: Arc::new(FdTable::new()),
            nofile: 16,
            cwd: String::from("/"),
        }
    }

    #[test]
    fn bind_after_close_leaves_no_node() {
        let fs = Arc::new(MemFs::new());
        let net = UnixNet::new(fs.clone(), 8);
        let cx = io_ctx();
        let addr = sockaddr_un(b"/d");

        let dgram = net.socket(AF_UNIX, SOCK_DGRAM).unwrap();
        dgram.close().unwrap();
        assert_eq!(dgram.bind(&cx, &addr), Err(Errno::EINVAL));
        assert!(!fs.exists("/d"));
        assert_eq!(net.bud_count(), 0);

        let stream = net.socket(AF_UNIX, SOCK_STREAM).unwrap();
        stream.close().unwrap();
        assert_eq!(stream.bind(&cx, &addr), Err(Errno::EINVAL));
        assert!(!fs.exists("/d"));

        // Both ids went back to their pools.
        let live = net.socket(AF_UNIX, SOCK_DGRAM).unwrap();
        live.bind(&cx, &addr).unwrap();
        assert!(fs.exists("/d"));
        assert_eq!(net.bud_count(), 1);
    }

    #[test]
    fn sockaddr_paths() {
        assert_eq!(sockaddr_path(b"\x05\x01/tmp/s\0junk"), Ok(&b"/tmp/s"[..]));
        assert_eq!(sockaddr_path(b"\x00\x01"), Err(Errno::EINVAL));
        assert_eq!(sockaddr_path(b"\x00"), Err(Errno::EINVAL));
        assert_eq!(sockaddr_un(b"ab"), vec![2, 1, b'a', b'b', 0]);
    }
}
