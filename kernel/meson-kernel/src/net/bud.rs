//! Datagram sockets.
//!
//! A bound datagram socket owns a [`Bud`]: a bounded queue of whole
//! datagrams, each remembered with the sender's bound path. The queue
//! holds at most [`BUD_RING_SIZE`] payload bytes in at most
//! [`BUD_RECORDS`] datagrams. Senders find a bud by stat-ing its path and
//! looking up `(minor, inode)`.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use meson_core::sync::{SpinLock, WaitQueue};
use meson_syscall::{D_SUD, F_GETFL, F_SETFL, O_NONBLOCK};

use super::{UnixNet, resolve_path, sockaddr_path, sockaddr_un};
use crate::config::{BUD_POLL_WRITE, BUD_RECORDS, BUD_RING_SIZE};
use crate::errno::{Errno, KResult};
use crate::fd::{FdFuture, FdOps, IoCtx, RecvInfo};
use crate::poll::{PollMsg, Pollers, Ready};
use crate::sched::KillSignal;
use crate::uio::UserIo;

struct Datagram {
    from: Vec<u8>,
    data: Vec<u8>,
}

struct BudState {
    queue: VecDeque<Datagram>,
    bytes: usize,
    closed: bool,
    pollers: Pollers,
}

impl BudState {
    fn can_hold(&self, len: usize) -> bool {
        self.queue.len() < BUD_RECORDS && self.bytes + len <= BUD_RING_SIZE
    }
}

/// A bound datagram endpoint.
pub struct Bud {
    id: usize,
    ino: u64,
    path: Vec<u8>,
    state: SpinLock<BudState>,
    cond: WaitQueue,
}

impl Bud {
    fn new(id: usize, ino: u64, path: Vec<u8>) -> Self {
        Self {
            id,
            ino,
            path,
            state: SpinLock::named(
                "bud",
                BudState {
                    queue: VecDeque::new(),
                    bytes: 0,
                    closed: false,
                    pollers: Pollers::new(),
                },
            ),
            cond: WaitQueue::new(),
        }
    }

    /// The bud id, which is the device minor of its node.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Inode of the device node.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Queues `data` from `from`, waiting for room.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once closed, [`Errno::EWOULDBLOCK`] if `noblock`
    /// and full, [`Errno::EINTR`] if killed while waiting.
    pub async fn send(
        &self,
        kill: &KillSignal,
        data: Vec<u8>,
        from: Vec<u8>,
        noblock: bool,
    ) -> KResult<usize> {
        let len = data.len();
        let mut pending = Some(Datagram { from, data });
        kill.wait_until(&self.cond, || {
            let mut st = self.state.lock();
            if st.closed {
                return Some(Err(Errno::EBADF));
            }
            if st.can_hold(len) {
                st.bytes += len;
                st.queue.extend(pending.take());
                st.pollers.wake_ready(Ready::READ);
                self.cond.wake_all();
                return Some(Ok(len));
            }
            if noblock {
                return Some(Err(Errno::EWOULDBLOCK));
            }
            None
        })
        .await?
    }

    /// Takes the oldest datagram into `dst`. Bytes that do not fit are
    /// discarded with the datagram.
    ///
    /// # Errors
    ///
    /// [`Errno::EBADF`] once closed, [`Errno::EWOULDBLOCK`] if `noblock`
    /// and empty, [`Errno::EINTR`] if killed while waiting,
    /// [`Errno::EFAULT`] on a bad user buffer (the datagram stays queued).
    pub async fn recv(
        &self,
        kill: &KillSignal,
        dst: &mut dyn UserIo,
        want_addr: bool,
        noblock: bool,
    ) -> KResult<RecvInfo> {
        kill.wait_until(&self.cond, || {
            let mut st = self.state.lock();
            if st.closed {
                return Some(Err(Errno::EBADF));
            }
            let Some(dg) = st.queue.front() else {
                return if noblock {
                    Some(Err(Errno::EWOULDBLOCK))
                } else {
                    None
                };
            };
            let bytes = match dst.write_from(&dg.data) {
                Ok(n) => n,
                Err(e) => return Some(Err(e)),
            };
            let addr = want_addr.then(|| sockaddr_un(&dg.from));
            if let Some(dg) = st.queue.pop_front() {
                st.bytes -= dg.data.len();
            }
            st.pollers.wake_ready(Ready::WRITE);
            self.cond.wake_all();
            Some(Ok(RecvInfo {
                bytes,
                addr,
                control: Vec::new(),
            }))
        })
        .await?
    }

    /// Readable with a datagram queued, writable while a small datagram
    /// would fit.
    ///
    /// # Errors
    ///
    /// [`Errno::ENOMEM`] if the poller list is full.
    pub fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(Ready::empty());
        }
        let mut r = Ready::empty();
        if pm.events.contains(Ready::READ) && !st.queue.is_empty() {
            r |= Ready::READ;
        }
        if pm.events.contains(Ready::WRITE) && st.can_hold(BUD_POLL_WRITE) {
            r |= Ready::WRITE;
        }
        if r.is_empty() && pm.dowait {
            st.pollers.add(pm)?;
        }
        Ok(r)
    }

    /// Marks the bud closed and wakes everyone waiting on it.
    fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.queue.clear();
        st.bytes = 0;
        st.pollers
            .wake_ready(Ready::READ | Ready::WRITE | Ready::ERROR);
        drop(st);
        self.cond.wake_all();
    }

    /// Datagrams queued.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

struct DgramState {
    opens: usize,
    bud: Option<Arc<Bud>>,
}

/// A `SOCK_DGRAM` socket.
pub struct DgramSocket {
    net: Arc<UnixNet>,
    state: SpinLock<DgramState>,
    options: AtomicUsize,
}

impl DgramSocket {
    /// An unbound socket holding one slot of the socket limit.
    pub fn new(net: Arc<UnixNet>, options: usize) -> Self {
        Self {
            net,
            state: SpinLock::named(
                "dgram_socket",
                DgramState {
                    opens: 1,
                    bud: None,
                },
            ),
            options: AtomicUsize::new(options & O_NONBLOCK),
        }
    }

    fn nonblocking(&self) -> bool {
        self.options.load(Ordering::Acquire) & O_NONBLOCK != 0
    }

    fn bud(&self) -> Option<Arc<Bud>> {
        self.state.lock().bud.clone()
    }
}

impl FdOps for DgramSocket {
    fn close(&self) -> KResult<()> {
        let mut st = self.state.lock();
        st.opens = st.opens.checked_sub(1).ok_or(Errno::EBADF)?;
        if st.opens > 0 {
            return Ok(());
        }
        let bud = st.bud.take();
        drop(st);
        if let Some(bud) = bud {
            bud.close();
            self.net.remove_bud(bud.id, bud.ino);
        }
        self.net.sockets.give();
        Ok(())
    }

    fn reopen(&self) -> KResult<()> {
        let mut st = self.state.lock();
        if st.opens == 0 {
            return Err(Errno::EBADF);
        }
        st.opens += 1;
        Ok(())
    }

    fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        match self.bud() {
            Some(bud) => bud.poll(pm),
            None => Ok(pm.events & Ready::ERROR),
        }
    }

    fn fcntl(&self, cmd: usize, arg: usize) -> KResult<usize> {
        match cmd {
            F_GETFL => Ok(self.options.load(Ordering::Acquire)),
            F_SETFL => {
                self.options.store(arg & O_NONBLOCK, Ordering::Release);
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn bind(&self, cx: &IoCtx, addr: &[u8]) -> KResult<()> {
        let raw = sockaddr_path(addr)?;
        let path = resolve_path(cx, raw)?;
        if self.state.lock().bud.is_some() {
            return Err(Errno::EINVAL);
        }
        let id = self.net.bud_ids.lock().alloc()?;
        let ino = match self.net.make_node(cx, &path, D_SUD, id) {
            Ok(ino) => ino,
            Err(e) => {
                self.net.bud_ids.lock().free(id);
                return Err(e);
            }
        };
        let bud = Arc::new(Bud::new(id, ino, raw.to_vec()));
        let mut st = self.state.lock();
        if st.bud.is_some() || st.opens == 0 {
            drop(st);
            // Lost a race with another bind, or closed meanwhile.
            self.net.drop_node(cx, &path);
            self.net.bud_ids.lock().free(id);
            return Err(Errno::EINVAL);
        }
        st.bud = Some(bud.clone());
        drop(st);
        self.net.register_bud(bud);
        Ok(())
    }

    fn listen(&self, _cx: &IoCtx, _backlog: isize) -> KResult<()> {
        Err(Errno::EOPNOTSUPP)
    }

    fn connect<'a>(&'a self, cx: &'a IoCtx, addr: &'a [u8]) -> FdFuture<'a, ()> {
        let _ = (cx, addr);
        Box::pin(async { Err(Errno::EINVAL) })
    }

    fn accept<'a>(&'a self, cx: &'a IoCtx) -> FdFuture<'a, (Arc<dyn FdOps>, Vec<u8>)> {
        let _ = cx;
        Box::pin(async { Err(Errno::EOPNOTSUPP) })
    }

    fn sendmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        src: &'a mut dyn UserIo,
        addr: &'a [u8],
        control: &'a [u8],
    ) -> FdFuture<'a, usize> {
        Box::pin(async move {
            if !control.is_empty() {
                return Err(Errno::EOPNOTSUPP);
            }
            let path = resolve_path(cx, sockaddr_path(addr)?)?;
            let (major, minor, ino) = self.net.lookup_node(cx, &path)?;
            if major != D_SUD {
                return Err(Errno::ECONNREFUSED);
            }
            let dest = self.net.find_bud(minor, ino).ok_or(Errno::ECONNREFUSED)?;
            let len = src.remain();
            if len > BUD_RING_SIZE {
                return Err(Errno::EINVAL);
            }
            let mut data = vec![0u8; len];
            let n = src.read_into(&mut data)?;
            data.truncate(n);
            let from = self.bud().map(|b| b.path.clone()).unwrap_or_default();
            dest.send(&cx.kill, data, from, self.nonblocking()).await
        })
    }

    fn recvmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        dst: &'a mut dyn UserIo,
        want_addr: bool,
        control_cap: usize,
    ) -> FdFuture<'a, RecvInfo> {
        let _ = control_cap;
        Box::pin(async move {
            let bud = self.bud().ok_or(Errno::ECONNREFUSED)?;
            bud.recv(&cx.kill, dst, want_addr, self.nonblocking()).await
        })
    }

    fn getsockopt(&self, _level: usize, _opt: usize, _cap: usize) -> KResult<Vec<u8>> {
        Err(Errno::EOPNOTSUPP)
    }

    fn setsockopt(&self, _level: usize, _opt: usize, _val: &[u8]) -> KResult<()> {
        Err(Errno::EOPNOTSUPP)
    }
}
