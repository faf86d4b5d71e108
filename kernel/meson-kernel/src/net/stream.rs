//! Stream sockets.
//!
//! A connected stream socket is two pipes: `rx`, which this socket created
//! and reads, and `tx`, which the peer created and this socket writes.
//! Descriptors passed with `SCM_RIGHTS` ride in `tx`'s mailbox.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use meson_core::sync::SpinLock;
use meson_core::ktrace;
use meson_syscall::{
    D_SUS, F_GETFL, F_SETFL, I_DEV, O_NONBLOCK, SCM_RIGHTS, SO_ERROR, SOL_SOCKET, Stat,
};

use super::{Listener, Role, UnixNet, resolve_path, sockaddr_path};
use crate::errno::{Errno, KResult};
use crate::fd::{FdFuture, FdOps, FdPerms, IoCtx, RecvInfo, ShutdownHow};
use crate::pipe::Pipe;
use crate::poll::{PollMsg, Ready};
use crate::uio::UserIo;

/// Size of an `SCM_RIGHTS` control message carrying one descriptor.
pub const SCM_RIGHTS_LEN: usize = 24;

/// `cmsg_len` of a control message with one 4-byte descriptor.
const CMSG_LEN_ONE_FD: u64 = 20;

enum Conn {
    Unconnected,
    Connecting,
    Listening(Arc<Listener>),
    Connected {
        rx: Arc<Pipe>,
        tx: Arc<Pipe>,
        rd_shut: bool,
        wr_shut: bool,
    },
}

struct Bound {
    id: usize,
    ino: u64,
}

struct StreamState {
    opens: usize,
    conn: Conn,
    bound: Option<Bound>,
}

/// A `SOCK_STREAM` socket.
pub struct StreamSocket {
    net: Arc<UnixNet>,
    state: SpinLock<StreamState>,
    options: AtomicUsize,
    /// Whether the last close gives back a slot of the socket limit.
    holds_slot: bool,
}

impl StreamSocket {
    /// A fresh socket from `socket()`. It holds one slot of the limit.
    pub fn unconnected(net: Arc<UnixNet>, options: usize) -> Self {
        Self::with_conn(net, Conn::Unconnected, options, true)
    }

    /// A connected socket reading `rx` and writing `tx`.
    pub fn connected(
        net: Arc<UnixNet>,
        rx: Arc<Pipe>,
        tx: Arc<Pipe>,
        options: usize,
        holds_slot: bool,
    ) -> Self {
        let conn = Conn::Connected {
            rx,
            tx,
            rd_shut: false,
            wr_shut: false,
        };
        Self::with_conn(net, conn, options, holds_slot)
    }

    fn with_conn(net: Arc<UnixNet>, conn: Conn, options: usize, holds_slot: bool) -> Self {
        Self {
            net,
            state: SpinLock::named(
                "stream_socket",
                StreamState {
                    opens: 1,
                    conn,
                    bound: None,
                },
            ),
            options: AtomicUsize::new(options & O_NONBLOCK),
            holds_slot,
        }
    }

    fn nonblocking(&self) -> bool {
        self.options.load(Ordering::Acquire) & O_NONBLOCK != 0
    }

    /// The pipes of a connected socket, unless that direction is shut.
    fn halves(&self) -> KResult<(Option<Arc<Pipe>>, Option<Arc<Pipe>>)> {
        match &self.state.lock().conn {
            Conn::Connected {
                rx,
                tx,
                rd_shut,
                wr_shut,
            } => Ok((
                (!*rd_shut).then(|| rx.clone()),
                (!*wr_shut).then(|| tx.clone()),
            )),
            _ => Err(Errno::ENOTCONN),
        }
    }

    /// Finds the listener bound at `addr` and trades pipes with it.
    async fn dial(&self, cx: &IoCtx, addr: &[u8]) -> KResult<(Arc<Pipe>, Arc<Pipe>)> {
        let path = resolve_path(cx, sockaddr_path(addr)?)?;
        let (major, minor, ino) = self.net.lookup_node(cx, &path)?;
        if major != D_SUS {
            return Err(Errno::ECONNREFUSED);
        }
        let listener = self
            .net
            .find_listener(minor, ino)
            .ok_or(Errno::ECONNREFUSED)?;
        let rx = Pipe::new(None);
        let tx = listener
            .rendezvous(&cx.kill, Role::Connector, rx.clone(), false)
            .await?;
        Ok((rx, tx))
    }

    async fn send(&self, cx: &IoCtx, src: &mut dyn UserIo, control: &[u8]) -> KResult<usize> {
        let (_, tx) = self.halves()?;
        let tx = tx.ok_or(Errno::EPIPE)?;
        if !control.is_empty() {
            let fd = parse_rights(control)?;
            let passed = cx.fds.get(fd)?.copy()?;
            tx.fd_add(&cx.kill, passed).await?;
        }
        tx.write_all(cx, src, self.nonblocking())
            .await
            .map_err(|e| if e == Errno::EPIPE { Errno::ECONNRESET } else { e })
    }

    async fn recv(&self, cx: &IoCtx, dst: &mut dyn UserIo, control_cap: usize) -> KResult<RecvInfo> {
        let (rx, _) = self.halves()?;
        let Some(rx) = rx else {
            return Ok(RecvInfo::default());
        };
        let bytes = rx.read(&cx.kill, dst, self.nonblocking()).await?;
        let mut control = Vec::new();
        if control_cap >= SCM_RIGHTS_LEN {
            if let Some(mut fd) = rx.fd_take() {
                fd.perms.remove(FdPerms::CLOEXEC);
                let n = cx.fds.insert(fd, cx.nofile)?;
                control = rights_message(n);
            }
        }
        Ok(RecvInfo {
            bytes,
            addr: None,
            control,
        })
    }
}

/// Extracts the descriptor from an `SCM_RIGHTS` control message.
fn parse_rights(control: &[u8]) -> KResult<usize> {
    let word = |at: usize| -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&control[at..at + 4]);
        u32::from_ne_bytes(b)
    };
    if control.len() < SCM_RIGHTS_LEN {
        return Err(Errno::EINVAL);
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&control[..8]);
    let cmsg_len = u64::from_ne_bytes(len);
    if !(CMSG_LEN_ONE_FD..=SCM_RIGHTS_LEN as u64).contains(&cmsg_len)
        || word(8) as usize != SOL_SOCKET
        || word(12) as usize != SCM_RIGHTS
    {
        return Err(Errno::EINVAL);
    }
    Ok(word(16) as usize)
}

/// Builds the `SCM_RIGHTS` control message announcing descriptor `fd`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "descriptor numbers are bounded by RLIMIT_NOFILE"
)]
fn rights_message(fd: usize) -> Vec<u8> {
    let mut out = vec![0u8; SCM_RIGHTS_LEN];
    out[..8].copy_from_slice(&CMSG_LEN_ONE_FD.to_ne_bytes());
    out[8..12].copy_from_slice(&(SOL_SOCKET as u32).to_ne_bytes());
    out[12..16].copy_from_slice(&(SCM_RIGHTS as u32).to_ne_bytes());
    out[16..20].copy_from_slice(&(fd as u32).to_ne_bytes());
    out
}

impl FdOps for StreamSocket {
    fn close(&self) -> KResult<()> {
        let mut st = self.state.lock();
        st.opens = st.opens.checked_sub(1).ok_or(Errno::EBADF)?;
        if st.opens > 0 {
            return Ok(());
        }
        let conn = core::mem::replace(&mut st.conn, Conn::Unconnected);
        let bound = st.bound.take();
        drop(st);
        match conn {
            Conn::Connected {
                rx,
                tx,
                rd_shut,
                wr_shut,
            } => {
                if !rd_shut {
                    rx.reopen(-1, 0)?;
                }
                if !wr_shut {
                    tx.reopen(0, -1)?;
                }
            }
            Conn::Listening(listener) => {
                if listener.reopen(-1)? {
                    self.net.remove_listener(listener.id(), listener.ino());
                }
            }
            Conn::Unconnected | Conn::Connecting => {
                if let Some(b) = bound {
                    self.net.stream_ids.lock().free(b.id);
                }
            }
        }
        if self.holds_slot {
            self.net.sockets.give();
        }
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

    fn fstat(&self) -> KResult<Stat> {
        Ok(Stat {
            mode: I_DEV << 16,
            ..Stat::default()
        })
    }

    fn read<'a>(&'a self, cx: &'a IoCtx, dst: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move { self.recv(cx, dst, 0).await.map(|r| r.bytes) })
    }

    fn write<'a>(&'a self, cx: &'a IoCtx, src: &'a mut dyn UserIo) -> FdFuture<'a, usize> {
        Box::pin(async move { self.send(cx, src, &[]).await })
    }

    fn poll(&self, pm: &PollMsg) -> KResult<Ready> {
        let (rx, tx) = match &self.state.lock().conn {
            Conn::Unconnected | Conn::Connecting => return Ok(pm.events & Ready::ERROR),
            Conn::Listening(l) => return l.poll(pm),
            Conn::Connected { rx, tx, .. } => (rx.clone(), tx.clone()),
        };
        let r = rx.poll(&PollMsg {
            events: pm.events - Ready::WRITE,
            ..pm.clone()
        })?;
        if !r.is_empty() {
            return Ok(r);
        }
        tx.poll(&PollMsg {
            events: pm.events - (Ready::READ | Ready::HUP),
            ..pm.clone()
        })
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
        let path = resolve_path(cx, sockaddr_path(addr)?)?;
        {
            let st = self.state.lock();
            if st.bound.is_some() || !matches!(st.conn, Conn::Unconnected) {
                return Err(Errno::EINVAL);
            }
        }
        let id = self.net.stream_ids.lock().alloc()?;
        let ino = match self.net.make_node(cx, &path, D_SUS, id) {
            Ok(ino) => ino,
            Err(e) => {
                self.net.stream_ids.lock().free(id);
                return Err(e);
            }
        };
        let mut st = self.state.lock();
        if st.bound.is_some() || st.opens == 0 || !matches!(st.conn, Conn::Unconnected) {
            drop(st);
            self.net.drop_node(cx, &path);
            self.net.stream_ids.lock().free(id);
            return Err(Errno::EINVAL);
        }
        st.bound = Some(Bound { id, ino });
        Ok(())
    }

    fn listen(&self, _cx: &IoCtx, backlog: isize) -> KResult<()> {
        let mut st = self.state.lock();
        match st.conn {
            Conn::Connected { .. } | Conn::Connecting => return Err(Errno::EISCONN),
            Conn::Listening(_) => return Err(Errno::EINVAL),
            Conn::Unconnected => {}
        }
        let Some(bound) = st.bound.as_ref() else {
            return Err(Errno::EINVAL);
        };
        let listener = Arc::new(Listener::new(bound.id, bound.ino, backlog));
        st.conn = Conn::Listening(listener.clone());
        drop(st);
        ktrace!(
            "net: stream {} listening, backlog {}",
            listener.id(),
            listener.backlog()
        );
        self.net.register_listener(listener);
        Ok(())
    }

    fn connect<'a>(&'a self, cx: &'a IoCtx, addr: &'a [u8]) -> FdFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut st = self.state.lock();
                match st.conn {
                    Conn::Connected { .. } | Conn::Connecting => return Err(Errno::EISCONN),
                    Conn::Listening(_) => return Err(Errno::EINVAL),
                    Conn::Unconnected => st.conn = Conn::Connecting,
                }
            }
            let res = self.dial(cx, addr).await;
            let mut st = self.state.lock();
            match res {
                Ok((rx, tx)) if st.opens == 0 => {
                    // Closed by another thread while dialing.
                    drop(st);
                    rx.reopen(-1, 0)?;
                    tx.reopen(0, -1)?;
                    Err(Errno::EBADF)
                }
                Ok((rx, tx)) => {
                    st.conn = Conn::Connected {
                        rx,
                        tx,
                        rd_shut: false,
                        wr_shut: false,
                    };
                    Ok(())
                }
                Err(e) => {
                    st.conn = Conn::Unconnected;
                    Err(e)
                }
            }
        })
    }

    fn accept<'a>(&'a self, cx: &'a IoCtx) -> FdFuture<'a, (Arc<dyn FdOps>, Vec<u8>)> {
        Box::pin(async move {
            let listener = match &self.state.lock().conn {
                Conn::Listening(l) => l.clone(),
                _ => return Err(Errno::EINVAL),
            };
            let rx = Pipe::new(None);
            let tx = listener
                .rendezvous(&cx.kill, Role::Acceptor, rx.clone(), self.nonblocking())
                .await?;
            let sock: Arc<dyn FdOps> =
                Arc::new(Self::connected(self.net.clone(), rx, tx, 0, false));
            Ok((sock, Vec::new()))
        })
    }

    fn sendmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        src: &'a mut dyn UserIo,
        addr: &'a [u8],
        control: &'a [u8],
    ) -> FdFuture<'a, usize> {
        Box::pin(async move {
            if !addr.is_empty() {
                self.halves()?;
                return Err(Errno::EISCONN);
            }
            self.send(cx, src, control).await
        })
    }

    fn recvmsg<'a>(
        &'a self,
        cx: &'a IoCtx,
        dst: &'a mut dyn UserIo,
        _want_addr: bool,
        control_cap: usize,
    ) -> FdFuture<'a, RecvInfo> {
        Box::pin(async move { self.recv(cx, dst, control_cap).await })
    }

    fn getsockopt(&self, level: usize, opt: usize, cap: usize) -> KResult<Vec<u8>> {
        if level != SOL_SOCKET || opt != SO_ERROR {
            return Err(Errno::EOPNOTSUPP);
        }
        Ok(vec![0u8; cap.min(4)])
    }

    fn setsockopt(&self, _level: usize, _opt: usize, _val: &[u8]) -> KResult<()> {
        Err(Errno::EOPNOTSUPP)
    }

    fn shutdown(&self, how: ShutdownHow) -> KResult<()> {
        let mut st = self.state.lock();
        let Conn::Connected {
            rx,
            tx,
            rd_shut,
            wr_shut,
        } = &mut st.conn
        else {
            return Err(Errno::ENOTCONN);
        };
        let mut release = Vec::new();
        if how.contains(ShutdownHow::READ) && !*rd_shut {
            *rd_shut = true;
            release.push((rx.clone(), -1, 0));
        }
        if how.contains(ShutdownHow::WRITE) && !*wr_shut {
            *wr_shut = true;
            release.push((tx.clone(), 0, -1));
        }
        drop(st);
        for (pipe, rd, wd) in release {
            pipe.reopen(rd, wd)?;
        }
        Ok(())
    }
}
