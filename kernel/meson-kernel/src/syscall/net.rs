//! Socket calls. Address and control buffers are copied in and out here;
//! the protocol work happens in [`crate::net`].

use alloc::vec;
use alloc::vec::Vec;

use meson_mm::AddressSpace;
use meson_syscall::{MsgHdr, SOCK_CLOEXEC};

use super::CallCtx;
use crate::config::{MSG_CONTROL_MAX, MSG_NAME_MAX, SOCKADDR_MAX};
use crate::errno::{Errno, KResult};
use crate::fd::{Fd, FdPerms, ShutdownHow};
use crate::net::copy_sockaddr;
use crate::uio::{UserBuf, UserIovec, read_struct, write_struct};

#[expect(clippy::cast_possible_wrap, reason = "lengths are signed in the ABI")]
fn signed(len: usize) -> isize {
    len as isize
}

fn field(v: u64) -> KResult<usize> {
    usize::try_from(v).map_err(|_| Errno::EINVAL)
}

/// Stores `addr` in the caller's `(buf, len_ptr)` pair: at most the
/// capacity read from `len_ptr` is copied, and the full length is stored
/// back. Nothing happens if either pointer is 0.
fn store_addr(aspace: &AddressSpace, buf: usize, len_ptr: usize, addr: &[u8]) -> KResult<()> {
    if buf == 0 || len_ptr == 0 {
        return Ok(());
    }
    let cap = field(aspace.read_u64(len_ptr)?)?;
    let n = addr.len().min(cap);
    aspace.copy_out(buf, &addr[..n])?;
    aspace.write_u64(len_ptr, addr.len() as u64)?;
    Ok(())
}

/// Installs a fresh socket object. The socket is closed if the table is
/// full.
fn install(cx: &CallCtx<'_>, fd: Fd) -> KResult<usize> {
    cx.process().fds().insert(fd, cx.nofile())
}

pub(super) fn socket(cx: &CallCtx<'_>, domain: usize, ty: usize, _proto: usize) -> KResult<usize> {
    let ops = cx.kernel.net.socket(domain, ty)?;
    let mut perms = FdPerms::READ | FdPerms::WRITE;
    perms.set(FdPerms::CLOEXEC, ty & SOCK_CLOEXEC != 0);
    install(cx, Fd::new(ops, perms))
}

pub(super) fn socketpair(
    cx: &CallCtx<'_>,
    domain: usize,
    ty: usize,
    _proto: usize,
    fds: usize,
) -> KResult<usize> {
    let (a, b) = cx.kernel.net.socketpair(domain, ty)?;
    let mut perms = FdPerms::READ | FdPerms::WRITE;
    perms.set(FdPerms::CLOEXEC, ty & SOCK_CLOEXEC != 0);
    let table = cx.process().fds();
    let (na, nb) = table.insert2(Fd::new(a, perms), Fd::new(b, perms), cx.nofile())?;

    let aspace = cx.aspace();
    #[expect(clippy::cast_possible_truncation, reason = "fds are below RLIMIT_NOFILE")]
    let stored = aspace
        .write_u32(fds, na as u32)
        .and_then(|()| aspace.write_u32(fds.wrapping_add(4), nb as u32));
    if let Err(e) = stored {
        for n in [na, nb] {
            if let Ok(fd) = table.take(n) {
                fd.close()?;
            }
        }
        return Err(e.into());
    }
    Ok(0)
}

pub(super) fn bind(cx: &CallCtx<'_>, fd: usize, addr: usize, addrlen: usize) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let addr = copy_sockaddr(&cx.aspace(), addr, signed(addrlen))?;
    fd.ops.bind(&cx.io(), &addr)?;
    Ok(0)
}

pub(super) fn listen(cx: &CallCtx<'_>, fd: usize, backlog: usize) -> KResult<usize> {
    cx.fd(fd)?.ops.listen(&cx.io(), signed(backlog))?;
    Ok(0)
}

pub(super) async fn connect(
    cx: &CallCtx<'_>,
    fd: usize,
    addr: usize,
    addrlen: usize,
) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let addr = copy_sockaddr(&cx.aspace(), addr, signed(addrlen))?;
    let io = cx.io();
    fd.ops.connect(&io, &addr).await?;
    Ok(0)
}

/// Accepts a connection. The peer address is stored at `addr` with its
/// length at `addrlen_ptr`, both optional.
pub(super) async fn accept(
    cx: &CallCtx<'_>,
    fd: usize,
    addr: usize,
    addrlen_ptr: usize,
) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let io = cx.io();
    let (conn, peer) = fd.ops.accept(&io).await?;
    if let Err(e) = store_addr(&cx.aspace(), addr, addrlen_ptr, &peer) {
        conn.close()?;
        return Err(e);
    }
    install(cx, Fd::new(conn, FdPerms::READ | FdPerms::WRITE))
}

/// `flags_len` packs the flags (low half, ignored) and the buffer length
/// (high half).
pub(super) async fn sendto(
    cx: &CallCtx<'_>,
    fd: usize,
    buf: usize,
    flags_len: usize,
    addr: usize,
    addrlen: usize,
) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let aspace = cx.aspace();
    let addr = copy_sockaddr(&aspace, addr, signed(addrlen))?;
    let mut src = UserBuf::new(aspace, buf, flags_len >> 32)?;
    let io = cx.io();
    fd.ops.sendmsg(&io, &mut src, &addr, &[]).await
}

pub(super) async fn recvfrom(
    cx: &CallCtx<'_>,
    fd: usize,
    buf: usize,
    flags_len: usize,
    addr: usize,
    addrlen_ptr: usize,
) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let aspace = cx.aspace();
    let mut dst = UserBuf::new(aspace.clone(), buf, flags_len >> 32)?;
    let io = cx.io();
    let got = fd.ops.recvmsg(&io, &mut dst, addr != 0, 0).await?;
    if let Some(peer) = got.addr {
        store_addr(&aspace, addr, addrlen_ptr, &peer)?;
    }
    Ok(got.bytes)
}

pub(super) async fn sendmsg(cx: &CallCtx<'_>, fd: usize, msg: usize, _flags: usize) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let aspace = cx.aspace();
    let hdr: MsgHdr = read_struct(&aspace, msg)?;
    let namelen = field(hdr.msg_namelen)?;
    let controllen = field(hdr.msg_controllen)?;
    if namelen > MSG_NAME_MAX || controllen > MSG_CONTROL_MAX {
        return Err(Errno::EINVAL);
    }
    let addr = copy_sockaddr(&aspace, field(hdr.msg_name)?, signed(namelen))?;
    let mut control = vec![0u8; controllen];
    if controllen > 0 {
        aspace.copy_in(field(hdr.msg_control)?, &mut control)?;
    }
    let mut src = UserIovec::new(aspace, field(hdr.msg_iov)?, field(hdr.msg_iovlen)?)?;
    let io = cx.io();
    fd.ops.sendmsg(&io, &mut src, &addr, &control).await
}

/// Receives into the message's iovecs and updates its name, control and
/// flags fields in place.
pub(super) async fn recvmsg(cx: &CallCtx<'_>, fd: usize, msg: usize, _flags: usize) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let aspace = cx.aspace();
    let mut hdr: MsgHdr = read_struct(&aspace, msg)?;
    let namelen = field(hdr.msg_namelen)?;
    let controllen = field(hdr.msg_controllen)?;
    if namelen > MSG_NAME_MAX || controllen > MSG_CONTROL_MAX {
        return Err(Errno::EINVAL);
    }
    let mut dst = UserIovec::new(aspace.clone(), field(hdr.msg_iov)?, field(hdr.msg_iovlen)?)?;
    let want_addr = hdr.msg_name != 0 && namelen > 0;
    let io = cx.io();
    let got = fd.ops.recvmsg(&io, &mut dst, want_addr, controllen).await?;

    let peer: Vec<u8> = got.addr.unwrap_or_default();
    if want_addr {
        let n = peer.len().min(namelen);
        aspace.copy_out(field(hdr.msg_name)?, &peer[..n])?;
    }
    let n = got.control.len().min(controllen);
    if n > 0 {
        aspace.copy_out(field(hdr.msg_control)?, &got.control[..n])?;
    }
    hdr.msg_namelen = if want_addr { peer.len() as u64 } else { 0 };
    hdr.msg_controllen = n as u64;
    hdr.msg_flags = 0;
    write_struct(&aspace, msg, &hdr)?;
    Ok(got.bytes)
}

pub(super) fn shutdown(cx: &CallCtx<'_>, fd: usize, how: usize) -> KResult<usize> {
    let how = ShutdownHow::from_bits(how)
        .filter(|h| !h.is_empty())
        .ok_or(Errno::EINVAL)?;
    cx.fd(fd)?.ops.shutdown(how)?;
    Ok(0)
}

/// `len` points at a u64 holding the buffer capacity; the option's real
/// length is stored back there.
pub(super) fn getsockopt(
    cx: &CallCtx<'_>,
    fd: usize,
    level: usize,
    opt: usize,
    val: usize,
    len: usize,
) -> KResult<usize> {
    let fd = cx.fd(fd)?;
    let aspace = cx.aspace();
    let cap = field(aspace.read_u64(len)?)?;
    let bytes = fd.ops.getsockopt(level, opt, cap.min(SOCKADDR_MAX))?;
    aspace.copy_out(val, &bytes)?;
    aspace.write_u64(len, bytes.len() as u64)?;
    Ok(0)
}

pub(super) fn setsockopt(
    cx: &CallCtx<'_>,
    fd: usize,
    level: usize,
    opt: usize,
    val: usize,
    len: usize,
) -> KResult<usize> {
    if len > SOCKADDR_MAX {
        return Err(Errno::EINVAL);
    }
    let fd = cx.fd(fd)?;
    let mut bytes = vec![0u8; len];
    cx.aspace().copy_in(val, &mut bytes)?;
    fd.ops.setsockopt(level, opt, &bytes)?;
    Ok(0)
}
