//! Descriptor data transfer: read, write, their positional and vectored
//! forms, lseek and pipe2.

use alloc::sync::Arc;

use meson_syscall::{O_CLOEXEC, O_NONBLOCK};

use super::CallCtx;
use crate::errno::{Errno, KResult};
use crate::fd::{Fd, FdOps, FdPerms};
use crate::pipe::{Pipe, PipeEnd};
use crate::uio::{UserBuf, UserIovec};

/// Looks up `n` and checks it carries `perm`.
fn fd_with(cx: &CallCtx<'_>, n: usize, perm: FdPerms) -> KResult<Fd> {
    let fd = cx.fd(n)?;
    if !fd.perms.contains(perm) {
        return Err(Errno::EBADF);
    }
    Ok(fd)
}

fn offset(off: usize) -> KResult<usize> {
    isize::try_from(off).map_err(|_| Errno::EINVAL)?;
    Ok(off)
}

pub(super) async fn read(cx: &CallCtx<'_>, fd: usize, buf: usize, len: usize) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::READ)?;
    let mut dst = UserBuf::new(cx.aspace(), buf, len)?;
    fd.ops.read(&cx.io(), &mut dst).await
}

pub(super) async fn write(cx: &CallCtx<'_>, fd: usize, buf: usize, len: usize) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::WRITE)?;
    let mut src = UserBuf::new(cx.aspace(), buf, len)?;
    fd.ops.write(&cx.io(), &mut src).await
}

pub(super) fn pread(
    cx: &CallCtx<'_>,
    fd: usize,
    buf: usize,
    len: usize,
    off: usize,
) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::READ)?;
    let mut dst = UserBuf::new(cx.aspace(), buf, len)?;
    fd.ops.pread(&mut dst, offset(off)?)
}

pub(super) fn pwrite(
    cx: &CallCtx<'_>,
    fd: usize,
    buf: usize,
    len: usize,
    off: usize,
) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::WRITE)?;
    let mut src = UserBuf::new(cx.aspace(), buf, len)?;
    fd.ops.pwrite(&mut src, offset(off)?)
}

pub(super) async fn readv(
    cx: &CallCtx<'_>,
    fd: usize,
    iov: usize,
    iovcnt: usize,
) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::READ)?;
    let mut dst = UserIovec::new(cx.aspace(), iov, iovcnt)?;
    fd.ops.read(&cx.io(), &mut dst).await
}

pub(super) async fn writev(
    cx: &CallCtx<'_>,
    fd: usize,
    iov: usize,
    iovcnt: usize,
) -> KResult<usize> {
    let fd = fd_with(cx, fd, FdPerms::WRITE)?;
    let mut src = UserIovec::new(cx.aspace(), iov, iovcnt)?;
    fd.ops.write(&cx.io(), &mut src).await
}

pub(super) fn lseek(cx: &CallCtx<'_>, fd: usize, off: usize, whence: usize) -> KResult<usize> {
    #[expect(clippy::cast_possible_wrap, reason = "the offset is signed in the ABI")]
    let off = off as isize;
    cx.fd(fd)?.ops.lseek(off, whence)
}

/// Creates a pipe and stores its read and write descriptors as two 4-byte
/// integers at `fds`.
pub(super) fn pipe2(cx: &CallCtx<'_>, fds: usize, flags: usize) -> KResult<usize> {
    if flags & !(O_NONBLOCK | O_CLOEXEC) != 0 {
        return Err(Errno::EINVAL);
    }
    let limit = cx.kernel.pipes.clone();
    limit.take()?;
    let pipe = Pipe::new(Some(limit));
    let rd: Arc<dyn FdOps> = Arc::new(PipeEnd::new(pipe.clone(), false, flags));
    let wr: Arc<dyn FdOps> = Arc::new(PipeEnd::new(pipe, true, flags));
    let extra = if flags & O_CLOEXEC != 0 {
        FdPerms::CLOEXEC
    } else {
        FdPerms::empty()
    };

    let table = cx.process().fds();
    let (a, b) = table.insert2(
        Fd::new(rd, FdPerms::READ | extra),
        Fd::new(wr, FdPerms::WRITE | extra),
        cx.nofile(),
    )?;
    let aspace = cx.aspace();
    #[expect(clippy::cast_possible_truncation, reason = "fds are below RLIMIT_NOFILE")]
    let stored = aspace
        .write_u32(fds, a as u32)
        .and_then(|()| aspace.write_u32(fds.wrapping_add(4), b as u32));
    if let Err(e) = stored {
        for n in [a, b] {
            if let Ok(fd) = table.take(n) {
                fd.close()?;
            }
        }
        return Err(e.into());
    }
    Ok(0)
}
